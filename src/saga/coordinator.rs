use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::execution::{SagaRunner, SagaStep};
use super::locks::CreatorLocks;
use super::steps::{FollowupStep, JitterStep, RotationStep, SchedulingContext, ValidationStep};
use super::types::{SagaExecution, SagaResult, SagaStatus, ScheduleItem};
use super::validator::ScheduleValidator;
use crate::config::SlotSagaConfig;
use crate::events::{EventSink, EventType, SchedulingEvent};
use crate::resilience::{
    CircuitBreakerRegistry, IdempotencyGuard, ROTATION_STORE_BREAKER, VALIDATOR_BREAKER,
};
use crate::state_machine::{RotationStateMachine, RotationStore};
use crate::timing::seed::stable_hash;
use crate::timing::{FollowupScheduler, JitterEngine};

/// Operation name under which saga results are cached.
pub const SAGA_OPERATION: &str = "schedule_saga";

/// Drives a creator's day schedule through rotation, follow-ups, jitter and
/// validation, rolling everything back if a step fails.
pub struct SagaCoordinator {
    config: SlotSagaConfig,
    machine: RotationStateMachine,
    jitter: JitterEngine,
    scheduler: FollowupScheduler,
    store: Arc<dyn RotationStore>,
    validator: Arc<dyn ScheduleValidator>,
    events: Arc<dyn EventSink>,
    breakers: Arc<CircuitBreakerRegistry>,
    guard: Arc<IdempotencyGuard<SagaResult>>,
    locks: Arc<CreatorLocks>,
    runner: SagaRunner,
}

impl SagaCoordinator {
    pub fn new(
        config: SlotSagaConfig,
        store: Arc<dyn RotationStore>,
        validator: Arc<dyn ScheduleValidator>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Ok(Self {
            machine: config.rotation_machine()?,
            jitter: config.jitter_engine()?,
            scheduler: config.followup_scheduler(),
            store,
            validator,
            events,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker_config())),
            guard: Arc::new(IdempotencyGuard::new(config.idempotency_ttl())),
            locks: Arc::new(CreatorLocks::new()),
            runner: SagaRunner::new(config.step_timeout(), config.compensation_timeout()),
            config,
        })
    }

    /// Share breakers with other coordinators.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Share the result cache with other coordinators.
    pub fn with_idempotency_guard(mut self, guard: Arc<IdempotencyGuard<SagaResult>>) -> Self {
        self.guard = guard;
        self
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn idempotency_guard(&self) -> &IdempotencyGuard<SagaResult> {
        &self.guard
    }

    pub async fn execute(&self, creator_id: &str, items: Vec<ScheduleItem>) -> SagaResult {
        self.execute_with_cancel(creator_id, items, CancellationToken::new())
            .await
    }

    /// Run the scheduling saga once per `(creator_id, schedule window)`.
    ///
    /// Sagas for the same creator are serialized. A live cached result for
    /// the same window is returned with `replayed = true` and nothing runs.
    /// Rolled-back results are not cached, so a retry starts from scratch.
    pub async fn execute_with_cancel(
        &self,
        creator_id: &str,
        items: Vec<ScheduleItem>,
        cancel: CancellationToken,
    ) -> SagaResult {
        let started = Instant::now();
        let params = idempotency_params(creator_id, &items);
        let _lock = self.locks.acquire(creator_id).await;

        if let Some(mut cached) = self.guard.lookup(SAGA_OPERATION, &params) {
            info!(creator_id, saga_id = %cached.saga_id, "replaying cached saga result");
            cached.replayed = true;
            self.emit_execution(&cached);
            return cached;
        }

        let schedule_day = items
            .iter()
            .map(|i| i.scheduled_time.date())
            .min()
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut ctx = SchedulingContext::new(creator_id, schedule_day, items);
        let steps = self.steps();
        let mut execution =
            SagaExecution::new(creator_id, steps.iter().map(|s| s.name().to_string()).collect());
        info!(creator_id, saga_id = %execution.saga_id, %schedule_day, "saga started");

        self.runner.run(&mut execution, &steps, &mut ctx, &cancel).await;

        let mut result = SagaResult::from_execution(&execution, ctx.items, started.elapsed());
        if matches!(result.status, SagaStatus::Completed | SagaStatus::Failed) {
            let check = self
                .guard
                .check_and_store(SAGA_OPERATION, &params, result.clone());
            if let Some(mut cached) = check.cached_result {
                cached.replayed = true;
                result = cached;
            }
        }

        match result.status {
            SagaStatus::Completed => info!(
                creator_id,
                saga_id = %result.saga_id,
                items = result.item_count,
                duration_ms = result.duration_ms,
                "saga completed"
            ),
            status => warn!(
                creator_id,
                saga_id = %result.saga_id,
                %status,
                failed_step = result.failed_step.as_deref().unwrap_or("-"),
                error = result.error.as_deref().unwrap_or("-"),
                "saga did not complete"
            ),
        }
        self.emit_execution(&result);
        result
    }

    fn steps(&self) -> Vec<Box<dyn SagaStep<SchedulingContext>>> {
        let followup = &self.config.followup;
        vec![
            Box::new(RotationStep {
                machine: self.machine.clone(),
                store: Arc::clone(&self.store),
                breaker: self.breakers.get(ROTATION_STORE_BREAKER),
                events: Arc::clone(&self.events),
            }),
            Box::new(FollowupStep {
                scheduler: self.scheduler.clone(),
                min_offset: followup.min_offset_minutes,
                max_offset: followup.max_offset_minutes,
                allow_next_day: followup.allow_next_day,
                send_type: followup.send_type.clone(),
                events: Arc::clone(&self.events),
            }),
            Box::new(JitterStep {
                engine: self.jitter.clone(),
                events: Arc::clone(&self.events),
            }),
            Box::new(ValidationStep {
                validator: Arc::clone(&self.validator),
                breaker: self.breakers.get(VALIDATOR_BREAKER),
                events: Arc::clone(&self.events),
            }),
        ]
    }

    fn emit_execution(&self, result: &SagaResult) {
        self.events.emit(
            SchedulingEvent::new(
                EventType::SagaExecution,
                &result.creator_id,
                json!({
                    "saga_id": result.saga_id,
                    "status": result.status,
                    "completed_steps": result.completed_steps,
                    "failed_step": result.failed_step,
                    "error_kind": result.error_kind,
                    "compensated_steps": result.compensated_steps,
                    "requires_manual_remediation": result.requires_manual_remediation,
                    "replayed": result.replayed,
                    "item_count": result.item_count,
                }),
            )
            .with_duration(result.duration_ms),
        );
    }
}

/// Idempotency parameters: the creator plus an order-independent hash of the
/// submitted items.
fn idempotency_params(creator_id: &str, items: &[ScheduleItem]) -> Value {
    let mut parts: Vec<String> = items
        .iter()
        .map(|item| serde_json::to_string(item).unwrap_or_else(|_| item.id.clone()))
        .collect();
    parts.sort();
    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    json!({
        "creator_id": creator_id,
        "window": format!("{:016x}", stable_hash(&refs)),
    })
}
