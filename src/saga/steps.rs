//! The four scheduling steps and the context they share.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde_json::json;
use tracing::{debug, info};

use super::execution::SagaStep;
use super::types::ScheduleItem;
use super::validator::{ScheduleValidator, ValidationReport};
use crate::error::StepError;
use crate::events::{EventSink, EventType, SchedulingEvent};
use crate::resilience::{CircuitBreaker, ROTATION_STORE_BREAKER};
use crate::state_machine::{RotationStateMachine, RotationStateRecord, RotationStore};
use crate::timing::{FollowupScheduler, JitterEngine};

pub const ROTATION_STEP: &str = "rotation";
pub const FOLLOWUP_STEP: &str = "followups";
pub const JITTER_STEP: &str = "jitter";
pub const VALIDATION_STEP: &str = "validation";

/// Mutable state threaded through one scheduling saga.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub creator_id: String,
    /// Calendar day the schedule covers; rotation ages are measured against it.
    pub schedule_day: NaiveDate,
    pub items: Vec<ScheduleItem>,
    pub validation: Option<ValidationReport>,

    loaded_record: Option<RotationStateRecord>,
    saved_record: Option<RotationStateRecord>,
    styled_indices: Vec<usize>,
    followups_start: Option<usize>,
    pre_jitter_times: Option<Vec<NaiveDateTime>>,
}

impl SchedulingContext {
    pub fn new(creator_id: impl Into<String>, schedule_day: NaiveDate, items: Vec<ScheduleItem>) -> Self {
        Self {
            creator_id: creator_id.into(),
            schedule_day,
            items,
            validation: None,
            loaded_record: None,
            saved_record: None,
            styled_indices: Vec::new(),
            followups_start: None,
            pre_jitter_times: None,
        }
    }

    /// Timestamp stamped on rotation transitions: midnight UTC of the
    /// schedule day, so pattern ages are counted on the schedule's calendar
    /// and not the wall clock.
    pub fn transition_at(&self) -> DateTime<Utc> {
        self.schedule_day.and_time(NaiveTime::MIN).and_utc()
    }

    /// Rotation record written by this saga, if any.
    pub fn saved_record(&self) -> Option<&RotationStateRecord> {
        self.saved_record.as_ref()
    }
}

/// Advances the creator's rotation state, persists it and styles PPV items.
pub struct RotationStep {
    pub machine: RotationStateMachine,
    pub store: Arc<dyn RotationStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub events: Arc<dyn EventSink>,
}

impl RotationStep {
    async fn load(&self, creator_id: &str) -> Result<Option<RotationStateRecord>, StepError> {
        self.breaker
            .call(|| self.store.load_rotation_state(creator_id))
            .await
            .map_err(|e| StepError::from_store(e, ROTATION_STORE_BREAKER))
    }
}

#[async_trait]
impl SagaStep<SchedulingContext> for RotationStep {
    fn name(&self) -> &'static str {
        ROTATION_STEP
    }

    async fn execute(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        let loaded = self.load(&ctx.creator_id).await?;
        let at = ctx.transition_at();
        let base = match &loaded {
            Some(record) => record.clone(),
            None => self.machine.initialize(&ctx.creator_id, at),
        };
        let outcome = self.machine.advance(&base, ctx.schedule_day, at)?;

        // PPV positions follow send order; explicit styles keep their slot.
        let mut ppv: Vec<usize> = (0..ctx.items.len()).filter(|&i| ctx.items[i].is_ppv).collect();
        ppv.sort_by_key(|&i| ctx.items[i].scheduled_time);
        let mut assignments = Vec::new();
        for (position, &index) in ppv.iter().enumerate() {
            if ctx.items[index].style.is_none() {
                assignments.push((index, self.machine.style_at(&outcome.record, position)?));
            }
        }

        if loaded.as_ref() != Some(&outcome.record) {
            // Recorded before the write so an interrupted save can be undone.
            ctx.loaded_record = loaded.clone();
            ctx.saved_record = Some(outcome.record.clone());
            let saved = self
                .breaker
                .call(|| self.store.save_rotation_state(&outcome.record, loaded.as_ref()))
                .await
                .map_err(|e| StepError::from_store(e, ROTATION_STORE_BREAKER));
            match saved {
                Ok(true) => {}
                other => {
                    ctx.loaded_record = None;
                    ctx.saved_record = None;
                    return Err(other.err().unwrap_or_else(|| StepError::Conflict {
                        creator_id: ctx.creator_id.clone(),
                    }));
                }
            }
        }

        for (index, style) in &assignments {
            ctx.items[*index].style = Some(style.to_string());
        }
        ctx.styled_indices = assignments.iter().map(|(index, _)| *index).collect();

        if !outcome.transitions.is_empty() {
            let transitions: Vec<String> = outcome
                .transitions
                .iter()
                .map(|(from, to)| format!("{from}->{to}"))
                .collect();
            info!(
                creator_id = %ctx.creator_id,
                previous = %outcome.previous_pattern,
                pattern = %outcome.record.current_pattern,
                rotated = outcome.rotated,
                "rotation state advanced"
            );
            self.events.emit(SchedulingEvent::new(
                EventType::RotationChange,
                &ctx.creator_id,
                json!({
                    "previous_pattern": outcome.previous_pattern,
                    "current_pattern": outcome.record.current_pattern,
                    "rotated": outcome.rotated,
                    "recovered": outcome.recovered(),
                    "days_on_pattern": outcome.record.days_on_pattern,
                    "transitions": transitions,
                }),
            ));
        }
        Ok(())
    }

    /// Clear assigned styles and put the stored record back the way it was
    /// found. A first-time creator's record is deleted.
    async fn compensate(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        for index in ctx.styled_indices.drain(..) {
            if let Some(item) = ctx.items.get_mut(index) {
                item.style = None;
            }
        }

        let Some(saved) = ctx.saved_record.take() else {
            return Ok(());
        };
        let original = ctx.loaded_record.take();
        let restored = match &original {
            Some(record) => {
                self.breaker
                    .call(|| self.store.save_rotation_state(record, Some(&saved)))
                    .await
            }
            None => {
                self.breaker
                    .call(|| self.store.delete_rotation_state(&ctx.creator_id, &saved))
                    .await
            }
        }
        .map_err(|e| StepError::from_store(e, ROTATION_STORE_BREAKER))?;

        if !restored {
            // The write may never have landed if the step was cut off mid-save.
            if self.load(&ctx.creator_id).await? != original {
                return Err(StepError::Conflict {
                    creator_id: ctx.creator_id.clone(),
                });
            }
        }
        info!(creator_id = %ctx.creator_id, "rotation state restored");
        Ok(())
    }
}

/// Adds a follow-up after every PPV send that does not have one yet.
pub struct FollowupStep {
    pub scheduler: FollowupScheduler,
    pub min_offset: i64,
    pub max_offset: i64,
    pub allow_next_day: bool,
    pub send_type: String,
    pub events: Arc<dyn EventSink>,
}

#[async_trait]
impl SagaStep<SchedulingContext> for FollowupStep {
    fn name(&self) -> &'static str {
        FOLLOWUP_STEP
    }

    async fn execute(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        let covered: HashSet<&str> = ctx.items.iter().filter_map(|i| i.parent_id.as_deref()).collect();

        let mut generated = Vec::new();
        for parent in ctx.items.iter().filter(|i| {
            i.is_ppv && !i.is_followup() && i.send_type != self.send_type && !covered.contains(i.id.as_str())
        }) {
            let at = self.scheduler.schedule(
                parent.scheduled_time,
                &ctx.creator_id,
                self.min_offset,
                self.max_offset,
                self.allow_next_day,
            )?;
            generated.push(ScheduleItem::followup_of(parent, at, &self.send_type));
        }

        for followup in &generated {
            let parent_time = ctx
                .items
                .iter()
                .find(|i| Some(&i.id) == followup.parent_id.as_ref())
                .map(|i| i.scheduled_time);
            let gap_minutes = parent_time.map(|t| (followup.scheduled_time - t).num_minutes());
            self.events.emit(SchedulingEvent::new(
                EventType::FollowupScheduled,
                &ctx.creator_id,
                json!({
                    "followup_id": followup.id,
                    "parent_id": followup.parent_id,
                    "scheduled_time": followup.scheduled_time,
                    "gap_minutes": gap_minutes,
                }),
            ));
        }

        debug!(creator_id = %ctx.creator_id, count = generated.len(), "follow-ups generated");
        ctx.followups_start = Some(ctx.items.len());
        ctx.items.extend(generated);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        if let Some(start) = ctx.followups_start.take() {
            ctx.items.truncate(start);
        }
        Ok(())
    }
}

/// Moves every send off round minutes.
///
/// Follow-ups first move by the same amount as their parent and are then
/// jittered themselves, so the gap changes by at most one jitter offset.
pub struct JitterStep {
    pub engine: JitterEngine,
    pub events: Arc<dyn EventSink>,
}

#[async_trait]
impl SagaStep<SchedulingContext> for JitterStep {
    fn name(&self) -> &'static str {
        JITTER_STEP
    }

    async fn execute(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        let before: Vec<NaiveDateTime> = ctx.items.iter().map(|i| i.scheduled_time).collect();
        let mut after = before.clone();

        for (index, item) in ctx.items.iter().enumerate().filter(|(_, i)| !i.is_followup()) {
            after[index] = self.engine.apply_jitter(item.scheduled_time, &ctx.creator_id)?;
        }
        for (index, item) in ctx.items.iter().enumerate().filter(|(_, i)| i.is_followup()) {
            let parent_shift = ctx
                .items
                .iter()
                .position(|p| Some(&p.id) == item.parent_id.as_ref())
                .map(|p| after[p] - before[p])
                .unwrap_or_else(TimeDelta::zero);
            after[index] = self
                .engine
                .apply_jitter(item.scheduled_time + parent_shift, &ctx.creator_id)?;
        }

        let shifts: Vec<_> = ctx
            .items
            .iter()
            .zip(before.iter().zip(&after))
            .map(|(item, (from, to))| {
                json!({
                    "id": item.id,
                    "from": from,
                    "to": to,
                    "offset_minutes": (*to - *from).num_minutes(),
                })
            })
            .collect();
        for (item, time) in ctx.items.iter_mut().zip(after) {
            item.scheduled_time = time;
        }
        ctx.pre_jitter_times = Some(before);

        self.events.emit(SchedulingEvent::new(
            EventType::JitterApplied,
            &ctx.creator_id,
            json!({ "count": shifts.len(), "shifts": shifts }),
        ));
        Ok(())
    }

    async fn compensate(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        let Some(before) = ctx.pre_jitter_times.take() else {
            return Ok(());
        };
        if before.len() != ctx.items.len() {
            return Err(StepError::Config(format!(
                "cannot restore {} pre-jitter times onto {} items",
                before.len(),
                ctx.items.len()
            )));
        }
        for (item, time) in ctx.items.iter_mut().zip(before) {
            item.scheduled_time = time;
        }
        Ok(())
    }
}

/// Runs the finished schedule past the external validator.
pub struct ValidationStep {
    pub validator: Arc<dyn ScheduleValidator>,
    pub breaker: Arc<CircuitBreaker>,
    pub events: Arc<dyn EventSink>,
}

#[async_trait]
impl SagaStep<SchedulingContext> for ValidationStep {
    fn name(&self) -> &'static str {
        VALIDATION_STEP
    }

    async fn execute(&self, ctx: &mut SchedulingContext) -> Result<(), StepError> {
        let started = std::time::Instant::now();
        let report = self
            .breaker
            .call(|| self.validator.validate(&ctx.creator_id, &ctx.items))
            .await?;

        self.events.emit(
            SchedulingEvent::new(
                EventType::ValidationResult,
                &ctx.creator_id,
                json!({
                    "is_valid": report.is_valid,
                    "errors": report.errors,
                    "warnings": report.warnings,
                }),
            )
            .with_duration(started.elapsed().as_millis() as u64),
        );

        if !report.is_valid {
            return Err(StepError::Validation(report.errors.join("; ")));
        }
        ctx.validation = Some(report);
        Ok(())
    }
}
