//! Generic step runner with timeouts, cancellation and reverse-order
//! compensation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::types::{SagaExecution, SagaStatus};
use crate::error::StepError;

/// One forward action of a saga plus the action that undoes it.
///
/// `execute` must leave the context unchanged when it returns an error.
/// `compensate` runs at most once, and only for a step that completed or was
/// interrupted mid-flight.
#[async_trait]
pub trait SagaStep<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<(), StepError>;

    async fn compensate(&self, _ctx: &mut C) -> Result<(), StepError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SagaRunner {
    pub step_timeout: Duration,
    pub compensation_timeout: Duration,
}

impl Default for SagaRunner {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
            compensation_timeout: Duration::from_secs(5),
        }
    }
}

impl SagaRunner {
    pub fn new(step_timeout: Duration, compensation_timeout: Duration) -> Self {
        Self {
            step_timeout,
            compensation_timeout,
        }
    }

    /// Run `steps` in order against `ctx`.
    ///
    /// On the first failure the completed steps are compensated in reverse.
    /// A step cut off by its timeout or by `cancel` may have left partial
    /// effects, so it is compensated first. The final status is
    /// `COMPLETED`, `ROLLED_BACK` or, when any compensation fails, `FAILED`.
    pub async fn run<C: Send>(
        &self,
        execution: &mut SagaExecution,
        steps: &[Box<dyn SagaStep<C>>],
        ctx: &mut C,
        cancel: &CancellationToken,
    ) {
        execution.status = SagaStatus::Running;
        let saga_id = execution.saga_id;

        let mut to_compensate = 0;
        for step in steps {
            let name = step.name();
            match self.run_step(step.as_ref(), ctx, cancel).await {
                Ok(()) => {
                    info!(%saga_id, step = name, "step completed");
                    execution.completed_steps.push(name.to_string());
                    to_compensate += 1;
                }
                Err((err, interrupted)) => {
                    warn!(%saga_id, step = name, error = %err, "step failed");
                    execution.failed_step = Some(name.to_string());
                    execution.error = Some(err);
                    if interrupted {
                        to_compensate += 1;
                    }
                    break;
                }
            }
        }

        if execution.error.is_none() {
            execution.status = SagaStatus::Completed;
            return;
        }

        for step in steps[..to_compensate].iter().rev() {
            let name = step.name();
            let outcome = match timeout(self.compensation_timeout, step.compensate(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout {
                    step: name.to_string(),
                    budget_ms: self.compensation_timeout.as_millis() as u64,
                }),
            };
            match outcome {
                Ok(()) => {
                    info!(%saga_id, step = name, "step compensated");
                    execution.compensated_steps.push(name.to_string());
                }
                Err(err) => {
                    error!(%saga_id, step = name, error = %err, "compensation failed");
                    execution.compensation_errors.push(format!("{name}: {err}"));
                }
            }
        }

        execution.status = if execution.compensation_errors.is_empty() {
            SagaStatus::RolledBack
        } else {
            SagaStatus::Failed
        };
    }

    /// Run one step. The flag in the error is true when the step had started
    /// and was cut off.
    async fn run_step<C: Send>(
        &self,
        step: &dyn SagaStep<C>,
        ctx: &mut C,
        cancel: &CancellationToken,
    ) -> Result<(), (StepError, bool)> {
        let name = step.name();
        if cancel.is_cancelled() {
            return Err((StepError::Cancelled { step: name.to_string() }, false));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err((StepError::Cancelled { step: name.to_string() }, true)),
            result = timeout(self.step_timeout, step.execute(ctx)) => match result {
                Ok(outcome) => outcome.map_err(|e| (e, false)),
                Err(_) => Err((
                    StepError::Timeout {
                        step: name.to_string(),
                        budget_ms: self.step_timeout.as_millis() as u64,
                    },
                    true,
                )),
            },
        }
    }
}
