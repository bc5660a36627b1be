//! Scheduling saga: four compensable steps run under idempotency, breakers
//! and a per-creator lock.

mod coordinator;
mod execution;
mod locks;
mod steps;
mod types;
mod validator;

pub use coordinator::{SAGA_OPERATION, SagaCoordinator};
pub use execution::{SagaRunner, SagaStep};
pub use locks::CreatorLocks;
pub use steps::{
    FOLLOWUP_STEP, FollowupStep, JITTER_STEP, JitterStep, ROTATION_STEP, RotationStep,
    SchedulingContext, VALIDATION_STEP, ValidationStep,
};
pub use types::{SagaExecution, SagaResult, SagaStatus, ScheduleItem};
pub use validator::{ScheduleValidator, StructuralValidator, ValidationReport};
