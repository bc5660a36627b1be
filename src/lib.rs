//! Timing orchestration for creator content slots.
//!
//! A day schedule goes through four compensable steps (rotation, follow-ups,
//! jitter, validation) driven by [`saga::SagaCoordinator`]. Every random
//! choice is seeded from the creator and the minute, so reruns agree.

pub mod config;
pub mod error;
pub mod events;
pub mod resilience;
pub mod saga;
pub mod state_machine;
pub mod timing;

pub use config::SlotSagaConfig;
pub use error::{FailureKind, SlotSagaError, StepError};
pub use saga::{SagaCoordinator, SagaResult, SagaStatus, ScheduleItem};
