use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::CircuitBreakerError;
use crate::state_machine::{InvalidTransition, RotationError, StoreError};
use crate::timing::TimingError;

#[derive(Debug, Error)]
pub enum SlotSagaError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a saga step failed. Never escapes the coordinator; it ends up as
/// `error`/`error_kind` on the saga result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("transient failure in {resource}: {message}")]
    Transient { resource: String, message: String },

    #[error("circuit '{name}' is open, call rejected")]
    CircuitOpen { name: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("rotation state for {creator_id} was changed by another writer")]
    Conflict { creator_id: String },

    #[error("step '{step}' exceeded its {budget_ms}ms budget")]
    Timeout { step: String, budget_ms: u64 },

    #[error("cancelled during step '{step}'")]
    Cancelled { step: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StepError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Transient { .. } | StepError::CircuitOpen { .. } | StepError::Conflict { .. } => {
                FailureKind::Transient
            }
            StepError::Validation(_) | StepError::Config(_) => FailureKind::Validation,
            StepError::InvalidTransition(_) => FailureKind::InvalidTransition,
            StepError::Timeout { .. } | StepError::Cancelled { .. } => FailureKind::Timeout,
        }
    }

    /// Map a breaker-wrapped store call failure.
    pub fn from_store(err: CircuitBreakerError<StoreError>, resource: &str) -> Self {
        match err {
            CircuitBreakerError::Rejected { name, .. } => StepError::CircuitOpen { name },
            CircuitBreakerError::Inner(e) => transient(resource, e),
        }
    }
}

impl From<CircuitBreakerError<StepError>> for StepError {
    fn from(err: CircuitBreakerError<StepError>) -> Self {
        match err {
            CircuitBreakerError::Rejected { name, .. } => StepError::CircuitOpen { name },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

fn transient(resource: &str, err: impl Display) -> StepError {
    StepError::Transient {
        resource: resource.to_string(),
        message: err.to_string(),
    }
}

impl From<TimingError> for StepError {
    fn from(err: TimingError) -> Self {
        match err {
            TimingError::GapBelowMinimum { .. } | TimingError::NoRoomBeforeEndOfDay { .. } => {
                StepError::Validation(err.to_string())
            }
            TimingError::InvalidWindow { .. }
            | TimingError::NoValidOffset { .. }
            | TimingError::InvalidJitterRange { .. } => StepError::Config(err.to_string()),
        }
    }
}

impl From<RotationError> for StepError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::InvalidTransition(t) => StepError::InvalidTransition(t),
            other => StepError::Config(other.to_string()),
        }
    }
}

/// Failure taxonomy reported alongside a failed saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Resource hiccup or open circuit; back off before retrying.
    Transient,
    /// An invariant was violated mid-step; not retried.
    Validation,
    /// Rotation transition outside the table; a logic defect.
    InvalidTransition,
    /// Step ran out of budget or was cancelled.
    Timeout,
    /// A rollback step failed; needs an operator.
    Compensation,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Validation => write!(f, "Validation"),
            FailureKind::InvalidTransition => write!(f, "InvalidTransition"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::Compensation => write!(f, "Compensation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::state_machine::RotationState;

    #[test]
    fn step_errors_classify_into_taxonomy() {
        assert_eq!(
            StepError::CircuitOpen { name: "x".into() }.kind(),
            FailureKind::Transient
        );
        assert_eq!(StepError::Validation("gap".into()).kind(), FailureKind::Validation);
        assert_eq!(
            StepError::Cancelled { step: "jitter".into() }.kind(),
            FailureKind::Timeout
        );
        let invalid = InvalidTransition {
            from: RotationState::Initializing,
            to: RotationState::Rotating,
        };
        assert_eq!(StepError::from(invalid).kind(), FailureKind::InvalidTransition);
    }

    #[test]
    fn timing_errors_map_by_cause() {
        let gap = TimingError::GapBelowMinimum {
            gap_minutes: 9,
            min_offset: 15,
        };
        assert!(matches!(StepError::from(gap), StepError::Validation(_)));
        let late = TimingError::NoRoomBeforeEndOfDay {
            parent_time: chrono::NaiveDate::from_ymd_opt(2025, 6, 2)
                .unwrap()
                .and_hms_opt(23, 59, 30)
                .unwrap(),
        };
        assert!(matches!(StepError::from(late), StepError::Validation(_)));
        let window = TimingError::InvalidWindow {
            min_offset: 5,
            max_offset: 1,
        };
        assert!(matches!(StepError::from(window), StepError::Config(_)));
    }

    #[test]
    fn store_errors_map_through_breaker() {
        let rejected: CircuitBreakerError<StoreError> = CircuitBreakerError::Rejected {
            name: "rotation-state-store".into(),
            state: CircuitState::Open,
        };
        assert_eq!(
            StepError::from_store(rejected, "rotation-state-store"),
            StepError::CircuitOpen {
                name: "rotation-state-store".into()
            }
        );

        let inner = CircuitBreakerError::Inner(StoreError::Unavailable("db down".into()));
        let err = StepError::from_store(inner, "rotation-state-store");
        assert_eq!(err.kind(), FailureKind::Transient);
        assert_eq!(
            err.to_string(),
            "transient failure in rotation-state-store: rotation store unavailable: db down"
        );
    }

    #[test]
    fn timeout_display() {
        let err = StepError::Timeout {
            step: "validation".into(),
            budget_ms: 250,
        };
        assert_eq!(err.to_string(), "step 'validation' exceeded its 250ms budget");
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FailureKind::InvalidTransition).unwrap(),
            "\"invalid_transition\""
        );
    }
}
