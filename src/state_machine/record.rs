use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::RotationState;

/// Persisted rotation state for a single creator.
///
/// Only [`RotationStateMachine`](super::RotationStateMachine) produces new
/// versions of a record; stores treat it as an opaque value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationStateRecord {
    pub creator_id: String,
    pub current_state: RotationState,
    /// Style sequence, one character per PPV position.
    pub current_pattern: String,
    pub days_on_pattern: u32,
    pub last_transition_at: DateTime<Utc>,
}

impl RotationStateRecord {
    pub fn new(creator_id: impl Into<String>, pattern: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            creator_id: creator_id.into(),
            current_state: RotationState::Initializing,
            current_pattern: pattern.into(),
            days_on_pattern: 0,
            last_transition_at: now,
        }
    }
}

/// What [`RotationStateMachine::advance`](super::RotationStateMachine::advance)
/// did to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationOutcome {
    pub record: RotationStateRecord,
    /// Every `(from, to)` pair walked, in order.
    pub transitions: Vec<(RotationState, RotationState)>,
    pub previous_pattern: String,
    /// True when the active pattern changed.
    pub rotated: bool,
}

impl RotationOutcome {
    pub fn unchanged(record: RotationStateRecord) -> Self {
        Self {
            previous_pattern: record.current_pattern.clone(),
            record,
            transitions: Vec::new(),
            rotated: false,
        }
    }

    /// True when the record passed through `ERROR` during this advance.
    pub fn recovered(&self) -> bool {
        self.transitions
            .iter()
            .any(|(from, _)| *from == RotationState::Error)
    }
}
