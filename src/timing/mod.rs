//! Deterministic timing primitives: seeds, minute jitter and follow-up delays.

mod followup;
mod jitter;
pub mod seed;

pub use followup::{FollowupScheduler, WindowValidation};
pub use jitter::{FORBIDDEN_MINUTES, JitterEngine, is_round_minute};

use chrono::NaiveDateTime;
use thiserror::Error;

/// Errors raised by the timing primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimingError {
    /// The follow-up cannot be placed at least `min_offset` minutes after its
    /// parent without crossing into the next day.
    #[error("follow-up gap of {gap_minutes}min after day-boundary clamp is below the {min_offset}min minimum")]
    GapBelowMinimum { gap_minutes: i64, min_offset: i64 },

    /// The parent is already at or past the end-of-day clamp, so nothing
    /// later on the same day is left for the follow-up.
    #[error("parent at {parent_time} leaves no room for a follow-up before end of day")]
    NoRoomBeforeEndOfDay { parent_time: NaiveDateTime },

    /// The requested offset window is empty or negative.
    #[error("invalid follow-up window [{min_offset}, {max_offset}]")]
    InvalidWindow { min_offset: i64, max_offset: i64 },

    /// No jitter offset avoids the forbidden minutes.
    #[error("no valid jitter offset for minute {minute}")]
    NoValidOffset { minute: u32 },

    /// The configured jitter range is inverted.
    #[error("invalid jitter range [{min_offset}, {max_offset}]")]
    InvalidJitterRange { min_offset: i64, max_offset: i64 },
}
