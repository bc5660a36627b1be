use std::f64::consts::PI;

use chrono::{Duration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TimingError;
use super::seed::{FOLLOWUP_NAMESPACE, seed};

/// Places follow-up messages a statistically plausible delay after their
/// parent send.
///
/// Delays are drawn from a normal distribution (Box–Muller) truncated to the
/// requested window by rejection sampling. When rejection keeps missing, a
/// uniform draw inside the window is used instead.
#[derive(Debug, Clone)]
pub struct FollowupScheduler {
    /// Center of the delay distribution, in minutes.
    pub mean_minutes: f64,
    /// Standard deviation of the delay distribution, in minutes.
    pub std_dev_minutes: f64,
    /// Rejection attempts before falling back to a uniform draw.
    pub max_attempts: u32,
}

impl Default for FollowupScheduler {
    fn default() -> Self {
        Self {
            mean_minutes: 28.0,
            std_dev_minutes: 8.0,
            max_attempts: 100,
        }
    }
}

/// Result of checking a parent/follow-up pair against an offset window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowValidation {
    pub is_valid: bool,
    pub gap_minutes: i64,
    pub error: Option<String>,
}

impl FollowupScheduler {
    /// Compute the follow-up time for a send at `parent_time`.
    ///
    /// With `allow_next_day == false`, a result past midnight is clamped to
    /// 23:59 of the parent's day; if that leaves less than `min_offset`
    /// minutes of spacing the call fails with
    /// [`TimingError::GapBelowMinimum`], and a parent already at or past
    /// 23:59 fails with [`TimingError::NoRoomBeforeEndOfDay`].
    pub fn schedule(
        &self,
        parent_time: NaiveDateTime,
        creator_id: &str,
        min_offset: i64,
        max_offset: i64,
        allow_next_day: bool,
    ) -> Result<NaiveDateTime, TimingError> {
        if min_offset < 0 || min_offset > max_offset {
            return Err(TimingError::InvalidWindow {
                min_offset,
                max_offset,
            });
        }

        let mut rng = StdRng::seed_from_u64(seed(FOLLOWUP_NAMESPACE, creator_id, parent_time));
        let offset = self.sample_offset(&mut rng, min_offset, max_offset);
        let candidate = parent_time + Duration::minutes(offset);

        if allow_next_day || candidate.date() == parent_time.date() {
            debug!(creator_id, %parent_time, offset, "follow-up scheduled");
            return Ok(candidate);
        }

        let end_of_day = parent_time
            .date()
            .and_hms_opt(23, 59, 0)
            .unwrap_or(parent_time);
        if end_of_day <= parent_time {
            return Err(TimingError::NoRoomBeforeEndOfDay { parent_time });
        }
        let gap_minutes = (end_of_day - parent_time).num_minutes();
        if gap_minutes < min_offset {
            return Err(TimingError::GapBelowMinimum {
                gap_minutes,
                min_offset,
            });
        }

        debug!(creator_id, %parent_time, gap_minutes, "follow-up clamped to end of day");
        Ok(end_of_day)
    }

    /// Check that `followup_time` falls inside `[min_offset, max_offset]`
    /// minutes after `parent_time`.
    pub fn validate_window(
        parent_time: NaiveDateTime,
        followup_time: NaiveDateTime,
        min_offset: i64,
        max_offset: i64,
    ) -> WindowValidation {
        let gap_minutes = (followup_time - parent_time).num_minutes();
        let error = if followup_time <= parent_time {
            Some(format!("follow-up at {followup_time} does not come after parent at {parent_time}"))
        } else if gap_minutes < min_offset {
            Some(format!("gap of {gap_minutes}min is below the {min_offset}min minimum"))
        } else if gap_minutes > max_offset {
            Some(format!("gap of {gap_minutes}min exceeds the {max_offset}min maximum"))
        } else {
            None
        };

        WindowValidation {
            is_valid: error.is_none(),
            gap_minutes,
            error,
        }
    }

    fn sample_offset(&self, rng: &mut StdRng, min_offset: i64, max_offset: i64) -> i64 {
        for _ in 0..self.max_attempts {
            // u1 in (0, 1] keeps ln() finite.
            let u1 = 1.0 - rng.gen_range(0.0..1.0_f64);
            let u2 = rng.gen_range(0.0..1.0_f64);
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            let candidate = (self.mean_minutes + z * self.std_dev_minutes).round() as i64;
            if (min_offset..=max_offset).contains(&candidate) {
                return candidate;
            }
        }
        rng.gen_range(min_offset..=max_offset)
    }
}
