use chrono::{Duration, NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::TimingError;
use super::seed::{JITTER_NAMESPACE, seed};

/// Minutes of the hour a jittered send may never land on.
pub const FORBIDDEN_MINUTES: [u32; 4] = [0, 15, 30, 45];

/// Tried, in order, when the configured range yields nothing usable.
const FALLBACK_OFFSETS: [i64; 8] = [1, -1, 2, -2, 3, -3, 4, -4];

/// True when the timestamp sits on a quarter hour.
pub fn is_round_minute(time: NaiveDateTime) -> bool {
    FORBIDDEN_MINUTES.contains(&time.minute())
}

/// Moves send times off round minutes by a small, creator-specific offset.
#[derive(Debug, Clone)]
pub struct JitterEngine {
    min_offset: i64,
    max_offset: i64,
}

impl Default for JitterEngine {
    fn default() -> Self {
        Self {
            min_offset: -7,
            max_offset: 8,
        }
    }
}

impl JitterEngine {
    pub fn new(min_offset: i64, max_offset: i64) -> Result<Self, TimingError> {
        if min_offset > max_offset {
            return Err(TimingError::InvalidJitterRange {
                min_offset,
                max_offset,
            });
        }
        Ok(Self {
            min_offset,
            max_offset,
        })
    }

    /// Widest distance, in minutes, jitter can move a timestamp.
    pub fn max_shift(&self) -> i64 {
        self.min_offset.abs().max(self.max_offset.abs())
    }

    /// Shift `base_time` by a seeded offset whose result avoids
    /// [`FORBIDDEN_MINUTES`].
    ///
    /// Identical `(base_time, creator_id)` pairs always produce the same
    /// result.
    pub fn apply_jitter(
        &self,
        base_time: NaiveDateTime,
        creator_id: &str,
    ) -> Result<NaiveDateTime, TimingError> {
        let mut rng = StdRng::seed_from_u64(seed(JITTER_NAMESPACE, creator_id, base_time));

        let mut candidates = valid_offsets(base_time, self.min_offset..=self.max_offset);
        if candidates.is_empty() {
            candidates = valid_offsets(base_time, FALLBACK_OFFSETS);
        }
        if candidates.is_empty() {
            return Err(TimingError::NoValidOffset {
                minute: base_time.minute(),
            });
        }

        let offset = candidates[rng.gen_range(0..candidates.len())];
        let jittered = base_time + Duration::minutes(offset);
        debug!(creator_id, %base_time, offset, %jittered, "jitter applied");
        Ok(jittered)
    }
}

fn valid_offsets(base: NaiveDateTime, offsets: impl IntoIterator<Item = i64>) -> Vec<i64> {
    offsets
        .into_iter()
        .filter(|&offset| !is_round_minute(base + Duration::minutes(offset)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn never_lands_on_round_minutes() {
        let engine = JitterEngine::default();
        for creator in ["alpha", "beta", "gamma", "delta"] {
            for hour in 0..24 {
                for minute in 0..60 {
                    let out = engine.apply_jitter(at(hour, minute), creator).unwrap();
                    assert!(
                        !is_round_minute(out),
                        "{creator} {hour}:{minute} jittered to {out}"
                    );
                }
            }
        }
    }

    #[test]
    fn offset_stays_in_range() {
        let engine = JitterEngine::default();
        for minute in 0..60 {
            let base = at(12, minute);
            let out = engine.apply_jitter(base, "creator-1").unwrap();
            let offset = (out - base).num_minutes();
            assert!((-7..=8).contains(&offset), "offset {offset} out of range");
        }
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let engine = JitterEngine::default();
        let first = engine.apply_jitter(at(9, 30), "creator-1").unwrap();
        for _ in 0..10 {
            assert_eq!(engine.apply_jitter(at(9, 30), "creator-1").unwrap(), first);
        }
    }

    #[test]
    fn falls_back_when_range_only_hits_round_minutes() {
        // Range of exactly zero at a round minute has no valid offset.
        let engine = JitterEngine::new(0, 0).unwrap();
        let out = engine.apply_jitter(at(10, 0), "creator-1").unwrap();
        assert!(!is_round_minute(out));
        assert!((out - at(10, 0)).num_minutes().abs() <= 4);
    }

    #[test]
    fn zero_range_off_round_minute_is_identity() {
        let engine = JitterEngine::new(0, 0).unwrap();
        assert_eq!(engine.apply_jitter(at(10, 7), "c").unwrap(), at(10, 7));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert_eq!(
            JitterEngine::new(5, -5).unwrap_err(),
            TimingError::InvalidJitterRange {
                min_offset: 5,
                max_offset: -5
            }
        );
    }

    #[test]
    fn max_shift_covers_both_directions() {
        assert_eq!(JitterEngine::default().max_shift(), 8);
        assert_eq!(JitterEngine::new(-10, 2).unwrap().max_shift(), 10);
    }
}
