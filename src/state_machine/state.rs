use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::{RotationOutcome, RotationStateRecord};
use crate::timing::seed::{ROTATION_NAMESPACE, stable_hash};

/// The five states of a creator's content rotation.
///
/// A creator normally sits in `PatternActive`; every 3–4 days the pattern
/// rotates via `RotationPending → Rotating → PatternActive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationState {
    Initializing,
    PatternActive,
    RotationPending,
    Rotating,
    Error,
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationState::Initializing => write!(f, "INITIALIZING"),
            RotationState::PatternActive => write!(f, "PATTERN_ACTIVE"),
            RotationState::RotationPending => write!(f, "ROTATION_PENDING"),
            RotationState::Rotating => write!(f, "ROTATING"),
            RotationState::Error => write!(f, "ERROR"),
        }
    }
}

/// The closed set of legal transitions.
pub const TRANSITIONS: [(RotationState, RotationState); 6] = [
    (RotationState::Initializing, RotationState::PatternActive),
    (RotationState::PatternActive, RotationState::RotationPending),
    (RotationState::RotationPending, RotationState::Rotating),
    (RotationState::Rotating, RotationState::PatternActive),
    (RotationState::Rotating, RotationState::Error),
    (RotationState::Error, RotationState::Initializing),
];

impl RotationState {
    pub const ALL: [RotationState; 5] = [
        RotationState::Initializing,
        RotationState::PatternActive,
        RotationState::RotationPending,
        RotationState::Rotating,
        RotationState::Error,
    ];

    pub fn can_transition_to(self, to: RotationState) -> bool {
        TRANSITIONS.contains(&(self, to))
    }
}

/// A transition outside [`TRANSITIONS`] was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid rotation transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RotationState,
    pub to: RotationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("no rotation patterns configured")]
    NoPatterns,

    #[error("rotation pattern {pattern:?} contains unknown style code {code:?}")]
    UnknownStyleCode { pattern: String, code: char },

    #[error("rotation pattern is empty")]
    EmptyPattern,
}

/// Style code to style name. Codes are what patterns are written in.
pub const STYLE_CODES: [(char, &str); 4] = [
    ('S', "solo"),
    ('B', "bundle"),
    ('W', "winner"),
    ('T', "sextape"),
];

/// Patterns used when none are configured. Each one cycles without
/// repeating a style back-to-back.
pub const DEFAULT_PATTERNS: [&str; 4] = ["SBWT", "BTSW", "WSTB", "TWBS"];

/// Look up the style name for a pattern character.
pub fn style_name(code: char) -> Option<&'static str> {
    STYLE_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Pure transition logic over [`RotationStateRecord`]s.
#[derive(Debug, Clone)]
pub struct RotationStateMachine {
    patterns: Vec<String>,
}

impl Default for RotationStateMachine {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl RotationStateMachine {
    pub fn new(patterns: Vec<String>) -> Result<Self, RotationError> {
        if patterns.is_empty() {
            return Err(RotationError::NoPatterns);
        }
        for pattern in &patterns {
            if pattern.is_empty() {
                return Err(RotationError::EmptyPattern);
            }
            if let Some(code) = pattern.chars().find(|c| style_name(*c).is_none()) {
                return Err(RotationError::UnknownStyleCode {
                    pattern: pattern.clone(),
                    code,
                });
            }
        }
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Apply one transition, returning the new record.
    ///
    /// The input record is never modified. Entering `PatternActive` starts a
    /// new cycle, so `days_on_pattern` resets to zero.
    pub fn transition(
        record: &RotationStateRecord,
        to: RotationState,
        at: DateTime<Utc>,
    ) -> Result<RotationStateRecord, InvalidTransition> {
        let from = record.current_state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }

        let mut next = record.clone();
        next.current_state = to;
        next.last_transition_at = at;
        if to == RotationState::PatternActive {
            next.days_on_pattern = 0;
        }
        Ok(next)
    }

    /// A fresh `Initializing` record with the creator's initial pattern.
    pub fn initialize(&self, creator_id: &str, now: DateTime<Utc>) -> RotationStateRecord {
        RotationStateRecord::new(creator_id, self.initial_pattern(creator_id), now)
    }

    /// Starting pattern for a creator, picked by hashing the creator id.
    pub fn initial_pattern(&self, creator_id: &str) -> &str {
        let index = stable_hash(&[ROTATION_NAMESPACE, creator_id]) % self.patterns.len() as u64;
        &self.patterns[index as usize]
    }

    /// Whether a cycle that has run `days_on_pattern` days should rotate.
    ///
    /// Days 0–2 never rotate and day 4+ always does. On day 3 the creator id
    /// and the cycle's start day decide, so roughly half of all cycles last
    /// three days and half last four.
    pub fn rotation_due(record: &RotationStateRecord, days_on_pattern: u32) -> bool {
        match days_on_pattern {
            0..=2 => false,
            3 => {
                let cycle_day = record.last_transition_at.date_naive().num_days_from_ce();
                stable_hash(&[ROTATION_NAMESPACE, &record.creator_id, &cycle_day.to_string()]) % 2
                    == 0
            }
            _ => true,
        }
    }

    /// Bring `record` up to date for `today`.
    ///
    /// Walks the transition table as far as needed: finishes an interrupted
    /// rotation, restarts `Error` records from `Initializing`, rotates an
    /// expired pattern, and routes an unknown pattern through `Error` so it
    /// is replaced from scratch. Always ends in `PatternActive`.
    pub fn advance(
        &self,
        record: &RotationStateRecord,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, RotationError> {
        let mut outcome = RotationOutcome::unchanged(record.clone());

        loop {
            let current = &mut outcome.record;
            match current.current_state {
                RotationState::Error => {
                    walk(&mut outcome, RotationState::Initializing, now)?;
                }
                RotationState::Initializing => {
                    outcome.record.current_pattern =
                        self.initial_pattern(&outcome.record.creator_id).to_string();
                    walk(&mut outcome, RotationState::PatternActive, now)?;
                    break;
                }
                RotationState::PatternActive => {
                    if !self.is_known(&current.current_pattern) {
                        walk(&mut outcome, RotationState::RotationPending, now)?;
                        continue;
                    }
                    let days = (today - current.last_transition_at.date_naive())
                        .num_days()
                        .max(0) as u32;
                    current.days_on_pattern = days;
                    if Self::rotation_due(current, days) {
                        walk(&mut outcome, RotationState::RotationPending, now)?;
                        continue;
                    }
                    break;
                }
                RotationState::RotationPending => {
                    walk(&mut outcome, RotationState::Rotating, now)?;
                }
                RotationState::Rotating => match self.next_pattern(&current.current_pattern) {
                    Some(next) => {
                        current.current_pattern = next.to_string();
                        walk(&mut outcome, RotationState::PatternActive, now)?;
                        break;
                    }
                    None => walk(&mut outcome, RotationState::Error, now)?,
                },
            }
        }

        outcome.rotated = outcome.record.current_pattern != outcome.previous_pattern;
        Ok(outcome)
    }

    /// Style name at `position` in the record's active pattern. Positions
    /// wrap around the pattern.
    pub fn style_at(
        &self,
        record: &RotationStateRecord,
        position: usize,
    ) -> Result<&'static str, RotationError> {
        let codes: Vec<char> = record.current_pattern.chars().collect();
        if codes.is_empty() {
            return Err(RotationError::EmptyPattern);
        }
        let code = codes[position % codes.len()];
        style_name(code).ok_or_else(|| RotationError::UnknownStyleCode {
            pattern: record.current_pattern.clone(),
            code,
        })
    }

    /// Advance the record for `today`, then return the style for `position`.
    pub fn get_next_style(
        &self,
        record: &RotationStateRecord,
        position: usize,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(RotationOutcome, &'static str), RotationError> {
        let outcome = self.advance(record, today, now)?;
        let style = self.style_at(&outcome.record, position)?;
        Ok((outcome, style))
    }

    fn is_known(&self, pattern: &str) -> bool {
        self.patterns.iter().any(|p| p == pattern)
    }

    fn next_pattern(&self, current: &str) -> Option<&str> {
        let index = self.patterns.iter().position(|p| p == current)?;
        Some(&self.patterns[(index + 1) % self.patterns.len()])
    }
}

fn walk(
    outcome: &mut RotationOutcome,
    to: RotationState,
    at: DateTime<Utc>,
) -> Result<(), InvalidTransition> {
    let from = outcome.record.current_state;
    outcome.record = RotationStateMachine::transition(&outcome.record, to, at)?;
    outcome.transitions.push((from, to));
    Ok(())
}
