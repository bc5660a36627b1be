//! The schedule validator collaborator and its default structural rules.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::ScheduleItem;
use crate::error::StepError;
use crate::timing::{FollowupScheduler, is_round_minute};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn valid() -> Self {
        Self::from_findings(Vec::new(), Vec::new())
    }
}

/// Checks a finished day schedule.
///
/// An `Err` means the validator itself could not run and counts against its
/// circuit breaker. A schedule that breaks the rules is an `Ok` report with
/// `is_valid == false`.
#[async_trait]
pub trait ScheduleValidator: Send + Sync {
    async fn validate(
        &self,
        creator_id: &str,
        items: &[ScheduleItem],
    ) -> Result<ValidationReport, StepError>;
}

/// In-process rules every published schedule must satisfy.
#[derive(Debug, Clone)]
pub struct StructuralValidator {
    pub followup_min_offset: i64,
    pub followup_max_offset: i64,
    /// Slack added to both window edges to absorb jitter.
    pub tolerance_minutes: i64,
}

impl Default for StructuralValidator {
    fn default() -> Self {
        Self {
            followup_min_offset: 15,
            followup_max_offset: 45,
            tolerance_minutes: 8,
        }
    }
}

impl StructuralValidator {
    pub fn check(&self, items: &[ScheduleItem]) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut seen = HashSet::new();
        for item in items {
            if !seen.insert(item.id.as_str()) {
                errors.push(format!("duplicate item id '{}'", item.id));
            }
            if is_round_minute(item.scheduled_time) {
                errors.push(format!(
                    "item '{}' at {} sits on a round minute",
                    item.id, item.scheduled_time
                ));
            }
        }

        let mut ppv: Vec<&ScheduleItem> = items.iter().filter(|i| i.is_ppv).collect();
        ppv.sort_by_key(|i| i.scheduled_time);
        for item in &ppv {
            if item.style.is_none() {
                warnings.push(format!("PPV item '{}' has no style", item.id));
            }
        }
        for pair in ppv.windows(2) {
            if let (Some(a), Some(b)) = (&pair[0].style, &pair[1].style)
                && a == b
            {
                errors.push(format!(
                    "PPV items '{}' and '{}' share style '{a}' back to back",
                    pair[0].id, pair[1].id
                ));
            }
        }

        let by_id: HashMap<&str, &ScheduleItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();
        let min = (self.followup_min_offset - self.tolerance_minutes).max(1);
        let max = self.followup_max_offset + self.tolerance_minutes;
        for followup in items.iter().filter(|i| i.is_followup()) {
            let parent_id = followup.parent_id.as_deref().unwrap_or_default();
            let Some(parent) = by_id.get(parent_id) else {
                errors.push(format!(
                    "follow-up '{}' references missing parent '{parent_id}'",
                    followup.id
                ));
                continue;
            };
            let window =
                FollowupScheduler::validate_window(parent.scheduled_time, followup.scheduled_time, min, max);
            if let Some(err) = window.error {
                errors.push(format!("follow-up '{}': {err}", followup.id));
            }
        }

        ValidationReport::from_findings(errors, warnings)
    }
}

#[async_trait]
impl ScheduleValidator for StructuralValidator {
    async fn validate(
        &self,
        _creator_id: &str,
        items: &[ScheduleItem],
    ) -> Result<ValidationReport, StepError> {
        Ok(self.check(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn valid_schedule() -> Vec<ScheduleItem> {
        let p1 = ScheduleItem::ppv("p1", at(10, 3)).with_style("solo");
        let p2 = ScheduleItem::ppv("p2", at(14, 7)).with_style("bundle");
        let f1 = ScheduleItem::followup_of(&p1, at(10, 31), "ppv_followup");
        vec![p1, p2, f1, ScheduleItem::new("t1", at(12, 11), "text")]
    }

    #[tokio::test]
    async fn accepts_clean_schedule() {
        let report = StructuralValidator::default()
            .validate("c1", &valid_schedule())
            .await
            .unwrap();
        assert_eq!(report, ValidationReport::valid());
    }

    #[test]
    fn flags_duplicates_and_round_minutes() {
        let mut items = valid_schedule();
        items.push(ScheduleItem::new("t1", at(16, 30), "text"));

        let report = StructuralValidator::default().check(&items);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("duplicate item id 't1'"));
        assert!(report.errors[1].contains("round minute"));
    }

    #[test]
    fn flags_back_to_back_styles_in_time_order() {
        let items = vec![
            ScheduleItem::ppv("late", at(18, 2)).with_style("solo"),
            ScheduleItem::ppv("early", at(9, 4)).with_style("solo"),
            ScheduleItem::ppv("mid", at(13, 8)),
        ];
        let report = StructuralValidator::default().check(&items);
        // "mid" has no style, so early and late are never compared.
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);

        let items = vec![
            ScheduleItem::ppv("late", at(18, 2)).with_style("solo"),
            ScheduleItem::ppv("early", at(9, 4)).with_style("solo"),
        ];
        let report = StructuralValidator::default().check(&items);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("'early' and 'late'"));
    }

    #[test]
    fn followup_window_includes_tolerance() {
        let parent = ScheduleItem::ppv("p1", at(10, 3)).with_style("solo");
        let validator = StructuralValidator::default();

        // 8 minutes: below 15 but inside the tolerance.
        let near = ScheduleItem::followup_of(&parent, at(10, 11), "ppv_followup");
        assert!(validator.check(&[parent.clone(), near]).is_valid);

        // 54 minutes: past 45 + 8.
        let far = ScheduleItem::followup_of(&parent, at(10, 57), "ppv_followup");
        assert!(!validator.check(&[parent.clone(), far]).is_valid);

        let before = ScheduleItem::followup_of(&parent, at(9, 58), "ppv_followup");
        let report = validator.check(&[parent.clone(), before]);
        assert!(report.errors[0].contains("does not come after"));
    }

    #[test]
    fn followup_without_parent_is_rejected() {
        let mut orphan = ScheduleItem::new("o1", at(11, 2), "ppv_followup");
        orphan.parent_id = Some("ghost".into());
        let report = StructuralValidator::default().check(&[orphan]);
        assert!(report.errors[0].contains("missing parent 'ghost'"));
    }
}
