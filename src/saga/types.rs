use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureKind, SlotSagaError, StepError};

/// One send on a creator's daily schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: String,
    pub scheduled_time: NaiveDateTime,
    pub send_type: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub is_ppv: bool,
    /// Set on generated follow-ups; the id of the send they follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl ScheduleItem {
    pub fn new(id: impl Into<String>, scheduled_time: NaiveDateTime, send_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scheduled_time,
            send_type: send_type.into(),
            style: None,
            is_ppv: false,
            parent_id: None,
        }
    }

    pub fn ppv(id: impl Into<String>, scheduled_time: NaiveDateTime) -> Self {
        Self {
            is_ppv: true,
            ..Self::new(id, scheduled_time, "ppv")
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// A follow-up to `parent` at `scheduled_time`.
    pub fn followup_of(parent: &ScheduleItem, scheduled_time: NaiveDateTime, send_type: &str) -> Self {
        Self {
            id: format!("{}-followup", parent.id),
            scheduled_time,
            send_type: send_type.to_string(),
            style: None,
            is_ppv: false,
            parent_id: Some(parent.id.clone()),
        }
    }

    pub fn is_followup(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Read a JSON array of items from disk.
    pub fn load_list(path: &Path) -> Result<Vec<ScheduleItem>, SlotSagaError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    RolledBack,
    Failed,
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaStatus::Pending => write!(f, "PENDING"),
            SagaStatus::Running => write!(f, "RUNNING"),
            SagaStatus::Completed => write!(f, "COMPLETED"),
            SagaStatus::RolledBack => write!(f, "ROLLED_BACK"),
            SagaStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// In-flight bookkeeping for one saga run. Never persisted.
#[derive(Debug, Clone)]
pub struct SagaExecution {
    pub saga_id: Uuid,
    pub creator_id: String,
    /// Step names in execution order.
    pub steps: Vec<String>,
    pub status: SagaStatus,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<StepError>,
    pub compensated_steps: Vec<String>,
    pub compensation_errors: Vec<String>,
}

impl SagaExecution {
    pub fn new(creator_id: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            saga_id: Uuid::new_v4(),
            creator_id: creator_id.into(),
            steps,
            status: SagaStatus::Pending,
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            compensated_steps: Vec::new(),
            compensation_errors: Vec::new(),
        }
    }

    /// Taxonomy entry for the failure, if any. A failed rollback outranks the
    /// step error that triggered it.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if !self.compensation_errors.is_empty() {
            return Some(FailureKind::Compensation);
        }
        self.error.as_ref().map(StepError::kind)
    }
}

/// What a saga run reports back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaResult {
    pub saga_id: Uuid,
    pub creator_id: String,
    pub status: SagaStatus,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub compensated_steps: Vec<String>,
    pub compensation_errors: Vec<String>,
    pub requires_manual_remediation: bool,
    /// True when this result was served from the idempotency cache.
    pub replayed: bool,
    pub item_count: usize,
    pub duration_ms: u64,
    pub items: Vec<ScheduleItem>,
}

impl SagaResult {
    pub fn from_execution(execution: &SagaExecution, items: Vec<ScheduleItem>, elapsed: Duration) -> Self {
        Self {
            saga_id: execution.saga_id,
            creator_id: execution.creator_id.clone(),
            status: execution.status,
            completed_steps: execution.completed_steps.clone(),
            failed_step: execution.failed_step.clone(),
            error: execution.error.as_ref().map(ToString::to_string),
            error_kind: execution.failure_kind(),
            compensated_steps: execution.compensated_steps.clone(),
            compensation_errors: execution.compensation_errors.clone(),
            requires_manual_remediation: execution.status == SagaStatus::Failed,
            replayed: false,
            item_count: items.len(),
            duration_ms: elapsed.as_millis() as u64,
            items,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SagaStatus::Completed
    }
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
    fn schedule_item_deserializes_with_defaults() {
        let item: ScheduleItem = serde_json::from_str(
            r#"{"id": "a", "scheduled_time": "2025-06-02T10:00:00", "send_type": "text"}"#,
        )
        .unwrap();
        assert_eq!(item, ScheduleItem::new("a", at(10, 0), "text"));
        assert!(!item.is_followup());
    }

    #[test]
    fn load_list_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.json");
        std::fs::write(
            &path,
            r#"[{"id": "p1", "scheduled_time": "2025-06-02T10:00:00", "send_type": "ppv", "is_ppv": true}]"#,
        )
        .unwrap();
        assert_eq!(ScheduleItem::load_list(&path).unwrap(), vec![ScheduleItem::ppv("p1", at(10, 0))]);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(ScheduleItem::load_list(&path), Err(SlotSagaError::Json(_))));
        assert!(matches!(
            ScheduleItem::load_list(&dir.path().join("missing.json")),
            Err(SlotSagaError::Io(_))
        ));
    }

    #[test]
    fn followup_links_to_parent() {
        let parent = ScheduleItem::ppv("p1", at(10, 0)).with_style("solo");
        let followup = ScheduleItem::followup_of(&parent, at(10, 28), "ppv_followup");
        assert_eq!(followup.id, "p1-followup");
        assert_eq!(followup.parent_id.as_deref(), Some("p1"));
        assert!(!followup.is_ppv);
        assert!(followup.style.is_none());
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&SagaStatus::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
        assert_eq!(SagaStatus::RolledBack.to_string(), "ROLLED_BACK");
    }

    #[test]
    fn result_reports_compensation_failures() {
        let mut execution = SagaExecution::new("c1", vec!["rotation".into(), "jitter".into()]);
        execution.status = SagaStatus::Failed;
        execution.completed_steps = vec!["rotation".into()];
        execution.failed_step = Some("jitter".into());
        execution.error = Some(StepError::Validation("bad".into()));
        execution.compensation_errors = vec!["rotation: store down".into()];

        let result = SagaResult::from_execution(&execution, Vec::new(), Duration::from_millis(7));
        assert_eq!(result.error_kind, Some(FailureKind::Compensation));
        assert!(result.requires_manual_remediation);
        assert_eq!(result.error.as_deref(), Some("validation failed: bad"));
        assert_eq!(result.duration_ms, 7);
        assert!(!result.is_success());
    }
}
