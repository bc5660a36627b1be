//! Structured scheduling events for downstream logging/metrics pipelines.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RotationChange,
    FollowupScheduled,
    JitterApplied,
    ValidationResult,
    SagaExecution,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::RotationChange => write!(f, "rotation_change"),
            EventType::FollowupScheduled => write!(f, "followup_scheduled"),
            EventType::JitterApplied => write!(f, "jitter_applied"),
            EventType::ValidationResult => write!(f, "validation_result"),
            EventType::SagaExecution => write!(f, "saga_execution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingEvent {
    pub event_type: EventType,
    pub creator_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl SchedulingEvent {
    pub fn new(event_type: EventType, creator_id: impl Into<String>, details: Value) -> Self {
        Self {
            event_type,
            creator_id: creator_id.into(),
            timestamp: Utc::now(),
            details,
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Receives events as the saga runs. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SchedulingEvent);
}

/// Writes each event as one JSON line through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SchedulingEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(
            target: "slot_saga::events",
            event_type = %event.event_type,
            creator_id = %event.creator_id,
            payload = %payload,
            "scheduling event"
        );
    }
}

/// Keeps events in memory; used by tests and the demo.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SchedulingEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulingEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<SchedulingEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: SchedulingEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
