//! Run event log entries.
//!
//! Every state transition of a run is recorded as an immutable event in
//! `<run_root>/logs/events.jsonl`, so a run can be audited after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: String,

    /// Step the event concerns (if applicable)
    pub step_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Attempt number for step events
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for finished invocations)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Artifact written alongside this event
    pub artifact_id: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: impl Into<String>,
        step_id: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: run_id.into(),
            step_id,
            event_type,
            summary: summary.into(),
            attempt: None,
            duration_ms: None,
            error: None,
            artifact_id: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_artifact(mut self, artifact_id: impl Into<String>) -> Self {
        self.artifact_id = Some(artifact_id.into());
        self
    }
}

/// Types of events recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    StepStarted,
    StepSucceeded,
    /// An attempt failed (the step may still be retried or routed)
    StepFailed,
    StepRetrying,
    GateEvaluated,
    /// A routing rule matched and its action was applied
    RouteApplied,
    RunSucceeded,
    RunFailed,
    RunBlocked,
}

impl EventType {
    /// True for the events that close a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::RunSucceeded | EventType::RunFailed | EventType::RunBlocked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            "run-1",
            Some("compile".to_string()),
            EventType::StepStarted,
            "Step 'compile' attempt 1",
        )
        .with_attempt(1);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"step_started\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.attempt, Some(1));
    }

    #[test]
    fn test_event_with_error_and_duration() {
        let event = Event::new("run-1", None, EventType::StepFailed, "failed")
            .with_duration(1500)
            .with_error("timeout: exceeded 5s");

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("timeout: exceeded 5s"));
    }

    #[test]
    fn test_terminal_event_types() {
        assert!(EventType::RunBlocked.is_terminal());
        assert!(!EventType::RouteApplied.is_terminal());
    }
}
