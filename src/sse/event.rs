/*
 * Copyright (C) 2026 Gantry contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The typed event model streamed over Server-Sent Events.
//!
//! Each event kind fixes its own JSON shape; `to_wire` frames the JSON
//! into one SSE block. Events are created per notification, serialized
//! immediately and never retained.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::ops::OperationStatus;

/// Operation state as spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    /// Registered, not started.
    Pending,
    /// Work underway.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
    /// Resources being prepared before real work starts.
    Initializing,
    /// Temporarily suspended.
    Paused,
}

impl WireStatus {
    /// The snake_case wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Initializing => "initializing",
            Self::Paused => "paused",
        }
    }
}

impl From<OperationStatus> for WireStatus {
    fn from(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Pending => Self::Pending,
            OperationStatus::Running => Self::InProgress,
            OperationStatus::Completed => Self::Complete,
            OperationStatus::Failed => Self::Failed,
            OperationStatus::Aborted => Self::Cancelled,
        }
    }
}

/// A progress update for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// The operation this event describes.
    pub operation_id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Client-resumable event id, when assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Current operation state.
    pub status: WireStatus,
    /// Work completed so far.
    pub progress: f64,
    /// Latest status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Free-form structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Rough seconds until completion, when computable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
}

impl ProgressEvent {
    /// Creates a progress event stamped with the current time.
    #[must_use]
    pub fn new(operation_id: impl Into<String>, status: WireStatus, progress: f64) -> Self {
        Self {
            operation_id: operation_id.into(),
            timestamp: Utc::now(),
            event_id: None,
            status,
            progress,
            message: None,
            details: None,
            estimated_time_remaining: None,
        }
    }
}

/// Successful termination of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    /// The operation this event describes.
    pub operation_id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Client-resumable event id, when assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Always `complete`; set by the constructor.
    pub status: WireStatus,
    /// The operation's result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Final status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall-clock time from start to completion, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CompletionEvent {
    /// Creates a completion event stamped with the current time.
    #[must_use]
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            timestamp: Utc::now(),
            event_id: None,
            status: WireStatus::Complete,
            result: None,
            message: None,
            duration: None,
        }
    }
}

/// Unrecoverable (usually) termination of one operation.
///
/// Serialized by hand rather than derived: absent optionals must be
/// omitted entirely, and `recoverable` appears only when true.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// The operation this event describes.
    pub operation_id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Client-resumable event id, when assigned.
    pub event_id: Option<String>,
    /// Human-readable failure description.
    pub error: String,
    /// Machine-readable failure code.
    pub code: Option<String>,
    /// Free-form structured payload.
    pub details: Option<Value>,
    /// Whether the client may retry; omitted from the wire unless true.
    pub recoverable: bool,
}

impl ErrorEvent {
    /// Creates an error event stamped with the current time.
    #[must_use]
    pub fn new(operation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            timestamp: Utc::now(),
            event_id: None,
            error: error.into(),
            code: None,
            details: None,
            recoverable: false,
        }
    }
}

impl Serialize for ErrorEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut len = 4;
        if self.event_id.is_some() {
            len += 1;
        }
        if self.code.is_some() {
            len += 1;
        }
        if self.details.is_some() {
            len += 1;
        }
        if self.recoverable {
            len += 1;
        }

        let mut state = serializer.serialize_struct("ErrorEvent", len)?;
        state.serialize_field("operation_id", &self.operation_id)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        if let Some(event_id) = &self.event_id {
            state.serialize_field("event_id", event_id)?;
        }
        state.serialize_field("status", WireStatus::Failed.as_str())?;
        state.serialize_field("error", &self.error)?;
        if let Some(code) = &self.code {
            state.serialize_field("code", code)?;
        }
        if let Some(details) = &self.details {
            state.serialize_field("details", details)?;
        }
        if self.recoverable {
            state.serialize_field("recoverable", &true)?;
        }
        state.end()
    }
}

/// Keep-alive marker proving the stream is still attached.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatEvent {
    /// The operation this event describes.
    pub operation_id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Client-resumable event id, when assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Monotonic counter per connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl HeartbeatEvent {
    /// Creates a heartbeat with the given sequence number.
    #[must_use]
    pub fn new(operation_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            operation_id: operation_id.into(),
            timestamp: Utc::now(),
            event_id: None,
            sequence: Some(sequence),
        }
    }
}

/// A log line surfaced to the streaming client.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    /// The operation this event describes.
    pub operation_id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Client-resumable event id, when assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Severity, e.g. `info` or `warning`.
    pub level: String,
    /// The log line.
    pub message: String,
    /// Component that produced the line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Free-form structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl LogEvent {
    /// Creates a log event stamped with the current time.
    #[must_use]
    pub fn new(
        operation_id: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            timestamp: Utc::now(),
            event_id: None,
            level: level.into(),
            message: message.into(),
            source: None,
            details: None,
        }
    }
}

/// A state transition for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    /// The operation this event describes.
    pub operation_id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Client-resumable event id, when assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// State before the transition, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<WireStatus>,
    /// State after the transition.
    pub current_status: WireStatus,
    /// Human-readable explanation of the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Free-form structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StatusEvent {
    /// Creates a status-transition event stamped with the current time.
    #[must_use]
    pub fn new(operation_id: impl Into<String>, current_status: WireStatus) -> Self {
        Self {
            operation_id: operation_id.into(),
            timestamp: Utc::now(),
            event_id: None,
            previous_status: None,
            current_status,
            message: None,
            details: None,
        }
    }
}

/// Any event that can go over the stream.
#[derive(Debug, Clone)]
pub enum SseEvent {
    /// A progress update.
    Progress(ProgressEvent),
    /// Successful termination.
    Completion(CompletionEvent),
    /// Failed termination.
    Error(ErrorEvent),
    /// Keep-alive marker.
    Heartbeat(HeartbeatEvent),
    /// Surfaced log line.
    Log(LogEvent),
    /// State transition.
    Status(StatusEvent),
}

impl SseEvent {
    /// The `event:` field value for this kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Completion(_) => "completion",
            Self::Error(_) => "error",
            Self::Heartbeat(_) => "heartbeat",
            Self::Log(_) => "log",
            Self::Status(_) => "status",
        }
    }

    /// The operation this event belongs to.
    #[must_use]
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Progress(e) => &e.operation_id,
            Self::Completion(e) => &e.operation_id,
            Self::Error(e) => &e.operation_id,
            Self::Heartbeat(e) => &e.operation_id,
            Self::Log(e) => &e.operation_id,
            Self::Status(e) => &e.operation_id,
        }
    }

    /// The event id, when one was assigned.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::Progress(e) => e.event_id.as_deref(),
            Self::Completion(e) => e.event_id.as_deref(),
            Self::Error(e) => e.event_id.as_deref(),
            Self::Heartbeat(e) => e.event_id.as_deref(),
            Self::Log(e) => e.event_id.as_deref(),
            Self::Status(e) => e.event_id.as_deref(),
        }
    }

    /// Whether a stream should close after delivering this event.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Completion(_) | Self::Error(_) => true,
            Self::Status(e) => matches!(
                e.current_status,
                WireStatus::Complete | WireStatus::Failed | WireStatus::Cancelled
            ),
            Self::Progress(_) | Self::Heartbeat(_) | Self::Log(_) => false,
        }
    }

    /// Frames the event as one SSE wire block:
    ///
    /// ```text
    /// event: <type>
    /// data: <json>
    /// id: <event_id>        (only if present)
    /// <blank line>
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be converted
    /// to JSON (practically unreachable for these types).
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            Self::Progress(e) => serde_json::to_string(e)?,
            Self::Completion(e) => serde_json::to_string(e)?,
            Self::Error(e) => serde_json::to_string(e)?,
            Self::Heartbeat(e) => serde_json::to_string(e)?,
            Self::Log(e) => serde_json::to_string(e)?,
            Self::Status(e) => serde_json::to_string(e)?,
        };

        let mut block = format!("event: {}\ndata: {data}\n", self.name());
        if let Some(event_id) = self.event_id() {
            block.push_str("id: ");
            block.push_str(event_id);
            block.push('\n');
        }
        block.push('\n');
        Ok(block)
    }
}

impl From<ProgressEvent> for SseEvent {
    fn from(event: ProgressEvent) -> Self {
        Self::Progress(event)
    }
}

impl From<CompletionEvent> for SseEvent {
    fn from(event: CompletionEvent) -> Self {
        Self::Completion(event)
    }
}

impl From<ErrorEvent> for SseEvent {
    fn from(event: ErrorEvent) -> Self {
        Self::Error(event)
    }
}

impl From<HeartbeatEvent> for SseEvent {
    fn from(event: HeartbeatEvent) -> Self {
        Self::Heartbeat(event)
    }
}

impl From<LogEvent> for SseEvent {
    fn from(event: LogEvent) -> Self {
        Self::Log(event)
    }
}

impl From<StatusEvent> for SseEvent {
    fn from(event: StatusEvent) -> Self {
        Self::Status(event)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for brevity"
)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    fn wire_json(block: &str) -> Result<Value> {
        let data_line = block
            .lines()
            .find(|line| line.starts_with("data: "))
            .unwrap();
        Ok(serde_json::from_str(
            data_line.trim_start_matches("data: "),
        )?)
    }

    #[test]
    fn test_progress_event_wire_block() -> Result<()> {
        let mut event = ProgressEvent::new("op-1", WireStatus::InProgress, 42.5);
        event.message = Some("deploying OS".to_string());
        let block = SseEvent::from(event).to_wire()?;

        assert!(block.starts_with("event: progress\ndata: "));
        assert!(block.ends_with("\n\n"));
        assert!(!block.contains("id: "));

        let data = wire_json(&block)?;
        assert_eq!(data["operation_id"], "op-1");
        assert_eq!(data["status"], "in_progress");
        assert_eq!(data["progress"], 42.5);
        assert_eq!(data["message"], "deploying OS");
        assert!(data.get("details").is_none());
        assert!(data.get("estimated_time_remaining").is_none());
        assert!(data["timestamp"].is_string());
        Ok(())
    }

    #[test]
    fn test_id_line_is_emitted_between_data_and_blank() -> Result<()> {
        let mut event = HeartbeatEvent::new("op-1", 3);
        event.event_id = Some("evt-17".to_string());
        let block = SseEvent::from(event).to_wire()?;

        let lines: Vec<&str> = block.lines().collect();
        assert!(lines[0].starts_with("event: heartbeat"));
        assert!(lines[1].starts_with("data: "));
        assert_eq!(lines[2], "id: evt-17");
        assert!(block.ends_with("\n\n"));

        let data = wire_json(&block)?;
        assert_eq!(data["sequence"], 3);
        assert_eq!(data["event_id"], "evt-17");
        Ok(())
    }

    #[test]
    fn test_error_event_omits_absent_optionals() -> Result<()> {
        let event = ErrorEvent::new("op-2", "deployment failed: no disk");
        let block = SseEvent::from(event).to_wire()?;
        let data = wire_json(&block)?;

        assert_eq!(data["status"], "failed");
        assert_eq!(data["error"], "deployment failed: no disk");
        assert!(data.get("code").is_none());
        assert!(data.get("details").is_none());
        assert!(data.get("event_id").is_none());
        // recoverable defaults to false and must then be absent entirely.
        assert!(data.get("recoverable").is_none());
        Ok(())
    }

    #[test]
    fn test_error_event_includes_present_optionals() -> Result<()> {
        let mut event = ErrorEvent::new("op-2", "commissioning failed");
        event.code = Some("FAILED_COMMISSIONING".to_string());
        event.details = Some(json!({"system_id": "abc123"}));
        event.recoverable = true;
        let block = SseEvent::from(event).to_wire()?;
        let data = wire_json(&block)?;

        assert_eq!(data["code"], "FAILED_COMMISSIONING");
        assert_eq!(data["details"]["system_id"], "abc123");
        assert_eq!(data["recoverable"], true);
        Ok(())
    }

    #[test]
    fn test_completion_event_shape() -> Result<()> {
        let mut event = CompletionEvent::new("op-3");
        event.result = Some(json!({"system_id": "abc123", "status": "DEPLOYED"}));
        event.duration = Some(152_000);
        let block = SseEvent::from(event.clone()).to_wire()?;
        let data = wire_json(&block)?;

        assert!(block.starts_with("event: completion\n"));
        assert_eq!(data["status"], "complete");
        assert_eq!(data["result"]["system_id"], "abc123");
        assert_eq!(data["duration"], 152_000);
        assert!(SseEvent::from(event).is_terminal());
        Ok(())
    }

    #[test]
    fn test_status_event_previous_optional() -> Result<()> {
        let mut event = StatusEvent::new("op-4", WireStatus::Cancelled);
        event.message = Some("client disconnected".to_string());
        let block = SseEvent::from(event.clone()).to_wire()?;
        let data = wire_json(&block)?;

        assert_eq!(data["current_status"], "cancelled");
        assert!(data.get("previous_status").is_none());
        assert!(SseEvent::from(event.clone()).is_terminal());

        event.previous_status = Some(WireStatus::InProgress);
        event.current_status = WireStatus::Paused;
        let data = wire_json(&SseEvent::from(event.clone()).to_wire()?)?;
        assert_eq!(data["previous_status"], "in_progress");
        assert!(!SseEvent::from(event).is_terminal());
        Ok(())
    }

    #[test]
    fn test_wire_status_mapping_from_registry_states() {
        assert_eq!(WireStatus::from(OperationStatus::Pending), WireStatus::Pending);
        assert_eq!(
            WireStatus::from(OperationStatus::Running),
            WireStatus::InProgress
        );
        assert_eq!(
            WireStatus::from(OperationStatus::Completed),
            WireStatus::Complete
        );
        assert_eq!(WireStatus::from(OperationStatus::Failed), WireStatus::Failed);
        assert_eq!(
            WireStatus::from(OperationStatus::Aborted),
            WireStatus::Cancelled
        );
    }
}
