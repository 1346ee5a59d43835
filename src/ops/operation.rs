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

//! The unit tracked by the operations registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::mcp::ProgressToken;

/// Lifecycle state of a tracked operation.
///
/// `Pending → Running → {Completed | Failed | Aborted}`; the three terminal
/// states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Registered but not yet doing work.
    Pending,
    /// Actively doing work.
    Running,
    /// Finished successfully; `result` is populated.
    Completed,
    /// Finished unsuccessfully; `error` is populated.
    Failed,
    /// Cancelled before finishing.
    Aborted,
}

impl OperationStatus {
    /// Whether this state is absorbing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// The snake_case name used on the wire and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked operation as stored in the registry.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Client-supplied token, the registry key.
    pub token: ProgressToken,
    /// Kind of work, e.g. `deploy_machine`.
    pub operation_type: String,
    /// Current lifecycle state.
    pub status: OperationStatus,
    /// Work completed so far.
    pub progress: f64,
    /// Total work expected.
    pub total: f64,
    /// Latest human-readable status line.
    pub message: String,
    /// When the operation was registered.
    pub start_time: DateTime<Utc>,
    /// When the operation was last touched; drives staleness.
    pub last_update_time: DateTime<Utc>,
    /// Failure description, terminal `Failed` only.
    pub error: Option<String>,
    /// Success payload, terminal `Completed` only.
    pub result: Option<Value>,
    /// Correlation id for logging; not part of the lifecycle.
    pub request_id: Option<String>,
    /// Cancellation handle; present only while Pending or Running.
    pub(crate) signal: Option<AbortSignal>,
    /// Distinguishes this registration from an earlier one under the
    /// same token, so a superseded signal cannot touch its replacement.
    pub(crate) registration_id: Uuid,
}

impl Operation {
    /// Copies the externally visible fields.
    #[must_use]
    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            token: self.token.clone(),
            operation_type: self.operation_type.clone(),
            status: self.status,
            progress: self.progress,
            total: self.total,
            message: self.message.clone(),
            start_time: self.start_time,
            last_update_time: self.last_update_time,
            error: self.error.clone(),
            result: self.result.clone(),
            request_id: self.request_id.clone(),
        }
    }
}

/// Externally visible view of an [`Operation`], without the cancellation
/// handle.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    /// Client-supplied token.
    pub token: ProgressToken,
    /// Kind of work.
    pub operation_type: String,
    /// Current lifecycle state.
    pub status: OperationStatus,
    /// Work completed so far.
    pub progress: f64,
    /// Total work expected.
    pub total: f64,
    /// Latest status line.
    pub message: String,
    /// When the operation was registered.
    pub start_time: DateTime<Utc>,
    /// When the operation was last touched.
    pub last_update_time: DateTime<Utc>,
    /// Failure description, if Failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Success payload, if Completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Correlation id for logging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Options accepted by `register`.
#[derive(Debug, Default)]
pub struct RegisterOptions {
    /// Starting state; defaults to `Running` (registering as `Pending`
    /// first is optional).
    pub initial_status: Option<OperationStatus>,
    /// Starting progress; defaults to 0.
    pub initial_progress: f64,
    /// Total work expected; defaults to 100.
    pub total: Option<f64>,
    /// Initial status line.
    pub message: Option<String>,
    /// Caller's cancellation signal; binding it makes `abort` cancel the
    /// caller and caller-side cancellation mark the entry Aborted.
    pub signal: Option<AbortSignal>,
    /// Correlation id for logging.
    pub request_id: Option<String>,
}

/// Partial update applied by `update`.
#[derive(Debug, Default)]
pub struct OperationUpdate {
    /// New lifecycle state.
    pub status: Option<OperationStatus>,
    /// New progress value.
    pub progress: Option<f64>,
    /// New status line.
    pub message: Option<String>,
    /// Failure description (sets terminal bookkeeping, not status).
    pub error: Option<String>,
    /// Success payload.
    pub result: Option<Value>,
}

/// Filters for `query`; all present filters AND together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationQuery {
    /// Match this lifecycle state.
    #[serde(default)]
    pub status: Option<OperationStatus>,
    /// Match this operation type.
    #[serde(default)]
    pub operation_type: Option<String>,
    /// Started strictly after this instant.
    #[serde(default)]
    pub started_after: Option<DateTime<Utc>>,
    /// Started strictly before this instant.
    #[serde(default)]
    pub started_before: Option<DateTime<Utc>>,
    /// Last touched strictly after this instant.
    #[serde(default)]
    pub updated_after: Option<DateTime<Utc>>,
    /// Last touched strictly before this instant.
    #[serde(default)]
    pub updated_before: Option<DateTime<Utc>>,
    /// Skip this many results after sorting.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Return at most this many results.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl OperationQuery {
    pub(crate) fn matches(&self, operation: &Operation) -> bool {
        if let Some(status) = self.status
            && operation.status != status
        {
            return false;
        }
        if let Some(kind) = &self.operation_type
            && operation.operation_type != *kind
        {
            return false;
        }
        if let Some(after) = self.started_after
            && operation.start_time <= after
        {
            return false;
        }
        if let Some(before) = self.started_before
            && operation.start_time >= before
        {
            return false;
        }
        if let Some(after) = self.updated_after
            && operation.last_update_time <= after
        {
            return false;
        }
        if let Some(before) = self.updated_before
            && operation.last_update_time >= before
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_terminal_states_are_absorbing_markers() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() -> Result<()> {
        assert_eq!(serde_json::to_string(&OperationStatus::Running)?, r#""running""#);
        let status: OperationStatus = serde_json::from_str(r#""aborted""#)?;
        assert_eq!(status, OperationStatus::Aborted);
        Ok(())
    }

    #[test]
    fn test_snapshot_omits_empty_terminal_fields() -> Result<()> {
        let now = Utc::now();
        let operation = Operation {
            token: ProgressToken::from("t1"),
            operation_type: "deploy_machine".to_string(),
            status: OperationStatus::Running,
            progress: 30.0,
            total: 100.0,
            message: "deploying".to_string(),
            start_time: now,
            last_update_time: now,
            error: None,
            result: None,
            request_id: None,
            signal: None,
            registration_id: Uuid::new_v4(),
        };

        let json = serde_json::to_value(operation.snapshot())?;
        assert_eq!(json["status"], "running");
        assert!(json.get("error").is_none());
        assert!(json.get("result").is_none());
        Ok(())
    }
}
