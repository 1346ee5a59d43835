// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

//! Append-only audit trail for operation lifecycle events.
//!
//! Each record is one JSON line, so the trail can be followed with
//! `tail -f` or replayed with standard tooling.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The specific event data.
    #[serde(flatten)]
    pub kind: AuditKind,
}

/// Types of audit events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    /// An operation entered the registry.
    OperationRegistered {
        /// The operation's progress token.
        token: String,
        /// Kind of work, e.g. `deploy_machine`.
        operation_type: String,
    },
    /// An operation finished successfully.
    OperationCompleted {
        /// The operation's progress token.
        token: String,
        /// Kind of work.
        operation_type: String,
        /// Wall-clock time from registration to completion.
        duration_ms: i64,
    },
    /// An operation finished unsuccessfully.
    OperationFailed {
        /// The operation's progress token.
        token: String,
        /// Kind of work.
        operation_type: String,
        /// Failure description.
        error: String,
    },
    /// An operation was cancelled.
    OperationAborted {
        /// The operation's progress token.
        token: String,
        /// Kind of work.
        operation_type: String,
        /// Why the operation was cancelled.
        reason: String,
    },
    /// The sweeper evicted an operation record.
    OperationSwept {
        /// The operation's progress token.
        token: String,
        /// Kind of work.
        operation_type: String,
        /// The state the record was in when evicted.
        status: String,
    },
    /// A tool call finished.
    ToolResult {
        /// The name of the tool called.
        tool: String,
        /// Whether the tool call was successful.
        success: bool,
        /// How long the tool call took in milliseconds.
        duration_ms: u64,
    },
    /// The server started.
    Started,
    /// The server is shutting down.
    Shutdown,
}

/// Cloneable handle to the audit trail.
///
/// Writes are best-effort; a failing trail never fails an operation.
#[derive(Debug, Clone)]
pub struct AuditLog {
    file: Option<Arc<Mutex<File>>>,
}

impl AuditLog {
    /// A log that discards every record (audit disabled).
    #[must_use]
    pub const fn noop() -> Self {
        Self { file: None }
    }

    /// Opens (appending) or creates the trail at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the file cannot be
    /// created.
    pub fn to_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit dir: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;

        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    /// Appends one record.
    pub fn record(&self, kind: AuditKind) {
        let Some(file) = &self.file else {
            return;
        };

        let event = AuditEvent {
            timestamp: Utc::now(),
            kind,
        };

        if let Ok(mut file) = file.lock()
            && let Ok(json) = serde_json::to_string(&event)
        {
            let _ = writeln!(file, "{json}");
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::{BufRead, BufReader};

    #[test]
    fn test_records_are_one_json_line_each() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::to_file(&path)?;

        log.record(AuditKind::OperationRegistered {
            token: "op-1".to_string(),
            operation_type: "deploy_machine".to_string(),
        });
        log.record(AuditKind::OperationCompleted {
            token: "op-1".to_string(),
            operation_type: "deploy_machine".to_string(),
            duration_ms: 1234,
        });

        let reader = BufReader::new(File::open(&path)?);
        let events: Vec<AuditEvent> = reader
            .lines()
            .map(|line| Ok(serde_json::from_str(&line?)?))
            .collect::<Result<_>>()?;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].kind,
            AuditKind::OperationRegistered { token, .. } if token == "op-1"
        ));
        assert!(matches!(
            &events[1].kind,
            AuditKind::OperationCompleted { duration_ms: 1234, .. }
        ));
        Ok(())
    }

    #[test]
    fn test_tagged_encoding_is_snake_case() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::to_file(&path)?;

        log.record(AuditKind::OperationAborted {
            token: "op-9".to_string(),
            operation_type: "commission_machine".to_string(),
            reason: "client disconnected".to_string(),
        });

        let line = std::fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(line.trim())?;
        assert_eq!(value["type"], "operation_aborted");
        assert_eq!(value["reason"], "client disconnected");
        assert!(value["timestamp"].is_string());
        Ok(())
    }

    #[test]
    fn test_noop_log_discards_silently() {
        let log = AuditLog::noop();
        log.record(AuditKind::Started);
        log.record(AuditKind::Shutdown);
    }

    #[test]
    fn test_appends_across_reopens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");

        AuditLog::to_file(&path)?.record(AuditKind::Started);
        AuditLog::to_file(&path)?.record(AuditKind::Shutdown);

        let lines = std::fs::read_to_string(&path)?;
        assert_eq!(lines.lines().count(), 2);
        Ok(())
    }
}
