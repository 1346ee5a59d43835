// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

//! Process-wide counters exposed at `GET /mcp/metrics`.
//!
//! One [`Metrics`] instance is created at startup and shared by handle.
//! Counters are relaxed atomics: they are operational telemetry, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counter bundle shared across the bridge.
#[derive(Debug)]
pub struct Metrics {
    started_at: DateTime<Utc>,
    /// Operations ever registered.
    pub operations_registered: AtomicU64,
    /// Operations that reached `Completed`.
    pub operations_completed: AtomicU64,
    /// Operations that reached `Failed`.
    pub operations_failed: AtomicU64,
    /// Operations that reached `Aborted`.
    pub operations_aborted: AtomicU64,
    /// Entries removed by the periodic sweep.
    pub operations_swept: AtomicU64,
    /// Progress notifications delivered to a sink.
    pub notifications_sent: AtomicU64,
    /// Progress notifications suppressed by the rate limiter.
    pub notifications_suppressed: AtomicU64,
    /// Sink delivery failures (swallowed, never fatal).
    pub notification_failures: AtomicU64,
    /// SSE streams accepted.
    pub sse_connections_opened: AtomicU64,
    /// SSE events written to clients.
    pub sse_events_sent: AtomicU64,
    /// JSON-RPC requests handled (HTTP and stdio).
    pub rpc_requests: AtomicU64,
    /// JSON-RPC error responses returned.
    pub rpc_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a zeroed counter bundle stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            operations_registered: AtomicU64::new(0),
            operations_completed: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operations_aborted: AtomicU64::new(0),
            operations_swept: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_suppressed: AtomicU64::new(0),
            notification_failures: AtomicU64::new(0),
            sse_connections_opened: AtomicU64::new(0),
            sse_events_sent: AtomicU64::new(0),
            rpc_requests: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
        }
    }

    /// When this process started serving.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whole seconds since startup, clamped at zero.
    #[must_use]
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    /// Point-in-time copy of every counter, for serialization.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            operations_registered: self.operations_registered.load(Ordering::Relaxed),
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            operations_aborted: self.operations_aborted.load(Ordering::Relaxed),
            operations_swept: self.operations_swept.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_suppressed: self.notifications_suppressed.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            sse_connections_opened: self.sse_connections_opened.load(Ordering::Relaxed),
            sse_events_sent: self.sse_events_sent.load(Ordering::Relaxed),
            rpc_requests: self.rpc_requests.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`Metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Whole seconds since startup.
    pub uptime_seconds: i64,
    /// Operations ever registered.
    pub operations_registered: u64,
    /// Operations that reached `Completed`.
    pub operations_completed: u64,
    /// Operations that reached `Failed`.
    pub operations_failed: u64,
    /// Operations that reached `Aborted`.
    pub operations_aborted: u64,
    /// Entries removed by the periodic sweep.
    pub operations_swept: u64,
    /// Progress notifications delivered.
    pub notifications_sent: u64,
    /// Progress notifications suppressed.
    pub notifications_suppressed: u64,
    /// Sink delivery failures.
    pub notification_failures: u64,
    /// SSE streams accepted.
    pub sse_connections_opened: u64,
    /// SSE events written.
    pub sse_events_sent: u64,
    /// JSON-RPC requests handled.
    pub rpc_requests: u64,
    /// JSON-RPC error responses returned.
    pub rpc_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_snapshot_reflects_counters() -> Result<()> {
        let metrics = Metrics::new();
        metrics.operations_registered.fetch_add(3, Ordering::Relaxed);
        metrics.notifications_sent.fetch_add(7, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_registered, 3);
        assert_eq!(snapshot.notifications_sent, 7);
        assert_eq!(snapshot.operations_failed, 0);
        assert!(snapshot.uptime_seconds >= 0);

        let json = serde_json::to_value(&snapshot)?;
        assert_eq!(json["operations_registered"], 3);
        Ok(())
    }
}
