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

//! Fan-out of operation events to streaming connections.
//!
//! The broker keeps one broadcast channel per operation id, created
//! lazily when the first client subscribes. Publishing to an operation
//! nobody watches is a no-op; a channel whose last receiver has gone
//! away is dropped on the next publish or release.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::Metrics;
use crate::ops::{OperationSnapshot, OperationStatus, OperationsRegistry};
use crate::progress::{NotificationSink, ProgressNotification};
use crate::sse::event::{
    CompletionEvent, ErrorEvent, LogEvent, ProgressEvent, SseEvent, StatusEvent, WireStatus,
};

/// Routes events to the streaming connections watching each operation.
#[derive(Clone)]
pub struct SseBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    channels: Mutex<HashMap<String, broadcast::Sender<SseEvent>>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl BrokerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<SseEvent>>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl SseBroker {
    /// Creates a broker whose per-operation channels buffer `capacity`
    /// events for slow readers.
    #[must_use]
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                metrics,
            }),
        }
    }

    /// Attaches a new receiver to the operation's channel, creating the
    /// channel if this is the first watcher.
    pub fn subscribe(&self, operation_id: &str) -> broadcast::Receiver<SseEvent> {
        let mut channels = self.inner.lock();
        let sender = channels
            .entry(operation_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0);
        self.inner
            .metrics
            .sse_connections_opened
            .fetch_add(1, Ordering::Relaxed);
        sender.subscribe()
    }

    /// Delivers an event to everyone watching its operation.
    ///
    /// Returns the number of receivers reached. Channels with no live
    /// receivers are removed as a side effect.
    pub fn publish(&self, event: &SseEvent) -> usize {
        let operation_id = event.operation_id().to_string();
        let mut channels = self.inner.lock();
        let Some(sender) = channels.get(&operation_id) else {
            return 0;
        };
        match sender.send(event.clone()) {
            Ok(reached) => {
                self.inner
                    .metrics
                    .sse_events_sent
                    .fetch_add(1, Ordering::Relaxed);
                reached
            }
            Err(_) => {
                debug!("Dropping stream channel with no receivers: {}", operation_id);
                channels.remove(&operation_id);
                0
            }
        }
    }

    /// Drops the operation's channel unless someone is still attached.
    ///
    /// Called by stream handlers on the way out so finished operations
    /// do not accumulate channels.
    pub fn release(&self, operation_id: &str) {
        let mut channels = self.inner.lock();
        if let Some(sender) = channels.get(operation_id)
            && sender.receiver_count() == 0
        {
            channels.remove(operation_id);
        }
    }

    /// Number of operations currently holding a channel.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Notification sink that turns progress updates into stream events.
///
/// The registry is consulted per notification so terminal updates come
/// out as `completion`, `error` or `status` events rather than a last
/// `progress` frame. The start and end brackets of a tracked call are
/// additionally surfaced as `log` breadcrumbs ahead of their event.
pub struct SseSink {
    broker: SseBroker,
    registry: OperationsRegistry,
}

impl SseSink {
    /// Couples a broker to the registry it reads operation state from.
    #[must_use]
    pub const fn new(broker: SseBroker, registry: OperationsRegistry) -> Self {
        Self { broker, registry }
    }

    fn event_for(
        operation_id: &str,
        notification: &ProgressNotification,
        snapshot: Option<OperationSnapshot>,
    ) -> SseEvent {
        let Some(snapshot) = snapshot else {
            let mut event =
                ProgressEvent::new(operation_id, WireStatus::InProgress, notification.progress);
            event.event_id = Some(Uuid::new_v4().to_string());
            event.message = Some(notification.message.clone());
            return event.into();
        };

        match snapshot.status {
            OperationStatus::Completed => {
                let mut event = CompletionEvent::new(operation_id);
                event.event_id = Some(Uuid::new_v4().to_string());
                event.duration = duration_ms(&snapshot);
                event.result = snapshot.result;
                event.message = Some(notification.message.clone());
                event.into()
            }
            OperationStatus::Failed => {
                let mut event = ErrorEvent::new(
                    operation_id,
                    snapshot
                        .error
                        .unwrap_or_else(|| notification.message.clone()),
                );
                event.event_id = Some(Uuid::new_v4().to_string());
                event.into()
            }
            OperationStatus::Aborted => {
                let mut event = StatusEvent::new(operation_id, WireStatus::Cancelled);
                event.event_id = Some(Uuid::new_v4().to_string());
                event.previous_status = Some(WireStatus::InProgress);
                event.message = Some(notification.message.clone());
                event.into()
            }
            OperationStatus::Pending | OperationStatus::Running => {
                let mut event = ProgressEvent::new(
                    operation_id,
                    WireStatus::from(snapshot.status),
                    notification.progress,
                );
                event.event_id = Some(Uuid::new_v4().to_string());
                event.message = Some(notification.message.clone());
                event.estimated_time_remaining =
                    estimate_remaining(&snapshot, notification.progress, notification.total);
                event.into()
            }
        }
    }

    /// Breadcrumb for the start or the end of a tracked call; regular
    /// progress traffic gets none.
    fn breadcrumb(
        operation_id: &str,
        notification: &ProgressNotification,
        snapshot: Option<&OperationSnapshot>,
    ) -> Option<SseEvent> {
        if !notification.important {
            return None;
        }
        let level = match snapshot.map(|s| s.status) {
            Some(OperationStatus::Failed) => "error",
            Some(OperationStatus::Aborted) => "warning",
            Some(OperationStatus::Completed) => "info",
            _ if notification.progress <= 0.0 => "info",
            _ => return None,
        };
        let mut event = LogEvent::new(operation_id, level, notification.message.clone());
        event.event_id = Some(Uuid::new_v4().to_string());
        Some(event.into())
    }
}

impl NotificationSink for SseSink {
    fn deliver(&self, notification: &ProgressNotification) -> Result<()> {
        let operation_id = notification.token.to_string();
        let snapshot = self.registry.get(&notification.token);
        if let Some(breadcrumb) = Self::breadcrumb(&operation_id, notification, snapshot.as_ref()) {
            self.broker.publish(&breadcrumb);
        }
        let event = Self::event_for(&operation_id, notification, snapshot);
        self.broker.publish(&event);
        Ok(())
    }
}

/// Event describing an operation's current state, for replay to a
/// client that subscribes after updates have already been published.
pub(crate) fn snapshot_event(snapshot: &OperationSnapshot) -> SseEvent {
    let operation_id = snapshot.token.to_string();
    match snapshot.status {
        OperationStatus::Completed => {
            let mut event = CompletionEvent::new(operation_id);
            event.event_id = Some(Uuid::new_v4().to_string());
            event.result = snapshot.result.clone();
            event.message = Some(snapshot.message.clone());
            event.duration = duration_ms(snapshot);
            event.into()
        }
        OperationStatus::Failed => {
            let mut event = ErrorEvent::new(
                operation_id,
                snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| snapshot.message.clone()),
            );
            event.event_id = Some(Uuid::new_v4().to_string());
            event.into()
        }
        OperationStatus::Aborted => {
            let mut event = StatusEvent::new(operation_id, WireStatus::Cancelled);
            event.event_id = Some(Uuid::new_v4().to_string());
            event.previous_status = Some(WireStatus::InProgress);
            event.message = Some(snapshot.message.clone());
            event.into()
        }
        OperationStatus::Pending | OperationStatus::Running => {
            let mut event = ProgressEvent::new(
                operation_id,
                WireStatus::from(snapshot.status),
                snapshot.progress,
            );
            event.event_id = Some(Uuid::new_v4().to_string());
            event.message = Some(snapshot.message.clone());
            event.into()
        }
    }
}

fn duration_ms(snapshot: &OperationSnapshot) -> Option<u64> {
    let elapsed = snapshot.last_update_time - snapshot.start_time;
    u64::try_from(elapsed.num_milliseconds()).ok()
}

/// Linear extrapolation from elapsed wall time and fraction done.
fn estimate_remaining(snapshot: &OperationSnapshot, progress: f64, total: f64) -> Option<u64> {
    if progress <= 0.0 || progress >= total {
        return None;
    }
    let elapsed = (Utc::now() - snapshot.start_time).num_seconds();
    let elapsed = u64::try_from(elapsed).ok()?;
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Estimates are coarse by nature"
    )]
    let remaining = (elapsed as f64 * (total - progress) / progress) as u64;
    Some(remaining)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::float_cmp,
    reason = "Tests use unwrap, panic and exact float constants for brevity"
)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::mcp::types::ProgressToken;
    use crate::ops::{OperationUpdate, OperationsConfig, RegisterOptions};
    use crate::sse::event::HeartbeatEvent;
    use anyhow::Result;
    use serde_json::json;

    fn broker() -> SseBroker {
        SseBroker::new(16, Arc::new(Metrics::new()))
    }

    fn registry() -> OperationsRegistry {
        OperationsRegistry::new(
            OperationsConfig::default(),
            Arc::new(Metrics::new()),
            AuditLog::noop(),
        )
    }

    fn notification(token: &ProgressToken, progress: f64, message: &str) -> ProgressNotification {
        ProgressNotification {
            token: token.clone(),
            progress,
            total: 100.0,
            message: message.to_string(),
            important: false,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let broker = broker();
        let event = SseEvent::from(ProgressEvent::new("op-1", WireStatus::InProgress, 10.0));
        assert_eq!(broker.publish(&event), 0);
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() -> Result<()> {
        let broker = broker();
        let mut rx = broker.subscribe("op-1");

        let mut progress = ProgressEvent::new("op-1", WireStatus::InProgress, 25.0);
        progress.message = Some("powering on".to_string());
        assert_eq!(broker.publish(&progress.into()), 1);

        let received = rx.try_recv()?;
        assert_eq!(received.name(), "progress");
        assert_eq!(received.operation_id(), "op-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() -> Result<()> {
        let broker = broker();
        let mut first = broker.subscribe("op-1");
        let mut second = broker.subscribe("op-1");

        let event = SseEvent::from(HeartbeatEvent::new("op-1", 1));
        assert_eq!(broker.publish(&event), 2);
        assert_eq!(first.try_recv()?.name(), "heartbeat");
        assert_eq!(second.try_recv()?.name(), "heartbeat");
        Ok(())
    }

    #[tokio::test]
    async fn test_release_drops_channel_only_when_unwatched() {
        let broker = broker();
        let first = broker.subscribe("op-1");
        let second = broker.subscribe("op-1");
        assert_eq!(broker.channel_count(), 1);

        drop(first);
        broker.release("op-1");
        assert_eq!(broker.channel_count(), 1);

        drop(second);
        broker.release("op-1");
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_collects_channel_after_receivers_vanish() {
        let broker = broker();
        let rx = broker.subscribe("op-1");
        drop(rx);

        let event = SseEvent::from(ProgressEvent::new("op-1", WireStatus::InProgress, 50.0));
        assert_eq!(broker.publish(&event), 0);
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_emits_progress_for_running_operation() -> Result<()> {
        let broker = broker();
        let registry = registry();
        let token = ProgressToken::from("op-run");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        let mut rx = broker.subscribe("op-run");

        let sink = SseSink::new(broker, registry);
        sink.deliver(&notification(&token, 30.0, "deploying OS"))?;

        match rx.try_recv()? {
            SseEvent::Progress(event) => {
                assert_eq!(event.status, WireStatus::InProgress);
                assert_eq!(event.progress, 30.0);
                assert_eq!(event.message.as_deref(), Some("deploying OS"));
                assert!(event.event_id.is_some());
            }
            other => panic!("expected progress event, got {}", other.name()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_emits_completion_for_completed_operation() -> Result<()> {
        let broker = broker();
        let registry = registry();
        let token = ProgressToken::from("op-done");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                result: Some(json!({"system_id": "abc123"})),
                ..OperationUpdate::default()
            },
        );
        let mut rx = broker.subscribe("op-done");

        let sink = SseSink::new(broker, registry);
        sink.deliver(&notification(&token, 100.0, "deploy_machine completed"))?;

        match rx.try_recv()? {
            SseEvent::Completion(event) => {
                assert_eq!(event.result.unwrap()["system_id"], "abc123");
                assert_eq!(event.message.as_deref(), Some("deploy_machine completed"));
                assert!(event.duration.is_some());
            }
            other => panic!("expected completion event, got {}", other.name()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_emits_error_for_failed_operation() -> Result<()> {
        let broker = broker();
        let registry = registry();
        let token = ProgressToken::from("op-bad");
        registry.register(token.clone(), "commission_machine", RegisterOptions::default());
        registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Failed),
                error: Some("machine entered FAILED_COMMISSIONING".to_string()),
                ..OperationUpdate::default()
            },
        );
        let mut rx = broker.subscribe("op-bad");

        let sink = SseSink::new(broker, registry);
        sink.deliver(&notification(&token, 100.0, "commission_machine failed"))?;

        match rx.try_recv()? {
            SseEvent::Error(event) => {
                assert_eq!(event.error, "machine entered FAILED_COMMISSIONING");
            }
            other => panic!("expected error event, got {}", other.name()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_emits_cancelled_status_for_aborted_operation() -> Result<()> {
        let broker = broker();
        let registry = registry();
        let token = ProgressToken::from("op-gone");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        registry.abort(&token, "client disconnected".into());
        let mut rx = broker.subscribe("op-gone");

        let sink = SseSink::new(broker, registry);
        sink.deliver(&notification(&token, 100.0, "deploy_machine aborted"))?;

        match rx.try_recv()? {
            SseEvent::Status(event) => {
                assert_eq!(event.current_status, WireStatus::Cancelled);
                assert_eq!(event.previous_status, Some(WireStatus::InProgress));
            }
            other => panic!("expected status event, got {}", other.name()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_event_reflects_terminal_state() -> Result<()> {
        let registry = registry();
        let token = ProgressToken::from("op-replay");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                progress: Some(100.0),
                message: Some("deploy_machine completed".to_string()),
                result: Some(json!({"system_id": "abc123"})),
                ..OperationUpdate::default()
            },
        );

        let snapshot = registry.get(&token).ok_or_else(|| anyhow::anyhow!("missing"))?;
        let event = snapshot_event(&snapshot);
        assert_eq!(event.name(), "completion");
        assert!(event.is_terminal());
        match event {
            SseEvent::Completion(completion) => {
                assert_eq!(completion.result.unwrap()["system_id"], "abc123");
            }
            other => panic!("expected completion event, got {}", other.name()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_brackets_emit_log_breadcrumbs() -> Result<()> {
        let broker = broker();
        let registry = registry();
        let token = ProgressToken::from("op-bracket");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        let mut rx = broker.subscribe("op-bracket");
        let sink = SseSink::new(broker, registry.clone());

        let mut start = notification(&token, 0.0, "Starting deploy_machine");
        start.important = true;
        sink.deliver(&start)?;
        assert_eq!(rx.try_recv()?.name(), "log");
        assert_eq!(rx.try_recv()?.name(), "progress");

        // A mid-flight update, even an important one, is not a bracket.
        let mut mid = notification(&token, 40.0, "still at it");
        mid.important = true;
        sink.deliver(&mid)?;
        assert_eq!(rx.try_recv()?.name(), "progress");

        registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                ..OperationUpdate::default()
            },
        );
        let mut end = notification(&token, 100.0, "deploy_machine completed");
        end.important = true;
        sink.deliver(&end)?;
        match rx.try_recv()? {
            SseEvent::Log(log) => {
                assert_eq!(log.level, "info");
                assert_eq!(log.message, "deploy_machine completed");
            }
            other => panic!("expected log event, got {}", other.name()),
        }
        assert_eq!(rx.try_recv()?.name(), "completion");
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_streams_untracked_tokens_as_progress() -> Result<()> {
        let broker = broker();
        let registry = registry();
        let token = ProgressToken::from("op-mystery");
        let mut rx = broker.subscribe("op-mystery");

        let sink = SseSink::new(broker, registry);
        sink.deliver(&notification(&token, 10.0, "working"))?;

        assert_eq!(rx.try_recv()?.name(), "progress");
        Ok(())
    }
}
