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

//! The envelope that turns a plain async function into a tracked operation.
//!
//! [`OperationTracker::track`] owns the whole lifecycle so tool
//! implementations never touch the registry directly: it derives a
//! cancellation signal (parent plus timeout), registers the operation,
//! brackets the work with one start and one end notification, races the
//! work against cancellation, and records the terminal state. Callers
//! without a progress token get the same cancellation semantics with all
//! bookkeeping skipped.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::abort::{self, AbortReason, AbortSignal, DerivedOptions};
use crate::error::{Error, Result};
use crate::mcp::ProgressToken;
use crate::ops::operation::{OperationStatus, OperationUpdate, RegisterOptions};
use crate::ops::registry::OperationsRegistry;
use crate::progress::{BoundProgress, ProgressNotifier};

/// Options for one tracked call.
#[derive(Debug)]
pub struct TrackOptions {
    /// Overall deadline; falls back to the tracker-wide default.
    pub timeout: Option<Duration>,
    /// Total work expected, for progress scaling.
    pub total: f64,
    /// Registry state to start in; defaults to `Running`.
    pub initial_status: Option<OperationStatus>,
    /// Progress to register and announce at the start of the bracket.
    pub initial_progress: f64,
    /// Message of the start notification; defaults to `Starting {type}`.
    pub initial_message: Option<String>,
    /// Correlation id carried through logs and the registry record.
    pub request_id: Option<String>,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            total: 100.0,
            initial_status: None,
            initial_progress: 0.0,
            initial_message: None,
            request_id: None,
        }
    }
}

/// Handle given to the work function of a tracked call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    token: Option<ProgressToken>,
    signal: AbortSignal,
    registry: OperationsRegistry,
    progress: BoundProgress,
    request_id: Option<String>,
}

impl OperationContext {
    /// The cancellation signal for this call. Work that loops should
    /// check it between iterations or select against it.
    #[must_use]
    pub const fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// The progress token, when the caller asked for tracking.
    #[must_use]
    pub const fn token(&self) -> Option<&ProgressToken> {
        self.token.as_ref()
    }

    /// The correlation id, when one was supplied.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// The expected total for progress scaling.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.progress.total()
    }

    /// Fails with [`Error::Aborted`] once the signal has cancelled.
    ///
    /// # Errors
    ///
    /// Returns the cancellation reason as an error.
    pub fn ensure_active(&self) -> Result<()> {
        self.signal.ensure_active()
    }

    /// Records progress in the registry and reports it, rate limited.
    pub fn report(&self, progress: f64, message: &str) {
        self.record(progress, message);
        self.progress.report(progress, message);
    }

    /// Like [`Self::report`] but bypasses rate limiting.
    pub fn report_important(&self, progress: f64, message: &str) {
        self.record(progress, message);
        self.progress.report_important(progress, message);
    }

    /// Reports a last-word update that must reach the client even after
    /// the signal has fired. Progress is taken from the registry so the
    /// notice rides at the operation's last recorded position.
    pub fn report_final(&self, message: &str) {
        let progress = self
            .token
            .as_ref()
            .and_then(|token| self.registry.get(token))
            .map_or(0.0, |snapshot| snapshot.progress);
        self.record(progress, message);
        self.progress.report_final(progress, message);
    }

    fn record(&self, progress: f64, message: &str) {
        if let Some(token) = &self.token {
            self.registry.update(
                token,
                OperationUpdate {
                    progress: Some(progress),
                    message: Some(message.to_string()),
                    ..Default::default()
                },
            );
        }
    }
}

/// Runs tool work as registered, cancellable, progress-reporting
/// operations.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    registry: OperationsRegistry,
    notifier: ProgressNotifier,
    default_timeout: Duration,
}

impl OperationTracker {
    /// Creates a tracker over the shared registry and notifier.
    #[must_use]
    pub const fn new(
        registry: OperationsRegistry,
        notifier: ProgressNotifier,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            notifier,
            default_timeout,
        }
    }

    /// The registry this tracker records into.
    #[must_use]
    pub const fn registry(&self) -> &OperationsRegistry {
        &self.registry
    }

    /// Runs `work` as a tracked operation.
    ///
    /// The work races against a signal derived from `parent` and the
    /// timeout; whichever side loses is dropped. With a token, the call is
    /// bracketed by exactly one start and one end notification (the end
    /// one is delivered even after cancellation) and its terminal state is
    /// recorded in the registry. Without a token only the cancellation
    /// semantics apply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] when cancelled or timed out, or the
    /// work's own error. Cancellation-shaped work errors are normalized
    /// into [`Error::Aborted`].
    pub async fn track<F, Fut>(
        &self,
        operation_type: &str,
        token: Option<ProgressToken>,
        parent: Option<&AbortSignal>,
        options: TrackOptions,
        work: F,
    ) -> Result<Value>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let signal = abort::derived(
            parent,
            DerivedOptions {
                timeout: Some(timeout),
                reason: None,
            },
        );

        // Cancelled before any work started: report nothing, record nothing.
        if let Some(reason) = signal.reason() {
            return Err(Error::Aborted(reason));
        }

        let start_message = options
            .initial_message
            .clone()
            .unwrap_or_else(|| format!("Starting {operation_type}"));

        if let Some(token) = &token {
            self.registry.register(
                token.clone(),
                operation_type,
                RegisterOptions {
                    initial_status: options.initial_status,
                    initial_progress: options.initial_progress,
                    total: Some(options.total),
                    message: Some(start_message.clone()),
                    signal: Some(signal.clone()),
                    request_id: options.request_id.clone(),
                },
            );
        }

        let context = OperationContext {
            token: token.clone(),
            signal: signal.clone(),
            registry: self.registry.clone(),
            progress: self
                .notifier
                .bind(token.clone(), signal.clone(), options.total),
            request_id: options.request_id,
        };

        debug!("Starting operation {} ({:?})", operation_type, token);
        self.notifier.send(
            token.as_ref(),
            Some(&signal),
            options.initial_progress,
            options.total,
            &start_message,
            true,
        );

        let raced = abort::abortable(work(context), &signal, None::<fn(&AbortReason)>).await;
        let outcome: Result<Value> = match raced {
            Ok(inner) => inner.map_err(|e| abort::normalize_abort_error(e, None)),
            Err(aborted) => Err(aborted),
        };

        let total = options.total;
        let result = match outcome {
            Ok(value) => {
                if let Some(token) = &token {
                    self.registry.update(
                        token,
                        OperationUpdate {
                            status: Some(OperationStatus::Completed),
                            progress: Some(total),
                            message: Some(format!("{operation_type} completed")),
                            result: Some(value.clone()),
                            ..Default::default()
                        },
                    );
                }
                // The end of the bracket must go out even if the signal
                // fired between the work finishing and this point.
                self.notifier.send(
                    token.as_ref(),
                    None,
                    total,
                    total,
                    &format!("{operation_type} completed"),
                    true,
                );
                Ok(value)
            }
            Err(Error::Aborted(reason)) => {
                if let Some(token) = &token {
                    // Usually already done by the registry's signal
                    // listener; covers work that returned an abort-shaped
                    // error without the signal ever firing.
                    self.registry.update(
                        token,
                        OperationUpdate {
                            status: Some(OperationStatus::Aborted),
                            message: Some(reason.message().to_string()),
                            ..Default::default()
                        },
                    );
                }
                self.notifier.send(
                    token.as_ref(),
                    None,
                    total,
                    total,
                    &format!("{operation_type} aborted: {reason}"),
                    true,
                );
                Err(Error::Aborted(reason))
            }
            Err(error) => {
                if let Some(token) = &token {
                    self.registry.update(
                        token,
                        OperationUpdate {
                            status: Some(OperationStatus::Failed),
                            message: Some(format!("{operation_type} failed")),
                            error: Some(error.to_string()),
                            ..Default::default()
                        },
                    );
                }
                self.notifier.send(
                    token.as_ref(),
                    None,
                    total,
                    total,
                    &format!("{operation_type} failed: {error}"),
                    true,
                );
                Err(error)
            }
        };

        if let Some(token) = &token {
            self.notifier.forget(token);
        }
        debug!(
            "Finished operation {} ({:?}): {}",
            operation_type,
            token,
            if result.is_ok() { "ok" } else { "err" }
        );
        result
    }
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
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Arc;

    use crate::audit::AuditLog;
    use crate::metrics::Metrics;
    use crate::ops::registry::OperationsConfig;
    use crate::progress::{NotificationConfig, RecordingSink};

    fn tracker_with_recorder() -> (OperationTracker, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let registry = OperationsRegistry::new(
            OperationsConfig::default(),
            metrics.clone(),
            AuditLog::noop(),
        );
        let notifier = ProgressNotifier::new(NotificationConfig::default(), sink.clone(), metrics);
        let tracker = OperationTracker::new(registry, notifier, Duration::from_secs(300));
        (tracker, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_brackets_work_with_start_and_end() -> Result<()> {
        let (tracker, sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-1");

        let value = tracker
            .track(
                "deploy_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |ctx| async move {
                    ctx.report(50.0, "halfway");
                    Ok(json!({"system_id": "abc123"}))
                },
            )
            .await?;

        assert_eq!(value, json!({"system_id": "abc123"}));

        let delivered = sink.snapshot();
        assert_eq!(delivered.first().map(|n| n.progress), Some(0.0));
        assert!(delivered.first().unwrap().message.starts_with("Starting"));
        let last = delivered.last().unwrap();
        assert_eq!(last.progress, 100.0);
        assert!(last.message.contains("completed"));

        let snapshot = tracker.registry().get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Completed);
        assert_eq!(snapshot.progress, 100.0);
        assert_eq!(snapshot.result, Some(json!({"system_id": "abc123"})));
        Ok(())
    }

    #[tokio::test]
    async fn test_mid_progress_lands_in_registry() -> Result<()> {
        let (tracker, _sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-2");
        let registry = tracker.registry().clone();

        let probe_token = token.clone();
        tracker
            .track(
                "commission_machine",
                Some(token),
                None,
                TrackOptions::default(),
                |ctx| async move {
                    ctx.report(37.0, "commissioning");
                    let snapshot = registry.get(&probe_token).unwrap();
                    assert_eq!(snapshot.progress, 37.0);
                    assert_eq!(snapshot.message, "commissioning");
                    Ok(json!(null))
                },
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_records_error_and_sends_end_bracket() {
        let (tracker, sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-3");

        let result = tracker
            .track(
                "deploy_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |_ctx| async move { Err::<Value, _>(Error::upstream("maas says no")) },
            )
            .await;

        assert!(matches!(result, Err(Error::Upstream { .. })));

        let snapshot = tracker.registry().get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Failed);
        assert!(snapshot.error.unwrap().contains("maas says no"));

        let last = sink.snapshot().pop().unwrap();
        assert!(last.message.contains("failed"));
        assert_eq!(last.progress, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_and_still_sends_final_notification() {
        let (tracker, sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-4");

        let tracked = tokio::spawn({
            let tracker = tracker.clone();
            let token = token.clone();
            async move {
                tracker
                    .track(
                        "deploy_machine",
                        Some(token),
                        None,
                        TrackOptions {
                            timeout: Some(Duration::from_secs(5)),
                            ..Default::default()
                        },
                        |_ctx| async move {
                            tokio::time::sleep(Duration::from_secs(600)).await;
                            Ok(json!(null))
                        },
                    )
                    .await
            }
        });

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        let result = tracked.await.unwrap();

        match result {
            Err(Error::Aborted(reason)) => {
                assert!(reason.message().contains("timed out"));
            }
            other => panic!("expected aborted, got {other:?}"),
        }

        let snapshot = tracker.registry().get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Aborted);

        // The end of the bracket goes out even though the signal is dead.
        let last = sink.snapshot().pop().unwrap();
        assert!(last.message.contains("aborted"));
        assert_eq!(last.progress, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_propagates() {
        let (tracker, _sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-5");
        let parent = AbortSignal::new();

        let tracked = tokio::spawn({
            let tracker = tracker.clone();
            let token = token.clone();
            let parent = parent.clone();
            async move {
                tracker
                    .track(
                        "commission_machine",
                        Some(token),
                        Some(&parent),
                        TrackOptions::default(),
                        |_ctx| async move {
                            tokio::time::sleep(Duration::from_secs(600)).await;
                            Ok(json!(null))
                        },
                    )
                    .await
            }
        });

        tokio::task::yield_now().await;
        parent.abort("client disconnected");
        let result = tracked.await.unwrap();

        match result {
            Err(Error::Aborted(reason)) => {
                assert_eq!(reason.message(), "client disconnected");
            }
            other => panic!("expected aborted, got {other:?}"),
        }
        assert_eq!(
            tracker.registry().get(&token).unwrap().status,
            OperationStatus::Aborted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_abort_cancels_running_work() {
        let (tracker, _sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-6");

        let tracked = tokio::spawn({
            let tracker = tracker.clone();
            let token = token.clone();
            async move {
                tracker
                    .track(
                        "deploy_machine",
                        Some(token),
                        None,
                        TrackOptions::default(),
                        |ctx| async move {
                            ctx.signal().cancelled().await;
                            ctx.ensure_active()?;
                            Ok(json!(null))
                        },
                    )
                    .await
            }
        });

        tokio::task::yield_now().await;
        assert!(tracker
            .registry()
            .abort(&token, AbortReason::new("cancel_operation tool")));

        let result = tracked.await.unwrap();
        assert!(matches!(result, Err(Error::Aborted(_))));
        assert_eq!(
            tracker.registry().get(&token).unwrap().status,
            OperationStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_abort_shaped_work_error_is_normalized() {
        let (tracker, _sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-7");

        let result = tracker
            .track(
                "release_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |_ctx| async move { Err::<Value, _>(Error::upstream("request was cancelled")) },
            )
            .await;

        assert!(matches!(result, Err(Error::Aborted(_))));
        assert_eq!(
            tracker.registry().get(&token).unwrap().status,
            OperationStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_untracked_call_runs_with_cancellation_only() -> Result<()> {
        let (tracker, sink) = tracker_with_recorder();

        let value = tracker
            .track(
                "list_machines",
                None,
                None,
                TrackOptions::default(),
                |ctx| async move {
                    // Reporting without a token is a quiet no-op.
                    ctx.report(10.0, "scanning");
                    Ok(json!(["m1", "m2"]))
                },
            )
            .await?;

        assert_eq!(value, json!(["m1", "m2"]));
        assert_eq!(sink.delivered_count(), 0);
        assert!(tracker.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_precancelled_parent_short_circuits() {
        let (tracker, sink) = tracker_with_recorder();
        let token = ProgressToken::from("op-8");
        let parent = AbortSignal::already_aborted("gone before start");

        let result = tracker
            .track(
                "deploy_machine",
                Some(token),
                Some(&parent),
                TrackOptions::default(),
                |_ctx| async move { Ok(json!(null)) },
            )
            .await;

        assert!(matches!(result, Err(Error::Aborted(_))));
        assert!(tracker.registry().is_empty());
        assert_eq!(sink.delivered_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_state_is_cleared_after_run() -> Result<()> {
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let registry = OperationsRegistry::new(
            OperationsConfig::default(),
            metrics.clone(),
            AuditLog::noop(),
        );
        let notifier = ProgressNotifier::new(NotificationConfig::default(), sink.clone(), metrics);
        let tracker =
            OperationTracker::new(registry, notifier.clone(), Duration::from_secs(300));
        let token = ProgressToken::from("op-9");

        tracker
            .track(
                "deploy_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |_ctx| async move { Ok(json!(null)) },
            )
            .await?;

        // The run's end bracket was just delivered; had its rate-limit
        // entry been kept, this follow-up would be suppressed. The
        // tracker forgets the token, so it counts as first-ever again.
        tokio::time::advance(Duration::from_millis(5)).await;
        notifier.send(Some(&token), None, 50.0, 100.0, "reused token", false);

        assert!(sink
            .snapshot()
            .iter()
            .any(|n| n.progress == 50.0 && n.message == "reused token"));
        Ok(())
    }
}
