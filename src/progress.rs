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

//! Rate-limited progress notification delivery.
//!
//! Work reports progress as often as it likes; the [`ProgressNotifier`]
//! decides what actually reaches the transport. Suppression is keyed by
//! token and never reorders what it lets through, so per-token delivery
//! stays FIFO. Losing a progress update must never fail the operation it
//! describes: delivery errors are logged and swallowed here and nowhere
//! else.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::abort::{self, AbortSignal};
use crate::error::Result;
use crate::mcp::ProgressToken;
use crate::metrics::Metrics;

/// An ephemeral progress update on its way to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressNotification {
    /// Token identifying the operation.
    pub token: ProgressToken,
    /// Work completed so far, clamped into `[0, total]`.
    pub progress: f64,
    /// Total work expected.
    pub total: f64,
    /// Human-readable status line.
    pub message: String,
    /// Whether this update bypassed rate limiting.
    pub important: bool,
}

/// Where delivered notifications go. Production implementations bind the
/// SSE broker or the stdio writer; tests bind a [`RecordingSink`].
pub trait NotificationSink: Send + Sync {
    /// Hands one notification to the transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport rejects the notification; the
    /// caller logs and swallows it.
    fn deliver(&self, notification: &ProgressNotification) -> Result<()>;
}

/// In-memory sink that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<ProgressNotification>>,
}

impl RecordingSink {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out everything delivered so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProgressNotification> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of notifications delivered so far.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, notification: &ProgressNotification) -> Result<()> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}

const fn default_min_interval_ms() -> u64 {
    1000
}

const fn default_true() -> bool {
    true
}

/// Rate-limiting knobs for progress delivery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Minimum milliseconds between deliveries for one token.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Deliver `progress == 0` updates regardless of timing.
    #[serde(default = "default_true")]
    pub always_send_first: bool,
    /// Deliver `progress == total` updates regardless of timing.
    #[serde(default = "default_true")]
    pub always_send_last: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            always_send_first: true,
            always_send_last: true,
        }
    }
}

struct NotifierInner {
    sink: Option<Arc<dyn NotificationSink>>,
    config: NotificationConfig,
    last_sent: Mutex<HashMap<ProgressToken, Instant>>,
    metrics: Arc<Metrics>,
}

/// Process-wide progress delivery with per-token rate limiting.
///
/// Cheap to clone; all clones share one last-sent table.
#[derive(Clone)]
pub struct ProgressNotifier {
    inner: Arc<NotifierInner>,
}

impl std::fmt::Debug for ProgressNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressNotifier")
            .field("bound", &self.inner.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl ProgressNotifier {
    /// Creates a notifier bound to a transport sink.
    #[must_use]
    pub fn new(
        config: NotificationConfig,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                sink: Some(sink),
                config,
                last_sent: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    /// Creates a notifier with no transport bound; every send is a no-op.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                sink: None,
                config: NotificationConfig::default(),
                last_sent: Mutex::new(HashMap::new()),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// Reports progress for `token`, subject to rate limiting.
    ///
    /// No-ops when no sink is bound, no token was supplied, or the
    /// operation's signal is already cancelled. An update is suppressed when
    /// less than the configured interval has passed since the last delivery
    /// for this token — unless it is the first ever for the token, is marked
    /// `important`, or is a configured always-send first/last update.
    /// Delivery failures are logged and swallowed.
    pub fn send(
        &self,
        token: Option<&ProgressToken>,
        signal: Option<&AbortSignal>,
        progress: f64,
        total: f64,
        message: &str,
        important: bool,
    ) {
        let Some(sink) = self.inner.sink.as_ref() else {
            return;
        };
        let Some(token) = token else {
            return;
        };
        if abort::is_aborted(signal) {
            return;
        }

        let total = if total.is_finite() && total > 0.0 {
            total
        } else {
            100.0
        };
        let progress = if progress.is_finite() {
            progress.clamp(0.0, total)
        } else {
            0.0
        };

        let now = Instant::now();
        let min_interval = Duration::from_millis(self.inner.config.min_interval_ms);
        {
            let last_sent = self
                .inner
                .last_sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let first_ever = !last_sent.contains_key(token);
            let bypass = first_ever
                || important
                || (self.inner.config.always_send_first && progress <= 0.0)
                || (self.inner.config.always_send_last && progress >= total);

            if !bypass
                && let Some(previous) = last_sent.get(token)
                && now.duration_since(*previous) < min_interval
            {
                trace!(token = %token, progress, "progress update suppressed by rate limit");
                self.inner
                    .metrics
                    .notifications_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let notification = ProgressNotification {
            token: token.clone(),
            progress,
            total,
            message: message.to_string(),
            important,
        };

        match sink.deliver(&notification) {
            Ok(()) => {
                self.inner
                    .last_sent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(token.clone(), now);
                self.inner
                    .metrics
                    .notifications_sent
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Best-effort by contract: a lost update never fails the
                // operation it describes.
                warn!(token = %token, "failed to deliver progress notification: {e}");
                self.inner
                    .metrics
                    .notification_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Forgets the rate-limit entry for `token`.
    pub fn forget(&self, token: &ProgressToken) {
        self.inner
            .last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Binds this notifier to one operation's token and signal.
    #[must_use]
    pub fn bind(
        &self,
        token: Option<ProgressToken>,
        signal: AbortSignal,
        total: f64,
    ) -> BoundProgress {
        BoundProgress {
            notifier: self.clone(),
            token,
            signal,
            total,
        }
    }
}

/// A per-operation progress reporter handed to work functions.
#[derive(Debug, Clone)]
pub struct BoundProgress {
    notifier: ProgressNotifier,
    token: Option<ProgressToken>,
    signal: AbortSignal,
    total: f64,
}

impl BoundProgress {
    /// Reports a regular (rate-limited) progress update.
    pub fn report(&self, progress: f64, message: &str) {
        self.notifier.send(
            self.token.as_ref(),
            Some(&self.signal),
            progress,
            self.total,
            message,
            false,
        );
    }

    /// Reports an update that bypasses rate limiting.
    pub fn report_important(&self, progress: f64, message: &str) {
        self.notifier.send(
            self.token.as_ref(),
            Some(&self.signal),
            progress,
            self.total,
            message,
            true,
        );
    }

    /// Reports an update that must reach the client even after the
    /// signal has fired, for final state notices.
    pub fn report_final(&self, progress: f64, message: &str) {
        self.notifier
            .send(self.token.as_ref(), None, progress, self.total, message, true);
    }

    /// The expected total for this operation.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.total
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp, reason = "Tests compare exact float constants")]
mod tests {
    use super::*;
    use anyhow::Result;
    use crate::error::Error;

    fn notifier_with_recorder() -> (ProgressNotifier, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let notifier = ProgressNotifier::new(
            NotificationConfig::default(),
            sink.clone(),
            Arc::new(Metrics::new()),
        );
        (notifier, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_suppresses_intermediate_update() {
        let (notifier, sink) = notifier_with_recorder();
        let token = ProgressToken::from("op-1");

        // t=0: first ever, delivered.
        notifier.send(Some(&token), None, 0.0, 100.0, "starting", false);
        tokio::time::advance(Duration::from_millis(200)).await;
        // t=200: too soon, suppressed.
        notifier.send(Some(&token), None, 5.0, 100.0, "working", false);
        tokio::time::advance(Duration::from_millis(900)).await;
        // t=1100: interval elapsed, delivered.
        notifier.send(Some(&token), None, 10.0, 100.0, "working", false);

        let delivered = sink.snapshot();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].progress, 0.0);
        assert_eq!(delivered[1].progress, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_important_and_final_updates_bypass_rate_limit() {
        let (notifier, sink) = notifier_with_recorder();
        let token = ProgressToken::from("op-2");

        notifier.send(Some(&token), None, 10.0, 100.0, "start", false);
        tokio::time::advance(Duration::from_millis(50)).await;
        notifier.send(Some(&token), None, 20.0, 100.0, "urgent", true);
        tokio::time::advance(Duration::from_millis(50)).await;
        notifier.send(Some(&token), None, 100.0, 100.0, "done", false);

        assert_eq!(sink.delivered_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_rate_limit_independently() {
        let (notifier, sink) = notifier_with_recorder();
        let a = ProgressToken::from("a");
        let b = ProgressToken::from("b");

        notifier.send(Some(&a), None, 10.0, 100.0, "a", false);
        tokio::time::advance(Duration::from_millis(10)).await;
        // Different token: its own first-ever delivery.
        notifier.send(Some(&b), None, 10.0, 100.0, "b", false);

        assert_eq!(sink.delivered_count(), 2);
    }

    #[tokio::test]
    async fn test_no_token_or_cancelled_signal_is_noop() {
        let (notifier, sink) = notifier_with_recorder();
        let token = ProgressToken::from("op-3");

        notifier.send(None, None, 50.0, 100.0, "anonymous", false);

        let cancelled = AbortSignal::already_aborted("stop");
        notifier.send(Some(&token), Some(&cancelled), 50.0, 100.0, "late", true);

        assert_eq!(sink.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_clamped_to_total() {
        let (notifier, sink) = notifier_with_recorder();
        let token = ProgressToken::from("op-4");

        notifier.send(Some(&token), None, 150.0, 100.0, "overshoot", false);
        notifier.send(Some(&token), None, -5.0, 100.0, "undershoot", true);

        let delivered = sink.snapshot();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].progress, 100.0);
        assert_eq!(delivered[1].progress, 0.0);
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn deliver(&self, _notification: &ProgressNotification) -> crate::error::Result<()> {
            Err(Error::upstream("stream gone"))
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let metrics = Arc::new(Metrics::new());
        let notifier = ProgressNotifier::new(
            NotificationConfig::default(),
            Arc::new(FailingSink),
            metrics.clone(),
        );
        let token = ProgressToken::from("op-5");

        // Must not panic or propagate.
        notifier.send(Some(&token), None, 10.0, 100.0, "doomed", false);

        assert_eq!(metrics.notification_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.notifications_sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_progress_reports_through_notifier() {
        let (notifier, sink) = notifier_with_recorder();
        let signal = AbortSignal::new();
        let bound = notifier.bind(Some(ProgressToken::from("op-6")), signal.clone(), 100.0);

        bound.report(0.0, "starting");
        tokio::time::advance(Duration::from_millis(10)).await;
        bound.report(50.0, "suppressed");
        bound.report_important(60.0, "urgent");

        let delivered = sink.snapshot();
        assert_eq!(delivered.len(), 2);
        assert!(delivered[1].important);

        // After cancellation the bound reporter goes quiet.
        signal.abort("stop");
        bound.report_important(70.0, "late");
        assert_eq!(sink.delivered_count(), 2);
    }

    #[tokio::test]
    async fn test_noop_notifier_ignores_everything() -> Result<()> {
        let notifier = ProgressNotifier::noop();
        let token = ProgressToken::from("op-7");
        notifier.send(Some(&token), None, 10.0, 100.0, "void", true);
        Ok(())
    }
}
