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

//! In-memory registry of long-running operations.
//!
//! The registry is the single source of truth for operation state. It is
//! shared between tool handlers (which register and update operations),
//! the HTTP/SSE layer (which reads them), and a background sweeper that
//! evicts old records. Lifecycle-management calls with an unknown token
//! log and return falsy rather than erroring, so bookkeeping can never
//! take down the work it is tracking.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abort::{AbortReason, AbortSignal};
use crate::audit::{AuditKind, AuditLog};
use crate::mcp::ProgressToken;
use crate::metrics::Metrics;
use crate::ops::operation::{
    Operation, OperationQuery, OperationSnapshot, OperationStatus, OperationUpdate,
    RegisterOptions,
};

const fn default_sweep_interval_secs() -> u64 {
    60
}

const fn default_max_completed_age_secs() -> u64 {
    3_600
}

const fn default_max_stale_age_secs() -> u64 {
    86_400
}

const fn default_operation_timeout_secs() -> u64 {
    300
}

/// Retention and timeout knobs for the registry, `[operations]` in the
/// config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperationsConfig {
    /// How often the background sweeper runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Terminal records older than this are evicted.
    #[serde(default = "default_max_completed_age_secs")]
    pub max_completed_age_secs: u64,
    /// Any record untouched for this long is evicted, terminal or not.
    #[serde(default = "default_max_stale_age_secs")]
    pub max_stale_age_secs: u64,
    /// Default timeout applied to tracked tool calls.
    #[serde(default = "default_operation_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            max_completed_age_secs: default_max_completed_age_secs(),
            max_stale_age_secs: default_max_stale_age_secs(),
            default_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl OperationsConfig {
    /// The default timeout as a [`Duration`].
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// What one sweep pass evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Terminal records past the completed-age cutoff.
    pub terminal_evicted: usize,
    /// Records (any state) past the stale-age cutoff.
    pub stale_evicted: usize,
}

impl SweepStats {
    /// Total records evicted by the pass.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.terminal_evicted + self.stale_evicted
    }
}

/// Shared, cloneable handle to the operations registry.
#[derive(Debug, Clone)]
pub struct OperationsRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    operations: Mutex<HashMap<ProgressToken, Operation>>,
    config: OperationsConfig,
    metrics: Arc<Metrics>,
    audit: AuditLog,
}

impl RegistryInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProgressToken, Operation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition an entry to Aborted. `expected_id`, when set, restricts
    /// the transition to the registration that installed the caller.
    fn mark_aborted(
        &self,
        token: &ProgressToken,
        expected_id: Option<Uuid>,
        reason: &AbortReason,
    ) -> bool {
        let mut operations = self.lock();
        let Some(entry) = operations.get_mut(token) else {
            debug!("Abort for unknown operation: {}", token);
            return false;
        };
        if let Some(expected) = expected_id
            && entry.registration_id != expected
        {
            debug!("Ignoring abort from superseded registration: {}", token);
            return false;
        }
        if entry.status.is_terminal() {
            debug!("Ignoring abort for terminal operation: {}", token);
            return false;
        }

        entry.status = OperationStatus::Aborted;
        entry.message = reason.message().to_string();
        entry.last_update_time = Utc::now();
        entry.signal = None;

        self.metrics.operations_aborted.fetch_add(1, Ordering::Relaxed);
        self.audit.record(AuditKind::OperationAborted {
            token: token.to_string(),
            operation_type: entry.operation_type.clone(),
            reason: reason.message().to_string(),
        });
        true
    }
}

fn sanitize_progress(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

fn sanitize_total(value: Option<f64>) -> f64 {
    match value {
        Some(total) if total.is_finite() && total > 0.0 => total,
        _ => 100.0,
    }
}

impl OperationsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: OperationsConfig, metrics: Arc<Metrics>, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                operations: Mutex::new(HashMap::new()),
                config,
                metrics,
                audit,
            }),
        }
    }

    /// Registers a new operation under `token`.
    ///
    /// If a signal is supplied it is bound both ways: cancelling the
    /// signal marks the record Aborted, and [`Self::abort`] cancels the
    /// signal. Registering a token that is already present replaces the
    /// old record and cancels its signal.
    pub fn register(
        &self,
        token: ProgressToken,
        operation_type: &str,
        options: RegisterOptions,
    ) -> OperationSnapshot {
        let now = Utc::now();
        let registration_id = Uuid::new_v4();

        if let Some(signal) = &options.signal {
            let weak = Arc::downgrade(&self.inner);
            let listener_token = token.clone();
            signal.on_abort(move |reason| {
                if let Some(inner) = weak.upgrade() {
                    inner.mark_aborted(&listener_token, Some(registration_id), reason);
                }
            });
        }

        let operation = Operation {
            token: token.clone(),
            operation_type: operation_type.to_string(),
            status: options.initial_status.unwrap_or(OperationStatus::Running),
            progress: sanitize_progress(options.initial_progress),
            total: sanitize_total(options.total),
            message: options.message.unwrap_or_default(),
            start_time: now,
            last_update_time: now,
            error: None,
            result: None,
            request_id: options.request_id,
            signal: options.signal,
            registration_id,
        };
        let snapshot = operation.snapshot();

        let superseded = {
            let mut operations = self.inner.lock();
            operations.insert(token.clone(), operation)
        };

        if let Some(previous) = superseded {
            warn!("Replacing existing operation: {}", token);
            if !previous.status.is_terminal()
                && let Some(signal) = previous.signal
            {
                signal.abort(AbortReason::new("operation re-registered"));
            }
        }

        self.inner
            .metrics
            .operations_registered
            .fetch_add(1, Ordering::Relaxed);
        self.inner.audit.record(AuditKind::OperationRegistered {
            token: token.to_string(),
            operation_type: operation_type.to_string(),
        });
        debug!("Registered operation {} ({})", token, operation_type);

        snapshot
    }

    /// Applies a partial update to an operation.
    ///
    /// Returns false (after logging) when the token is unknown or the
    /// record is already terminal; terminal records absorb the whole
    /// patch, including its progress and message.
    pub fn update(&self, token: &ProgressToken, update: OperationUpdate) -> bool {
        let mut operations = self.inner.lock();
        let Some(entry) = operations.get_mut(token) else {
            warn!("Update for unknown operation: {}", token);
            return false;
        };
        if entry.status.is_terminal() {
            debug!("Ignoring update for terminal operation: {}", token);
            return false;
        }

        if let Some(progress) = update.progress {
            if progress.is_finite() {
                entry.progress = progress;
            } else {
                warn!("Ignoring non-finite progress for operation: {}", token);
            }
        }
        if let Some(message) = update.message {
            entry.message = message;
        }
        if let Some(error) = update.error {
            entry.error = Some(error);
        }
        if let Some(result) = update.result {
            entry.result = Some(result);
        }
        if let Some(status) = update.status {
            entry.status = status;
        }
        entry.last_update_time = Utc::now();

        if entry.status.is_terminal() {
            entry.signal = None;
            let duration_ms = (entry.last_update_time - entry.start_time).num_milliseconds();
            match entry.status {
                OperationStatus::Completed => {
                    self.inner
                        .metrics
                        .operations_completed
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner.audit.record(AuditKind::OperationCompleted {
                        token: token.to_string(),
                        operation_type: entry.operation_type.clone(),
                        duration_ms,
                    });
                }
                OperationStatus::Failed => {
                    self.inner
                        .metrics
                        .operations_failed
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner.audit.record(AuditKind::OperationFailed {
                        token: token.to_string(),
                        operation_type: entry.operation_type.clone(),
                        error: entry.error.clone().unwrap_or_default(),
                    });
                }
                _ => {
                    self.inner
                        .metrics
                        .operations_aborted
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner.audit.record(AuditKind::OperationAborted {
                        token: token.to_string(),
                        operation_type: entry.operation_type.clone(),
                        reason: entry.message.clone(),
                    });
                }
            }
        }
        true
    }

    /// Looks up an operation by token.
    #[must_use]
    pub fn get(&self, token: &ProgressToken) -> Option<OperationSnapshot> {
        self.inner.lock().get(token).map(Operation::snapshot)
    }

    /// Removes an operation, cancelling its signal if still live.
    ///
    /// Returns the removed record, or None (after logging) for an
    /// unknown token.
    pub fn remove(&self, token: &ProgressToken) -> Option<OperationSnapshot> {
        let removed = self.inner.lock().remove(token);
        let Some(operation) = removed else {
            warn!("Remove for unknown operation: {}", token);
            return None;
        };

        let snapshot = operation.snapshot();
        if !operation.status.is_terminal()
            && let Some(signal) = operation.signal
        {
            debug!("Cancelling signal of removed operation: {}", token);
            signal.abort(AbortReason::new("operation removed"));
        }
        Some(snapshot)
    }

    /// Cancels an operation: marks the record Aborted and fires its
    /// bound signal so the worker stops.
    ///
    /// Returns false (after logging) when the token is unknown or the
    /// record is already terminal.
    pub fn abort(&self, token: &ProgressToken, reason: AbortReason) -> bool {
        let (signal, operation_type) = {
            let mut operations = self.inner.lock();
            let Some(entry) = operations.get_mut(token) else {
                warn!("Abort for unknown operation: {}", token);
                return false;
            };
            if entry.status.is_terminal() {
                debug!("Ignoring abort for terminal operation: {}", token);
                return false;
            }

            entry.status = OperationStatus::Aborted;
            entry.message = reason.message().to_string();
            entry.last_update_time = Utc::now();
            (entry.signal.take(), entry.operation_type.clone())
        };

        self.inner
            .metrics
            .operations_aborted
            .fetch_add(1, Ordering::Relaxed);
        self.inner.audit.record(AuditKind::OperationAborted {
            token: token.to_string(),
            operation_type,
            reason: reason.message().to_string(),
        });

        if let Some(signal) = signal {
            signal.abort(reason);
        }
        true
    }

    /// Queries operations, most recently started first.
    #[must_use]
    pub fn query(&self, query: &OperationQuery) -> Vec<OperationSnapshot> {
        let mut matches: Vec<OperationSnapshot> = {
            let operations = self.inner.lock();
            operations
                .values()
                .filter(|op| query.matches(op))
                .map(Operation::snapshot)
                .collect()
        };

        // Sort by start time (most recent first)
        matches.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        matches.into_iter().skip(offset).take(limit).collect()
    }

    /// All operations that are not yet terminal, most recently started
    /// first.
    #[must_use]
    pub fn active(&self) -> Vec<OperationSnapshot> {
        let mut active: Vec<OperationSnapshot> = {
            let operations = self.inner.lock();
            operations
                .values()
                .filter(|op| !op.status.is_terminal())
                .map(Operation::snapshot)
                .collect()
        };
        active.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        active
    }

    /// Operations of one type, most recently started first.
    #[must_use]
    pub fn by_type(&self, operation_type: &str) -> Vec<OperationSnapshot> {
        self.query(&OperationQuery {
            operation_type: Some(operation_type.to_string()),
            ..OperationQuery::default()
        })
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Empties the registry, cancelling every live signal.
    pub fn clear(&self) {
        let drained: Vec<Operation> = {
            let mut operations = self.inner.lock();
            operations.drain().map(|(_, op)| op).collect()
        };

        let mut cancelled = 0usize;
        for operation in drained {
            if !operation.status.is_terminal()
                && let Some(signal) = operation.signal
            {
                signal.abort(AbortReason::new("registry cleared"));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cleared registry, cancelled {} live operation(s)", cancelled);
        }
    }

    /// One sweep pass against the supplied clock.
    ///
    /// Evicts terminal records older than the completed-age cutoff and
    /// any record untouched past the stale-age cutoff. Stale records
    /// that were still live get their signals cancelled.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepStats {
        let terminal_cutoff = now
            - TimeDelta::try_seconds(i64::try_from(self.inner.config.max_completed_age_secs).unwrap_or(i64::MAX))
                .unwrap_or(TimeDelta::MAX);
        let stale_cutoff = now
            - TimeDelta::try_seconds(i64::try_from(self.inner.config.max_stale_age_secs).unwrap_or(i64::MAX))
                .unwrap_or(TimeDelta::MAX);

        let mut stats = SweepStats::default();
        let mut stale_signals: Vec<AbortSignal> = Vec::new();
        {
            let mut operations = self.inner.lock();
            let doomed: Vec<ProgressToken> = operations
                .values()
                .filter(|op| {
                    (op.status.is_terminal() && op.last_update_time < terminal_cutoff)
                        || op.last_update_time < stale_cutoff
                })
                .map(|op| op.token.clone())
                .collect();

            for token in doomed {
                let Some(operation) = operations.remove(&token) else {
                    continue;
                };
                if operation.status.is_terminal() {
                    stats.terminal_evicted += 1;
                    debug!("Swept terminal operation: {}", token);
                } else {
                    stats.stale_evicted += 1;
                    warn!(
                        "Swept stale operation {} still in state {}",
                        token, operation.status
                    );
                    if let Some(signal) = operation.signal {
                        stale_signals.push(signal);
                    }
                }
                self.inner.audit.record(AuditKind::OperationSwept {
                    token: token.to_string(),
                    operation_type: operation.operation_type,
                    status: operation.status.to_string(),
                });
            }
        }

        for signal in stale_signals {
            signal.abort(AbortReason::new("operation swept as stale"));
        }

        let evicted = stats.total();
        if evicted > 0 {
            self.inner
                .metrics
                .operations_swept
                .fetch_add(u64::try_from(evicted).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
        stats
    }

    /// Starts the periodic sweeper.
    ///
    /// The task holds only a weak handle, so dropping the last registry
    /// clone stops it; it never keeps the process alive on its own.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let registry = Self { inner };
                let stats = registry.sweep_at(Utc::now());
                if stats.total() > 0 {
                    info!(
                        "Sweeper evicted {} operation(s) ({} terminal, {} stale)",
                        stats.total(),
                        stats.terminal_evicted,
                        stats.stale_evicted
                    );
                }
            }
        })
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

    fn registry() -> OperationsRegistry {
        OperationsRegistry::new(
            OperationsConfig::default(),
            Arc::new(Metrics::new()),
            AuditLog::noop(),
        )
    }

    fn running_update(progress: f64, message: &str) -> OperationUpdate {
        OperationUpdate {
            progress: Some(progress),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_defaults_and_get() {
        let registry = registry();
        let token = ProgressToken::from("op-1");

        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());

        let snapshot = registry.get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Running);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.total, 100.0);
        assert_eq!(snapshot.operation_type, "deploy_machine");
        assert!(registry.get(&ProgressToken::from("missing")).is_none());
    }

    #[test]
    fn test_update_applies_patch() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());

        assert!(registry.update(&token, running_update(42.0, "halfway-ish")));

        let snapshot = registry.get(&token).unwrap();
        assert_eq!(snapshot.progress, 42.0);
        assert_eq!(snapshot.message, "halfway-ish");
        assert!(snapshot.last_update_time >= snapshot.start_time);
    }

    #[test]
    fn test_update_unknown_token_returns_false() {
        let registry = registry();
        assert!(!registry.update(&ProgressToken::from("ghost"), running_update(1.0, "x")));
    }

    #[test]
    fn test_terminal_states_absorb_updates() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());

        assert!(registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                progress: Some(100.0),
                result: Some(json!({"system_id": "abc123"})),
                ..Default::default()
            }
        ));

        // The whole later patch is dropped, message included.
        assert!(!registry.update(&token, running_update(10.0, "rewound")));

        let snapshot = registry.get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Completed);
        assert_eq!(snapshot.progress, 100.0);
        assert_ne!(snapshot.message, "rewound");
        assert_eq!(snapshot.result, Some(json!({"system_id": "abc123"})));
    }

    #[test]
    fn test_abort_marks_record_and_fires_signal() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        let signal = AbortSignal::new();
        registry.register(
            token.clone(),
            "deploy_machine",
            RegisterOptions {
                signal: Some(signal.clone()),
                ..Default::default()
            },
        );

        assert!(registry.abort(&token, AbortReason::new("user cancelled")));

        let snapshot = registry.get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Aborted);
        assert_eq!(snapshot.message, "user cancelled");
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().unwrap().message(), "user cancelled");

        // Absorbing: a second abort is a no-op.
        assert!(!registry.abort(&token, AbortReason::new("again")));
        assert!(!registry.abort(&ProgressToken::from("ghost"), AbortReason::default()));
    }

    #[test]
    fn test_external_cancellation_marks_record_aborted() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        let signal = AbortSignal::new();
        registry.register(
            token.clone(),
            "commission_machine",
            RegisterOptions {
                signal: Some(signal.clone()),
                ..Default::default()
            },
        );

        signal.abort(AbortReason::new("client disconnected"));

        let snapshot = registry.get(&token).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Aborted);
        assert_eq!(snapshot.message, "client disconnected");
        assert!(!registry.update(&token, running_update(50.0, "late")));
    }

    #[test]
    fn test_cancelling_after_completion_is_ignored() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        let signal = AbortSignal::new();
        registry.register(
            token.clone(),
            "deploy_machine",
            RegisterOptions {
                signal: Some(signal.clone()),
                ..Default::default()
            },
        );

        registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                ..Default::default()
            },
        );
        signal.abort(AbortReason::new("too late"));

        assert_eq!(
            registry.get(&token).unwrap().status,
            OperationStatus::Completed
        );
    }

    #[test]
    fn test_reregistration_cancels_old_without_touching_new() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        let old_signal = AbortSignal::new();
        registry.register(
            token.clone(),
            "deploy_machine",
            RegisterOptions {
                signal: Some(old_signal.clone()),
                ..Default::default()
            },
        );

        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());

        // Replacing fires the superseded signal...
        assert!(old_signal.is_aborted());
        assert_eq!(
            old_signal.reason().unwrap().message(),
            "operation re-registered"
        );
        // ...whose listener must not abort the replacement.
        assert_eq!(
            registry.get(&token).unwrap().status,
            OperationStatus::Running
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_cancels_live_signal() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        let signal = AbortSignal::new();
        registry.register(
            token.clone(),
            "deploy_machine",
            RegisterOptions {
                signal: Some(signal.clone()),
                ..Default::default()
            },
        );

        let removed = registry.remove(&token).unwrap();
        assert_eq!(removed.operation_type, "deploy_machine");
        assert!(signal.is_aborted());
        assert!(registry.get(&token).is_none());
        assert!(registry.remove(&token).is_none());
    }

    #[test]
    fn test_query_filters_and_paginates() {
        let registry = registry();
        for i in 0..5 {
            registry.register(
                ProgressToken::from(format!("op-{i}").as_str()),
                if i % 2 == 0 { "deploy_machine" } else { "commission_machine" },
                RegisterOptions::default(),
            );
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        registry.update(
            &ProgressToken::from("op-0"),
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                ..Default::default()
            },
        );

        let deploys = registry.query(&OperationQuery {
            operation_type: Some("deploy_machine".to_string()),
            ..Default::default()
        });
        assert_eq!(deploys.len(), 3);
        assert_eq!(registry.by_type("commission_machine").len(), 2);

        let running = registry.query(&OperationQuery {
            status: Some(OperationStatus::Running),
            ..Default::default()
        });
        assert_eq!(running.len(), 4);

        // Most recently started first.
        let all = registry.query(&OperationQuery::default());
        assert_eq!(all[0].token, ProgressToken::from("op-4"));
        assert_eq!(all[4].token, ProgressToken::from("op-0"));

        let page = registry.query(&OperationQuery {
            offset: Some(1),
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].token, ProgressToken::from("op-3"));
        assert_eq!(page[1].token, ProgressToken::from("op-2"));
    }

    #[test]
    fn test_query_time_window() {
        let registry = registry();
        let before = Utc::now() - TimeDelta::seconds(1);
        registry.register(ProgressToken::from("op-1"), "deploy_machine", RegisterOptions::default());
        let after = Utc::now() + TimeDelta::seconds(1);

        let hits = registry.query(&OperationQuery {
            started_after: Some(before),
            started_before: Some(after),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);

        let misses = registry.query(&OperationQuery {
            started_after: Some(after),
            ..Default::default()
        });
        assert!(misses.is_empty());
    }

    #[test]
    fn test_active_excludes_terminal() {
        let registry = registry();
        registry.register(ProgressToken::from("op-1"), "deploy_machine", RegisterOptions::default());
        registry.register(ProgressToken::from("op-2"), "deploy_machine", RegisterOptions::default());
        registry.update(
            &ProgressToken::from("op-1"),
            OperationUpdate {
                status: Some(OperationStatus::Failed),
                error: Some("boom".to_string()),
                ..Default::default()
            },
        );

        let active = registry.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token, ProgressToken::from("op-2"));
    }

    #[test]
    fn test_sweep_evicts_old_terminal_records() {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        registry.update(
            &token,
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                ..Default::default()
            },
        );
        registry.register(ProgressToken::from("op-2"), "deploy_machine", RegisterOptions::default());

        // Within the hour nothing is old enough.
        assert_eq!(registry.sweep_at(Utc::now()), SweepStats::default());
        assert_eq!(registry.len(), 2);

        // Two hours later the terminal record goes, the running one stays.
        let stats = registry.sweep_at(Utc::now() + TimeDelta::hours(2));
        assert_eq!(stats.terminal_evicted, 1);
        assert_eq!(stats.stale_evicted, 0);
        assert!(registry.get(&token).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_stale_running_records_and_cancels() {
        let registry = registry();
        let signal = AbortSignal::new();
        registry.register(
            ProgressToken::from("op-1"),
            "deploy_machine",
            RegisterOptions {
                signal: Some(signal.clone()),
                ..Default::default()
            },
        );

        let stats = registry.sweep_at(Utc::now() + TimeDelta::hours(25));
        assert_eq!(stats.stale_evicted, 1);
        assert!(registry.is_empty());
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().unwrap().message(), "operation swept as stale");
    }

    #[test]
    fn test_clear_cancels_live_signals() {
        let registry = registry();
        let signal = AbortSignal::new();
        registry.register(
            ProgressToken::from("op-1"),
            "deploy_machine",
            RegisterOptions {
                signal: Some(signal.clone()),
                ..Default::default()
            },
        );
        registry.register(ProgressToken::from("op-2"), "deploy_machine", RegisterOptions::default());

        registry.clear();
        assert!(registry.is_empty());
        assert!(signal.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_stops_when_registry_dropped() -> Result<()> {
        let registry = registry();
        let handle = registry.spawn_sweeper();

        drop(registry);
        tokio::time::advance(Duration::from_secs(61)).await;

        handle.await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ticks_while_registry_alive() -> Result<()> {
        let registry = registry();
        let token = ProgressToken::from("op-1");
        registry.register(token.clone(), "deploy_machine", RegisterOptions::default());
        let handle = registry.spawn_sweeper();

        // A healthy record survives sweeps while the clock is fresh.
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(registry.get(&token).is_some());

        drop(registry);
        tokio::time::advance(Duration::from_secs(61)).await;
        handle.await?;
        Ok(())
    }
}
