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

//! Composable cancellation primitives.
//!
//! An [`AbortSignal`] is a cheaply cloneable handle carrying an abort reason
//! and a small listener table. Signals form a graph: a derived signal is
//! cancelled by its parent, by a timeout, or directly; a combined signal is
//! cancelled by whichever input fires first. Every signal deregisters itself
//! from its parents once fired, so listener lists stay bounded.
//!
//! Cancellation is permanent and idempotent. Cleanup callbacks registered
//! with [`AbortSignal::on_abort`] run exactly once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Why a signal was cancelled. Cheap to clone, carried inside
/// [`Error::Aborted`].
#[derive(Debug, Clone)]
pub struct AbortReason(Arc<str>);

impl AbortReason {
    /// Creates a reason from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }

    /// The canonical reason for a timeout-driven cancellation.
    #[must_use]
    pub fn timed_out(after: Duration) -> Self {
        Self::new(format!("operation timed out after {}ms", after.as_millis()))
    }

    /// The reason message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Default for AbortReason {
    fn default() -> Self {
        Self::new("operation aborted")
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AbortReason {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for AbortReason {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

type AbortCallback = Box<dyn FnOnce(&AbortReason) + Send>;

struct SignalState {
    reason: Option<AbortReason>,
    listeners: HashMap<u64, AbortCallback>,
    next_listener: u64,
}

struct SignalInner {
    state: Mutex<SignalState>,
    // Flipped to true exactly once; `cancelled()` waits on it.
    aborted_tx: watch::Sender<bool>,
}

/// A cloneable cancellation handle carrying a reason.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Creates a fresh, live signal.
    #[must_use]
    pub fn new() -> Self {
        let (aborted_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    reason: None,
                    listeners: HashMap::new(),
                    next_listener: 0,
                }),
                aborted_tx,
            }),
        }
    }

    /// Creates a signal that is already cancelled with the given reason.
    #[must_use]
    pub fn already_aborted(reason: impl Into<AbortReason>) -> Self {
        let signal = Self::new();
        signal.abort(reason);
        signal
    }

    fn lock_state(&self) -> MutexGuard<'_, SignalState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this signal has been cancelled.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.lock_state().reason.is_some()
    }

    /// The cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        self.lock_state().reason.clone()
    }

    /// Cancels the signal. Returns `false` if it was already cancelled;
    /// cancelling twice is a safe no-op and the first reason wins.
    ///
    /// Listeners registered before cancellation run synchronously here, in
    /// no particular order, after the lock is released.
    pub fn abort(&self, reason: impl Into<AbortReason>) -> bool {
        let (reason, listeners) = {
            let mut state = self.lock_state();
            if state.reason.is_some() {
                return false;
            }
            let reason = reason.into();
            state.reason = Some(reason.clone());
            let listeners: Vec<AbortCallback> =
                state.listeners.drain().map(|(_, cb)| cb).collect();
            (reason, listeners)
        };

        let _ = self.inner.aborted_tx.send(true);
        for callback in listeners {
            callback(&reason);
        }
        true
    }

    /// Registers `callback` to run exactly once when the signal cancels.
    ///
    /// If the signal is already cancelled, the callback runs on the next
    /// scheduler tick rather than inline (requires a running Tokio runtime
    /// in that case). The returned registration can be used to remove the
    /// callback; unregistering after the signal fired is a no-op.
    pub fn on_abort<F>(&self, callback: F) -> AbortRegistration
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        let mut state = self.lock_state();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            tokio::spawn(async move {
                callback(&reason);
            });
            return AbortRegistration {
                inner: Weak::new(),
                id: 0,
            };
        }

        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, Box::new(callback));
        AbortRegistration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Resolves with the reason once the signal cancels; immediately if it
    /// already has.
    pub async fn cancelled(&self) -> AbortReason {
        let mut rx = self.inner.aborted_tx.subscribe();
        // The sender lives inside `self.inner`, so this cannot fail while
        // we hold `&self`.
        let _ = rx.wait_for(|aborted| *aborted).await;
        self.reason().unwrap_or_default()
    }

    /// Returns `Err(Error::Aborted)` if the signal has been cancelled.
    /// The synchronous mid-computation cancellation point.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Aborted`] carrying the signal's reason.
    pub fn ensure_active(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(Error::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Like [`AbortSignal::ensure_active`] but prefixes the reason with
    /// caller context.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Aborted`] when the signal has been cancelled.
    pub fn ensure_active_context(&self, context: &str) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(Error::Aborted(AbortReason::new(format!(
                "{context}: {reason}"
            )))),
            None => Ok(()),
        }
    }
}

/// Handle returned by [`AbortSignal::on_abort`]; removes the callback when
/// no longer wanted.
#[derive(Debug)]
pub struct AbortRegistration {
    inner: Weak<SignalInner>,
    id: u64,
}

impl AbortRegistration {
    /// Removes the registered callback. A no-op if the signal already fired
    /// (the callback has run) or was dropped.
    pub fn unregister(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.remove(&self.id);
        }
    }
}

/// Options for [`derived`].
#[derive(Debug, Default)]
pub struct DerivedOptions {
    /// Cancel the derived signal after this long, unless something else
    /// cancels it first.
    pub timeout: Option<Duration>,
    /// Reason used when the timeout fires; defaults to
    /// [`AbortReason::timed_out`].
    pub reason: Option<AbortReason>,
}

/// Creates a child signal cancelled by its parent, by `timeout`, or
/// directly — whichever happens first.
///
/// If the parent is already cancelled the child is cancelled immediately and
/// synchronously with the parent's reason, and no timer is started. The
/// child removes its parent listener once it fires for any reason, and the
/// timeout timer is dropped when the child cancels before it elapses.
#[must_use]
pub fn derived(parent: Option<&AbortSignal>, options: DerivedOptions) -> AbortSignal {
    let child = AbortSignal::new();

    if let Some(parent) = parent {
        if let Some(reason) = parent.reason() {
            child.abort(reason);
            return child;
        }
        let forward = child.clone();
        let registration = parent.on_abort(move |reason| {
            forward.abort(reason.clone());
        });
        let _ = child.on_abort(move |_| registration.unregister());
    }

    if let Some(timeout) = options.timeout {
        let reason = options
            .reason
            .unwrap_or_else(|| AbortReason::timed_out(timeout));
        let timed = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    timed.abort(reason);
                }
                _ = timed.cancelled() => {}
            }
        });
    }

    child
}

/// Fans multiple signals into one that cancels when any input cancels.
///
/// Zero inputs yield a signal that never cancels; one input is returned as
/// a pass-through clone. With two or more, the combined signal deregisters
/// from every input once any one fires. `reason`, when given, overrides the
/// firing input's reason.
#[must_use]
pub fn combine(signals: &[AbortSignal], reason: Option<AbortReason>) -> AbortSignal {
    match signals {
        [] => AbortSignal::new(),
        [only] => only.clone(),
        _ => {
            let combined = AbortSignal::new();

            for signal in signals {
                if let Some(fired) = signal.reason() {
                    combined.abort(reason.unwrap_or(fired));
                    return combined;
                }
            }

            let mut registrations = Vec::with_capacity(signals.len());
            for signal in signals {
                let fan_in = combined.clone();
                let override_reason = reason.clone();
                registrations.push(signal.on_abort(move |fired| {
                    fan_in.abort(override_reason.unwrap_or_else(|| fired.clone()));
                }));
            }
            let _ = combined.on_abort(move |_| {
                for registration in registrations {
                    registration.unregister();
                }
            });

            combined
        }
    }
}

/// Non-throwing check, tolerant of an absent signal (never aborted).
#[must_use]
pub fn is_aborted(signal: Option<&AbortSignal>) -> bool {
    signal.is_some_and(AbortSignal::is_aborted)
}

/// Sleeps for `duration`, failing early if `signal` cancels first. The
/// timer is dropped in both outcomes.
///
/// # Errors
///
/// Fails with [`Error::Aborted`] if the signal cancels before the duration
/// elapses.
pub async fn delay(duration: Duration, signal: Option<&AbortSignal>) -> Result<()> {
    let Some(signal) = signal else {
        tokio::time::sleep(duration).await;
        return Ok(());
    };
    tokio::select! {
        biased;
        reason = signal.cancelled() => Err(Error::Aborted(reason)),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Races `future` against `signal`, settling early with [`Error::Aborted`]
/// if the signal fires first; the losing future is dropped.
///
/// `cleanup`, when supplied, is registered via [`AbortSignal::on_abort`]
/// and unregistered again once the future wins the race.
///
/// # Errors
///
/// Fails with [`Error::Aborted`] when cancelled before completion.
pub async fn abortable<F, C>(
    future: F,
    signal: &AbortSignal,
    cleanup: Option<C>,
) -> Result<F::Output>
where
    F: Future,
    C: FnOnce(&AbortReason) + Send + 'static,
{
    let registration = cleanup.map(|callback| signal.on_abort(callback));

    tokio::pin!(future);
    let result = tokio::select! {
        biased;
        reason = signal.cancelled() => Err(Error::Aborted(reason)),
        output = &mut future => Ok(output),
    };

    if result.is_ok()
        && let Some(registration) = registration
    {
        registration.unregister();
    }
    result
}

static ABORT_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(
        clippy::unwrap_used,
        reason = "Pattern is a compile-time constant verified by tests"
    )]
    Regex::new(r"(?i)\babort(?:ed)?\b|\bcancel(?:led|ed)?\b|\btimed?\s?out\b|deadline has elapsed")
        .unwrap()
});

/// Whether `error` is cancellation-shaped: either the canonical
/// [`Error::Aborted`] variant, or any other variant whose message matches
/// common abort/cancel/timeout phrasing.
#[must_use]
pub fn is_abort_error(error: &Error) -> bool {
    match error {
        Error::Aborted(_) => true,
        other => ABORT_MESSAGE.is_match(&other.to_string()),
    }
}

/// Normalizes a cancellation-shaped failure into the canonical
/// [`Error::Aborted`]; other errors pass through unchanged. `context`, when
/// given, prefixes the reason.
#[must_use]
pub fn normalize_abort_error(error: Error, context: Option<&str>) -> Error {
    if !is_abort_error(&error) {
        return error;
    }
    let message = match &error {
        Error::Aborted(reason) => reason.to_string(),
        other => other.to_string(),
    };
    let reason = match context {
        Some(context) => AbortReason::new(format!("{context}: {message}")),
        None => AbortReason::new(message),
    };
    Error::Aborted(reason)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "Tests use unwrap and panic for brevity"
)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(&AbortReason) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (count, move |_: &AbortReason| {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_abort_is_idempotent_first_reason_wins() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());

        assert!(signal.abort("first"));
        assert!(!signal.abort("second"));

        assert!(signal.is_aborted());
        let reason = signal.reason().map(|r| r.to_string());
        assert_eq!(reason.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_on_abort_runs_exactly_once() {
        let signal = AbortSignal::new();
        let (count, callback) = counter();
        let _registration = signal.on_abort(callback);

        signal.abort("stop");
        signal.abort("stop again");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_abort_after_cancellation_runs_on_next_tick() {
        let signal = AbortSignal::already_aborted("done");
        let (count, callback) = counter();
        let _registration = signal.on_abort(callback);

        // Never inline: nothing has run yet at this point.
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_prevents_callback() {
        let signal = AbortSignal::new();
        let (count, callback) = counter();
        let registration = signal.on_abort(callback);

        registration.unregister();
        signal.abort("stop");

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_timeout_fires_at_deadline() {
        let signal = derived(
            None,
            DerivedOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        // Let the spawned timer task register its sleep before advancing.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(99)).await;
        tokio::task::yield_now().await;
        assert!(!signal.is_aborted());

        tokio::time::advance(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert!(signal.is_aborted());

        let reason = signal.reason().map(|r| r.to_string()).unwrap_or_default();
        assert!(reason.contains("timed out"), "unexpected reason: {reason}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_parent_cancellation_beats_timeout() {
        let parent = AbortSignal::new();
        let child = derived(
            Some(&parent),
            DerivedOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        tokio::time::advance(Duration::from_millis(50)).await;
        parent.abort("parent stopped");
        tokio::task::yield_now().await;

        let reason = child.reason().map(|r| r.to_string());
        assert_eq!(reason.as_deref(), Some("parent stopped"));

        // Past the original deadline the reason must not change.
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        let reason = child.reason().map(|r| r.to_string());
        assert_eq!(reason.as_deref(), Some("parent stopped"));
    }

    #[tokio::test]
    async fn test_derived_from_already_cancelled_parent_is_synchronous() {
        let parent = AbortSignal::already_aborted("gone");
        let child = derived(Some(&parent), DerivedOptions::default());

        // No tick needed: cancellation is immediate.
        assert!(child.is_aborted());
        let reason = child.reason().map(|r| r.to_string());
        assert_eq!(reason.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn test_combine_fans_in_first_firing_input() {
        let a = AbortSignal::new();
        let b = AbortSignal::new();
        let combined = combine(&[a.clone(), b.clone()], None);

        assert!(!combined.is_aborted());
        b.abort("b fired");

        assert!(combined.is_aborted());
        let reason = combined.reason().map(|r| r.to_string());
        assert_eq!(reason.as_deref(), Some("b fired"));
        assert!(!a.is_aborted());
    }

    #[test]
    fn test_combine_empty_never_cancels_and_single_passes_through() {
        let never = combine(&[], None);
        assert!(!never.is_aborted());

        let only = AbortSignal::new();
        let combined = combine(std::slice::from_ref(&only), None);
        only.abort("stop");
        assert!(combined.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_completes_or_cancels() -> Result<()> {
        delay(Duration::from_millis(10), None).await?;

        let signal = AbortSignal::new();
        let sleeper = tokio::spawn({
            let signal = signal.clone();
            async move { delay(Duration::from_secs(60), Some(&signal)).await }
        });
        tokio::time::advance(Duration::from_millis(10)).await;
        signal.abort("no need to wait");

        let result = sleeper.await?;
        assert!(matches!(result, Err(Error::Aborted(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_abortable_cancels_pending_future_and_runs_cleanup() -> Result<()> {
        let signal = AbortSignal::new();
        let (count, callback) = counter();

        let racing = tokio::spawn({
            let signal = signal.clone();
            async move {
                abortable(
                    tokio::time::sleep(Duration::from_secs(300)),
                    &signal,
                    Some(callback),
                )
                .await
            }
        });

        tokio::task::yield_now().await;
        signal.abort("give up");
        let result = racing.await?;

        assert!(matches!(result, Err(Error::Aborted(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_abortable_unregisters_cleanup_after_completion() {
        let signal = AbortSignal::new();
        let (count, callback) = counter();

        let result = abortable(async { 42 }, &signal, Some(callback)).await;
        assert!(matches!(result, Ok(42)));

        // Cancelling afterwards must not fire the (unregistered) cleanup.
        signal.abort("late");
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ensure_active_and_absent_signal_checks() -> Result<()> {
        let signal = AbortSignal::new();
        signal.ensure_active()?;
        assert!(!is_aborted(Some(&signal)));
        assert!(!is_aborted(None));

        signal.abort("stop");
        assert!(signal.ensure_active().is_err());
        assert!(is_aborted(Some(&signal)));

        let err = signal
            .ensure_active_context("polling machine m3")
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert_eq!(err, "polling machine m3: stop");
        Ok(())
    }

    #[test]
    fn test_abort_error_classification() {
        assert!(is_abort_error(&Error::Aborted(AbortReason::default())));
        assert!(is_abort_error(&Error::upstream("request was cancelled")));
        assert!(is_abort_error(&Error::Validation(
            "deadline has elapsed".to_string()
        )));
        assert!(!is_abort_error(&Error::upstream("connection reset")));
        assert!(!is_abort_error(&Error::not_found("machine xyz")));
    }

    #[test]
    fn test_normalize_abort_error() {
        let normalized = normalize_abort_error(
            Error::upstream("poll aborted by client"),
            Some("deployment"),
        );
        match normalized {
            Error::Aborted(reason) => {
                assert!(reason.to_string().starts_with("deployment: "));
            }
            other => panic!("expected aborted, got {other:?}"),
        }

        let untouched = normalize_abort_error(Error::not_found("machine"), None);
        assert!(matches!(untouched, Error::NotFound(_)));
    }
}
