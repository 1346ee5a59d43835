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

//! Bounded polling loops that follow a deployment or commissioning to
//! its end state.
//!
//! Each monitor sleeps a fixed interval between upstream status reads,
//! maps non-terminal states onto a climbing progress value capped below
//! completion, and reports once per poll. Terminal states classify as
//! success or failure; running out of polls yields a timed-out result
//! rather than an error.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::abort;
use crate::error::{Error, Result};
use crate::maas::{MachineApi, MachineStatus};
use crate::ops::OperationContext;

/// Fraction of the budget climbed while the machine is still working.
const PROGRESS_CAP_PCT: f64 = 70.0;
/// Progress floor reported with the initial notice.
const INITIAL_PCT: f64 = 5.0;
/// Ramp start for the first completed poll.
const RAMP_START_PCT: f64 = 10.0;

/// Shape of one monitoring loop.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Sleep between status reads.
    pub interval: Duration,
    /// Status reads before giving up.
    pub max_polls: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 60,
        }
    }
}

/// What one monitor watches for.
struct MonitorSpec {
    /// Capitalized activity name for messages, e.g. `Deployment`.
    activity: &'static str,
    /// Upstream state that counts as success.
    success: MachineStatus,
    /// Past-tense success word, e.g. `deployed`.
    done: &'static str,
}

/// Sends the cancellation notice if the monitor is torn down after its
/// signal fired, including when the future is dropped mid-await.
struct CancelNotice<'a> {
    ctx: &'a OperationContext,
    activity: &'static str,
}

impl Drop for CancelNotice<'_> {
    fn drop(&mut self) {
        if self.ctx.signal().is_aborted() {
            self.ctx
                .report_final(&format!("{} monitoring cancelled", self.activity));
        }
    }
}

/// Follows a deployment until the machine reaches `DEPLOYED`, a failure
/// state, or the polling budget runs out.
///
/// # Errors
///
/// Returns an upstream error when the machine enters a failure state or
/// a status read fails, and an aborted error when cancelled mid-poll.
pub async fn monitor_deployment<M: MachineApi>(
    api: &M,
    ctx: &OperationContext,
    system_id: &str,
    config: MonitorConfig,
) -> Result<Value> {
    let spec = MonitorSpec {
        activity: "Deployment",
        success: MachineStatus::Deployed,
        done: "deployed",
    };
    monitor(api, ctx, system_id, config, &spec).await
}

/// Follows commissioning until the machine reaches `READY`, a failure
/// state, or the polling budget runs out.
///
/// # Errors
///
/// Returns an upstream error when the machine enters a failure state or
/// a status read fails, and an aborted error when cancelled mid-poll.
pub async fn monitor_commissioning<M: MachineApi>(
    api: &M,
    ctx: &OperationContext,
    system_id: &str,
    config: MonitorConfig,
) -> Result<Value> {
    let spec = MonitorSpec {
        activity: "Commissioning",
        success: MachineStatus::Ready,
        done: "ready",
    };
    monitor(api, ctx, system_id, config, &spec).await
}

async fn monitor<M: MachineApi>(
    api: &M,
    ctx: &OperationContext,
    system_id: &str,
    config: MonitorConfig,
    spec: &MonitorSpec,
) -> Result<Value> {
    let _notice = CancelNotice {
        ctx,
        activity: spec.activity,
    };
    let total = ctx.total();

    ctx.report_important(
        pct(INITIAL_PCT, total),
        &format!("Monitoring {} of machine {system_id}", spec.activity.to_lowercase()),
    );

    let mut last_status: Option<MachineStatus> = None;
    for poll in 0..config.max_polls {
        abort::delay(config.interval, Some(ctx.signal())).await?;

        let status = api.machine_status(system_id).await?;
        debug!(
            "Machine {} status after poll {}: {}",
            system_id,
            poll + 1,
            status
        );

        if status == spec.success {
            ctx.report_important(total, &format!("Machine {system_id} {}", spec.done));
            return Ok(json!({
                "system_id": system_id,
                "status": status.as_str(),
            }));
        }
        if status.is_failure() {
            return Err(Error::upstream(format!(
                "machine {system_id} entered {status}"
            )));
        }

        ctx.report(
            ramp(poll, config.max_polls, total),
            &format!("Machine {system_id} status: {status}"),
        );
        last_status = Some(status);
    }

    let last = last_status.map_or_else(|| "UNKNOWN".to_string(), |s| s.to_string());
    warn!(
        "{} monitoring for {} exhausted {} polls, last status {}",
        spec.activity, system_id, config.max_polls, last
    );
    Ok(json!({
        "system_id": system_id,
        "status": last,
        "timed_out": true,
        "message": format!(
            "{} monitoring timed out, last known status {last}",
            spec.activity.to_lowercase()
        ),
    }))
}

fn pct(value: f64, total: f64) -> f64 {
    total * value / 100.0
}

/// Climbs from the ramp start toward the cap over the first half of the
/// polling budget, then holds.
fn ramp(poll: u32, max_polls: u32, total: f64) -> f64 {
    let half = f64::from(max_polls.max(2)) / 2.0;
    let step = (PROGRESS_CAP_PCT - RAMP_START_PCT) / half;
    let percent = (RAMP_START_PCT + f64::from(poll) * step).min(PROGRESS_CAP_PCT);
    pct(percent, total)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    reason = "Tests use unwrap and exact float constants for brevity"
)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::maas::{CommissionParams, DeployParams, Machine, ReleaseParams};
    use crate::mcp::types::ProgressToken;
    use crate::metrics::Metrics;
    use crate::ops::{OperationStatus, OperationTracker, OperationsConfig, OperationsRegistry, TrackOptions};
    use crate::progress::{NotificationConfig, ProgressNotifier, RecordingSink};
    use anyhow::{Context, Result};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted upstream: pops one status per read, repeating the last.
    struct ScriptedApi {
        statuses: Mutex<VecDeque<MachineStatus>>,
        last: Mutex<MachineStatus>,
    }

    impl ScriptedApi {
        fn new(script: &[MachineStatus]) -> Self {
            Self {
                statuses: Mutex::new(script.iter().cloned().collect()),
                last: Mutex::new(MachineStatus::New),
            }
        }
    }

    impl MachineApi for ScriptedApi {
        async fn list_machines(&self) -> crate::error::Result<Vec<Machine>> {
            unreachable!("not used by monitors")
        }

        async fn get_machine(&self, _system_id: &str) -> crate::error::Result<Machine> {
            unreachable!("not used by monitors")
        }

        async fn machine_status(&self, _system_id: &str) -> crate::error::Result<MachineStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = statuses.pop_front() {
                *last = next;
            }
            Ok(last.clone())
        }

        async fn deploy_machine(
            &self,
            _system_id: &str,
            _params: &DeployParams,
        ) -> crate::error::Result<Machine> {
            unreachable!("not used by monitors")
        }

        async fn commission_machine(
            &self,
            _system_id: &str,
            _params: &CommissionParams,
        ) -> crate::error::Result<Machine> {
            unreachable!("not used by monitors")
        }

        async fn release_machine(
            &self,
            _system_id: &str,
            _params: &ReleaseParams,
        ) -> crate::error::Result<Machine> {
            unreachable!("not used by monitors")
        }
    }

    struct Rig {
        tracker: OperationTracker,
        registry: OperationsRegistry,
        sink: Arc<RecordingSink>,
    }

    fn rig() -> Rig {
        let metrics = Arc::new(Metrics::new());
        let registry = OperationsRegistry::new(
            OperationsConfig::default(),
            Arc::clone(&metrics),
            AuditLog::noop(),
        );
        let sink = Arc::new(RecordingSink::new());
        let notifier = ProgressNotifier::new(
            NotificationConfig::default(),
            Arc::clone(&sink) as Arc<dyn crate::progress::NotificationSink>,
            metrics,
        );
        Rig {
            tracker: OperationTracker::new(registry.clone(), notifier, Duration::from_secs(600)),
            registry,
            sink,
        }
    }

    fn fast() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(5),
            max_polls: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_monitor_completes_with_monotone_progress() -> Result<()> {
        let rig = rig();
        let api = ScriptedApi::new(&[
            MachineStatus::Deploying,
            MachineStatus::Deploying,
            MachineStatus::Deployed,
        ]);
        let token = ProgressToken::from("deploy-1");

        let result = rig
            .tracker
            .track(
                "deploy_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |ctx| async move { monitor_deployment(&api, &ctx, "abc123", fast()).await },
            )
            .await?;

        assert_eq!(result["system_id"], "abc123");
        assert_eq!(result["status"], "DEPLOYED");

        let snapshot = rig.registry.get(&token).context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Completed);

        let delivered = rig.sink.snapshot();
        let progresses: Vec<f64> = delivered.iter().map(|n| n.progress).collect();
        assert!(
            progresses.windows(2).all(|w| w[0] <= w[1]),
            "progress went backwards: {progresses:?}"
        );
        assert_eq!(*progresses.last().context("no notifications")?, 100.0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_monitor_surfaces_failed_deployment() -> Result<()> {
        let rig = rig();
        let api = ScriptedApi::new(&[MachineStatus::Deploying, MachineStatus::FailedDeployment]);
        let token = ProgressToken::from("deploy-2");

        let error = rig
            .tracker
            .track(
                "deploy_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |ctx| async move { monitor_deployment(&api, &ctx, "abc123", fast()).await },
            )
            .await
            .expect_err("failed deployment must error");
        assert!(error.to_string().contains("FAILED_DEPLOYMENT"));

        let snapshot = rig.registry.get(&token).context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Failed);
        assert!(
            snapshot
                .error
                .context("error not recorded")?
                .contains("FAILED_DEPLOYMENT")
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_commission_monitor_reaches_ready() -> Result<()> {
        let rig = rig();
        let api = ScriptedApi::new(&[
            MachineStatus::Commissioning,
            MachineStatus::Testing,
            MachineStatus::Ready,
        ]);

        let result = rig
            .tracker
            .track(
                "commission_machine",
                Some(ProgressToken::from("comm-1")),
                None,
                TrackOptions::default(),
                |ctx| async move { monitor_commissioning(&api, &ctx, "abc123", fast()).await },
            )
            .await?;

        assert_eq!(result["status"], "READY");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_times_out_with_last_known_status() -> Result<()> {
        let rig = rig();
        let api = ScriptedApi::new(&[MachineStatus::Deploying]);
        let token = ProgressToken::from("deploy-slow");

        let result = rig
            .tracker
            .track(
                "deploy_machine",
                Some(token.clone()),
                None,
                TrackOptions::default(),
                |ctx| async move {
                    monitor_deployment(
                        &api,
                        &ctx,
                        "abc123",
                        MonitorConfig {
                            interval: Duration::from_secs(5),
                            max_polls: 3,
                        },
                    )
                    .await
                },
            )
            .await?;

        assert_eq!(result["timed_out"], true);
        assert_eq!(result["status"], "DEPLOYING");
        assert!(
            result["message"]
                .as_str()
                .context("message missing")?
                .contains("timed out, last known status DEPLOYING")
        );

        // Running out of polls is not a failure.
        let snapshot = rig.registry.get(&token).context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Completed);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_cancellation_sends_final_notice() -> Result<()> {
        let rig = rig();
        let api = Arc::new(ScriptedApi::new(&[MachineStatus::Deploying]));
        let token = ProgressToken::from("deploy-cancel");

        let tracker = rig.tracker.clone();
        let task_token = token.clone();
        let task_api = Arc::clone(&api);
        let handle = tokio::spawn(async move {
            tracker
                .track(
                    "deploy_machine",
                    Some(task_token),
                    None,
                    TrackOptions::default(),
                    |ctx| async move {
                        monitor_deployment(task_api.as_ref(), &ctx, "abc123", fast()).await
                    },
                )
                .await
        });

        // Let the monitor get through one poll, then cancel mid-sleep.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(rig.registry.abort(&token, "client disconnected".into()));

        let result = handle.await?;
        assert!(matches!(result, Err(crate::error::Error::Aborted(_))));

        let delivered = rig.sink.snapshot();
        assert!(
            delivered
                .iter()
                .any(|n| n.message.contains("Deployment monitoring cancelled")),
            "missing cancellation notice in {:?}",
            delivered.iter().map(|n| n.message.clone()).collect::<Vec<_>>()
        );

        let snapshot = rig.registry.get(&token).context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Aborted);
        Ok(())
    }

    #[test]
    fn test_ramp_is_monotone_and_capped() {
        let mut previous = 0.0;
        for poll in 0..100 {
            let value = ramp(poll, 60, 100.0);
            assert!(value >= previous, "ramp dipped at poll {poll}");
            assert!(value <= 70.0, "ramp exceeded cap at poll {poll}");
            previous = value;
        }
        assert_eq!(ramp(99, 60, 100.0), 70.0);
    }
}
