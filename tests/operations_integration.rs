//! End-to-end tests of the operation pipeline with the registry, tracker,
//! notifier and audit log wired together the way the binary wires them.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    reason = "Tests use unwrap and exact float constants for brevity"
)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use gantry_mcp::abort::AbortReason;
use gantry_mcp::audit::AuditLog;
use gantry_mcp::error::Error;
use gantry_mcp::mcp::ProgressToken;
use gantry_mcp::metrics::Metrics;
use gantry_mcp::ops::{
    OperationContext, OperationQuery, OperationStatus, OperationTracker, OperationUpdate,
    OperationsConfig, OperationsRegistry, RegisterOptions, TrackOptions,
};
use gantry_mcp::progress::{NotificationConfig, ProgressNotifier, RecordingSink};
use serde_json::json;

struct Rig {
    tracker: OperationTracker,
    registry: OperationsRegistry,
    sink: Arc<RecordingSink>,
    metrics: Arc<Metrics>,
}

fn rig_with(operations: OperationsConfig, notifications: NotificationConfig, audit: AuditLog) -> Rig {
    let metrics = Arc::new(Metrics::new());
    let registry = OperationsRegistry::new(operations, Arc::clone(&metrics), audit);
    let sink = Arc::new(RecordingSink::new());
    let notifier = ProgressNotifier::new(
        notifications,
        Arc::clone(&sink) as Arc<dyn gantry_mcp::progress::NotificationSink>,
        Arc::clone(&metrics),
    );
    let tracker = OperationTracker::new(registry.clone(), notifier, Duration::from_secs(600));
    Rig {
        tracker,
        registry,
        sink,
        metrics,
    }
}

/// Rig with rate limiting disabled so every report is observable.
fn rig() -> Rig {
    rig_with(
        OperationsConfig::default(),
        NotificationConfig {
            min_interval_ms: 0,
            ..NotificationConfig::default()
        },
        AuditLog::noop(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_tracked_operation_completes_end_to_end() -> Result<()> {
    let rig = rig();
    let token = ProgressToken::from("deploy-1");

    let outcome = rig
        .tracker
        .track(
            "deploy_machine",
            Some(token.clone()),
            None,
            TrackOptions {
                request_id: Some("req-42".to_string()),
                ..TrackOptions::default()
            },
            |ctx: OperationContext| async move {
                ctx.report(25.0, "Powering on");
                ctx.report(80.0, "Installing OS");
                Ok(json!({"system_id": "abc123", "status": "DEPLOYED"}))
            },
        )
        .await?;
    assert_eq!(outcome["system_id"], "abc123");

    let snapshot = rig.registry.get(&token).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Completed);
    assert_eq!(snapshot.progress, 100.0);
    assert_eq!(snapshot.message, "deploy_machine completed");
    assert_eq!(snapshot.request_id.as_deref(), Some("req-42"));
    assert_eq!(snapshot.result, Some(json!({"system_id": "abc123", "status": "DEPLOYED"})));

    let delivered = rig.sink.snapshot();
    assert_eq!(delivered.len(), 4);
    assert_eq!(delivered[0].progress, 0.0);
    assert!(delivered[0].important);
    assert_eq!(delivered[1].message, "Powering on");
    let last = delivered.last().unwrap();
    assert_eq!(last.progress, 100.0);
    assert_eq!(last.message, "deploy_machine completed");
    assert!(last.important);

    assert_eq!(rig.metrics.operations_registered.load(Ordering::Relaxed), 1);
    assert_eq!(rig.metrics.operations_completed.load(Ordering::Relaxed), 1);
    assert_eq!(rig.metrics.notifications_sent.load(Ordering::Relaxed), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_registry_abort_cancels_running_work() -> Result<()> {
    let rig = rig();
    let token = ProgressToken::from("deploy-2");

    let tracker = rig.tracker.clone();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        tracker
            .track(
                "deploy_machine",
                Some(task_token),
                None,
                TrackOptions::default(),
                |ctx: OperationContext| async move {
                    ctx.report_important(10.0, "Holding");
                    std::future::pending::<()>().await;
                    Ok(json!({}))
                },
            )
            .await
    });

    // Wait for the work to report before pulling the plug.
    while rig.sink.delivered_count() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(rig.registry.abort(&token, AbortReason::new("operator request")));

    let outcome = handle.await?;
    match outcome {
        Err(Error::Aborted(reason)) => {
            assert!(reason.message().contains("operator request"));
        }
        other => panic!("expected aborted, got {other:?}"),
    }

    let snapshot = rig.registry.get(&token).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Aborted);
    assert_eq!(snapshot.message, "operator request");

    let last = rig.sink.snapshot().into_iter().next_back().unwrap();
    assert!(last.message.contains("aborted"));
    assert!(last.message.contains("operator request"));
    assert!(last.important);

    assert_eq!(rig.metrics.operations_aborted.load(Ordering::Relaxed), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_aborts_stalled_work() -> Result<()> {
    let rig = rig();
    let token = ProgressToken::from("commission-1");

    let outcome = rig
        .tracker
        .track(
            "commission_machine",
            Some(token.clone()),
            None,
            TrackOptions {
                timeout: Some(Duration::from_secs(5)),
                ..TrackOptions::default()
            },
            |_ctx: OperationContext| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            },
        )
        .await;

    match outcome {
        Err(Error::Aborted(reason)) => {
            assert!(reason.message().contains("timed out"));
        }
        other => panic!("expected aborted, got {other:?}"),
    }

    let snapshot = rig.registry.get(&token).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Aborted);
    assert!(snapshot.message.contains("timed out"));
    assert_eq!(rig.metrics.operations_aborted.load(Ordering::Relaxed), 1);
    Ok(())
}

#[tokio::test]
async fn test_rate_limiter_suppresses_rapid_updates() -> Result<()> {
    let rig = rig_with(
        OperationsConfig::default(),
        NotificationConfig::default(),
        AuditLog::noop(),
    );
    let token = ProgressToken::from("deploy-3");

    rig.tracker
        .track(
            "deploy_machine",
            Some(token),
            None,
            TrackOptions::default(),
            |ctx: OperationContext| async move {
                for step in 0..50 {
                    ctx.report(f64::from(step), &format!("step {step}"));
                }
                Ok(json!({}))
            },
        )
        .await?;

    // Start and end brackets always go out; the 50 rapid mid-flight
    // reports land inside the minimum interval and are dropped.
    assert!(rig.sink.delivered_count() <= 5);
    assert!(rig.metrics.notifications_suppressed.load(Ordering::Relaxed) >= 45);
    Ok(())
}

#[tokio::test]
async fn test_sweeper_evicts_old_terminal_records_and_audits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let audit_path = dir.path().join("audit.jsonl");
    let rig = rig_with(
        OperationsConfig {
            max_completed_age_secs: 60,
            ..OperationsConfig::default()
        },
        NotificationConfig::default(),
        AuditLog::to_file(&audit_path)?,
    );

    let done = ProgressToken::from("done-1");
    rig.registry
        .register(done.clone(), "deploy_machine", RegisterOptions::default());
    rig.registry.update(
        &done,
        OperationUpdate {
            status: Some(OperationStatus::Completed),
            ..OperationUpdate::default()
        },
    );

    let live = ProgressToken::from("live-1");
    rig.registry
        .register(live.clone(), "commission_machine", RegisterOptions::default());

    let stats = rig
        .registry
        .sweep_at(Utc::now() + TimeDelta::try_seconds(120).unwrap());
    assert_eq!(stats.terminal_evicted, 1);
    assert_eq!(stats.stale_evicted, 0);
    assert!(rig.registry.get(&done).is_none());
    assert!(rig.registry.get(&live).is_some());
    assert_eq!(rig.metrics.operations_swept.load(Ordering::Relaxed), 1);

    let trail = std::fs::read_to_string(&audit_path)?;
    assert!(trail.contains("operation_registered"));
    assert!(trail.contains("operation_completed"));
    assert!(trail.contains("operation_swept"));
    Ok(())
}

#[tokio::test]
async fn test_query_filters_by_status_and_type() -> Result<()> {
    let rig = rig();

    let finished = ProgressToken::from("q-1");
    rig.registry
        .register(finished.clone(), "deploy_machine", RegisterOptions::default());
    rig.registry.update(
        &finished,
        OperationUpdate {
            status: Some(OperationStatus::Completed),
            ..OperationUpdate::default()
        },
    );
    rig.registry.register(
        ProgressToken::from("q-2"),
        "commission_machine",
        RegisterOptions::default(),
    );
    rig.registry.register(
        ProgressToken::from("q-3"),
        "deploy_machine",
        RegisterOptions::default(),
    );

    let running = rig.registry.query(&OperationQuery {
        status: Some(OperationStatus::Running),
        ..OperationQuery::default()
    });
    assert_eq!(running.len(), 2);

    let deploys = rig.registry.query(&OperationQuery {
        operation_type: Some("deploy_machine".to_string()),
        ..OperationQuery::default()
    });
    assert_eq!(deploys.len(), 2);

    let running_deploys = rig.registry.query(&OperationQuery {
        status: Some(OperationStatus::Running),
        operation_type: Some("deploy_machine".to_string()),
        ..OperationQuery::default()
    });
    assert_eq!(running_deploys.len(), 1);
    assert_eq!(running_deploys[0].operation_type, "deploy_machine");

    let capped = rig.registry.query(&OperationQuery {
        limit: Some(1),
        ..OperationQuery::default()
    });
    assert_eq!(capped.len(), 1);

    assert_eq!(rig.registry.active().len(), 2);
    Ok(())
}
