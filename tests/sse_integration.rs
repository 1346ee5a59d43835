// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for brevity"
)]
//! Event-stream tests over real sockets.
//!
//! Covers replay of finished operations, live progress during a
//! monitored deployment, heartbeats on idle streams, stream closure
//! on terminal events, and channel cleanup when the client walks
//! away mid-stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use gantry_mcp::audit::AuditLog;
use gantry_mcp::bridge::{MaasBridgeHandler, MonitorConfig};
use gantry_mcp::error::Error;
use gantry_mcp::maas::{
    CommissionParams, DeployParams, Machine, MachineApi, MachineStatus, ReleaseParams,
};
use gantry_mcp::mcp::{AppState, McpService, ProgressToken, router};
use gantry_mcp::metrics::Metrics;
use gantry_mcp::ops::{
    OperationStatus, OperationTracker, OperationUpdate, OperationsConfig, OperationsRegistry,
    RegisterOptions,
};
use gantry_mcp::progress::{NotificationConfig, ProgressNotifier};
use gantry_mcp::sse::{SseBroker, SseSink};
use serde_json::{Value, json};

fn machine(system_id: &str, status_name: &str) -> Machine {
    Machine {
        system_id: system_id.to_string(),
        hostname: "rack-1".to_string(),
        architecture: "amd64/generic".to_string(),
        cpu_count: 4,
        memory: 16384,
        status_name: status_name.to_string(),
        power_state: "on".to_string(),
        osystem: "ubuntu".to_string(),
        distro_series: "noble".to_string(),
        ip_addresses: vec![],
        tag_names: vec![],
    }
}

/// Canned upstream whose status reads follow a script; the last entry
/// repeats once the script runs out.
struct FakeApi {
    machines: Vec<Machine>,
    statuses: Mutex<VecDeque<MachineStatus>>,
    last: Mutex<MachineStatus>,
}

impl FakeApi {
    fn new(machines: Vec<Machine>, script: &[MachineStatus]) -> Self {
        Self {
            machines,
            statuses: Mutex::new(script.iter().cloned().collect()),
            last: Mutex::new(MachineStatus::New),
        }
    }
}

impl MachineApi for FakeApi {
    async fn list_machines(&self) -> gantry_mcp::error::Result<Vec<Machine>> {
        Ok(self.machines.clone())
    }

    async fn get_machine(&self, system_id: &str) -> gantry_mcp::error::Result<Machine> {
        self.machines
            .iter()
            .find(|m| m.system_id == system_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("machine {system_id}")))
    }

    async fn machine_status(&self, _system_id: &str) -> gantry_mcp::error::Result<MachineStatus> {
        let mut statuses = self.statuses.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = statuses.pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    async fn deploy_machine(
        &self,
        system_id: &str,
        _params: &DeployParams,
    ) -> gantry_mcp::error::Result<Machine> {
        self.get_machine(system_id).await
    }

    async fn commission_machine(
        &self,
        system_id: &str,
        _params: &CommissionParams,
    ) -> gantry_mcp::error::Result<Machine> {
        self.get_machine(system_id).await
    }

    async fn release_machine(
        &self,
        system_id: &str,
        _params: &ReleaseParams,
    ) -> gantry_mcp::error::Result<Machine> {
        self.get_machine(system_id).await
    }
}

struct TestServer {
    base: String,
    registry: OperationsRegistry,
    broker: SseBroker,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(api: FakeApi, monitor: MonitorConfig, heartbeat: Duration) -> Result<TestServer> {
    let api = Arc::new(api);
    let metrics = Arc::new(Metrics::new());
    let registry = OperationsRegistry::new(
        OperationsConfig::default(),
        Arc::clone(&metrics),
        AuditLog::noop(),
    );
    let broker = SseBroker::new(64, Arc::clone(&metrics));
    let sink = Arc::new(SseSink::new(broker.clone(), registry.clone()));
    let notifier = ProgressNotifier::new(
        NotificationConfig {
            min_interval_ms: 0,
            ..NotificationConfig::default()
        },
        sink,
        Arc::clone(&metrics),
    );
    let tracker = OperationTracker::new(registry.clone(), notifier, Duration::from_secs(60));
    let handler = MaasBridgeHandler::new(Arc::clone(&api), tracker, monitor, AuditLog::noop());
    let service = McpService::new(Arc::new(handler), Arc::clone(&metrics));
    let state = AppState::new(
        service,
        registry.clone(),
        broker.clone(),
        api,
        metrics,
        heartbeat,
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    Ok(TestServer {
        base,
        registry,
        broker,
        client: reqwest::Client::new(),
        handle,
    })
}

impl TestServer {
    fn stream_url(&self, operation_id: &str) -> String {
        format!("{}/mcp/stream?operation_id={operation_id}", self.base)
    }

    async fn open_stream(&self, operation_id: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.stream_url(operation_id))
            .send()
            .await?;
        anyhow::ensure!(
            response.status().as_u16() == 200,
            "unexpected status {}",
            response.status()
        );
        Ok(response)
    }
}

fn quick_monitor() -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_millis(10),
        max_polls: 50,
    }
}

#[tokio::test]
async fn test_finished_operation_is_replayed_and_stream_closes() -> Result<()> {
    let server = serve(
        FakeApi::new(vec![], &[]),
        MonitorConfig::default(),
        Duration::from_secs(30),
    )
    .await?;

    let token = ProgressToken::from("op-replay");
    server
        .registry
        .register(token.clone(), "deploy_machine", RegisterOptions::default());
    server.registry.update(
        &token,
        OperationUpdate {
            status: Some(OperationStatus::Completed),
            progress: Some(100.0),
            message: Some("deploy_machine completed".to_string()),
            result: Some(json!({"system_id": "abc123", "status": "DEPLOYED"})),
            ..OperationUpdate::default()
        },
    );

    let response = server.open_stream("op-replay").await?;
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .context("content-type")?
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // text() returning at all proves the server closed the stream.
    let body = response.text().await?;
    assert!(body.contains("event: completion"), "body: {body}");
    assert!(body.contains("data: "));
    assert!(body.contains("\nid: "));
    assert!(body.contains("DEPLOYED"));
    Ok(())
}

#[tokio::test]
async fn test_live_deploy_streams_progress_then_completion() -> Result<()> {
    let server = serve(
        FakeApi::new(
            vec![machine("abc123", "Allocated")],
            &[
                MachineStatus::Deploying,
                MachineStatus::Deploying,
                MachineStatus::Deployed,
            ],
        ),
        quick_monitor(),
        Duration::from_secs(30),
    )
    .await?;

    // Subscribe before kicking off the work so nothing is missed.
    let stream = server.open_stream("deploy-sse-1").await?;

    let rpc: Value = server
        .client
        .post(format!("{}/mcp", server.base))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "deploy_machine",
                "arguments": {"system_id": "abc123"},
                "_meta": {"progressToken": "deploy-sse-1"}
            }
        }))
        .send()
        .await?
        .json()
        .await?;
    assert!(rpc.get("error").is_none(), "deploy failed: {rpc}");

    let body = stream.text().await?;
    assert!(body.contains("event: progress"), "body: {body}");
    assert!(body.contains("event: completion"), "body: {body}");
    assert!(body.contains("DEPLOYED"));

    let last_frame = body
        .split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .last()
        .context("at least one frame")?;
    assert!(last_frame.contains("event: completion"));
    Ok(())
}

#[tokio::test]
async fn test_failed_deployment_streams_error_event() -> Result<()> {
    let server = serve(
        FakeApi::new(
            vec![machine("abc123", "Allocated")],
            &[MachineStatus::Deploying, MachineStatus::FailedDeployment],
        ),
        quick_monitor(),
        Duration::from_secs(30),
    )
    .await?;

    let stream = server.open_stream("deploy-sse-2").await?;

    let rpc: Value = server
        .client
        .post(format!("{}/mcp", server.base))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "deploy_machine",
                "arguments": {"system_id": "abc123"},
                "_meta": {"progressToken": "deploy-sse-2"}
            }
        }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(rpc["error"]["code"], -32004);

    let body = stream.text().await?;
    assert!(body.contains("event: error"), "body: {body}");
    assert!(body.contains("FAILED_DEPLOYMENT"));
    assert!(!body.contains("recoverable"));
    Ok(())
}

#[tokio::test]
async fn test_cancel_closes_stream_with_cancelled_status() -> Result<()> {
    // Script never reaches a terminal state, so only the cancel ends it.
    let server = serve(
        FakeApi::new(
            vec![machine("abc123", "Allocated")],
            &[MachineStatus::Deploying],
        ),
        MonitorConfig {
            interval: Duration::from_millis(10),
            max_polls: 1000,
        },
        Duration::from_secs(30),
    )
    .await?;

    let stream = server.open_stream("deploy-sse-3").await?;

    let client = server.client.clone();
    let rpc_url = format!("{}/mcp", server.base);
    let deploy = tokio::spawn(async move {
        client
            .post(rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {
                    "name": "deploy_machine",
                    "arguments": {"system_id": "abc123"},
                    "_meta": {"progressToken": "deploy-sse-3"}
                }
            }))
            .send()
            .await?
            .json::<Value>()
            .await
    });

    let token = ProgressToken::from("deploy-sse-3");
    for _ in 0..500 {
        if server
            .registry
            .get(&token)
            .is_some_and(|s| s.status == OperationStatus::Running)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancel: Value = server
        .client
        .post(format!("{}/mcp", server.base))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": "cancel_operation",
                "arguments": {"token": "deploy-sse-3", "reason": "changed plans"}
            }
        }))
        .send()
        .await?
        .json()
        .await?;
    assert!(cancel.get("error").is_none(), "cancel failed: {cancel}");

    let rpc = deploy.await??;
    assert_eq!(rpc["error"]["code"], -32004);

    let body = stream.text().await?;
    assert!(body.contains("event: status"), "body: {body}");
    assert!(body.contains("\"current_status\":\"cancelled\""));
    Ok(())
}

#[tokio::test]
async fn test_heartbeats_flow_on_idle_stream() -> Result<()> {
    let server = serve(
        FakeApi::new(vec![], &[]),
        MonitorConfig::default(),
        Duration::from_millis(20),
    )
    .await?;

    // Subscribing ahead of the operation is allowed; until something is
    // published the stream carries only keep-alives.
    let mut response = server.open_stream("op-idle").await?;
    let mut body = String::new();
    while body.matches("event: heartbeat").count() < 2 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .context("heartbeat timeout")??;
        let chunk = chunk.context("stream ended early")?;
        body.push_str(&String::from_utf8_lossy(&chunk));
    }

    assert!(body.contains("\"sequence\":1"));
    assert!(body.contains("\"sequence\":2"));
    // Heartbeats carry no replayable id.
    assert!(!body.contains("\nid: "));
    Ok(())
}

#[tokio::test]
async fn test_client_disconnect_releases_stream_channel() -> Result<()> {
    let server = serve(
        FakeApi::new(vec![], &[]),
        MonitorConfig::default(),
        Duration::from_millis(20),
    )
    .await?;

    // The operation never finishes, so only the client hangup can end
    // the stream.
    server.registry.register(
        ProgressToken::from("op-walkaway"),
        "deploy_machine",
        RegisterOptions::default(),
    );

    let mut response = server.open_stream("op-walkaway").await?;
    let first = tokio::time::timeout(Duration::from_secs(5), response.chunk())
        .await
        .context("first frame timeout")??;
    assert!(first.is_some(), "stream ended before any frame");
    assert_eq!(server.broker.channel_count(), 1);

    drop(response);

    // The handler notices the hangup on a later heartbeat write and the
    // stream guard hands the channel back.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.broker.channel_count() != 0 {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "channel never released after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[tokio::test]
async fn test_stream_rejects_missing_operation_id() -> Result<()> {
    let server = serve(
        FakeApi::new(vec![], &[]),
        MonitorConfig::default(),
        Duration::from_secs(30),
    )
    .await?;

    let empty = server
        .client
        .get(format!("{}/mcp/stream?operation_id=", server.base))
        .send()
        .await?;
    assert_eq!(empty.status().as_u16(), 400);

    let absent = server
        .client
        .get(format!("{}/mcp/stream", server.base))
        .send()
        .await?;
    assert_eq!(absent.status().as_u16(), 400);
    Ok(())
}
