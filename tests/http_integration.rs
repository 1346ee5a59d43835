// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for brevity"
)]
//! HTTP transport tests against a live server on an ephemeral port.
//!
//! Each test assembles the full stack (registry, tracker, broker,
//! bridge handler) around a scripted upstream, serves it with axum,
//! and talks to it over real sockets.

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
    OperationStatus, OperationTracker, OperationsConfig, OperationsRegistry, RegisterOptions,
};
use gantry_mcp::progress::{NotificationConfig, ProgressNotifier};
use gantry_mcp::sse::{SseBroker, SseSink};
use serde_json::{Value, json};

fn machine(system_id: &str, hostname: &str, status_name: &str) -> Machine {
    Machine {
        system_id: system_id.to_string(),
        hostname: hostname.to_string(),
        architecture: "amd64/generic".to_string(),
        cpu_count: 8,
        memory: 32768,
        status_name: status_name.to_string(),
        power_state: "on".to_string(),
        osystem: "ubuntu".to_string(),
        distro_series: "noble".to_string(),
        ip_addresses: vec![],
        tag_names: vec![],
    }
}

/// Canned upstream whose status reads follow a script.
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
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serves the full stack around `api` on an ephemeral port. Progress
/// rate limiting is disabled so every update is observable.
async fn serve(api: FakeApi, monitor: MonitorConfig, heartbeat: Duration) -> Result<TestServer> {
    let api = Arc::new(api);
    let metrics = Arc::new(Metrics::new());
    let registry = OperationsRegistry::new(
        OperationsConfig::default(),
        Arc::clone(&metrics),
        AuditLog::noop(),
    );
    let broker = SseBroker::new(16, Arc::clone(&metrics));
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
    let state = AppState::new(service, registry.clone(), broker, api, metrics, heartbeat);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    Ok(TestServer {
        base,
        registry,
        client: reqwest::Client::new(),
        handle,
    })
}

async fn serve_default() -> Result<TestServer> {
    serve(
        FakeApi::new(vec![], &[]),
        MonitorConfig::default(),
        Duration::from_secs(30),
    )
    .await
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn rpc(&self, body: &Value) -> Result<Value> {
        let response = self.client.post(self.url("/mcp")).json(body).send().await?;
        anyhow::ensure!(
            response.status().as_u16() == 200,
            "unexpected status {}",
            response.status()
        );
        Ok(response.json().await?)
    }

    async fn call_tool(&self, id: i64, name: &str, arguments: Value) -> Result<Value> {
        self.rpc(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        }))
        .await
    }
}

fn result_text(response: &Value) -> &str {
    response["result"]["content"][0]["text"]
        .as_str()
        .expect("tool result text")
}

#[tokio::test]
async fn test_initialize_reports_server_identity() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .rpc(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "itest", "version": "0.0.1"}
            }
        }))
        .await?;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["serverInfo"]["name"], "gantry");
    assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
    assert!(response["result"]["capabilities"]["tools"].is_object());
    Ok(())
}

#[tokio::test]
async fn test_tools_list_exposes_machine_and_operation_tools() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .rpc(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await?;

    let tools = response["result"]["tools"]
        .as_array()
        .context("tools array")?;
    assert_eq!(tools.len(), 8);

    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in [
        "list_machines",
        "get_machine",
        "deploy_machine",
        "commission_machine",
        "release_machine",
        "get_operation",
        "list_operations",
        "cancel_operation",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }
    for tool in tools {
        assert_eq!(tool["inputSchema"]["type"], "object");
    }
    Ok(())
}

#[tokio::test]
async fn test_get_machine_round_trip() -> Result<()> {
    let server = serve(
        FakeApi::new(vec![machine("abc123", "rack-1", "Ready")], &[]),
        MonitorConfig::default(),
        Duration::from_secs(30),
    )
    .await?;

    let response = server
        .call_tool(3, "get_machine", json!({"system_id": "abc123"}))
        .await?;
    assert!(response.get("error").is_none());
    assert!(response["result"].get("isError").is_none());

    let machine: Value = serde_json::from_str(result_text(&response))?;
    assert_eq!(machine["hostname"], "rack-1");
    assert_eq!(machine["status_name"], "Ready");
    Ok(())
}

#[tokio::test]
async fn test_deploy_tracks_operation_to_completion() -> Result<()> {
    let server = serve(
        FakeApi::new(
            vec![machine("abc123", "rack-1", "Allocated")],
            &[MachineStatus::Deploying, MachineStatus::Deployed],
        ),
        MonitorConfig {
            interval: Duration::from_millis(10),
            max_polls: 20,
        },
        Duration::from_secs(30),
    )
    .await?;

    let response = server
        .rpc(&json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {
                "name": "deploy_machine",
                "arguments": {"system_id": "abc123", "distro_series": "noble"},
                "_meta": {"progressToken": "deploy-http-1"}
            }
        }))
        .await?;
    assert!(response.get("error").is_none(), "deploy failed: {response}");
    assert!(result_text(&response).contains("DEPLOYED"));

    let snapshot = server
        .registry
        .get(&ProgressToken::from("deploy-http-1"))
        .context("operation recorded")?;
    assert_eq!(snapshot.status, OperationStatus::Completed);
    assert_eq!(snapshot.operation_type, "deploy_machine");

    // The finished operation is also fetchable as a resource.
    let resource = server
        .client
        .post(server.url("/mcp/resource"))
        .json(&json!({"uri": "maas://operation/deploy-http-1"}))
        .send()
        .await?;
    assert_eq!(resource.status().as_u16(), 200);
    let body: Value = resource.json().await?;
    assert_eq!(body["contents"][0]["mimeType"], "application/json");
    let text = body["contents"][0]["text"].as_str().context("text")?;
    assert!(text.contains("deploy_machine"));
    assert!(text.contains("completed"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_method_is_method_not_found() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .rpc(&json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}))
        .await?;
    assert_eq!(response["error"]["code"], -32601);
    Ok(())
}

#[tokio::test]
async fn test_unparseable_body_is_parse_error_with_null_id() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .client
        .post(server.url("/mcp"))
        .body("{this is not json")
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], -32700);
    assert!(body["id"].is_null());
    Ok(())
}

#[tokio::test]
async fn test_notification_is_accepted() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .client
        .post(server.url("/mcp"))
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 202);
    Ok(())
}

#[tokio::test]
async fn test_missing_machine_maps_to_resource_not_found() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .call_tool(6, "get_machine", json!({"system_id": "ghost"}))
        .await?;
    assert_eq!(response["error"]["code"], -32003);
    assert!(
        response["error"]["message"]
            .as_str()
            .context("message")?
            .contains("ghost")
    );
    Ok(())
}

#[tokio::test]
async fn test_tool_shape_error_stays_in_band() -> Result<()> {
    let server = serve_default().await?;
    let response = server
        .rpc(&json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": "get_machine"}
        }))
        .await?;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    assert!(result_text(&response).contains("Missing arguments"));
    Ok(())
}

#[tokio::test]
async fn test_cancel_operation_over_rpc() -> Result<()> {
    let server = serve_default().await?;
    let token = ProgressToken::from("op-cancel-1");
    server
        .registry
        .register(token.clone(), "deploy_machine", RegisterOptions::default());

    let response = server
        .call_tool(
            8,
            "cancel_operation",
            json!({"token": "op-cancel-1", "reason": "wrong machine"}),
        )
        .await?;
    assert!(response.get("error").is_none());
    assert!(result_text(&response).contains("true"));

    let snapshot = server.registry.get(&token).context("snapshot")?;
    assert_eq!(snapshot.status, OperationStatus::Aborted);
    assert_eq!(snapshot.message, "wrong machine");
    Ok(())
}

#[tokio::test]
async fn test_healthz_and_metrics_endpoints() -> Result<()> {
    let server = serve_default().await?;
    let _ = server
        .rpc(&json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
        .await?;

    let health: Value = server
        .client
        .get(server.url("/mcp/healthz"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");
    assert!(health["uptime_seconds"].as_i64().context("uptime")? >= 0);
    assert!(health["version"].is_string());

    let metrics: Value = server
        .client
        .get(server.url("/mcp/metrics"))
        .send()
        .await?
        .json()
        .await?;
    assert!(metrics["rpc_requests"].as_u64().context("rpc_requests")? >= 1);
    assert_eq!(metrics["operations_registered"], 0);
    Ok(())
}

#[tokio::test]
async fn test_resource_errors_map_to_http_statuses() -> Result<()> {
    let server = serve(
        FakeApi::new(vec![machine("abc123", "rack-1", "Ready")], &[]),
        MonitorConfig::default(),
        Duration::from_secs(30),
    )
    .await?;

    let ok = server
        .client
        .post(server.url("/mcp/resource"))
        .json(&json!({"uri": "maas://machine/abc123"}))
        .send()
        .await?;
    assert_eq!(ok.status().as_u16(), 200);
    let body: Value = ok.json().await?;
    assert_eq!(body["contents"][0]["uri"], "maas://machine/abc123");

    let missing = server
        .client
        .post(server.url("/mcp/resource"))
        .json(&json!({"uri": "maas://operation/ghost"}))
        .send()
        .await?;
    assert_eq!(missing.status().as_u16(), 404);

    let unsupported = server
        .client
        .post(server.url("/mcp/resource"))
        .json(&json!({"uri": "file:///etc/passwd"}))
        .send()
        .await?;
    assert_eq!(unsupported.status().as_u16(), 400);
    let body: Value = unsupported.json().await?;
    assert!(
        body["error"]
            .as_str()
            .context("error text")?
            .contains("Unsupported")
    );
    Ok(())
}
