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

//! Bridge handler that maps MCP tool calls to machine operations.
//!
//! Thin CRUD tools answer inline from the upstream API. The two
//! long-running tools (`deploy_machine`, `commission_machine`) run under
//! the operation tracker: they register against the caller's progress
//! token, hand the work to a monitoring loop, and re-raise failures
//! after the terminal state is recorded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::audit::{AuditKind, AuditLog};
use crate::bridge::pollers::{self, MonitorConfig};
use crate::error::{Error, Result};
use crate::maas::{CommissionParams, DeployParams, MachineApi, ReleaseParams};
use crate::mcp::types::{CallToolParams, CallToolResult, ProgressToken, Tool};
use crate::ops::{OperationQuery, OperationTracker, TrackOptions};

/// Headroom added to the monitoring budget before the tracker's
/// timeout fires, so loop exhaustion wins over the timer.
const TRACK_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

/// Input for tools addressing one machine.
#[derive(Debug, Deserialize)]
pub struct SystemIdInput {
    /// Machine identifier, e.g. `4y3h7n`.
    pub system_id: String,
}

/// Input for `list_machines`; both filters apply client-side.
#[derive(Debug, Default, Deserialize)]
pub struct ListMachinesInput {
    /// Keep only machines whose status matches, e.g. `READY`.
    pub status: Option<String>,
    /// Keep only machines whose hostname contains this substring.
    pub hostname_contains: Option<String>,
}

/// Input for `deploy_machine`.
#[derive(Debug, Deserialize)]
pub struct DeployInput {
    /// Machine identifier.
    pub system_id: String,
    /// Deployment options passed through to the controller.
    #[serde(flatten)]
    pub params: DeployParams,
}

/// Input for `commission_machine`.
#[derive(Debug, Deserialize)]
pub struct CommissionInput {
    /// Machine identifier.
    pub system_id: String,
    /// Commissioning options passed through to the controller.
    #[serde(flatten)]
    pub params: CommissionParams,
}

/// Input for `release_machine`.
#[derive(Debug, Deserialize)]
pub struct ReleaseInput {
    /// Machine identifier.
    pub system_id: String,
    /// Release options passed through to the controller.
    #[serde(flatten)]
    pub params: ReleaseParams,
}

/// Input for `get_operation`.
#[derive(Debug, Deserialize)]
pub struct TokenInput {
    /// Operation token, string or number.
    pub token: ProgressToken,
}

/// Input for `cancel_operation`.
#[derive(Debug, Deserialize)]
pub struct CancelInput {
    /// Operation token, string or number.
    pub token: ProgressToken,
    /// Recorded as the cancellation reason.
    pub reason: Option<String>,
}

/// Routes MCP tool calls to the upstream machine API.
pub struct MaasBridgeHandler<M> {
    api: Arc<M>,
    tracker: OperationTracker,
    monitor_config: MonitorConfig,
    audit: AuditLog,
}

impl<M: MachineApi> MaasBridgeHandler<M> {
    /// Creates a handler over the given upstream API.
    pub const fn new(
        api: Arc<M>,
        tracker: OperationTracker,
        monitor_config: MonitorConfig,
        audit: AuditLog,
    ) -> Self {
        Self {
            api,
            tracker,
            monitor_config,
            audit,
        }
    }

    /// The tracker driving long-running tools, for wiring the transport.
    #[must_use]
    pub const fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// Describes every tool this bridge offers.
    #[allow(clippy::too_many_lines, reason = "Naturally long list of tools")]
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        vec![
            Tool {
                name: "list_machines".to_string(),
                description: Some("List machines known to the MAAS region controller, optionally filtered by status or hostname substring.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "status": { "type": "string", "description": "Keep only machines in this status, e.g. 'READY' or 'Deployed' (case-insensitive)" },
                        "hostname_contains": { "type": "string", "description": "Keep only machines whose hostname contains this substring" }
                    },
                    "required": []
                }),
            },
            Tool {
                name: "get_machine".to_string(),
                description: Some("Get the full record of one machine by system id.".to_string()),
                input_schema: system_id_schema(),
            },
            Tool {
                name: "deploy_machine".to_string(),
                description: Some("Deploy an operating system onto a machine and monitor the deployment to completion. Long-running; supply _meta.progressToken to receive progress notifications and to watch the operation over the event stream.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "system_id": { "type": "string", "description": "Machine identifier, e.g. '4y3h7n'" },
                        "distro_series": { "type": "string", "description": "OS release to install, e.g. 'noble' (controller default when omitted)" },
                        "hwe_kernel": { "type": "string", "description": "Kernel to boot, e.g. 'hwe-24.04'" },
                        "user_data": { "type": "string", "description": "Base64-encoded cloud-init user data" }
                    },
                    "required": ["system_id"]
                }),
            },
            Tool {
                name: "commission_machine".to_string(),
                description: Some("Commission a machine (hardware discovery and testing) and monitor it until READY. Long-running; supply _meta.progressToken to receive progress notifications.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "system_id": { "type": "string", "description": "Machine identifier" },
                        "enable_ssh": { "type": "boolean", "description": "Leave the machine SSH-accessible afterwards (default: false)" },
                        "skip_networking": { "type": "boolean", "description": "Keep the current network configuration (default: false)" },
                        "skip_storage": { "type": "boolean", "description": "Keep the current storage configuration (default: false)" }
                    },
                    "required": ["system_id"]
                }),
            },
            Tool {
                name: "release_machine".to_string(),
                description: Some("Release a machine back to the pool.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "system_id": { "type": "string", "description": "Machine identifier" },
                        "comment": { "type": "string", "description": "Note recorded in the machine's event log" },
                        "erase": { "type": "boolean", "description": "Wipe disks before releasing (default: false)" }
                    },
                    "required": ["system_id"]
                }),
            },
            Tool {
                name: "get_operation".to_string(),
                description: Some("Get the current state of one tracked operation by token.".to_string()),
                input_schema: token_schema(),
            },
            Tool {
                name: "list_operations".to_string(),
                description: Some("List tracked operations, optionally filtered by status, type, or time window.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "status": { "type": "string", "enum": ["pending", "running", "completed", "failed", "aborted"], "description": "Keep only operations in this state" },
                        "operation_type": { "type": "string", "description": "Keep only operations of this kind, e.g. 'deploy_machine'" },
                        "started_after": { "type": "string", "description": "RFC 3339 timestamp; keep operations started strictly after it" },
                        "started_before": { "type": "string", "description": "RFC 3339 timestamp; keep operations started strictly before it" },
                        "updated_after": { "type": "string", "description": "RFC 3339 timestamp; keep operations last touched strictly after it" },
                        "updated_before": { "type": "string", "description": "RFC 3339 timestamp; keep operations last touched strictly before it" },
                        "offset": { "type": "integer", "description": "Skip this many results (default: 0)" },
                        "limit": { "type": "integer", "description": "Return at most this many results" }
                    },
                    "required": []
                }),
            },
            Tool {
                name: "cancel_operation".to_string(),
                description: Some("Cancel a running operation. The operation's work stops within one polling interval and the operation is recorded as cancelled.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "token": { "description": "Operation token (string or number)" },
                        "reason": { "type": "string", "description": "Recorded as the cancellation reason" }
                    },
                    "required": ["token"]
                }),
            },
        ]
    }

    /// Executes one tool call.
    ///
    /// Argument-shape problems come back as in-band tool errors;
    /// execution failures re-raise after the terminal state is recorded
    /// so the transport can map them to protocol errors.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tools and for failed or cancelled
    /// tool execution.
    pub async fn call_tool(
        &self,
        params: CallToolParams,
        parent: Option<&AbortSignal>,
    ) -> Result<CallToolResult> {
        let started = Instant::now();
        let name = params.name.clone();
        let token = params.progress_token();

        let result = match name.as_str() {
            "list_machines" => self.handle_list_machines(params.arguments).await,
            "get_machine" => self.handle_get_machine(params.arguments).await,
            "deploy_machine" => self.handle_deploy(params.arguments, token, parent).await,
            "commission_machine" => self.handle_commission(params.arguments, token, parent).await,
            "release_machine" => self.handle_release(params.arguments).await,
            "get_operation" => self.handle_get_operation(params.arguments),
            "list_operations" => self.handle_list_operations(params.arguments),
            "cancel_operation" => self.handle_cancel_operation(params.arguments),
            _ => Err(Error::validation(format!("Unknown tool: {name}"))),
        };

        let success = matches!(&result, Ok(r) if r.is_error.is_none());
        self.audit.record(AuditKind::ToolResult {
            tool: name,
            success,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
        result
    }

    async fn handle_list_machines(&self, arguments: Option<Value>) -> Result<CallToolResult> {
        let input: ListMachinesInput = match parse_optional(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        let mut machines = self.api.list_machines().await?;
        if let Some(status) = &input.status {
            let wanted = status.trim().to_uppercase().replace([' ', '-'], "_");
            machines.retain(|m| m.status().as_str() == wanted);
        }
        if let Some(fragment) = &input.hostname_contains {
            machines.retain(|m| m.hostname.contains(fragment.as_str()));
        }

        Ok(json_text(&json!({
            "count": machines.len(),
            "machines": machines,
        })))
    }

    async fn handle_get_machine(&self, arguments: Option<Value>) -> Result<CallToolResult> {
        let input: SystemIdInput = match parse_required(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        let machine = self.api.get_machine(&input.system_id).await?;
        Ok(json_text(&serde_json::to_value(&machine)?))
    }

    async fn handle_deploy(
        &self,
        arguments: Option<Value>,
        token: Option<ProgressToken>,
        parent: Option<&AbortSignal>,
    ) -> Result<CallToolResult> {
        let input: DeployInput = match parse_required(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        let api = Arc::clone(&self.api);
        let monitor_config = self.monitor_config;
        let system_id = input.system_id.clone();
        let result = self
            .tracker
            .track(
                "deploy_machine",
                token,
                parent,
                self.track_options(format!("Starting deployment of machine {system_id}")),
                |ctx| async move {
                    let machine = api.deploy_machine(&system_id, &input.params).await?;
                    debug!(
                        "Deployment accepted for {}: status {}",
                        system_id, machine.status_name
                    );
                    pollers::monitor_deployment(api.as_ref(), &ctx, &system_id, monitor_config)
                        .await
                },
            )
            .await?;
        Ok(json_text(&result))
    }

    async fn handle_commission(
        &self,
        arguments: Option<Value>,
        token: Option<ProgressToken>,
        parent: Option<&AbortSignal>,
    ) -> Result<CallToolResult> {
        let input: CommissionInput = match parse_required(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        let api = Arc::clone(&self.api);
        let monitor_config = self.monitor_config;
        let system_id = input.system_id.clone();
        let result = self
            .tracker
            .track(
                "commission_machine",
                token,
                parent,
                self.track_options(format!("Starting commissioning of machine {system_id}")),
                |ctx| async move {
                    let machine = api.commission_machine(&system_id, &input.params).await?;
                    debug!(
                        "Commissioning accepted for {}: status {}",
                        system_id, machine.status_name
                    );
                    pollers::monitor_commissioning(api.as_ref(), &ctx, &system_id, monitor_config)
                        .await
                },
            )
            .await?;
        Ok(json_text(&result))
    }

    async fn handle_release(&self, arguments: Option<Value>) -> Result<CallToolResult> {
        let input: ReleaseInput = match parse_required(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        let machine = self.api.release_machine(&input.system_id, &input.params).await?;
        Ok(json_text(&json!({
            "system_id": machine.system_id,
            "status": machine.status().as_str(),
        })))
    }

    fn handle_get_operation(&self, arguments: Option<Value>) -> Result<CallToolResult> {
        let input: TokenInput = match parse_required(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        match self.tracker.registry().get(&input.token) {
            Some(snapshot) => Ok(json_text(&serde_json::to_value(&snapshot)?)),
            None => Ok(CallToolResult::error(format!(
                "No operation with token {}",
                input.token
            ))),
        }
    }

    fn handle_list_operations(&self, arguments: Option<Value>) -> Result<CallToolResult> {
        let query: OperationQuery = match parse_optional(arguments) {
            Ok(query) => query,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        let operations = self.tracker.registry().query(&query);
        Ok(json_text(&json!({
            "count": operations.len(),
            "operations": operations,
        })))
    }

    fn handle_cancel_operation(&self, arguments: Option<Value>) -> Result<CallToolResult> {
        let input: CancelInput = match parse_required(arguments) {
            Ok(input) => input,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        let reason = input
            .reason
            .map_or_else(|| "cancelled by client".into(), Into::into);
        if self.tracker.registry().abort(&input.token, reason) {
            Ok(json_text(&json!({
                "token": input.token,
                "cancelled": true,
            })))
        } else {
            Ok(CallToolResult::error(format!(
                "Operation {} not found or already finished",
                input.token
            )))
        }
    }

    fn track_options(&self, initial_message: String) -> TrackOptions {
        let budget =
            self.monitor_config.interval * self.monitor_config.max_polls + TRACK_TIMEOUT_MARGIN;
        TrackOptions {
            timeout: Some(budget),
            initial_message: Some(initial_message),
            request_id: Some(Uuid::new_v4().to_string()),
            ..TrackOptions::default()
        }
    }
}

/// Parses arguments for tools that require them.
fn parse_required<T: DeserializeOwned>(arguments: Option<Value>) -> Result<T> {
    let value = arguments.ok_or_else(|| Error::validation("Missing arguments"))?;
    serde_json::from_value(value).map_err(|e| Error::validation(format!("Invalid arguments: {e}")))
}

/// Parses arguments for tools where they may be omitted entirely.
fn parse_optional<T: DeserializeOwned>(arguments: Option<Value>) -> Result<T> {
    serde_json::from_value(arguments.unwrap_or_else(|| json!({})))
        .map_err(|e| Error::validation(format!("Invalid arguments: {e}")))
}

/// Tool result carrying the value as pretty-printed JSON text.
fn json_text(value: &Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    CallToolResult::text(text)
}

fn system_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "system_id": { "type": "string", "description": "Machine identifier, e.g. '4y3h7n'" }
        },
        "required": ["system_id"]
    })
}

fn token_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "token": { "description": "Operation token (string or number)" }
        },
        "required": ["token"]
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for brevity"
)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::maas::{Machine, MachineStatus};
    use crate::mcp::types::{CallMeta, ToolContent};
    use crate::metrics::Metrics;
    use crate::ops::{OperationStatus, OperationsConfig, OperationsRegistry};
    use crate::progress::{NotificationConfig, ProgressNotifier, RecordingSink};
    use anyhow::{Context, Result};
    use std::collections::VecDeque;
    use std::sync::Mutex;

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
        async fn list_machines(&self) -> crate::error::Result<Vec<Machine>> {
            Ok(self.machines.clone())
        }

        async fn get_machine(&self, system_id: &str) -> crate::error::Result<Machine> {
            self.machines
                .iter()
                .find(|m| m.system_id == system_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("machine {system_id}")))
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
            system_id: &str,
            _params: &DeployParams,
        ) -> crate::error::Result<Machine> {
            self.get_machine(system_id).await
        }

        async fn commission_machine(
            &self,
            system_id: &str,
            _params: &CommissionParams,
        ) -> crate::error::Result<Machine> {
            self.get_machine(system_id).await
        }

        async fn release_machine(
            &self,
            system_id: &str,
            _params: &ReleaseParams,
        ) -> crate::error::Result<Machine> {
            self.get_machine(system_id).await
        }
    }

    struct Rig {
        handler: MaasBridgeHandler<FakeApi>,
        registry: OperationsRegistry,
        sink: Arc<RecordingSink>,
    }

    fn rig(machines: Vec<Machine>, script: &[MachineStatus]) -> Rig {
        let metrics = Arc::new(Metrics::new());
        let registry = OperationsRegistry::new(
            OperationsConfig::default(),
            Arc::clone(&metrics),
            AuditLog::noop(),
        );
        let sink = Arc::new(RecordingSink::new());
        let notifier =
            ProgressNotifier::new(NotificationConfig::default(), sink.clone(), metrics);
        let tracker = OperationTracker::new(registry.clone(), notifier, Duration::from_secs(600));
        let handler = MaasBridgeHandler::new(
            Arc::new(FakeApi::new(machines, script)),
            tracker,
            MonitorConfig {
                interval: Duration::from_secs(5),
                max_polls: 10,
            },
            AuditLog::noop(),
        );
        Rig {
            handler,
            registry,
            sink,
        }
    }

    fn call(name: &str, arguments: Value) -> CallToolParams {
        CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
            meta: None,
        }
    }

    fn tracked_call(name: &str, arguments: Value, token: &str) -> CallToolParams {
        CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
            meta: Some(CallMeta {
                progress_token: Some(ProgressToken::from(token)),
            }),
        }
    }

    fn result_text(result: &CallToolResult) -> &str {
        let ToolContent::Text { text } = result
            .content
            .first()
            .expect("tool result has no content");
        text
    }

    #[tokio::test]
    async fn test_list_tools_names_are_unique() {
        let rig = rig(vec![], &[]);
        let tools = rig.handler.list_tools();
        assert_eq!(tools.len(), 8);
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn test_get_machine_returns_record() -> Result<()> {
        let rig = rig(vec![machine("abc123", "rack-01", "Ready")], &[]);
        let result = rig
            .handler
            .call_tool(call("get_machine", json!({"system_id": "abc123"})), None)
            .await?;
        assert!(result.is_error.is_none());
        assert!(result_text(&result).contains("rack-01"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_arguments_is_in_band_error() -> Result<()> {
        let rig = rig(vec![], &[]);
        let params = CallToolParams {
            name: "get_machine".to_string(),
            arguments: None,
            meta: None,
        };
        let result = rig.handler.call_tool(params, None).await?;
        assert_eq!(result.is_error, Some(true));
        assert!(result_text(&result).contains("Missing arguments"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_is_raised() {
        let rig = rig(vec![], &[]);
        let result = rig
            .handler
            .call_tool(call("reboot_rack", json!({})), None)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_list_machines_hostname_filter() -> Result<()> {
        let rig = rig(
            vec![
                machine("a1", "web-01", "Ready"),
                machine("a2", "db-01", "Ready"),
            ],
            &[],
        );
        let result = rig
            .handler
            .call_tool(
                call("list_machines", json!({"hostname_contains": "web"})),
                None,
            )
            .await?;
        let text = result_text(&result);
        assert!(text.contains("web-01"));
        assert!(!text.contains("db-01"));
        assert!(text.contains("\"count\": 1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_machines_status_filter_accepts_loose_spelling() -> Result<()> {
        let rig = rig(
            vec![
                machine("a1", "web-01", "Ready"),
                machine("a2", "db-01", "Failed deployment"),
            ],
            &[],
        );
        let result = rig
            .handler
            .call_tool(
                call("list_machines", json!({"status": "failed deployment"})),
                None,
            )
            .await?;
        let text = result_text(&result);
        assert!(text.contains("db-01"));
        assert!(!text.contains("web-01"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_machine_tracks_to_completion() -> Result<()> {
        let rig = rig(
            vec![machine("abc123", "rack-01", "Allocated")],
            &[
                MachineStatus::Deploying,
                MachineStatus::Deploying,
                MachineStatus::Deployed,
            ],
        );

        let result = rig
            .handler
            .call_tool(
                tracked_call("deploy_machine", json!({"system_id": "abc123"}), "tok-deploy"),
                None,
            )
            .await?;
        assert!(result.is_error.is_none());
        assert!(result_text(&result).contains("DEPLOYED"));

        let snapshot = rig
            .registry
            .get(&ProgressToken::from("tok-deploy"))
            .context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Completed);
        assert_eq!(snapshot.operation_type, "deploy_machine");

        assert!(!rig.sink.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_failure_re_raises_after_recording() -> Result<()> {
        let rig = rig(
            vec![machine("abc123", "rack-01", "Allocated")],
            &[MachineStatus::FailedDeployment],
        );

        let error = rig
            .handler
            .call_tool(
                tracked_call("deploy_machine", json!({"system_id": "abc123"}), "tok-fail"),
                None,
            )
            .await
            .expect_err("failed deployment must re-raise");
        assert!(error.to_string().contains("FAILED_DEPLOYMENT"));

        let snapshot = rig
            .registry
            .get(&ProgressToken::from("tok-fail"))
            .context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_operation_queries_and_cancel() -> Result<()> {
        let rig = rig(vec![], &[]);
        let token = ProgressToken::from("op-q");
        rig.registry.register(
            token.clone(),
            "deploy_machine",
            crate::ops::RegisterOptions {
                signal: Some(AbortSignal::new()),
                ..Default::default()
            },
        );

        let listed = rig
            .handler
            .call_tool(
                call("list_operations", json!({"operation_type": "deploy_machine"})),
                None,
            )
            .await?;
        assert!(result_text(&listed).contains("\"count\": 1"));

        let fetched = rig
            .handler
            .call_tool(call("get_operation", json!({"token": "op-q"})), None)
            .await?;
        assert!(result_text(&fetched).contains("deploy_machine"));

        let cancelled = rig
            .handler
            .call_tool(
                call("cancel_operation", json!({"token": "op-q", "reason": "test"})),
                None,
            )
            .await?;
        assert!(result_text(&cancelled).contains("true"));
        let snapshot = rig.registry.get(&token).context("operation missing")?;
        assert_eq!(snapshot.status, OperationStatus::Aborted);

        // A second cancel reports failure in-band.
        let again = rig
            .handler
            .call_tool(call("cancel_operation", json!({"token": "op-q"})), None)
            .await?;
        assert_eq!(again.is_error, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_operation_unknown_token() -> Result<()> {
        let rig = rig(vec![], &[]);
        let result = rig
            .handler
            .call_tool(call("get_operation", json!({"token": 42})), None)
            .await?;
        assert_eq!(result.is_error, Some(true));
        assert!(result_text(&result).contains("42"));
        Ok(())
    }
}
