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

//! Transport-independent JSON-RPC request handling.
//!
//! Both the HTTP endpoint and the stdio loop feed parsed messages
//! through [`McpService`], so method dispatch, protocol errors, and the
//! error-code mapping behave identically on either transport.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::abort::AbortSignal;
use crate::bridge::MaasBridgeHandler;
use crate::maas::MachineApi;
use crate::mcp::types::{
    CallToolParams, INTERNAL_ERROR, INVALID_PARAMS, InitializeParams, InitializeResult,
    ListToolsResult, METHOD_NOT_FOUND, Notification, Request, RequestId, Response,
    ServerCapabilities, ServerInfo, ToolsCapability,
};
use crate::metrics::Metrics;

/// Protocol revision this server speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Dispatches JSON-RPC requests to the bridge handler.
pub struct McpService<M> {
    handler: Arc<MaasBridgeHandler<M>>,
    metrics: Arc<Metrics>,
}

impl<M> Clone for McpService<M> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<M: MachineApi> McpService<M> {
    /// Creates a service around the bridge handler.
    pub const fn new(handler: Arc<MaasBridgeHandler<M>>, metrics: Arc<Metrics>) -> Self {
        Self { handler, metrics }
    }

    /// The wrapped bridge handler.
    #[must_use]
    pub const fn handler(&self) -> &Arc<MaasBridgeHandler<M>> {
        &self.handler
    }

    /// Handles one request and produces its response.
    ///
    /// `parent` bounds any long-running work started by the request;
    /// transports wire it to their notion of "the client went away".
    pub async fn handle_request(&self, request: Request, parent: Option<AbortSignal>) -> Response {
        debug!("Handling request: {} (id={:?})", request.method, request.id);
        self.metrics.rpc_requests.fetch_add(1, Ordering::Relaxed);

        let response = match request.method.as_str() {
            "initialize" => Self::handle_initialize(request),
            "ping" => success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request),
            "tools/call" => self.handle_tools_call(request, parent).await,
            _ => {
                warn!("Unknown method: {}", request.method);
                Response::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("Unknown method: {}", request.method),
                )
            }
        };

        if response.error.is_some() {
            self.metrics.rpc_errors.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    /// Handles one notification; notifications never produce a response.
    pub fn handle_notification(&self, notification: &Notification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                info!("MCP client initialized");
            }
            "notifications/cancelled" => {
                debug!("Client cancelled a request");
            }
            other => {
                debug!("Ignoring unknown notification: {}", other);
            }
        }
    }

    fn handle_initialize(request: Request) -> Response {
        let params: InitializeParams = match request
            .params
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(params)) => params,
            Ok(None) => {
                return Response::error(request.id, INVALID_PARAMS, "Missing initialize params");
            }
            Err(e) => {
                return Response::error(
                    request.id,
                    INVALID_PARAMS,
                    format!("Invalid initialize params: {e}"),
                );
            }
        };

        info!(
            "MCP client connecting: {} v{} (protocol {})",
            params.client_info.name,
            params.client_info.version.as_deref().unwrap_or("unknown"),
            params.protocol_version
        );

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                resources: Some(json!({})),
            },
            server_info: ServerInfo {
                name: "gantry".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            instructions: None,
        };
        success(request.id, result)
    }

    fn handle_tools_list(&self, request: Request) -> Response {
        let tools = self.handler.list_tools();
        debug!("Listing {} tools", tools.len());
        success(request.id, ListToolsResult { tools })
    }

    async fn handle_tools_call(&self, request: Request, parent: Option<AbortSignal>) -> Response {
        let params: CallToolParams = match request
            .params
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(params)) => params,
            Ok(None) => {
                return Response::error(request.id, INVALID_PARAMS, "Missing tools/call params");
            }
            Err(e) => {
                return Response::error(
                    request.id,
                    INVALID_PARAMS,
                    format!("Invalid tools/call params: {e}"),
                );
            }
        };

        debug!("Calling tool: {}", params.name);
        match self.handler.call_tool(params, parent.as_ref()).await {
            Ok(result) => success(request.id, result),
            Err(e) => {
                error!("Tool call failed: {e}");
                Response::from_error(request.id, &e)
            }
        }
    }
}

/// Success response, downgrading unserializable results to an internal
/// error instead of panicking.
fn success(id: RequestId, result: impl Serialize) -> Response {
    match Response::success(id.clone(), result) {
        Ok(response) => response,
        Err(e) => Response::error(id, INTERNAL_ERROR, format!("Unserializable result: {e}")),
    }
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
    use crate::bridge::MonitorConfig;
    use crate::error::Error;
    use crate::maas::{CommissionParams, DeployParams, Machine, MachineStatus, ReleaseParams};
    use crate::mcp::types::{
        CallToolResult, OPERATION_FAILED, RESOURCE_NOT_FOUND, error_code,
    };
    use crate::ops::{OperationTracker, OperationsConfig, OperationsRegistry};
    use crate::progress::{NotificationConfig, ProgressNotifier, RecordingSink};
    use anyhow::{Context, Result};
    use std::time::Duration;

    struct EmptyApi;

    impl MachineApi for EmptyApi {
        async fn list_machines(&self) -> crate::error::Result<Vec<Machine>> {
            Ok(vec![])
        }

        async fn get_machine(&self, system_id: &str) -> crate::error::Result<Machine> {
            Err(Error::not_found(format!("machine {system_id}")))
        }

        async fn machine_status(&self, system_id: &str) -> crate::error::Result<MachineStatus> {
            Err(Error::not_found(format!("machine {system_id}")))
        }

        async fn deploy_machine(
            &self,
            system_id: &str,
            _params: &DeployParams,
        ) -> crate::error::Result<Machine> {
            Err(Error::upstream(format!("cannot deploy {system_id}")))
        }

        async fn commission_machine(
            &self,
            system_id: &str,
            _params: &CommissionParams,
        ) -> crate::error::Result<Machine> {
            Err(Error::upstream(format!("cannot commission {system_id}")))
        }

        async fn release_machine(
            &self,
            system_id: &str,
            _params: &ReleaseParams,
        ) -> crate::error::Result<Machine> {
            Err(Error::upstream(format!("cannot release {system_id}")))
        }
    }

    fn service() -> McpService<EmptyApi> {
        let metrics = Arc::new(Metrics::new());
        let registry = OperationsRegistry::new(
            OperationsConfig::default(),
            Arc::clone(&metrics),
            AuditLog::noop(),
        );
        let notifier = ProgressNotifier::new(
            NotificationConfig::default(),
            Arc::new(RecordingSink::new()),
            Arc::clone(&metrics),
        );
        let tracker = OperationTracker::new(registry, notifier, Duration::from_secs(60));
        let handler = MaasBridgeHandler::new(
            Arc::new(EmptyApi),
            tracker,
            MonitorConfig::default(),
            AuditLog::noop(),
        );
        McpService::new(Arc::new(handler), metrics)
    }

    fn request(id: i64, method: &str, params: Option<serde_json::Value>) -> Request {
        Request {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_handle_initialize() -> Result<()> {
        let service = service();
        let response = service
            .handle_request(
                request(
                    1,
                    "initialize",
                    Some(json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "clientInfo": {"name": "test-client", "version": "1.0.0"}
                    })),
                ),
                None,
            )
            .await;

        assert!(response.error.is_none());
        let result: InitializeResult =
            serde_json::from_value(response.result.context("missing result")?)?;
        assert_eq!(result.server_info.name, "gantry");
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_without_params_is_invalid() -> Result<()> {
        let service = service();
        let response = service.handle_request(request(1, "initialize", None), None).await;
        let error = response.error.context("expected error")?;
        assert_eq!(error.code, INVALID_PARAMS);
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_ping() {
        let service = service();
        let response = service.handle_request(request(2, "ping", None), None).await;
        assert!(response.result.is_some());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_handle_tools_list() -> Result<()> {
        let service = service();
        let response = service.handle_request(request(3, "tools/list", None), None).await;
        let result: ListToolsResult =
            serde_json::from_value(response.result.context("missing result")?)?;
        assert!(result.tools.iter().any(|t| t.name == "deploy_machine"));
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_unknown_method() -> Result<()> {
        let service = service();
        let response = service
            .handle_request(request(4, "resources/list", None), None)
            .await;
        let error = response.error.context("expected error")?;
        assert_eq!(error.code, METHOD_NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_argument_problems_stay_in_band() -> Result<()> {
        let service = service();
        let response = service
            .handle_request(
                request(5, "tools/call", Some(json!({"name": "get_machine"}))),
                None,
            )
            .await;

        assert!(response.error.is_none(), "shape errors are tool results");
        let result: CallToolResult =
            serde_json::from_value(response.result.context("missing result")?)?;
        assert_eq!(result.is_error, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_execution_failure_maps_to_rpc_error() -> Result<()> {
        let service = service();
        let response = service
            .handle_request(
                request(
                    6,
                    "tools/call",
                    Some(json!({"name": "get_machine", "arguments": {"system_id": "nope"}})),
                ),
                None,
            )
            .await;

        let error = response.error.context("expected error")?;
        assert_eq!(error.code, RESOURCE_NOT_FOUND);
        assert!(error.message.contains("nope"));
        Ok(())
    }

    #[tokio::test]
    async fn test_error_metrics_count_rpc_failures() {
        let service = service();
        let before = service.metrics.rpc_errors.load(Ordering::Relaxed);
        let _response = service.handle_request(request(7, "nope", None), None).await;
        let after = service.metrics.rpc_errors.load(Ordering::Relaxed);
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_upstream_maps_to_operation_failed() {
        assert_eq!(error_code(&Error::upstream("boom")), OPERATION_FAILED);
    }
}
