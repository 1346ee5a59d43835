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

//! HTTP transport: JSON-RPC over `POST /mcp` plus the event stream.
//!
//! Protocol and tool errors travel as JSON-RPC error objects inside an
//! HTTP 200; non-200 statuses are reserved for transport-level problems
//! (unparseable body, missing query parameter, unknown route). The
//! stream endpoint writes raw SSE frames and closes after the watched
//! operation reaches a terminal state.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response as HttpResponse};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::error::{Error, Result};
use crate::maas::MachineApi;
use crate::mcp::service::McpService;
use crate::mcp::types::{
    INTERNAL_ERROR, Notification, PARSE_ERROR, ProgressToken, Request, ResourceContents,
    ResourceParams, ResourceResult, Response,
};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::ops::OperationsRegistry;
use crate::sse::{HeartbeatEvent, SseBroker, SseEvent, snapshot_event};

/// Shared state behind every HTTP route.
pub struct AppState<M> {
    service: McpService<M>,
    registry: OperationsRegistry,
    broker: SseBroker,
    api: Arc<M>,
    metrics: Arc<Metrics>,
    heartbeat: Duration,
}

impl<M> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            api: Arc::clone(&self.api),
            metrics: Arc::clone(&self.metrics),
            heartbeat: self.heartbeat,
        }
    }
}

impl<M: MachineApi> AppState<M> {
    /// Bundles the pieces every route needs.
    pub const fn new(
        service: McpService<M>,
        registry: OperationsRegistry,
        broker: SseBroker,
        api: Arc<M>,
        metrics: Arc<Metrics>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            service,
            registry,
            broker,
            api,
            metrics,
            heartbeat,
        }
    }
}

/// Builds the router serving the MCP surface.
pub fn router<M: MachineApi>(state: AppState<M>) -> Router {
    Router::new()
        .route("/mcp", post(rpc))
        .route("/mcp/stream", get(stream))
        .route("/mcp/resource", post(resource))
        .route("/mcp/healthz", get(healthz))
        .route("/mcp/metrics", get(metrics))
        .with_state(state)
}

async fn rpc<M: MachineApi>(State(state): State<AppState<M>>, body: Bytes) -> HttpResponse {
    if let Ok(request) = serde_json::from_slice::<Request>(&body) {
        let response = dispatch_tracked(state, request).await;
        return Json(response).into_response();
    }

    if let Ok(notification) = serde_json::from_slice::<Notification>(&body) {
        state.service.handle_notification(&notification);
        return StatusCode::ACCEPTED.into_response();
    }

    state.metrics.rpc_errors.fetch_add(1, Ordering::Relaxed);
    Json(json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": PARSE_ERROR, "message": "Invalid JSON-RPC message"},
    }))
    .into_response()
}

/// Runs the request on its own task so a dropped connection cancels the
/// work through the abort signal instead of tearing it down mid-await.
async fn dispatch_tracked<M: MachineApi>(state: AppState<M>, request: Request) -> Response {
    let id = request.id.clone();
    let parent = AbortSignal::new();
    let mut guard = DisconnectGuard::new(parent.clone());

    let service = state.service.clone();
    let task = tokio::spawn(async move { service.handle_request(request, Some(parent)).await });
    let joined = task.await;
    guard.disarm();

    joined.unwrap_or_else(|e| {
        Response::error(id, INTERNAL_ERROR, format!("Request task failed: {e}"))
    })
}

/// Aborts the in-flight request if the HTTP future is dropped before
/// the response is ready.
struct DisconnectGuard {
    signal: AbortSignal,
    armed: bool,
}

impl DisconnectGuard {
    const fn new(signal: AbortSignal) -> Self {
        Self {
            signal,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.signal.abort("client disconnected");
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    operation_id: String,
}

async fn stream<M: MachineApi>(
    State(state): State<AppState<M>>,
    Query(query): Query<StreamQuery>,
) -> HttpResponse {
    let operation_id = query.operation_id;
    if operation_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "operation_id is required").into_response();
    }

    debug!("Stream opened for operation {}", operation_id);
    let receiver = state.broker.subscribe(&operation_id);
    let snapshot = state.registry.get(&ProgressToken::parse(&operation_id));
    let broker = state.broker.clone();
    let heartbeat = state.heartbeat;

    let body = async_stream::stream! {
        let _guard = StreamGuard {
            broker,
            operation_id: operation_id.clone(),
        };
        // Rebound after the guard so the receiver is dropped first and
        // the guard's release can collect an unwatched channel.
        let mut receiver = receiver;

        if let Some(snapshot) = snapshot {
            let event = snapshot_event(&snapshot);
            let terminal = event.is_terminal();
            if let Ok(block) = event.to_wire() {
                yield frame(block);
            }
            if terminal {
                debug!("Operation {} already finished, replayed and closing", operation_id);
                return;
            }
        }

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut sequence: u64 = 0;

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        match event.to_wire() {
                            Ok(block) => yield frame(block),
                            Err(e) => warn!("Dropping unserializable stream event: {e}"),
                        }
                        if terminal {
                            debug!("Operation {} reached terminal state, closing stream", operation_id);
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Stream for {} lagged, {} events dropped", operation_id, missed);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    sequence += 1;
                    let event = SseEvent::from(HeartbeatEvent::new(operation_id.clone(), sequence));
                    match event.to_wire() {
                        Ok(block) => yield frame(block),
                        Err(e) => warn!("Dropping unserializable heartbeat: {e}"),
                    }
                }
            }
        }
    };

    sse_response(Body::from_stream(body))
}

/// Releases the broker channel when the stream ends or the client
/// disconnects mid-stream.
struct StreamGuard {
    broker: SseBroker,
    operation_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.broker.release(&self.operation_id);
    }
}

fn frame(block: String) -> Result<Bytes, Infallible> {
    Ok(Bytes::from(block))
}

fn sse_response(body: Body) -> HttpResponse {
    let built = axum::http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .header(header::TRANSFER_ENCODING, "chunked")
        .header("X-Accel-Buffering", "no")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body);
    built.unwrap_or_else(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to build stream response: {e}"),
        )
            .into_response()
    })
}

async fn resource<M: MachineApi>(
    State(state): State<AppState<M>>,
    Json(params): Json<ResourceParams>,
) -> HttpResponse {
    match fetch_resource(&state, &params.uri).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            let status = match &e {
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::Validation(_) => StatusCode::BAD_REQUEST,
                Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
                Error::Aborted(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn fetch_resource<M: MachineApi>(state: &AppState<M>, uri: &str) -> Result<ResourceResult> {
    let text = if let Some(system_id) = uri.strip_prefix("maas://machine/") {
        let machine = state.api.get_machine(system_id).await?;
        serde_json::to_string_pretty(&machine)?
    } else if let Some(token) = uri.strip_prefix("maas://operation/") {
        let snapshot = state
            .registry
            .get(&ProgressToken::parse(token))
            .ok_or_else(|| Error::not_found(format!("operation {token}")))?;
        serde_json::to_string_pretty(&snapshot)?
    } else {
        return Err(Error::validation(format!("Unsupported resource URI: {uri}")));
    };

    Ok(ResourceResult {
        contents: vec![ResourceContents {
            uri: uri.to_string(),
            mime_type: "application/json".to_string(),
            text,
        }],
    })
}

async fn healthz<M: MachineApi>(State(state): State<AppState<M>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.metrics.uptime_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics<M: MachineApi>(State(state): State<AppState<M>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
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
    use crate::bridge::{MaasBridgeHandler, MonitorConfig};
    use crate::maas::{CommissionParams, DeployParams, Machine, MachineStatus, ReleaseParams};
    use crate::ops::{
        OperationStatus, OperationTracker, OperationUpdate, OperationsConfig, RegisterOptions,
    };
    use crate::progress::{NotificationConfig, ProgressNotifier};
    use crate::sse::SseSink;
    use anyhow::{Context, Result};

    struct EmptyApi;

    impl MachineApi for EmptyApi {
        async fn list_machines(&self) -> crate::error::Result<Vec<Machine>> {
            Ok(vec![])
        }

        async fn get_machine(&self, system_id: &str) -> crate::error::Result<Machine> {
            Err(crate::error::Error::not_found(format!(
                "machine {system_id}"
            )))
        }

        async fn machine_status(&self, system_id: &str) -> crate::error::Result<MachineStatus> {
            Err(crate::error::Error::not_found(format!(
                "machine {system_id}"
            )))
        }

        async fn deploy_machine(
            &self,
            system_id: &str,
            _params: &DeployParams,
        ) -> crate::error::Result<Machine> {
            Err(crate::error::Error::upstream(format!(
                "cannot deploy {system_id}"
            )))
        }

        async fn commission_machine(
            &self,
            system_id: &str,
            _params: &CommissionParams,
        ) -> crate::error::Result<Machine> {
            Err(crate::error::Error::upstream(format!(
                "cannot commission {system_id}"
            )))
        }

        async fn release_machine(
            &self,
            system_id: &str,
            _params: &ReleaseParams,
        ) -> crate::error::Result<Machine> {
            Err(crate::error::Error::upstream(format!(
                "cannot release {system_id}"
            )))
        }
    }

    fn state() -> AppState<EmptyApi> {
        let metrics = Arc::new(Metrics::new());
        let registry = OperationsRegistry::new(
            OperationsConfig::default(),
            Arc::clone(&metrics),
            AuditLog::noop(),
        );
        let broker = SseBroker::new(16, Arc::clone(&metrics));
        let sink = Arc::new(SseSink::new(broker.clone(), registry.clone()));
        let notifier =
            ProgressNotifier::new(NotificationConfig::default(), sink, Arc::clone(&metrics));
        let tracker = OperationTracker::new(
            registry.clone(),
            notifier,
            Duration::from_secs(60),
        );
        let handler = MaasBridgeHandler::new(
            Arc::new(EmptyApi),
            tracker,
            MonitorConfig::default(),
            AuditLog::noop(),
        );
        let service = McpService::new(Arc::new(handler), Arc::clone(&metrics));
        AppState::new(
            service,
            registry,
            broker,
            Arc::new(EmptyApi),
            metrics,
            Duration::from_secs(15),
        )
    }

    async fn body_json(response: HttpResponse) -> Result<Value> {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn test_unparseable_body_is_parse_error() -> Result<()> {
        let response = rpc(State(state()), Bytes::from_static(b"{nope")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await?;
        assert_eq!(json["error"]["code"], PARSE_ERROR);
        assert!(json["id"].is_null());
        Ok(())
    }

    #[tokio::test]
    async fn test_notification_is_accepted_without_body() {
        let body = Bytes::from_static(
            br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        );
        let response = rpc(State(state()), body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_rpc_ping_round_trip() -> Result<()> {
        let body = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        let response = rpc(State(state()), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await?;
        assert_eq!(json["id"], 1);
        assert!(json.get("error").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_sse_response_headers() {
        let response = sse_response(Body::empty());
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(b"text/event-stream; charset=utf-8".as_slice())
        );
        assert_eq!(
            headers.get(header::CACHE_CONTROL).map(|v| v.as_bytes()),
            Some(b"no-cache, no-transform".as_slice())
        );
        assert_eq!(
            headers.get("X-Accel-Buffering").map(|v| v.as_bytes()),
            Some(b"no".as_slice())
        );
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .map(|v| v.as_bytes()),
            Some(b"*".as_slice())
        );
    }

    #[tokio::test]
    async fn test_fetch_resource_rejects_unknown_scheme() {
        let state = state();
        let result = fetch_resource(&state, "file:///etc/passwd").await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_fetch_resource_returns_operation_snapshot() -> Result<()> {
        let state = state();
        let token = ProgressToken::from("op-http");
        state
            .registry
            .register(token, "deploy_machine", RegisterOptions::default());
        state.registry.update(
            &ProgressToken::from("op-http"),
            OperationUpdate {
                status: Some(OperationStatus::Completed),
                ..OperationUpdate::default()
            },
        );

        let result = fetch_resource(&state, "maas://operation/op-http").await?;
        let contents = result.contents.first().context("no contents")?;
        assert_eq!(contents.mime_type, "application/json");
        assert!(contents.text.contains("deploy_machine"));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_resource_missing_operation_is_not_found() {
        let state = state();
        let result = fetch_resource(&state, "maas://operation/ghost").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_healthz_shape() -> Result<()> {
        let response = healthz(State(state())).await;
        let json = serde_json::to_value(response.0)?;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        Ok(())
    }
}
