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

//! stdio transport: line-delimited JSON-RPC on stdin/stdout.
//!
//! Requests are handled concurrently, each on its own task, so one
//! long-running deployment does not block the next request. A single
//! writer task owns stdout; responses and progress notifications are
//! funneled through one channel so output lines never interleave.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use crate::error::{Error, Result};
use crate::maas::MachineApi;
use crate::mcp::service::McpService;
use crate::mcp::types::{Notification, PARSE_ERROR, ProgressParams, Request, Response};
use crate::progress::{NotificationSink, ProgressNotification};

/// Notification sink that writes `notifications/progress` lines to the
/// shared stdout channel.
pub struct StdioSink {
    outbound: mpsc::UnboundedSender<String>,
}

impl StdioSink {
    /// Creates the sink together with both ends of the outbound channel.
    ///
    /// The sender goes to [`serve`] for responses; the receiver feeds
    /// the stdout writer task.
    #[must_use]
    pub fn channel() -> (
        Self,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { outbound: tx.clone() }, tx, rx)
    }
}

impl NotificationSink for StdioSink {
    fn deliver(&self, notification: &ProgressNotification) -> Result<()> {
        let message = Notification::progress(&ProgressParams {
            progress_token: notification.token.clone(),
            progress: notification.progress,
            total: Some(notification.total),
            message: Some(notification.message.clone()),
        })?;
        let text = serde_json::to_string(&message)?;
        self.outbound
            .send(text)
            .map_err(|_| Error::Internal(anyhow::anyhow!("stdout writer closed")))?;
        Ok(())
    }
}

/// Reads requests from stdin until EOF, writing responses through the
/// outbound channel.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn serve<M: MachineApi>(
    service: McpService<M>,
    outbound: mpsc::UnboundedSender<String>,
    receiver: mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    info!("MCP server listening on stdio");
    let _writer = tokio::spawn(write_outbound(receiver));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        trace!("Received: {}", line);

        let service = service.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            handle_line(&service, &line, &outbound).await;
        });
    }

    info!("stdin closed, stdio transport shutting down");
    Ok(())
}

async fn handle_line<M: MachineApi>(
    service: &McpService<M>,
    line: &str,
    outbound: &mpsc::UnboundedSender<String>,
) {
    if let Ok(request) = serde_json::from_str::<Request>(line) {
        let response = service.handle_request(request, None).await;
        send_response(outbound, &response);
        return;
    }

    if let Ok(notification) = serde_json::from_str::<Notification>(line) {
        service.handle_notification(&notification);
        return;
    }

    warn!("Discarding unparseable message");
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": PARSE_ERROR, "message": "Invalid JSON-RPC message"},
    });
    if outbound.send(body.to_string()).is_err() {
        error!("stdout writer is gone, dropping parse error response");
    }
}

fn send_response(outbound: &mpsc::UnboundedSender<String>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(text) => {
            if outbound.send(text).is_err() {
                error!("stdout writer is gone, dropping response");
            }
        }
        Err(e) => error!("Failed to serialize response: {e}"),
    }
}

async fn write_outbound(mut receiver: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = receiver.recv().await {
        trace!("Sending: {}", line);
        if let Err(e) = write_line(&mut stdout, &line).await {
            error!("Failed to write to stdout: {e}");
            break;
        }
    }
}

async fn write_line(stdout: &mut Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
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
    use crate::mcp::types::ProgressToken;
    use crate::metrics::Metrics;
    use crate::ops::{OperationTracker, OperationsConfig, OperationsRegistry};
    use crate::progress::{NotificationConfig, ProgressNotifier, RecordingSink};
    use anyhow::Result;
    use serde_json::Value;
    use std::sync::Arc;
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

    #[tokio::test]
    async fn test_request_line_produces_response_line() -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_line(
            &service(),
            r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#,
            &tx,
        )
        .await;

        let line = rx.try_recv()?;
        let response: Value = serde_json::from_str(&line)?;
        assert_eq!(response["id"], 7);
        assert!(response.get("error").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_notification_line_produces_no_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_line(
            &service(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            &tx,
        )
        .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_garbage_line_produces_parse_error() -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_line(&service(), "{definitely not json", &tx).await;

        let line = rx.try_recv()?;
        let response: Value = serde_json::from_str(&line)?;
        assert_eq!(response["error"]["code"], PARSE_ERROR);
        assert!(response["id"].is_null());
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_emits_progress_notification_line() -> Result<()> {
        let (sink, _tx, mut rx) = StdioSink::channel();
        sink.deliver(&ProgressNotification {
            token: ProgressToken::from("deploy-1"),
            progress: 35.0,
            total: 100.0,
            message: "Machine abc123 status: DEPLOYING".to_string(),
            important: false,
        })?;

        let line = rx.try_recv()?;
        let notification: Value = serde_json::from_str(&line)?;
        assert_eq!(notification["method"], "notifications/progress");
        assert_eq!(notification["params"]["progressToken"], "deploy-1");
        assert_eq!(notification["params"]["progress"], 35.0);
        assert_eq!(notification["params"]["total"], 100.0);
        Ok(())
    }
}
