// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

//! Gantry MCP server and CLI.
//!
//! This is the main entry point for the Gantry machine-management bridge.
//! It serves MCP over HTTP (with an SSE stream for operation progress) or
//! over stdio, and can print the effective configuration.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]
#![allow(clippy::print_stderr, reason = "CLI tool needs to output to stderr")]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry_mcp::audit::{AuditKind, AuditLog};
use gantry_mcp::bridge::MaasBridgeHandler;
use gantry_mcp::config::Config;
use gantry_mcp::maas::MaasClient;
use gantry_mcp::mcp::{AppState, McpService, StdioSink, router, serve_stdio};
use gantry_mcp::metrics::Metrics;
use gantry_mcp::ops::{OperationTracker, OperationsRegistry};
use gantry_mcp::progress::{NotificationSink, ProgressNotifier};
use gantry_mcp::sse::{SseBroker, SseSink};

/// Command-line arguments for Gantry.
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(about = "Bridge between MCP and the MAAS machine lifecycle API")]
#[command(version = env!("GANTRY_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP listener to, e.g. "0.0.0.0:8080".
    /// Overrides the config file if set.
    #[arg(short, long, global = true)]
    listen: Option<String>,
}

/// Subcommands supported by Gantry.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP bridge server (default if no subcommand given).
    Serve {
        /// Serve MCP over stdio instead of HTTP.
        #[arg(long)]
        stdio: bool,
    },

    /// Print the effective configuration as JSON and exit.
    Config,
}

/// Entry point for the Gantry binary.
///
/// # Errors
///
/// Returns an error if the subcommand fails.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        None => run_server(args, false).await,
        Some(Command::Serve { stdio }) => run_server(args, stdio).await,
        Some(Command::Config) => run_config(args),
    }
}

/// Prints the effective configuration after all layers are applied.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or serialized.
fn run_config(args: Args) -> Result<()> {
    let mut config = Config::load(args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Runs the MCP bridge server.
///
/// # Errors
///
/// Returns an error if the server fails to start or encounters an internal
/// error.
async fn run_server(args: Args, stdio: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gantry=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.clone())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    info!("Starting gantry machine-management bridge");
    info!("MAAS endpoint: {}", config.maas.endpoint);

    let metrics = Arc::new(Metrics::new());

    let audit = match &config.audit_log {
        Some(path) => {
            info!("Audit trail: {}", path.display());
            AuditLog::to_file(path)?
        }
        None => AuditLog::noop(),
    };
    audit.record(AuditKind::Started);

    let registry =
        OperationsRegistry::new(config.operations.clone(), metrics.clone(), audit.clone());
    let sweeper = registry.spawn_sweeper();

    let api = Arc::new(MaasClient::new(&config.maas.endpoint, &config.maas.api_key)?);

    let result = if stdio {
        run_stdio(&config, api, registry, audit.clone(), metrics).await
    } else {
        run_http(&config, api, registry, audit.clone(), metrics).await
    };

    sweeper.abort();
    let _ = sweeper.await;

    audit.record(AuditKind::Shutdown);
    info!("Shutting down");

    result
}

/// Assembles the tracked-operation stack behind an MCP service.
fn build_service(
    config: &Config,
    api: Arc<MaasClient>,
    registry: OperationsRegistry,
    sink: Arc<dyn NotificationSink>,
    audit: AuditLog,
    metrics: Arc<Metrics>,
) -> McpService<MaasClient> {
    let notifier = ProgressNotifier::new(config.notifications.clone(), sink, metrics.clone());
    let tracker = OperationTracker::new(registry, notifier, config.operations.default_timeout());
    let handler = MaasBridgeHandler::new(api, tracker, config.polling.monitor(), audit);
    McpService::new(Arc::new(handler), metrics)
}

/// Serves MCP over HTTP with an SSE stream for operation progress.
async fn run_http(
    config: &Config,
    api: Arc<MaasClient>,
    registry: OperationsRegistry,
    audit: AuditLog,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let broker = SseBroker::new(config.sse.channel_capacity, metrics.clone());
    let sink = Arc::new(SseSink::new(broker.clone(), registry.clone()));
    let service = build_service(
        config,
        api.clone(),
        registry.clone(),
        sink,
        audit,
        metrics.clone(),
    );
    let state = AppState::new(
        service,
        registry,
        broker,
        api,
        metrics,
        config.sse.heartbeat(),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")
}

/// Serves MCP over stdio, one JSON-RPC message per line.
async fn run_stdio(
    config: &Config,
    api: Arc<MaasClient>,
    registry: OperationsRegistry,
    audit: AuditLog,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let (sink, outbound, receiver) = StdioSink::channel();
    let service = build_service(config, api, registry, Arc::new(sink), audit, metrics);

    info!("Serving MCP on stdio");

    tokio::select! {
        res = serve_stdio(service, outbound, receiver) => Ok(res?),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}

/// Completes when a shutdown signal arrives.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received shutdown signal");
    } else {
        error!("Failed to listen for shutdown signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults_to_http() {
        let args = Args::parse_from(["gantry", "serve"]);
        assert!(matches!(args.command, Some(Command::Serve { stdio: false })));
    }

    #[test]
    fn test_serve_stdio_flag_parses() {
        let args = Args::parse_from(["gantry", "serve", "--stdio"]);
        assert!(matches!(args.command, Some(Command::Serve { stdio: true })));
    }

    #[test]
    fn test_listen_is_global() {
        let args = Args::parse_from(["gantry", "serve", "--listen", "0.0.0.0:9000"]);
        assert_eq!(args.listen.as_deref(), Some("0.0.0.0:9000"));
    }
}
