// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

//! Gantry is a bridge between MCP (Model Context Protocol) and the MAAS machine API.
//!
//! It lets AI assistants drive bare-metal machine lifecycles (deploy, commission,
//! release) as tracked long-running operations with live progress delivery over
//! MCP notifications or server-sent events.

/// Cooperative cancellation signals and combinators.
pub mod abort;
/// Append-only audit trail for operations and tool calls.
pub mod audit;
/// Bridge logic between MCP tools and machine operations.
pub mod bridge;
/// Layered configuration handling.
pub mod config;
/// Crate-wide error and result types.
pub mod error;
/// MAAS API client and machine model.
pub mod maas;
/// MCP server implementation and type definitions.
pub mod mcp;
/// Process-wide counters behind the metrics endpoint.
pub mod metrics;
/// Registry and lifecycle tracking for long-running operations.
pub mod ops;
/// Rate-limited progress notification delivery.
pub mod progress;
/// Server-sent events transport for operation streams.
pub mod sse;
