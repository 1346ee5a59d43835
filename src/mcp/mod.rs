// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

/// HTTP transport: JSON-RPC endpoint, event stream, resources, health.
mod http;
/// Transport-independent JSON-RPC dispatch.
mod service;
/// stdio transport: line-delimited JSON-RPC.
mod stdio;
/// MCP type definitions and JSON-RPC messages.
pub mod types;

pub use http::{AppState, router};
pub use service::{McpService, PROTOCOL_VERSION};
pub use stdio::{StdioSink, serve as serve_stdio};
pub use types::ProgressToken;
