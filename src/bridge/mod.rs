// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

/// Maps MCP tool calls to machine operations.
mod handler;
/// Monitoring loops for deployments and commissioning runs.
mod pollers;

pub use handler::MaasBridgeHandler;
pub use pollers::MonitorConfig;
