// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

//! Server-Sent Events transport for watching long-running operations.

/// Per-operation fan-out and the notification sink feeding it.
mod broker;
/// Typed wire events and SSE framing.
mod event;

pub use broker::{SseBroker, SseSink};
pub(crate) use broker::snapshot_event;
pub use event::{
    CompletionEvent, ErrorEvent, HeartbeatEvent, LogEvent, ProgressEvent, SseEvent, StatusEvent,
    WireStatus,
};
