// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Gantry contributors

/// The operation record and its query/update types.
mod operation;
/// Shared registry of tracked operations plus the background sweeper.
mod registry;
/// Envelope running tool work as tracked, cancellable operations.
mod tracker;

pub use operation::{
    OperationQuery, OperationSnapshot, OperationStatus, OperationUpdate, RegisterOptions,
};
pub use registry::{OperationsConfig, OperationsRegistry, SweepStats};
pub use tracker::{OperationContext, OperationTracker, TrackOptions};
