// SPDX-License-Identifier: GPL-3.0-or-later

//! MAAS region controller integration.

/// The `MachineApi` seam and its data types.
mod api;
/// The production reqwest client.
mod client;

pub use api::{
    CommissionParams, DeployParams, Machine, MachineApi, MachineStatus, ReleaseParams,
};
pub use client::MaasClient;
