// SPDX-License-Identifier: GPL-3.0-or-later

//! The machine-management API surface the bridge is built against.
//!
//! `MachineApi` is the seam between tool handlers and the upstream MAAS
//! region controller. Production uses the reqwest client; tests swap in
//! scripted fakes.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One machine as reported by the region controller.
///
/// Field names follow the upstream JSON; absent fields deserialize to
/// their defaults so older controllers still parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Stable machine identifier, e.g. `4y3h7n`.
    pub system_id: String,
    /// DNS hostname.
    #[serde(default)]
    pub hostname: String,
    /// Architecture string, e.g. `amd64/generic`.
    #[serde(default)]
    pub architecture: String,
    /// Number of CPU cores.
    #[serde(default)]
    pub cpu_count: u32,
    /// RAM in MiB.
    #[serde(default)]
    pub memory: u64,
    /// Lifecycle state as spelled by the controller, e.g. `Deploying`.
    #[serde(default)]
    pub status_name: String,
    /// Power state, e.g. `on` / `off`.
    #[serde(default)]
    pub power_state: String,
    /// Operating system, e.g. `ubuntu`.
    #[serde(default)]
    pub osystem: String,
    /// OS release, e.g. `noble`.
    #[serde(default)]
    pub distro_series: String,
    /// Addresses currently assigned to the machine.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    /// Tags attached to the machine.
    #[serde(default)]
    pub tag_names: Vec<String>,
}

impl Machine {
    /// The machine's lifecycle state, parsed from `status_name`.
    #[must_use]
    pub fn status(&self) -> MachineStatus {
        self.status_name.parse().unwrap_or_else(|_| {
            MachineStatus::Other(self.status_name.trim().to_uppercase())
        })
    }
}

/// Machine lifecycle states the pollers act on.
///
/// The controller spells these with spaces (`Failed deployment`);
/// parsing normalizes case and separators, and anything unrecognized
/// lands in `Other` rather than failing the poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineStatus {
    /// Newly enlisted, not yet commissioned.
    New,
    /// Hardware discovery in progress.
    Commissioning,
    /// Commissioning ended in failure.
    FailedCommissioning,
    /// Hardware tests running.
    Testing,
    /// Hardware tests ended in failure.
    FailedTesting,
    /// Commissioned and available for allocation.
    Ready,
    /// Reserved for a user, not yet deployed.
    Allocated,
    /// OS installation in progress.
    Deploying,
    /// OS installed and booted.
    Deployed,
    /// Deployment ended in failure.
    FailedDeployment,
    /// Returning to the pool.
    Releasing,
    /// Release ended in failure.
    FailedReleasing,
    /// Marked broken by an operator.
    Broken,
    /// Any state this build does not recognize, normalized form.
    Other(String),
}

impl MachineStatus {
    /// Whether this state represents a failed operation.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FailedCommissioning
                | Self::FailedTesting
                | Self::FailedDeployment
                | Self::FailedReleasing
                | Self::Broken
        )
    }

    /// The normalized spelling, e.g. `FAILED_DEPLOYMENT`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "NEW",
            Self::Commissioning => "COMMISSIONING",
            Self::FailedCommissioning => "FAILED_COMMISSIONING",
            Self::Testing => "TESTING",
            Self::FailedTesting => "FAILED_TESTING",
            Self::Ready => "READY",
            Self::Allocated => "ALLOCATED",
            Self::Deploying => "DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::FailedDeployment => "FAILED_DEPLOYMENT",
            Self::Releasing => "RELEASING",
            Self::FailedReleasing => "FAILED_RELEASING",
            Self::Broken => "BROKEN",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace([' ', '-'], "_");
        Ok(match normalized.as_str() {
            "NEW" => Self::New,
            "COMMISSIONING" => Self::Commissioning,
            "FAILED_COMMISSIONING" => Self::FailedCommissioning,
            "TESTING" => Self::Testing,
            "FAILED_TESTING" => Self::FailedTesting,
            "READY" => Self::Ready,
            "ALLOCATED" => Self::Allocated,
            "DEPLOYING" => Self::Deploying,
            "DEPLOYED" => Self::Deployed,
            "FAILED_DEPLOYMENT" => Self::FailedDeployment,
            "RELEASING" => Self::Releasing,
            "FAILED_RELEASING" => Self::FailedReleasing,
            "BROKEN" => Self::Broken,
            _ => Self::Other(normalized),
        })
    }
}

/// Options for starting a deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployParams {
    /// OS release to install; controller default when absent.
    #[serde(default)]
    pub distro_series: Option<String>,
    /// Kernel to boot, e.g. `hwe-24.04`.
    #[serde(default)]
    pub hwe_kernel: Option<String>,
    /// Base64-encoded cloud-init user data.
    #[serde(default)]
    pub user_data: Option<String>,
}

/// Options for starting commissioning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommissionParams {
    /// Leave the machine SSH-accessible afterwards.
    #[serde(default)]
    pub enable_ssh: bool,
    /// Keep the current network configuration.
    #[serde(default)]
    pub skip_networking: bool,
    /// Keep the current storage configuration.
    #[serde(default)]
    pub skip_storage: bool,
}

/// Options for releasing a machine back to the pool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseParams {
    /// Note recorded in the machine's event log.
    #[serde(default)]
    pub comment: Option<String>,
    /// Wipe disks before releasing.
    #[serde(default)]
    pub erase: bool,
}

/// Upstream machine operations the bridge depends on.
///
/// Start operations return the machine record as it stands right after
/// the request is accepted; callers poll `machine_status` afterwards.
pub trait MachineApi: Send + Sync + 'static {
    /// Lists every machine visible to the configured credentials.
    fn list_machines(&self) -> impl Future<Output = Result<Vec<Machine>>> + Send;

    /// Fetches one machine by system id.
    fn get_machine(&self, system_id: &str) -> impl Future<Output = Result<Machine>> + Send;

    /// Fetches just the lifecycle state of one machine.
    fn machine_status(
        &self,
        system_id: &str,
    ) -> impl Future<Output = Result<MachineStatus>> + Send;

    /// Starts deploying an OS onto the machine.
    fn deploy_machine(
        &self,
        system_id: &str,
        params: &DeployParams,
    ) -> impl Future<Output = Result<Machine>> + Send;

    /// Starts commissioning the machine.
    fn commission_machine(
        &self,
        system_id: &str,
        params: &CommissionParams,
    ) -> impl Future<Output = Result<Machine>> + Send;

    /// Releases the machine back to the pool.
    fn release_machine(
        &self,
        system_id: &str,
        params: &ReleaseParams,
    ) -> impl Future<Output = Result<Machine>> + Send;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_status_parses_controller_spellings() {
        assert_eq!(
            "Failed deployment".parse::<MachineStatus>().unwrap(),
            MachineStatus::FailedDeployment
        );
        assert_eq!(
            "DEPLOYED".parse::<MachineStatus>().unwrap(),
            MachineStatus::Deployed
        );
        assert_eq!(
            "commissioning".parse::<MachineStatus>().unwrap(),
            MachineStatus::Commissioning
        );
        assert_eq!(
            "Rescue mode".parse::<MachineStatus>().unwrap(),
            MachineStatus::Other("RESCUE_MODE".to_string())
        );
    }

    #[test]
    fn test_status_failure_classification() {
        assert!(MachineStatus::FailedDeployment.is_failure());
        assert!(MachineStatus::Broken.is_failure());
        assert!(!MachineStatus::Deploying.is_failure());
        assert!(!MachineStatus::Deployed.is_failure());
        assert!(!MachineStatus::Other("RESCUE_MODE".to_string()).is_failure());
    }

    #[test]
    fn test_status_display_round_trips() {
        for status in [
            MachineStatus::Ready,
            MachineStatus::FailedCommissioning,
            MachineStatus::Deploying,
        ] {
            assert_eq!(status.as_str().parse::<MachineStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_machine_deserializes_from_controller_json() -> Result<()> {
        let machine: Machine = serde_json::from_str(
            r#"{
                "system_id": "4y3h7n",
                "hostname": "rack-03",
                "architecture": "amd64/generic",
                "cpu_count": 16,
                "memory": 65536,
                "status_name": "Deploying",
                "power_state": "on",
                "osystem": "ubuntu",
                "distro_series": "noble",
                "ip_addresses": ["10.0.0.17"],
                "tag_names": ["gpu"],
                "unrelated_field": {"ignored": true}
            }"#,
        )?;
        assert_eq!(machine.system_id, "4y3h7n");
        assert_eq!(machine.status(), MachineStatus::Deploying);
        assert_eq!(machine.memory, 65536);
        assert_eq!(machine.tag_names, vec!["gpu"]);
        Ok(())
    }

    #[test]
    fn test_machine_tolerates_sparse_json() -> Result<()> {
        let machine: Machine = serde_json::from_str(r#"{"system_id": "abc123"}"#)?;
        assert!(machine.hostname.is_empty());
        assert_eq!(machine.status(), MachineStatus::Other(String::new()));
        Ok(())
    }
}
