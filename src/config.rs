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

//! Layered configuration: defaults, user config file, explicit file,
//! then `GANTRY_*` environment variables (nested keys use `__`, e.g.
//! `GANTRY_MAAS__ENDPOINT`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bridge::MonitorConfig;
use crate::ops::OperationsConfig;
use crate::progress::NotificationConfig;

/// Everything the server reads at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream MAAS region controller connection.
    #[serde(default)]
    pub maas: MaasConfig,

    /// Operation registry retention and timeouts.
    #[serde(default)]
    pub operations: OperationsConfig,

    /// Progress notification rate limiting.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Deployment/commissioning monitor loop.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Event stream tuning.
    #[serde(default)]
    pub sse: SseConfig,

    /// Append-only audit trail destination; auditing is disabled when unset.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

/// HTTP listener settings, `[server]` in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the HTTP transport binds, e.g. `127.0.0.1:8080`.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Upstream connection settings, `[maas]` in the config file.
///
/// Both fields are required to serve; they default to empty so the
/// effective configuration can be inspected before credentials exist.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MaasConfig {
    /// Region controller base URL, e.g. `http://10.0.0.2:5240/MAAS`.
    #[serde(default)]
    pub endpoint: String,

    /// API key in `consumer:token:secret` form. Never included in
    /// config dumps.
    #[serde(default, skip_serializing)]
    pub api_key: String,
}

/// Monitor loop settings, `[polling]` in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    /// Seconds between upstream status checks.
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    /// Status checks before monitoring gives up.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl PollingConfig {
    /// The monitor configuration these settings describe.
    #[must_use]
    pub const fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_polls: self.max_polls,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            max_polls: default_max_polls(),
        }
    }
}

/// Event stream settings, `[sse]` in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SseConfig {
    /// Seconds between heartbeat events on an otherwise idle stream.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    /// Events buffered per operation for slow stream readers.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl SseConfig {
    /// Heartbeat cadence as a duration.
    #[must_use]
    pub const fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_max_polls() -> u32 {
    60
}

const fn default_heartbeat_secs() -> u64 {
    15
}

const fn default_channel_capacity() -> usize {
    256
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a value has the
    /// wrong shape.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.listen", default_listen())?;

        // ~/.config/gantry/config.toml when present
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("gantry").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // Without an explicit prefix separator, config-rs would inherit the
        // nesting separator and demand `GANTRY__MAAS__ENDPOINT`.
        builder = builder.add_source(
            config::Environment::with_prefix("GANTRY")
                .prefix_separator("_")
                .separator("__"),
        );

        let config = builder.build().context("Failed to build configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for brevity"
)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.polling.interval_secs, 5);
        assert_eq!(config.polling.max_polls, 60);
        assert_eq!(config.sse.heartbeat_interval_secs, 15);
        assert!(config.maas.endpoint.is_empty());
        assert!(config.audit_log.is_none());
    }

    #[test]
    fn test_load_layered_file() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
[server]
listen = "0.0.0.0:9000"

[maas]
endpoint = "http://maas.example:5240/MAAS"
api_key = "consumer:token:secret"

[polling]
interval_secs = 2

[notifications]
min_interval_ms = 250
"#
        )?;

        let config = Config::load(Some(file.path().to_path_buf()))?;
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.maas.endpoint, "http://maas.example:5240/MAAS");
        assert_eq!(config.polling.interval_secs, 2);
        assert_eq!(config.polling.max_polls, 60, "unset keys keep defaults");
        assert_eq!(config.notifications.min_interval_ms, 250);
        Ok(())
    }

    #[test]
    fn test_monitor_conversion() {
        let polling = PollingConfig {
            interval_secs: 3,
            max_polls: 7,
        };
        let monitor = polling.monitor();
        assert_eq!(monitor.interval, Duration::from_secs(3));
        assert_eq!(monitor.max_polls, 7);
    }

    #[test]
    fn test_api_key_never_serialized() -> Result<()> {
        let config = Config {
            maas: MaasConfig {
                endpoint: "http://maas.example:5240/MAAS".to_string(),
                api_key: "consumer:token:secret".to_string(),
            },
            ..Config::default()
        };
        let dump = serde_json::to_string_pretty(&config)?;
        assert!(!dump.contains("secret"));
        assert!(dump.contains("endpoint"));
        Ok(())
    }
}
