//! Configuration for the lifecycle manager.
//!
//! Everything is a plain serde structure loaded once at construction.
//! Environment handling and flag parsing stay in the binary; the core
//! only ever sees this object.

use crate::selector::{CostPreference, TierPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the management API listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Preference applied when a start request doesn't carry one.
    #[serde(default)]
    pub cost_preference: CostPreference,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub tiers: TierPolicy,
}

fn default_port() -> u16 {
    3000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            metrics_port: default_metrics_port(),
            cost_preference: CostPreference::default(),
            server: ServerConfig::default(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            tiers: TierPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// How the external serving process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command used to spawn the model server (default: "vllm").
    /// Overridable for testing with mock-vllm.
    #[serde(default = "default_serve_command")]
    pub serve_command: String,

    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// How long to wait for graceful exit before force-killing.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Extra arguments appended to the serve command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_serve_command() -> String {
    "vllm".to_string()
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    8000
}

fn default_stop_grace_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            serve_command: default_serve_command(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            stop_grace_secs: default_stop_grace_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Health monitoring cadence and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Give up on a server that never reports healthy after this long.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Poll interval while waiting for the first successful probe.
    #[serde(default = "default_starting_poll_ms")]
    pub starting_poll_ms: u64,

    /// Poll interval once the server has been healthy at least once.
    #[serde(default = "default_steady_poll_ms")]
    pub steady_poll_ms: u64,

    /// Per-probe timeout.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Consecutive failures before a healthy server is marked degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,

    /// Consecutive failures while degraded before giving up entirely.
    #[serde(default = "default_failed_after")]
    pub failed_after: u32,

    /// Automatic relaunch attempts after a failure.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_starting_poll_ms() -> u64 {
    2000
}

fn default_steady_poll_ms() -> u64 {
    5000
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_degraded_after() -> u32 {
    3
}

fn default_failed_after() -> u32 {
    5
}

fn default_max_restarts() -> u32 {
    1
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout_secs(),
            starting_poll_ms: default_starting_poll_ms(),
            steady_poll_ms: default_steady_poll_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            degraded_after: default_degraded_after(),
            failed_after: default_failed_after(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl HealthConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn starting_poll(&self) -> Duration {
        Duration::from_millis(self.starting_poll_ms)
    }

    pub fn steady_poll(&self) -> Duration {
        Duration::from_millis(self.steady_poll_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Request forwarding limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Upper bound on a single forwarded inference call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RoutingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.server.serve_command, "vllm");
        assert_eq!(config.server.bind_port, 8000);
        assert_eq!(config.health.degraded_after, 3);
        assert_eq!(config.health.failed_after, 5);
        assert_eq!(config.health.max_restarts, 1);
        assert_eq!(config.routing.request_timeout_secs, 30);
        assert_eq!(config.tiers.gpu_tiers.len(), 3);
    }

    #[test]
    fn parses_overrides() {
        let json = r#"{
            "port": 4000,
            "cost_preference": "quality_first",
            "server": {"serve_command": "mock-vllm", "bind_port": 9001},
            "health": {"startup_timeout_secs": 5, "starting_poll_ms": 100}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(
            config.cost_preference,
            crate::selector::CostPreference::QualityFirst
        );
        assert_eq!(config.server.serve_command, "mock-vllm");
        assert_eq!(config.health.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.health.starting_poll(), Duration::from_millis(100));
        // untouched sections keep their defaults
        assert_eq!(config.health.steady_poll(), Duration::from_millis(5000));
    }
}
