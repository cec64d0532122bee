//! Supervisor tunables. Everything has a default, so an empty JSON object
//! is a valid configuration.

use crate::openvpn::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Line the stock `openvpn` binary prints once the tunnel is up.
pub const DEFAULT_CONNECTED_MARKER: &str = "Initialization Sequence Completed";

/// Default `log` target for everything this crate emits.
pub const DEFAULT_LOG_TARGET: &str = "sorng_openvpn_supervisor";

/// Configuration for one `OpenVpnClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Binary name or path. Resolved once when the client is built.
    pub binary: PathBuf,
    /// Substring that marks a successfully established tunnel.
    pub connected_marker: String,

    // ── Event channel capacities ─────────────────────────────
    pub log_capacity: usize,
    pub status_capacity: usize,
    pub error_capacity: usize,

    // ── Timing ───────────────────────────────────────────────
    /// Pause between disconnect and connect in `reconnect`.
    pub reconnect_cooldown_ms: u64,
    /// Time between SIGTERM and the hard kill on cancellation.
    pub terminate_grace_ms: u64,
    /// How long the exit watcher waits for the readers after exit.
    pub drain_timeout_ms: u64,

    // ── Behaviour ────────────────────────────────────────────
    /// Terminate leftover instances of the binary before connecting.
    pub reap_stale_processes: bool,
    /// Where config / auth files are staged (system temp dir if unset).
    pub staging_dir: Option<PathBuf>,
    /// Cap on retained log lines; `None` keeps every line.
    pub log_buffer_limit: Option<usize>,
    /// `log` target used for diagnostics.
    pub log_target: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            connected_marker: DEFAULT_CONNECTED_MARKER.into(),
            log_capacity: 100,
            status_capacity: 10,
            error_capacity: 2,
            reconnect_cooldown_ms: 1_000,
            terminate_grace_ms: 3_000,
            drain_timeout_ms: 2_000,
            reap_stale_processes: true,
            staging_dir: None,
            log_buffer_limit: None,
            log_target: DEFAULT_LOG_TARGET.into(),
        }
    }
}

impl SupervisorConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, OpenVpnError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| {
            OpenVpnError::new(OpenVpnErrorKind::ParseError, "Invalid supervisor config")
                .with_detail(e.to_string())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), OpenVpnError> {
        let mut problems = Vec::new();
        if self.binary.as_os_str().is_empty() {
            problems.push("binary must not be empty");
        }
        if self.connected_marker.trim().is_empty() {
            problems.push("connected_marker must not be empty");
        }
        if self.log_capacity == 0 || self.status_capacity == 0 || self.error_capacity == 0 {
            problems.push("channel capacities must be at least 1");
        }
        if self.log_buffer_limit == Some(0) {
            problems.push("log_buffer_limit must be at least 1 when set");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(OpenVpnError::new(
                OpenVpnErrorKind::ConfigInvalid,
                "Supervisor config validation failed",
            )
            .with_detail(problems.join("; ")))
        }
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
