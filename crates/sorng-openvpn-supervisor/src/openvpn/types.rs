//! Shared types, enums, error types, and event payloads for the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Status of the supervised tunnel as observed from process output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Process launched, tunnel not yet established.
    Initializing,
    /// The binary reported the tunnel as established.
    Connected,
    /// Session ended cleanly or was stopped by the caller.
    Disconnected,
    /// Process exited with a failure.
    Error,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionStatus {
    /// Disconnected and Error end a session; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Supervisor state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of the supervised process (as opposed to the tunnel status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error causes (classified from output)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reason for a connection failure, derived from the binary's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorCause {
    AuthFailure,
    TlsHandshakeFailure,
    DnsFailure,
    /// Transport-level timeout inside the tunnel setup.
    TunnelTimeout,
    NoRouteToHost,
    InactivityTimeout,
    PortInUse,
    GenericTlsError,
    /// Nothing specific matched; carries the raw line (or exit detail).
    GenericFailure { raw_line: String },
}

impl ErrorCause {
    pub fn generic(raw_line: impl Into<String>) -> Self {
        Self::GenericFailure {
            raw_line: raw_line.into(),
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFailure => write!(f, "authentication failed"),
            Self::TlsHandshakeFailure => write!(f, "TLS handshake failed"),
            Self::DnsFailure => write!(f, "cannot resolve server address"),
            Self::TunnelTimeout => write!(f, "connection timed out"),
            Self::NoRouteToHost => write!(f, "no route to host"),
            Self::InactivityTimeout => write!(f, "inactivity timeout"),
            Self::PortInUse => write!(f, "address already in use"),
            Self::GenericTlsError => write!(f, "TLS error"),
            Self::GenericFailure { raw_line } => write!(f, "{}", raw_line),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Event payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which pipe of the child a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub session_id: String,
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when the connection status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub session_id: String,
    pub old_status: ConnectionStatus,
    pub new_status: ConnectionStatus,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when the process exits with a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub session_id: String,
    pub cause: ErrorCause,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crate-level error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenVpnErrorKind {
    BinaryNotFound,
    AlreadyRunning,
    StagingFailed,
    ZombieProcess,
    SpawnFailed,
    ConnectionFailed,
    Timeout,
    DisconnectFailed,
    ConfigInvalid,
    IoError,
    ParseError,
}

/// Crate-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVpnError {
    pub kind: OpenVpnErrorKind,
    pub message: String,
    pub detail: Option<String>,
    /// Classified cause, set for `ConnectionFailed`.
    pub cause: Option<ErrorCause>,
}

impl fmt::Display for OpenVpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(c) = &self.cause {
            write!(f, ": {}", c)?;
        }
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for OpenVpnError {}

impl OpenVpnError {
    pub fn new(kind: OpenVpnErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
            cause: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn connection_failed(cause: ErrorCause) -> Self {
        Self {
            kind: OpenVpnErrorKind::ConnectionFailed,
            message: "OpenVPN connection failed".into(),
            detail: None,
            cause: Some(cause),
        }
    }

    pub fn already_running() -> Self {
        Self::new(
            OpenVpnErrorKind::AlreadyRunning,
            "OpenVPN client is already running",
        )
    }

    pub fn timeout() -> Self {
        Self::new(
            OpenVpnErrorKind::Timeout,
            "Connection timed out or was cancelled",
        )
    }

    pub fn is(&self, kind: OpenVpnErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<OpenVpnError> for String {
    fn from(e: OpenVpnError) -> String {
        e.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Binary location helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known OpenVPN binary paths by platform.
pub fn default_binary_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\Program Files\OpenVPN\bin\openvpn.exe"));
        paths.push(PathBuf::from(
            r"C:\Program Files (x86)\OpenVPN\bin\openvpn.exe",
        ));
    }
    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
        paths.push(PathBuf::from("/opt/homebrew/sbin/openvpn"));
    }
    paths
}

/// Resolve the configured binary to an executable path.
///
/// Names and paths go through `PATH` lookup first. The stock `openvpn`
/// name additionally falls back to the platform install locations,
/// since `sbin` directories are often missing from a user's `PATH`.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if let Ok(found) = which::which(binary) {
        return Some(found);
    }
    let is_stock_name = binary
        .file_stem()
        .map(|s| s == "openvpn")
        .unwrap_or(false)
        && binary.components().count() == 1;
    if is_stock_name {
        return default_binary_paths().into_iter().find(|p| p.exists());
    }
    None
}

/// Parse an OpenVPN `--version` output line (e.g. "OpenVPN 2.6.8 …").
pub fn parse_version_string(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"OpenVPN\s+(\d+\.\d+\.\d+)").ok()?;
    re.captures(output).map(|c| c[1].to_string())
}
