//! OpenVPN process lifecycle – arguments, spawn, signals, exit wait.

use crate::openvpn::auth::StagedCredentials;
use crate::openvpn::types::*;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Argument builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Command line for one session: staged config, staged credentials,
/// and no in-memory credential caching in the binary.
pub fn build_args(config_path: &Path, auth_path: &Path) -> Vec<String> {
    vec![
        "--config".into(),
        config_path.display().to_string(),
        "--auth-user-pass".into(),
        auth_path.display().to_string(),
        "--auth-nocache".into(),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Spawn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A freshly started child with its output pipes detached.
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn the binary against the staged files. Does NOT wait for the tunnel.
pub fn spawn_openvpn(
    binary: &Path,
    staged: &StagedCredentials,
) -> Result<SpawnedProcess, OpenVpnError> {
    let args = build_args(staged.config_path(), staged.auth_path());

    let mut child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            OpenVpnError::new(
                OpenVpnErrorKind::SpawnFailed,
                format!("Failed to spawn {}", binary.display()),
            )
            .with_detail(e.to_string())
        })?;

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(o), Some(e)) => (o, e),
        _ => {
            let _ = child.start_kill();
            return Err(OpenVpnError::new(
                OpenVpnErrorKind::SpawnFailed,
                "Child output pipes were not captured",
            ));
        }
    };

    Ok(SpawnedProcess {
        pid: child.id(),
        child,
        stdout,
        stderr,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Send SIGTERM (or SIGKILL when `hard`) to a PID. A process that is
/// already gone counts as success.
#[cfg(unix)]
pub fn signal_pid(pid: u32, hard: bool) -> Result<(), OpenVpnError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| {
        OpenVpnError::new(OpenVpnErrorKind::IoError, format!("PID {} out of range", pid))
    })?;
    let sig = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(OpenVpnError::new(
            OpenVpnErrorKind::IoError,
            format!("Cannot signal PID {}", pid),
        )
        .with_detail(e.to_string())),
    }
}

#[cfg(not(unix))]
pub fn signal_pid(pid: u32, _hard: bool) -> Result<(), OpenVpnError> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            OpenVpnError::new(OpenVpnErrorKind::IoError, "Cannot run taskkill")
                .with_detail(e.to_string())
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(OpenVpnError::new(
            OpenVpnErrorKind::IoError,
            format!("taskkill failed for PID {}", pid),
        ))
    }
}

/// Ask the child to shut down; falls back to a hard kill when no
/// polite signal can be delivered.
fn request_terminate(child: &mut Child, target: &str) {
    let polite = match child.id() {
        Some(pid) if cfg!(unix) => signal_pid(pid, false).is_ok(),
        _ => false,
    };
    if !polite {
        if let Err(e) = child.start_kill() {
            log::debug!(target: target, "start_kill failed: {}", e);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Exit wait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
    pub description: String,
}

impl ExitOutcome {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        let description = match (status.code(), signal) {
            (Some(c), _) => format!("exit status {}", c),
            (None, Some(s)) => format!("terminated by signal {}", s),
            (None, None) => "terminated".to_string(),
        };
        Self {
            success: status.success(),
            code: status.code(),
            description,
        }
    }

    pub fn wait_failed(e: &std::io::Error) -> Self {
        Self {
            success: false,
            code: None,
            description: format!("wait failed: {}", e),
        }
    }
}

/// Wait for the child to exit. Always ends in a reaped child: on
/// `cancel` it gets SIGTERM, and if it is still alive after `grace`
/// (or as soon as `kill` fires) it is killed outright.
pub async fn wait_for_exit(
    child: &mut Child,
    cancel: &CancellationToken,
    kill: &CancellationToken,
    grace: Duration,
    target: &str,
) -> ExitOutcome {
    let natural = tokio::select! {
        res = child.wait() => Some(res),
        _ = cancel.cancelled() => None,
    };

    let res = match natural {
        Some(res) => res,
        None => {
            log::debug!(target: target, "cancellation requested, terminating child");
            request_terminate(child, target);
            let graceful = tokio::select! {
                res = child.wait() => Some(res),
                _ = kill.cancelled() => None,
                _ = tokio::time::sleep(grace) => None,
            };
            match graceful {
                Some(res) => res,
                None => {
                    log::info!(target: target, "child still alive, killing");
                    if let Err(e) = child.start_kill() {
                        log::debug!(target: target, "start_kill failed: {}", e);
                    }
                    child.wait().await
                }
            }
        }
    };

    match res {
        Ok(status) => ExitOutcome::from_status(&status),
        Err(e) => ExitOutcome::wait_failed(&e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Version query
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Get the version of the OpenVPN binary.
pub async fn get_openvpn_version(binary: &Path) -> Result<String, OpenVpnError> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            OpenVpnError::new(
                OpenVpnErrorKind::SpawnFailed,
                format!("Failed to run {} --version", binary.display()),
            )
            .with_detail(e.to_string())
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{}\n{}", stdout, stderr);

    parse_version_string(&combined)
        .ok_or_else(|| OpenVpnError::new(OpenVpnErrorKind::ParseError, "Could not parse version"))
}
