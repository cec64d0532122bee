//! Pre-flight cleanup of leftover `openvpn` instances from earlier runs.

use crate::openvpn::process::signal_pid;
use crate::openvpn::types::*;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Finds and stops processes by executable name.
#[async_trait]
pub trait ProcessScanner: Send + Sync {
    async fn find(&self, name: &str) -> Result<Vec<u32>, OpenVpnError>;
    async fn terminate(&self, pids: &[u32]) -> Result<(), OpenVpnError>;
}

/// `pgrep` + SIGTERM on Unix, `tasklist` + `taskkill` on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgrepScanner;

#[async_trait]
impl ProcessScanner for PgrepScanner {
    #[cfg(not(windows))]
    async fn find(&self, name: &str) -> Result<Vec<u32>, OpenVpnError> {
        let output = Command::new("pgrep")
            .args(["-x", name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OpenVpnError::new(OpenVpnErrorKind::IoError, "Failed to run pgrep")
                    .with_detail(e.to_string())
            })?;
        // pgrep exits 1 when nothing matched
        match output.status.code() {
            Some(0) => Ok(parse_pid_lines(&String::from_utf8_lossy(&output.stdout))),
            Some(1) => Ok(Vec::new()),
            _ => Err(OpenVpnError::new(OpenVpnErrorKind::IoError, "pgrep failed")
                .with_detail(String::from_utf8_lossy(&output.stderr).trim().to_string())),
        }
    }

    #[cfg(windows)]
    async fn find(&self, name: &str) -> Result<Vec<u32>, OpenVpnError> {
        let image = if name.ends_with(".exe") {
            name.to_string()
        } else {
            format!("{}.exe", name)
        };
        let output = Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {}", image), "/FO", "CSV", "/NH"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OpenVpnError::new(OpenVpnErrorKind::IoError, "Failed to run tasklist")
                    .with_detail(e.to_string())
            })?;
        Ok(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn terminate(&self, pids: &[u32]) -> Result<(), OpenVpnError> {
        let failed: Vec<String> = pids
            .iter()
            .filter_map(|&pid| signal_pid(pid, false).err().map(|e| format!("{}: {}", pid, e)))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(OpenVpnError::new(OpenVpnErrorKind::IoError, "Could not signal process")
                .with_detail(failed.join("; ")))
        }
    }
}

/// One PID per line, as printed by `pgrep`.
pub fn parse_pid_lines(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

/// `tasklist /FO CSV /NH` rows: `"openvpn.exe","1234","Console",...`.
pub fn parse_tasklist_csv(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|l| l.split(',').nth(1))
        .filter_map(|f| f.trim().trim_matches('"').parse().ok())
        .collect()
}

/// Terminate every running process named `name`. Returns the PIDs that
/// were signalled. A failed search is treated as "nothing running".
pub async fn reap_stale_processes(
    scanner: &dyn ProcessScanner,
    name: &str,
    log_target: &str,
) -> Result<Vec<u32>, OpenVpnError> {
    let pids = match scanner.find(name).await {
        Ok(p) => p,
        Err(e) => {
            log::debug!(target: log_target, "stale process scan failed, skipping: {}", e);
            return Ok(Vec::new());
        }
    };
    if pids.is_empty() {
        return Ok(pids);
    }

    log::warn!(target: log_target, "terminating stale {} processes: {:?}", name, pids);
    scanner.terminate(&pids).await.map_err(|e| {
        let list: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
        OpenVpnError::new(
            OpenVpnErrorKind::ZombieProcess,
            format!("Failed to terminate stale {} processes", name),
        )
        .with_detail(format!("pids: {}; {}", list.join(", "), e))
    })?;
    Ok(pids)
}
