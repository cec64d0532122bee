//! Credential holder and the ephemeral files handed to the binary.
//!
//! The config and `auth-user-pass` files live only as long as the
//! session: they are scoped `TempPath`s, removed explicitly on cleanup
//! and by `Drop` on any path that skips it.

use crate::openvpn::types::*;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use zeroize::Zeroize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Username / password pair. The password is wiped from memory on drop.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct VpnCredentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl VpnCredentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Contents of an `auth-user-pass` file: username then password,
    /// each newline-terminated.
    pub fn auth_file_contents(&self) -> String {
        format!("{}\n{}\n", self.username, self.password)
    }

    pub fn wipe(&mut self) {
        self.password.zeroize();
    }
}

impl Drop for VpnCredentials {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for VpnCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Staged files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The two files one session hands to the binary.
pub struct StagedCredentials {
    config_path: PathBuf,
    auth_path: PathBuf,
    config: Option<TempPath>,
    auth: Option<TempPath>,
}

impl StagedCredentials {
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn auth_path(&self) -> &Path {
        &self.auth_path
    }

    /// Whether the files are still on disk (as far as we know).
    pub fn is_staged(&self) -> bool {
        self.config.is_some() || self.auth.is_some()
    }

    /// Delete both files. Safe to call repeatedly; a file that is
    /// already gone is not an error. Every file is attempted even when
    /// an earlier one fails, and the failures are reported together.
    pub fn remove(&mut self) -> Result<(), OpenVpnError> {
        let mut failed = Vec::new();
        for tp in [self.config.take(), self.auth.take()].into_iter().flatten() {
            let path = tp.to_path_buf();
            if let Err(e) = tp.close() {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failed.push(format!("{}: {}", path.display(), e));
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(OpenVpnError::new(OpenVpnErrorKind::IoError, "Failed to remove staged files")
                .with_detail(failed.join("; ")))
        }
    }
}

impl fmt::Debug for StagedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedCredentials")
            .field("config_path", &self.config_path)
            .field("auth_path", &self.auth_path)
            .field("staged", &self.is_staged())
            .finish()
    }
}

fn write_private_file(dir: &Path, suffix: &str, content: &[u8]) -> Result<TempPath, OpenVpnError> {
    // NamedTempFile is created 0600 on Unix.
    let mut file = tempfile::Builder::new()
        .prefix("sorng-ovpn-")
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|e| {
            OpenVpnError::new(OpenVpnErrorKind::StagingFailed, "Cannot create staged file")
                .with_detail(format!("{}: {}", dir.display(), e))
        })?;
    file.write_all(content)
        .and_then(|_| file.flush())
        .map_err(|e| {
            OpenVpnError::new(OpenVpnErrorKind::StagingFailed, "Cannot write staged file")
                .with_detail(format!("{}: {}", file.path().display(), e))
        })?;
    Ok(file.into_temp_path())
}

/// Write the config bytes and the auth file into `dir`.
///
/// If the second file fails, the first one is dropped (and so deleted)
/// before the error is returned.
pub fn stage_credentials(
    dir: &Path,
    config: &[u8],
    creds: &VpnCredentials,
) -> Result<StagedCredentials, OpenVpnError> {
    stage_with(dir, config, creds, write_private_file)
}

fn stage_with<W>(
    dir: &Path,
    config: &[u8],
    creds: &VpnCredentials,
    mut write: W,
) -> Result<StagedCredentials, OpenVpnError>
where
    W: FnMut(&Path, &str, &[u8]) -> Result<TempPath, OpenVpnError>,
{
    let config_tp = write(dir, ".ovpn", config)?;

    let mut auth_body = creds.auth_file_contents();
    let auth_result = write(dir, ".auth", auth_body.as_bytes());
    auth_body.zeroize();
    let auth_tp = auth_result?;

    Ok(StagedCredentials {
        config_path: config_tp.to_path_buf(),
        auth_path: auth_tp.to_path_buf(),
        config: Some(config_tp),
        auth: Some(auth_tp),
    })
}
