//! Well-known file locations and tilde expansion.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory name under the per-user config dir that holds app state.
pub const APP_DIR_NAME: &str = "DevTools";

/// Resolves `~` and `~/...` against the user's home directory.
///
/// Anything else is returned untouched. Used for `IdentityFile` values and
/// sync pair paths typed by the user.
pub fn expand_tilde(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    if trimmed == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(trimmed).to_path_buf()
}

/// `~/.ssh` for the current user.
pub fn ssh_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssh"))
        .ok_or_else(|| Error::ConnectionFailed("could not determine home directory".to_string()))
}

/// `~/.ssh/config`.
pub fn ssh_config_path() -> Result<PathBuf> {
    Ok(ssh_dir()?.join("config"))
}

/// `known_hosts` co-located with the SSH config file.
pub fn known_hosts_path() -> Result<PathBuf> {
    Ok(ssh_dir()?.join("known_hosts"))
}

/// Per-user `DevTools` app directory, created on first use.
pub fn app_config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| Error::ConnectionFailed("could not determine config directory".to_string()))?
        .join(APP_DIR_NAME);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// `DevTools/config.json`.
pub fn app_config_path() -> Result<PathBuf> {
    Ok(app_config_dir()?.join("config.json"))
}

/// `DevTools/app.log`.
pub fn app_log_path() -> Result<PathBuf> {
    Ok(app_config_dir()?.join("app.log"))
}
