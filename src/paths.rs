//! Host-side locations used by guestbuild.
//!
//! - Config: `$XDG_CONFIG_HOME/guestbuild/config.toml` (or `~/.config/...`)
//! - Logs:   `$XDG_DATA_HOME/guestbuild/logs/` (or `~/.local/share/...`)
//!
//! On macOS the log directory follows `~/Library/Logs/guestbuild/`.
//! Per-target working directories are not resolved here; they hang off
//! `Config::work_root`.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "guestbuild";

fn home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// Default configuration file path.
pub fn config_file() -> Option<PathBuf> {
    let dir = match std::env::var("XDG_CONFIG_HOME") {
        Ok(xdg) => PathBuf::from(xdg).join(APP_NAME),
        Err(_) => home()?.join(".config").join(APP_NAME),
    };
    Some(dir.join("config.toml"))
}

/// Directory for the optional tracing log file.
pub fn log_dir() -> Option<PathBuf> {
    Some(resolve_log_dir(&home()?))
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

/// The user's ssh known_hosts file, `/tmp/...` when `$HOME` is unset.
pub fn known_hosts_file() -> PathBuf {
    home()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ssh")
        .join("known_hosts")
}
