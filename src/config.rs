//! Orchestrator settings.
//!
//! All tunables live in one `Config` struct that is deserialized from TOML.
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! wants to change:
//!
//! ```toml
//! source_dir = "/home/me/src/self/"
//!
//! [guest]
//! password = "Pass123"
//!
//! [timing]
//! deadline_secs = 5400
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Host source tree pushed into every guest.
    pub source_dir: PathBuf,
    /// Directory that holds one working directory per target.
    pub work_root: PathBuf,
    /// Run several targets at once when `all` is requested.
    pub parallel: bool,
    pub guest: GuestConfig,
    pub timing: TimingConfig,
    pub ports: PortRange,
    pub build: BuildConfig,
}

/// Credentials and addressing for the guest's sshd.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuestConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    /// Host known_hosts file cleaned of stale `[host]:port` entries at boot.
    pub known_hosts: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between connectivity probes.
    pub probe_interval_ms: u64,
    /// Pause between hypervisor liveness probes.
    pub exit_poll_interval_ms: u64,
    /// Wall-clock bound on one supervised cycle.
    pub deadline_secs: u64,
    /// Bound on each cleanup step after a deadline expires.
    pub grace_secs: u64,
}

/// Host ports eligible for the guest ssh forward, `min..max`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Guest-side layout of the build and the classification markers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildConfig {
    pub guest_source_dir: String,
    pub guest_build_dir: String,
    /// Artifact path relative to the build directory.
    pub artifact: String,
    /// Test working directory relative to the guest source dir.
    pub test_dir: String,
    /// Script piped into the artifact's stdin for the automated test run.
    pub test_script: String,
    pub test_args: Vec<String>,
    pub build_marker: String,
    pub test_marker: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            work_root: PathBuf::from("."),
            parallel: false,
            guest: GuestConfig::default(),
            timing: TimingConfig::default(),
            ports: PortRange::default(),
            build: BuildConfig::default(),
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: "Pass123".to_string(),
            host: "localhost".to_string(),
            known_hosts: crate::paths::known_hosts_file(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1_000,
            exit_poll_interval_ms: 1_000,
            deadline_secs: 2 * 60 * 60,
            grace_secs: 120,
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10_000,
            max: 60_000,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            guest_source_dir: "/self".to_string(),
            guest_build_dir: "/root/build".to_string(),
            artifact: "vm/Self".to_string(),
            test_dir: "objects".to_string(),
            test_script: "tests runVMSuite. \
                          benchmarks suite do: [|:b| b printLine. b run]. \
                          'ALL TESTS COMPLETE' printLine. _Quit"
                .to_string(),
            test_args: vec![
                "-f".to_string(),
                "worldBuilder.self".to_string(),
                "-o".to_string(),
                "morphic".to_string(),
            ],
            build_marker: "Built target Self".to_string(),
            test_marker: "ALL TESTS COMPLETE".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl TimingConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.min..self.max).contains(&port)
    }
}

impl BuildConfig {
    pub fn artifact_path(&self) -> String {
        format!("{}/{}", self.guest_build_dir, self.artifact)
    }
}

impl Config {
    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("invalid configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match crate::paths::config_file() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                info!(path = %path.display(), "loaded configuration");
                Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                debug!(path = %path.display(), "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("read configuration {}", path.display())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ports.min == 0 || self.ports.min >= self.ports.max {
            bail!(
                "port range {}..{} is empty or starts at 0",
                self.ports.min,
                self.ports.max
            );
        }
        if self.build.build_marker.is_empty() || self.build.test_marker.is_empty() {
            bail!("classification markers must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let c = Config::default();
        assert_eq!(c.guest.user, "root");
        assert_eq!(c.ports, PortRange { min: 10_000, max: 60_000 });
        assert_eq!(c.timing.deadline(), Duration::from_secs(7200));
        assert_eq!(c.build.artifact_path(), "/root/build/vm/Self");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = Config::from_toml(
            r#"
source_dir = "/src/self/"

[timing]
deadline_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(c.source_dir, PathBuf::from("/src/self/"));
        assert_eq!(c.timing.deadline_secs, 60);
        assert_eq!(c.timing.probe_interval_ms, 1_000);
        assert_eq!(c.guest.password, "Pass123");
        assert_eq!(c.build.test_marker, "ALL TESTS COMPLETE");
    }

    #[test]
    fn toml_roundtrip() {
        let original = Config::default();
        let parsed = Config::from_toml(&original.to_toml()).unwrap();
        assert_eq!(parsed.ports, original.ports);
        assert_eq!(parsed.build.test_args, original.build.test_args);
    }

    #[test]
    fn inverted_port_range_rejected() {
        let err = Config::from_toml("[ports]\nmin = 5000\nmax = 4000\n").unwrap_err();
        assert!(err.to_string().contains("port range"), "got: {err}");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_file_is_read() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("guestbuild.toml");
        std::fs::write(&file, "parallel = true\n").unwrap();
        let c = Config::load(Some(&file)).unwrap();
        assert!(c.parallel);
    }
}
