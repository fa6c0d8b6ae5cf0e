//! ssh / rsync command lines for reaching the guest.
//!
//! The guest only accepts password logins, so every invocation is wrapped in
//! `sshpass`. Host keys are not checked for these connections only: each boot
//! is a new machine answering on `localhost`, and the stale known_hosts entry
//! for the session port is removed separately at boot.

use crate::config::GuestConfig;
use crate::vm::host::Invocation;

/// SSH options shared by every ssh and rsync invocation.
///
/// * `StrictHostKeyChecking=no`: accept the new VM's key.
/// * `LogLevel=ERROR`: keep banners and warnings out of the run log.
/// * `ConnectTimeout=10`: a guest that accepts TCP but never answers must
///   not stall a probe.
pub const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "LogLevel=ERROR",
    "-o", "ConnectTimeout=10",
];

/// Builds transport invocations for one guest account.
#[derive(Debug, Clone)]
pub struct Transport {
    guest: GuestConfig,
}

impl Transport {
    pub fn new(guest: GuestConfig) -> Self {
        Self { guest }
    }

    pub fn guest(&self) -> &GuestConfig {
        &self.guest
    }

    fn sshpass(&self) -> Invocation {
        Invocation::new("sshpass").args(["-p", self.guest.password.as_str()])
    }

    fn login(&self) -> String {
        format!("{}@{}", self.guest.user, self.guest.host)
    }

    /// Command line of `invocation` safe for logs and headings.
    pub fn describe(&self, invocation: &Invocation) -> String {
        invocation.redacted(&self.guest.password)
    }

    /// `ssh` running `remote` in the guest on `port`.
    pub fn ssh(&self, port: u16, remote: &str) -> Invocation {
        self.sshpass()
            .args(["ssh", "-q", "-p"])
            .arg(port.to_string())
            .args(SSH_OPTS.iter().copied())
            .arg(self.login())
            .arg(remote)
    }

    /// Interactive login shell in the guest.
    pub fn interactive(&self, port: u16) -> Invocation {
        self.sshpass()
            .args(["ssh", "-p"])
            .arg(port.to_string())
            .args(SSH_OPTS.iter().copied())
            .arg(self.login())
    }

    /// The `-e` argument handed to rsync.
    fn rsync_shell(&self, port: u16) -> String {
        let mut words = vec!["ssh".to_string(), "-p".to_string(), port.to_string()];
        words.extend(SSH_OPTS.iter().map(|s| s.to_string()));
        shell_words::join(words)
    }

    /// Content-compared copy of the host directory `src` into guest `dest`.
    ///
    /// `--checksum` makes rsync compare file contents rather than size and
    /// modification time, which can be wrong after an unclean guest shutdown.
    pub fn push_tree(&self, port: u16, src: &str, dest: &str) -> Invocation {
        // Trailing slash: copy the contents of src, not src itself.
        let src = if src.ends_with('/') {
            src.to_string()
        } else {
            format!("{src}/")
        };
        self.sshpass()
            .args(["rsync", "--checksum", "-rz", "-e"])
            .arg(self.rsync_shell(port))
            .arg(src)
            .arg(format!("{}:{dest}", self.login()))
    }

    /// Copy guest file `src` into host directory `dest_dir`.
    pub fn pull_file(&self, port: u16, src: &str, dest_dir: &str) -> Invocation {
        self.sshpass()
            .args(["rsync", "--checksum", "-z", "-e"])
            .arg(self.rsync_shell(port))
            .arg(format!("{}:{src}", self.login()))
            .arg(format!("{}/", dest_dir.trim_end_matches('/')))
    }
}
