//! The seam between the orchestrator and the host operating system.
//!
//! Everything that leaves the process (ssh, rsync, ssh-keygen, the
//! hypervisor, signals to the hypervisor PID) goes through the [`Host`]
//! trait. [`SystemHost`] is the real implementation; tests substitute a
//! scripted host so whole cycles can run without a VM.

use std::fmt;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// One host program invocation: the program and its argument vector.
///
/// Arguments are passed straight to `execve`, never through a host shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line with every argument equal to `secret` masked.
    pub fn redacted(&self, secret: &str) -> String {
        let masked = Invocation {
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|a| if !secret.is_empty() && a == secret { "****".to_string() } else { a.clone() })
                .collect(),
        };
        masked.to_string()
    }

    /// True when `needle` appears as one of the arguments.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        f.write_str(&shell_words::join(words))
    }
}

/// Captured result of a finished host program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOutput {
    /// Exit code, `None` when the program was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }
}

/// Operations the orchestrator needs from the host.
#[async_trait]
pub trait Host: Send + Sync {
    /// Run a program to completion and capture both output streams.
    ///
    /// A non-zero exit is returned as data. `Err` means the program could not
    /// be started at all.
    async fn run(&self, invocation: &Invocation) -> Result<HostOutput>;

    /// Run a program attached to the caller's terminal. Returns the exit code.
    async fn run_interactive(&self, invocation: &Invocation) -> Result<Option<i32>>;

    /// Liveness probe for a PID. Any probe error other than "no such
    /// process" reports the process as alive.
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver SIGTERM, or SIGKILL when `force` is set.
    fn terminate(&self, pid: u32, force: bool) -> Result<()>;
}

/// [`Host`] backed by real processes and signals.
#[derive(Debug, Clone, Default)]
pub struct SystemHost;

#[async_trait]
impl Host for SystemHost {
    async fn run(&self, invocation: &Invocation) -> Result<HostOutput> {
        debug!(program = %invocation.program, args = invocation.args.len(), "spawning host command");

        // kill_on_drop: an aborted run must not leave ssh/rsync behind.
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{}`", invocation.program))?;

        Ok(HostOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn run_interactive(&self, invocation: &Invocation) -> Result<Option<i32>> {
        let status = Command::new(&invocation.program)
            .args(&invocation.args)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn `{}`", invocation.program))?;
        Ok(status.code())
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        send_signal(pid, force)
    }
}

/// `kill(pid, 0)` liveness check.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return true;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    let alive = alive_after_probe_error(err.raw_os_error());
    if alive {
        warn!(pid, error = %err, "liveness probe failed, assuming process is alive");
    }
    alive
}

/// Only "no such process" proves a process gone. EPERM and anything else
/// leave it counted as alive.
#[cfg(unix)]
fn alive_after_probe_error(errno: Option<i32>) -> bool {
    errno != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> Result<()> {
    let raw = libc::pid_t::try_from(pid).context("pid out of range")?;
    anyhow::ensure!(raw > 0, "refusing to signal pid {pid}");
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // SAFETY: plain kill(2) on a validated positive pid.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(err).with_context(|| format!("failed to signal hypervisor pid {pid}"))
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _force: bool) -> Result<()> {
    anyhow::bail!("cannot signal pid {pid} on this platform")
}
