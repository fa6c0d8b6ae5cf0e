//! VM lifecycle management via QEMU.
//!
//! ## Architecture
//!
//! ```text
//! boot(session)
//!     ├─► ssh-keygen -R [localhost]:<port>      (forget the previous VM's key)
//!     └─► qemu -daemonize -pidfile <wd>/pid ...  (returns once daemonized)
//!             └─► session.record_pid(<pid file>)
//! poweroff(session)      shutdown command over the remote channel
//! wait_for_exit(session) poll kill(pid, 0) until it fails, then delete <wd>/pid
//! terminate(session)     SIGTERM / SIGKILL to the PID file's process, only for
//!                        reclaiming a hung VM
//! ```
//!
//! `wait_for_exit` is the only confirmation that the hypervisor is gone. Any
//! path that booted a VM has to reach it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::vm::host::{Host, Invocation};
use crate::vm::remote_channel::{RemoteChannel, Verbosity};
use crate::vm::session::Session;

/// Build the hypervisor command line for `session`.
pub fn hypervisor_invocation(session: &Session) -> Invocation {
    let profile = &session.profile;
    let mut inv = Invocation::new(profile.hypervisor);
    if profile.use_kvm {
        inv = inv.arg("--enable-kvm");
    }
    inv = inv
        .arg("-nic")
        .arg(format!("user,hostfwd=tcp::{}-:22", session.port))
        .arg("-daemonize")
        .args(["-m", profile.memory])
        .args(["-boot", "d"]);
    if session.install {
        inv = inv.arg("-cdrom").arg(session.installer.display().to_string());
    }
    inv.arg("-pidfile")
        .arg(session.pid_file.display().to_string())
        .arg("-hda")
        .arg(session.disk.display().to_string())
}

/// Parse the decimal PID written by the hypervisor.
pub fn parse_pid(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    let pid: u32 = trimmed
        .parse()
        .with_context(|| format!("PID file contains {trimmed:?}, not a process id"))?;
    if pid == 0 {
        bail!("PID file contains 0");
    }
    Ok(pid)
}

async fn read_pid_file(path: &Path) -> Result<Option<u32>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_pid(&text).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read PID file {}", path.display())),
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    channel: RemoteChannel,
    known_hosts: std::path::PathBuf,
    poll_interval: Duration,
}

impl Lifecycle {
    pub fn new(channel: RemoteChannel, known_hosts: std::path::PathBuf, poll_interval: Duration) -> Self {
        Self {
            channel,
            known_hosts,
            poll_interval,
        }
    }

    fn host(&self) -> &Arc<dyn Host> {
        self.channel.host()
    }

    /// Launch the hypervisor for `session` and record its PID.
    ///
    /// Returns as soon as the hypervisor has daemonized; the guest is not
    /// reachable yet.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::claim`] and [`Lifecycle::launch`].
    pub async fn boot(&self, session: &Session) -> Result<()> {
        self.claim(session).await?;
        self.launch(session).await
    }

    /// Take over the working directory: create it, and refuse when a PID
    /// file names a hypervisor that is still running. A PID file left by an
    /// exited hypervisor is removed.
    pub async fn claim(&self, session: &Session) -> Result<()> {
        tokio::fs::create_dir_all(&session.working_dir)
            .await
            .with_context(|| format!("create working directory {}", session.working_dir.display()))?;

        if let Some(stale) = read_pid_file(&session.pid_file).await? {
            if self.host().is_alive(stale) {
                bail!(
                    "{} already has a running hypervisor (pid {stale}); \
                     power it off before booting again",
                    session.target()
                );
            }
            debug!(pid = stale, "removing PID file left by an exited hypervisor");
            remove_pid_file(&session.pid_file).await?;
        }
        Ok(())
    }

    /// Start the hypervisor in a claimed working directory.
    ///
    /// # Errors
    ///
    /// If the hypervisor cannot be spawned or exits non-zero, or it did not
    /// leave a readable PID file.
    pub async fn launch(&self, session: &Session) -> Result<()> {
        self.forget_host_key(session).await;

        if !session.quiet {
            println!("Booting {} on port {}...", session.target(), session.port);
        }
        let invocation = hypervisor_invocation(session);
        info!(guest = session.target(), port = session.port, command = %invocation, "launching hypervisor");

        session.mark_launched();
        let out = self
            .host()
            .run(&invocation)
            .await
            .with_context(|| format!("launch hypervisor for {}", session.target()))?;
        if !out.success() {
            bail!(
                "hypervisor for {} exited {:?}: {}",
                session.target(),
                out.code,
                out.combined().trim()
            );
        }

        let pid = read_pid_file(&session.pid_file).await?.with_context(|| {
            format!(
                "hypervisor for {} did not write {}",
                session.target(),
                session.pid_file.display()
            )
        })?;
        session.record_pid(pid);
        info!(guest = session.target(), pid, port = session.port, "hypervisor running");
        Ok(())
    }

    /// Remove `[host]:port` from known_hosts. Failure is only traced: the
    /// entry may simply not exist.
    async fn forget_host_key(&self, session: &Session) {
        let guest = self.channel.transport().guest();
        let inv = Invocation::new("ssh-keygen")
            .arg("-f")
            .arg(self.known_hosts.display().to_string())
            .arg("-R")
            .arg(format!("[{}]:{}", guest.host, session.port));
        match self.host().run(&inv).await {
            Ok(out) if out.success() => debug!(port = session.port, "cleared stale host key"),
            Ok(out) => debug!(port = session.port, code = ?out.code, "no host key to clear"),
            Err(e) => warn!(port = session.port, error = %e, "could not run ssh-keygen"),
        }
    }

    /// Ask the guest to shut down. Does not wait.
    pub async fn poweroff(&self, session: &Session) -> Result<()> {
        if !session.quiet {
            println!("Shutting down {}", session.target());
        }
        self.channel
            .execute(session, session.profile.shutdown_command(), Verbosity::Stage)
            .await?;
        Ok(())
    }

    /// Block until the hypervisor process has exited, then delete its PID file.
    ///
    /// # Errors
    ///
    /// When neither the PID file nor a PID recorded at boot exists: the VM was
    /// never booted in this session.
    pub async fn wait_for_exit(&self, session: &Session) -> Result<()> {
        let Some(pid) = current_pid(session).await? else {
            bail!(
                "no PID file at {} and no recorded hypervisor for {}; was the VM booted?",
                session.pid_file.display(),
                session.target()
            );
        };

        debug!(guest = session.target(), pid, "waiting for hypervisor to exit");
        while self.host().is_alive(pid) {
            tokio::time::sleep(self.poll_interval).await;
        }

        remove_pid_file(&session.pid_file).await?;
        session.clear_pid();
        info!(guest = session.target(), pid, "hypervisor exited");
        Ok(())
    }

    /// Signal the session's hypervisor directly.
    ///
    /// Only a PID still named by the PID file, and started by this session,
    /// is signalled. Once QEMU has removed its file the recorded PID may
    /// already belong to another process.
    pub async fn terminate(&self, session: &Session, force: bool) -> Result<()> {
        let Some(pid) = read_pid_file(&session.pid_file).await? else {
            debug!(guest = session.target(), "no PID file, nothing to signal");
            return Ok(());
        };
        match session.pid() {
            Some(recorded) if recorded != pid => bail!(
                "PID file {} names {pid}, not the hypervisor {recorded} started for {}",
                session.pid_file.display(),
                session.target()
            ),
            None if !session.launched() => bail!(
                "PID file {} was not written by a hypervisor this session started",
                session.pid_file.display()
            ),
            _ => {}
        }
        warn!(guest = session.target(), pid, force, "signalling hypervisor");
        self.host().terminate(pid, force)
    }

    /// Whether this session started a hypervisor that may need reclaiming.
    /// A PID file this session did not launch is never its to reclaim.
    pub async fn has_hypervisor(&self, session: &Session) -> bool {
        if session.pid().is_some() {
            return true;
        }
        session.launched() && matches!(read_pid_file(&session.pid_file).await, Ok(Some(_)) | Err(_))
    }
}

/// PID from the PID file, or the one recorded at boot when QEMU already
/// removed its own file on a clean exit.
async fn current_pid(session: &Session) -> Result<Option<u32>> {
    Ok(read_pid_file(&session.pid_file).await?.or_else(|| session.pid()))
}

async fn remove_pid_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove PID file {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles;

    fn session(name: &str) -> Session {
        let profile = Arc::new(profiles::lookup(name).unwrap());
        Session::with_port(profile, Path::new("/vms"), 31337)
    }

    #[test]
    fn kvm_guest_command_line() {
        let inv = hypervisor_invocation(&session("NetBSD"));
        assert_eq!(inv.program, "qemu-system-x86_64");
        assert_eq!(inv.args[0], "--enable-kvm");
        assert!(inv.has_arg("user,hostfwd=tcp::31337-:22"));
        assert!(inv.has_arg("-daemonize"));
        assert!(inv.has_arg("/vms/NetBSD/pid"));
        assert!(inv.has_arg("/vms/NetBSD/NetBSD-9.3-i386.qcow2"));
        assert!(!inv.has_arg("-cdrom"));
    }

    #[test]
    fn install_boot_attaches_installer() {
        let inv = hypervisor_invocation(&session("Debian").installing(true));
        let at = inv.args.iter().position(|a| a == "-cdrom").unwrap();
        assert_eq!(inv.args[at + 1], "/vms/Debian/debian-11.6.0-i386-netinst.iso");
    }

    #[test]
    fn ppc_guest_has_no_kvm() {
        let inv = hypervisor_invocation(&session("NetBSDmacppc"));
        assert_eq!(inv.program, "qemu-system-ppc");
        assert!(!inv.has_arg("--enable-kvm"));
    }

    #[test]
    fn parse_pid_accepts_trailing_newline() {
        assert_eq!(parse_pid("4242\n").unwrap(), 4242);
        assert!(parse_pid("").is_err());
        assert!(parse_pid("0").is_err());
        assert!(parse_pid("qemu").is_err());
    }
}
