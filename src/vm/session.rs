//! Run-time state for one boot-through-teardown cycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use crate::config::PortRange;
use crate::profiles::TargetProfile;
use crate::vm::run_log::RunLog;

/// Number of random candidates tried before settling on an unchecked port.
const PORT_ATTEMPTS: usize = 64;

/// One cycle of one target.
///
/// Cloning a session shares the recorded hypervisor PID and launch state, so
/// a supervisor holding a clone can clean up after a worker it aborted.
#[derive(Debug, Clone)]
pub struct Session {
    pub profile: Arc<TargetProfile>,
    /// Host port forwarded to the guest's port 22.
    pub port: u16,
    pub working_dir: PathBuf,
    pub disk: PathBuf,
    pub installer: PathBuf,
    pub pid_file: PathBuf,
    pub log: RunLog,
    /// Suppress console echo of command output.
    pub quiet: bool,
    /// Attach the installer image on boot.
    pub install: bool,
    pid: Arc<Mutex<Option<u32>>>,
    /// Set once this session has started a hypervisor; a PID file found
    /// before that belongs to someone else.
    launched: Arc<AtomicBool>,
}

impl Session {
    /// New session with a freshly allocated port.
    pub fn new(profile: Arc<TargetProfile>, work_root: &Path, ports: PortRange) -> Self {
        Self::with_port(profile, work_root, allocate_port(ports))
    }

    pub fn with_port(profile: Arc<TargetProfile>, work_root: &Path, port: u16) -> Self {
        let working_dir = profile.working_dir_in(work_root);
        Self {
            disk: profile.disk_path(work_root),
            installer: profile.installer_path(work_root),
            pid_file: working_dir.join("pid"),
            log: RunLog::for_working_dir(&working_dir),
            working_dir,
            port,
            quiet: false,
            install: false,
            pid: Arc::new(Mutex::new(None)),
            launched: Arc::new(AtomicBool::new(false)),
            profile,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn installing(mut self, install: bool) -> Self {
        self.install = install;
        self
    }

    pub fn target(&self) -> &'static str {
        self.profile.name
    }

    /// Hypervisor PID recorded at boot, if the VM has not been confirmed gone.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_pid(&self, pid: u32) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = Some(pid);
    }

    pub(crate) fn clear_pid(&self) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.launched.store(false, Ordering::SeqCst);
    }

    /// Whether this session started the hypervisor it may have to reclaim.
    pub fn launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_launched(&self) {
        self.launched.store(true, Ordering::SeqCst);
    }
}

/// Pick a random port in `range`, preferring one that is free on the host.
///
/// The range is wide so a port whose previous VM is still winding down is
/// unlikely to be drawn again.
pub fn allocate_port(range: PortRange) -> u16 {
    allocate_port_except(range, None)
}

/// Like [`allocate_port`], but never returns `previous` unless the range
/// holds no other port.
pub fn allocate_port_except(range: PortRange, previous: Option<u16>) -> u16 {
    let mut rng = rand::rng();
    let roomy = range.max.saturating_sub(range.min) > 1;
    for _ in 0..PORT_ATTEMPTS {
        let port = rng.random_range(range.min..range.max);
        if roomy && Some(port) == previous {
            continue;
        }
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            debug!(port, "allocated forward port");
            return port;
        }
    }
    let mut port = rng.random_range(range.min..range.max);
    if roomy && Some(port) == previous {
        port = if port + 1 < range.max { port + 1 } else { range.min };
    }
    debug!(port, "no free port found, using unchecked candidate");
    port
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles;

    #[test]
    fn allocated_ports_stay_in_range() {
        let range = PortRange { min: 20_000, max: 20_050 };
        for _ in 0..200 {
            assert!(range.contains(allocate_port(range)));
        }
    }

    #[test]
    fn previous_port_is_not_drawn_again() {
        let range = PortRange { min: 20_100, max: 20_102 };
        for _ in 0..100 {
            assert_eq!(allocate_port_except(range, Some(20_100)), 20_101);
        }
    }

    #[test]
    fn single_port_range_reuses_the_previous_port() {
        let range = PortRange { min: 20_200, max: 20_201 };
        assert_eq!(allocate_port_except(range, Some(20_200)), 20_200);
    }

    #[test]
    fn session_paths_follow_working_dir() {
        let profile = Arc::new(profiles::lookup("NetBSD").unwrap());
        let s = Session::with_port(profile, Path::new("/vms"), 12345);
        assert_eq!(s.pid_file, Path::new("/vms/NetBSD/pid"));
        assert_eq!(s.log.path(), Path::new("/vms/NetBSD/NetBSD.out.txt"));
        assert_eq!(s.disk, Path::new("/vms/NetBSD/NetBSD-9.3-i386.qcow2"));
        assert_eq!(s.port, 12345);
    }

    #[test]
    fn clones_share_the_recorded_pid() {
        let profile = Arc::new(profiles::lookup("Debian").unwrap());
        let s = Session::with_port(profile, Path::new("/vms"), 2222);
        let clone = s.clone();
        s.record_pid(4242);
        assert_eq!(clone.pid(), Some(4242));
        clone.clear_pid();
        assert_eq!(s.pid(), None);
    }

    #[test]
    fn launch_state_is_shared_and_cleared_with_the_pid() {
        let profile = Arc::new(profiles::lookup("NetBSD").unwrap());
        let s = Session::with_port(profile, Path::new("/vms"), 2223);
        let clone = s.clone();
        assert!(!clone.launched());
        s.mark_launched();
        s.record_pid(77);
        assert!(clone.launched());
        clone.clear_pid();
        assert!(!s.launched());
    }
}
