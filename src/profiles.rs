//! Catalog of guest operating systems.
//!
//! Each guest is one [`TargetProfile`] value: a flat record of image names,
//! hypervisor settings and guest command paths, plus the two behaviors that
//! differ between families (package installation after a fresh OS install
//! and the shutdown command). Profiles are built once from the catalog and
//! never mutated.

use std::path::{Path, PathBuf};

/// How the guest is asked to power itself off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStyle {
    /// BSD `shutdown -p` (power down).
    Bsd,
    /// Linux `shutdown -P` (capital P).
    Linux,
}

impl ShutdownStyle {
    pub fn command(self) -> &'static str {
        match self {
            ShutdownStyle::Bsd => "/sbin/shutdown -p now",
            ShutdownStyle::Linux => "/sbin/shutdown -P now",
        }
    }
}

/// Immutable description of one guest OS variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    /// Catalog name, also accepted on the command line.
    pub name: &'static str,
    /// Working directory (relative to the work root) holding images, PID file and log.
    pub working_dir: &'static str,
    /// Disk image file name inside the working directory.
    pub disk_image: &'static str,
    /// Installer image file name inside the working directory.
    pub installer_image: &'static str,
    /// Where the installer image can be downloaded from.
    pub installer_url: &'static str,
    pub hypervisor: &'static str,
    pub use_kvm: bool,
    /// Memory size in the hypervisor's `-m` syntax.
    pub memory: &'static str,
    /// Guest path of `chown`, used to hand the synced tree to the guest user.
    pub chown: &'static str,
    /// Environment assignments prefixed to the configure step.
    pub env_flags: &'static str,
    /// Extra flags for the configure step.
    pub cmake_options: &'static str,
    /// Login shell initialization file sourced before each command.
    pub shell_profile: &'static str,
    /// Shell that runs decoded command payloads.
    pub guest_shell: &'static str,
    /// Commands run once after a fresh OS install.
    pub package_install: &'static [&'static str],
    /// Commands run before every build.
    pub per_run_setup: &'static [&'static str],
    pub shutdown: ShutdownStyle,
}

impl TargetProfile {
    /// Working directory under `work_root`.
    pub fn working_dir_in(&self, work_root: &Path) -> PathBuf {
        work_root.join(self.working_dir)
    }

    pub fn disk_path(&self, work_root: &Path) -> PathBuf {
        self.working_dir_in(work_root).join(self.disk_image)
    }

    pub fn installer_path(&self, work_root: &Path) -> PathBuf {
        self.working_dir_in(work_root).join(self.installer_image)
    }

    pub fn shutdown_command(&self) -> &'static str {
        self.shutdown.command()
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

const NETBSD_PACKAGES: &[&str] = &["pkgin -y install rsync cmake git vim libX11 libXext bash"];
const NETBSD_SETUP: &[&str] = &["/sbin/sysctl -w security.pax.aslr.global=0"];

const BASE: TargetProfile = TargetProfile {
    name: "",
    working_dir: "",
    disk_image: "",
    installer_image: "",
    installer_url: "",
    hypervisor: "qemu-system-x86_64",
    use_kvm: true,
    memory: "4G",
    chown: "/usr/sbin/chown",
    env_flags: "",
    cmake_options: "",
    shell_profile: "~/.profile",
    guest_shell: "bash",
    package_install: &[],
    per_run_setup: &[],
    shutdown: ShutdownStyle::Bsd,
};

const NETBSD: TargetProfile = TargetProfile {
    name: "NetBSD",
    working_dir: "NetBSD",
    disk_image: "NetBSD-9.3-i386.qcow2",
    installer_image: "NetBSD-9.3-i386.iso",
    installer_url: "https://cdn.netbsd.org/pub/NetBSD/NetBSD-9.3/images/NetBSD-9.3-i386.iso",
    chown: "/sbin/chown",
    package_install: NETBSD_PACKAGES,
    per_run_setup: NETBSD_SETUP,
    ..BASE
};

const NETBSD_MACPPC: TargetProfile = TargetProfile {
    name: "NetBSDmacppc",
    working_dir: "NetBSDmacppc",
    disk_image: "NetBSD-9.3-macppc.qcow2",
    installer_image: "NetBSD-9.3-macppc.iso",
    installer_url: "https://cdn.netbsd.org/pub/NetBSD/NetBSD-9.3/images/NetBSD-9.3-macppc.iso",
    hypervisor: "qemu-system-ppc",
    use_kvm: false,
    ..NETBSD
};

const FREEBSD: TargetProfile = TargetProfile {
    name: "FreeBSD",
    working_dir: "FreeBSD",
    disk_image: "FreeBSD-13.1-RELEASE-i386.qcow2",
    installer_image: "FreeBSD-13.1-RELEASE-i386-disc1.iso",
    installer_url: "https://download.freebsd.org/releases/i386/i386/ISO-IMAGES/13.1/FreeBSD-13.1-RELEASE-i386-disc1.iso",
    env_flags: "CC=gcc CPP=g++",
    cmake_options: "-DCMAKE_BUILD_TYPE=Release",
    package_install: &[
        "pkg install -y rsync cmake git vim libX11 libXext gcc bash",
        // gcc's runtime is not on the default library path.
        "echo \"libgcc_s.so.1\t\t/usr/local/lib/gcc12/libgcc_s.so.1\" >> /etc/libmap.conf",
    ],
    ..BASE
};

const DEBIAN: TargetProfile = TargetProfile {
    name: "Debian",
    working_dir: "Debian",
    disk_image: "debian-11.6.0-i386.qcow2",
    installer_image: "debian-11.6.0-i386-netinst.iso",
    installer_url: "https://cdimage.debian.org/debian-cd/current/i386/iso-cd/debian-11.6.0-i386-netinst.iso",
    chown: "/usr/bin/chown",
    package_install: &["apt install -y rsync cmake git vim build-essential xorg-dev libncurses5-dev"],
    shutdown: ShutdownStyle::Linux,
    ..BASE
};

const CATALOG: &[TargetProfile] = &[NETBSD, NETBSD_MACPPC, FREEBSD, DEBIAN];

/// Targets covered by `all`.
const ALL: &[&str] = &["NetBSD", "FreeBSD", "Debian"];

/// Every profile in the catalog.
pub fn catalog() -> &'static [TargetProfile] {
    CATALOG
}

/// Look up one profile by name (ASCII case-insensitive).
pub fn lookup(name: &str) -> Option<TargetProfile> {
    CATALOG
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .cloned()
}

/// Resolve a command-line target: a catalog name or `all`.
pub fn resolve(target: &str) -> Option<Vec<TargetProfile>> {
    if target.eq_ignore_ascii_case("all") {
        return Some(ALL.iter().filter_map(|n| lookup(n)).collect());
    }
    lookup(target).map(|p| vec![p])
}
