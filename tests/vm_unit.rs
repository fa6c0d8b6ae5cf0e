//! Pure tests across the public API that need no VM and no host programs.
//!
//! Tested in this file:
//! - a partial TOML config flows into session paths and the hypervisor
//!   command line
//! - every catalog profile yields a launchable, self-consistent command line
//! - remote payloads round-trip arbitrary shell text

use std::path::Path;
use std::sync::Arc;

use guestbuild::config::Config;
use guestbuild::profiles::{self, ShutdownStyle};
use guestbuild::vm::lifecycle::hypervisor_invocation;
use guestbuild::vm::remote_channel::{decode_command, encode_command, guest_payload};
use guestbuild::vm::session::Session;

#[test]
fn partial_config_drives_session_layout() {
    let config = Config::from_toml(
        r#"
work_root = "/srv/vms"

[ports]
min = 41000
max = 41010
"#,
    )
    .unwrap();
    assert_eq!(config.guest.user, "root");
    assert_eq!(config.build.test_marker, "ALL TESTS COMPLETE");

    let profile = Arc::new(profiles::lookup("freebsd").unwrap());
    let session = Session::new(profile, &config.work_root, config.ports);

    assert!(config.ports.contains(session.port));
    assert_eq!(session.working_dir, Path::new("/srv/vms/FreeBSD"));
    assert_eq!(session.log.path(), Path::new("/srv/vms/FreeBSD/FreeBSD.out.txt"));

    let inv = hypervisor_invocation(&session);
    assert!(inv.has_arg(&format!("user,hostfwd=tcp::{}-:22", session.port)));
    assert!(inv.has_arg("/srv/vms/FreeBSD/pid"));
}

#[test]
fn every_profile_has_a_complete_command_line() {
    for profile in profiles::catalog() {
        let session = Session::with_port(Arc::new(profile.clone()), Path::new("/w"), 20000);
        let inv = hypervisor_invocation(&session);

        assert!(inv.program.starts_with("qemu-system-"), "{}", profile.name);
        assert_eq!(inv.has_arg("--enable-kvm"), profile.use_kvm, "{}", profile.name);
        assert!(inv.has_arg(profile.memory), "{}", profile.name);
        assert!(inv.args.last().unwrap().ends_with(profile.disk_image), "{}", profile.name);
        assert!(!profile.installer_url.is_empty(), "{}", profile.name);
        assert!(!profile.package_install.is_empty(), "{}", profile.name);
    }
}

#[test]
fn only_linux_guests_use_capital_p_shutdown() {
    for profile in profiles::catalog() {
        let linux = profile.shutdown == ShutdownStyle::Linux;
        assert_eq!(linux, profile.name == "Debian", "{}", profile.name);
        assert!(profile.shutdown_command().starts_with("/sbin/shutdown"));
    }
}

#[test]
fn payload_round_trips_shell_text() {
    let commands = [
        "echo BUILDING: $(date)",
        r#"cd /self/objects ; echo 'a "quoted" | piped' | ./Self -f x"#,
        "printf '%s\\n' \"$HOME\" && exit 3",
        "echo ünïcödé",
    ];
    for command in commands {
        let payload = guest_payload(command, "~/.profile", "bash");
        let hex = encode_command(command);
        assert!(payload.contains(&hex));
        assert_eq!(decode_command(&hex).unwrap(), command);
    }
}
