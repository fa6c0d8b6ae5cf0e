//! Guest VM management for guestbuild.
//!
//! Everything needed to drive one guest from the host: the process seam
//! ([`host`]), ssh/rsync command lines ([`transport`]), remote command
//! execution ([`remote_channel`]), the boot gate ([`connectivity`]),
//! hypervisor lifecycle ([`lifecycle`]), file transfer and guest setup
//! ([`provisioning`]), and the per-cycle state they share ([`session`],
//! [`run_log`]).

pub mod connectivity;
pub mod host;
pub mod lifecycle;
pub mod provisioning;
pub mod remote_channel;
pub mod run_log;
pub mod session;
pub mod transport;
