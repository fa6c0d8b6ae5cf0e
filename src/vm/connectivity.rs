//! Wait for the guest's ssh daemon to answer.
//!
//! Boot time depends on the guest OS, the host and whether KVM is in use, so
//! there is no retry limit here. A guest that never comes up is stopped by
//! the run deadline in [`crate::supervisor`].

use std::io::Write;
use std::time::Duration;

use tracing::{debug, info};

use crate::vm::remote_channel::RemoteChannel;
use crate::vm::session::Session;

/// Probe until the guest runs a trivial command. Returns the number of
/// probes made, the last of which succeeded.
pub async fn wait_for_guest(channel: &RemoteChannel, session: &Session, interval: Duration) -> u32 {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if channel.probe(session).await {
            if !session.quiet {
                println!("Connected");
            }
            info!(guest = session.target(), port = session.port, attempts, "guest shell reachable");
            return attempts;
        }

        debug!(guest = session.target(), port = session.port, attempts, "guest not reachable yet");
        if !session.quiet {
            print!(".");
            let _ = std::io::stdout().flush();
        }
        tokio::time::sleep(interval).await;
    }
}
