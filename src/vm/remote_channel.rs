//! Remote command channel: run one shell command inside the guest.
//!
//! The command text never travels as shell source. It is hex-encoded on the
//! host and the guest runs a fixed snippet that decodes and executes it:
//!
//! ```text
//! source ~/.profile > /dev/null 2>&1; echo <hex> | xxd -r -p | bash 2>&1
//! ```
//!
//! The snippet contains only `[0-9a-f]` beyond its fixed text, so quotes,
//! pipes and `$()` in the command reach the guest shell byte-for-byte.
//!
//! Every command is recorded in the run log (heading plus output). The exit
//! status is reported but never turned into an error: interpreting the
//! outcome is left to log classification.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use data_encoding::HEXLOWER;
use tracing::{debug, warn};

use crate::vm::host::{Host, HostOutput};
use crate::vm::session::Session;
use crate::vm::transport::Transport;

/// Console treatment of one command. The run log always gets everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Echo heading and output unless the session is quiet.
    Stage,
    /// Never echo.
    Silent,
}

impl Verbosity {
    fn echoes(self, session: &Session) -> bool {
        match self {
            Verbosity::Stage => !session.quiet,
            Verbosity::Silent => false,
        }
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    /// Remote exit status; `None` when ssh was killed by a signal.
    pub code: Option<i32>,
    /// Combined stdout/stderr of the command.
    pub output: String,
}

impl Executed {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Hex payload for `command`.
pub fn encode_command(command: &str) -> String {
    HEXLOWER.encode(command.as_bytes())
}

/// Inverse of [`encode_command`].
pub fn decode_command(hex: &str) -> Result<String> {
    let bytes = HEXLOWER
        .decode(hex.as_bytes())
        .context("command payload is not lowercase hex")?;
    String::from_utf8(bytes).context("command payload is not UTF-8")
}

/// The guest-side snippet that sources `shell_profile` and runs `command`.
pub fn guest_payload(command: &str, shell_profile: &str, guest_shell: &str) -> String {
    format!(
        "source {shell_profile} > /dev/null 2>&1; echo {} | xxd -r -p | {guest_shell} 2>&1",
        encode_command(command)
    )
}

#[derive(Clone)]
pub struct RemoteChannel {
    host: Arc<dyn Host>,
    transport: Transport,
}

impl RemoteChannel {
    pub fn new(host: Arc<dyn Host>, transport: Transport) -> Self {
        Self { host, transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Run `command` in the guest as the privileged user.
    ///
    /// # Errors
    ///
    /// Only when ssh cannot be spawned or the run log cannot be written.
    /// A failing remote command is returned as [`Executed`] data.
    pub async fn execute(
        &self,
        session: &Session,
        command: &str,
        verbosity: Verbosity,
    ) -> Result<Executed> {
        let echo = verbosity.echoes(session);
        if echo {
            println!("\n> {command}\n");
        }
        session.log.heading(command).await?;

        let profile = &session.profile;
        let payload = guest_payload(command, profile.shell_profile, profile.guest_shell);
        let invocation = self.transport.ssh(session.port, &payload);

        let result = self
            .host
            .run(&invocation)
            .await
            .with_context(|| format!("remote command on {}: {command}", session.target()))?;

        let executed = into_executed(result);
        session.log.append(&executed.output).await?;

        if echo {
            print!("{}", executed.output);
            let _ = std::io::stdout().flush();
        }

        if executed.success() {
            debug!(guest = session.target(), port = session.port, %command, "remote command finished");
        } else {
            warn!(
                guest = session.target(),
                port = session.port,
                code = ?executed.code,
                %command,
                "remote command exited non-zero"
            );
        }
        Ok(executed)
    }

    /// Run `true` in the guest without touching the run log.
    ///
    /// Returns whether the guest answered. Spawn failures count as "not yet".
    pub async fn probe(&self, session: &Session) -> bool {
        let invocation = self.transport.ssh(session.port, "true");
        match self.host.run(&invocation).await {
            Ok(out) => out.success(),
            Err(e) => {
                debug!(port = session.port, error = %e, "connectivity probe could not run");
                false
            }
        }
    }
}

fn into_executed(out: HostOutput) -> Executed {
    Executed {
        code: out.code,
        output: out.combined(),
    }
}
