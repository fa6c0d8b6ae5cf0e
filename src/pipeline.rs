//! The fixed build-and-test pipeline run inside a booted guest, and the
//! classification of its run log.
//!
//! Stage order (the run log was truncated before the VM booted):
//!
//! 1. sync sources, profile setup commands
//! 2. build-environment identity
//! 3. clean and recreate the build directory
//! 4. configure
//! 5. build
//! 6. automated test run of the built artifact
//! 7. copy the artifact to the host (best-effort)
//!
//! No stage checks the previous stage's exit status. Whether the run built and
//! whether the tests ran to the end is read back from the log afterwards.

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::config::BuildConfig;
use crate::vm::provisioning::Provisioner;
use crate::vm::remote_channel::{RemoteChannel, Verbosity};
use crate::vm::run_log::HEADING_PREFIX;
use crate::vm::session::Session;

/// Guest commands that identify the build environment.
const ENVIRONMENT_PROBES: &[&str] = &[
    "echo ------------------------------------------------------------",
    "echo BUILDING: $(date)",
    "echo OS: $(uname -a)",
    "echo GIT: $(git --version)",
    "echo CMAKE: $(cmake --version)",
    "echo CC: $(cc --version)",
    "echo ------------------------------------------------------------",
];

/// Outcome read back from a run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// The build marker was seen.
    pub built: bool,
    /// The test-run end sentinel was seen.
    pub tested: bool,
}

impl Classification {
    pub fn passed(&self) -> bool {
        self.built && self.tested
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = |ok: bool| if ok { "OK" } else { "FAILED" };
        write!(f, "built {}, tested {}", word(self.built), word(self.tested))
    }
}

/// Look for the two markers in the command output recorded in `log`.
///
/// Heading lines are skipped so a marker that appears in a command's own
/// text cannot count as output.
pub fn classify(log: &str, build_marker: &str, test_marker: &str) -> Classification {
    let mut result = Classification::default();
    for line in log.lines().filter(|l| !l.starts_with(HEADING_PREFIX)) {
        result.built |= line.contains(build_marker);
        result.tested |= line.contains(test_marker);
        if result.passed() {
            break;
        }
    }
    result
}

/// Single-quote `s` for a POSIX shell.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Clone)]
pub struct Pipeline {
    channel: RemoteChannel,
    provisioner: Provisioner,
    build: BuildConfig,
}

impl Pipeline {
    pub fn new(channel: RemoteChannel, provisioner: Provisioner, build: BuildConfig) -> Self {
        Self {
            channel,
            provisioner,
            build,
        }
    }

    pub fn classify(&self, log: &str) -> Classification {
        classify(log, &self.build.build_marker, &self.build.test_marker)
    }

    async fn run(&self, session: &Session, command: &str) -> Result<()> {
        self.channel.execute(session, command, Verbosity::Stage).await?;
        Ok(())
    }

    /// Run every stage against a booted, reachable guest.
    ///
    /// # Errors
    ///
    /// Only transport and log failures. Artifact extraction failures are
    /// warned about and otherwise ignored.
    pub async fn compile(&self, session: &Session, source: &Path) -> Result<()> {
        self.provisioner.sync_sources(session, source).await?;
        self.provisioner.per_run_setup(session).await?;

        self.log_environment(session).await?;
        self.clean_build_dir(session).await?;
        self.configure(session).await?;
        self.build(session).await?;
        self.run_tests(session).await?;

        match self.provisioner.extract_artifact(session).await {
            Ok(true) => {}
            Ok(false) => warn!(guest = session.target(), "artifact extraction failed"),
            Err(e) => warn!(guest = session.target(), error = %e, "artifact extraction could not run"),
        }
        Ok(())
    }

    pub async fn log_environment(&self, session: &Session) -> Result<()> {
        for probe in ENVIRONMENT_PROBES {
            self.channel.execute(session, probe, Verbosity::Stage).await?;
        }
        Ok(())
    }

    pub async fn clean_build_dir(&self, session: &Session) -> Result<()> {
        let dir = &self.build.guest_build_dir;
        self.run(session, &format!("rm -rf {dir} ; mkdir -p {dir}")).await
    }

    pub async fn configure(&self, session: &Session) -> Result<()> {
        let profile = &session.profile;
        let mut command = format!("cd {} ; ", self.build.guest_build_dir);
        if !profile.env_flags.is_empty() {
            command.push_str(profile.env_flags);
            command.push(' ');
        }
        command.push_str("cmake ");
        if !profile.cmake_options.is_empty() {
            command.push_str(profile.cmake_options);
            command.push(' ');
        }
        command.push_str(&self.build.guest_source_dir);
        self.run(session, &command).await
    }

    pub async fn build(&self, session: &Session) -> Result<()> {
        let command = format!("cd {} ; cmake --build .", self.build.guest_build_dir);
        self.run(session, &command).await
    }

    pub async fn run_tests(&self, session: &Session) -> Result<()> {
        self.run(session, &self.test_command()).await
    }

    fn test_command(&self) -> String {
        let mut command = format!(
            "cd {}/{} ; echo {} | {}",
            self.build.guest_source_dir,
            self.build.test_dir,
            sh_quote(&self.build.test_script),
            self.build.artifact_path()
        );
        for arg in &self.build.test_args {
            command.push(' ');
            command.push_str(&sh_quote(arg));
        }
        command
    }
}
