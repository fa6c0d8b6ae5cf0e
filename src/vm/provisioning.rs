//! Getting files into and out of the guest, and one-time guest setup.
//!
//! Source sync always replaces the guest copy wholesale: the previous tree is
//! deleted first and rsync compares contents, not timestamps. A VM that was
//! killed mid-build can leave files whose metadata looks current while their
//! contents are not.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::vm::remote_channel::{RemoteChannel, Verbosity};
use crate::vm::session::Session;

#[derive(Clone)]
pub struct Provisioner {
    channel: RemoteChannel,
    build: BuildConfig,
}

impl Provisioner {
    pub fn new(channel: RemoteChannel, build: BuildConfig) -> Self {
        Self { channel, build }
    }

    /// Replace the guest's copy of `source` and hand it to the guest user.
    ///
    /// # Errors
    ///
    /// When rsync (or sshpass) cannot be started. A partial transfer is only
    /// recorded in the run log; the build stage will notice missing files.
    pub async fn sync_sources(&self, session: &Session, source: &Path) -> Result<()> {
        let dest = &self.build.guest_source_dir;
        if !session.quiet {
            println!("Syncing sources from {}", source.display());
        }

        self.channel
            .execute(session, &format!("rm -rf {dest}"), Verbosity::Stage)
            .await?;

        let source = source
            .to_str()
            .context("source path contains non-UTF-8 characters")?;
        let invocation = self.channel.transport().push_tree(session.port, source, dest);
        session
            .log
            .heading(&self.channel.transport().describe(&invocation))
            .await?;

        let out = self
            .channel
            .host()
            .run(&invocation)
            .await
            .with_context(|| format!("start source transfer into {}", session.target()))?;
        session.log.append(&out.combined()).await?;
        if out.success() {
            info!(guest = session.target(), port = session.port, "sources synced");
        } else {
            warn!(guest = session.target(), code = ?out.code, "rsync reported a failed transfer");
        }

        let user = &self.channel.transport().guest().user;
        self.channel
            .execute(
                session,
                &format!("{} -R {user} {dest}", session.profile.chown),
                Verbosity::Stage,
            )
            .await?;
        Ok(())
    }

    /// Copy the built artifact into the target's working directory.
    ///
    /// Returns whether the copy succeeded; callers treat this as best-effort.
    pub async fn extract_artifact(&self, session: &Session) -> Result<bool> {
        let artifact = self.build.artifact_path();
        let dest = session.working_dir.display().to_string();
        let invocation = self.channel.transport().pull_file(session.port, &artifact, &dest);
        if !session.quiet {
            println!("Fetching {artifact}");
        }
        session
            .log
            .heading(&self.channel.transport().describe(&invocation))
            .await?;

        let out = self
            .channel
            .host()
            .run(&invocation)
            .await
            .with_context(|| format!("start artifact transfer from {}", session.target()))?;
        session.log.append(&out.combined()).await?;
        Ok(out.success())
    }

    /// Install the packages a freshly installed guest needs.
    pub async fn initialise_os(&self, session: &Session) -> Result<()> {
        for command in session.profile.package_install {
            self.channel.execute(session, command, Verbosity::Stage).await?;
        }
        Ok(())
    }

    /// Profile-specific preparation before each build.
    pub async fn per_run_setup(&self, session: &Session) -> Result<()> {
        for command in session.profile.per_run_setup {
            self.channel.execute(session, command, Verbosity::Stage).await?;
        }
        Ok(())
    }
}
