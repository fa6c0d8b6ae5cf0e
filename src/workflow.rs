//! The user-facing actions and the component wiring behind them.
//!
//! ```text
//! install  image check → installer boot (operator) → boot → packages → shutdown
//! boot     boot → gate → interactive ssh → shutdown
//! compile  boot → gate → pipeline → shutdown, unbounded, verbose
//! summary  same cycle under the deadline, quiet, one line per target
//! ```
//!
//! Every path that booted a VM ends in [`Orchestrator::shutdown`], which only
//! returns once the hypervisor process is gone.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::profiles::TargetProfile;
use crate::supervisor::{Outcome, RunReport, Supervisor};
use crate::vm::connectivity::wait_for_guest;
use crate::vm::host::Host;
use crate::vm::lifecycle::Lifecycle;
use crate::vm::provisioning::Provisioner;
use crate::vm::remote_channel::RemoteChannel;
use crate::vm::session::{Session, allocate_port_except};
use crate::vm::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Run the OS installer from the prepared images, then install build packages.
    Install,
    /// Boot and open an interactive shell in the guest.
    Boot,
    /// Full build-and-test cycle with all output on the console.
    Compile,
    /// Build-and-test cycle under the deadline, one result line per target.
    Summary,
}

impl Action {
    /// Host programs this action needs besides the hypervisors.
    pub fn prerequisites(self) -> &'static [&'static str] {
        match self {
            Action::Install | Action::Boot => &["sshpass", "ssh", "ssh-keygen"],
            Action::Compile | Action::Summary => &["sshpass", "ssh", "ssh-keygen", "rsync"],
        }
    }
}

/// All components for one configuration, cheap to clone into tasks.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    channel: RemoteChannel,
    lifecycle: Lifecycle,
    provisioner: Provisioner,
    pipeline: Pipeline,
}

impl Orchestrator {
    pub fn new(config: Config, host: Arc<dyn Host>) -> Self {
        let channel = RemoteChannel::new(host, Transport::new(config.guest.clone()));
        let lifecycle = Lifecycle::new(
            channel.clone(),
            config.guest.known_hosts.clone(),
            config.timing.exit_poll_interval(),
        );
        let provisioner = Provisioner::new(channel.clone(), config.build.clone());
        let pipeline = Pipeline::new(channel.clone(), provisioner.clone(), config.build.clone());
        Self {
            config: Arc::new(config),
            channel,
            lifecycle,
            provisioner,
            pipeline,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channel(&self) -> &RemoteChannel {
        &self.channel
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// A new session for `profile` with a fresh port.
    pub fn session(&self, profile: &TargetProfile) -> Session {
        Session::new(
            Arc::new(profile.clone()),
            &self.config.work_root,
            self.config.ports,
        )
    }

    /// A session for the same target on a different port than `previous`,
    /// with the same console settings and no hypervisor state.
    pub fn next_session(&self, previous: &Session) -> Session {
        let port = allocate_port_except(self.config.ports, Some(previous.port));
        Session::with_port(previous.profile.clone(), &self.config.work_root, port)
            .quiet(previous.quiet)
    }

    async fn wait_for_guest(&self, session: &Session) -> u32 {
        wait_for_guest(&self.channel, session, self.config.timing.probe_interval()).await
    }

    /// claim → fresh run log → launch → gate → build pipeline → shutdown.
    ///
    /// The log is truncated once the working directory is this cycle's and
    /// before anything can hang. Once the hypervisor is launched the shutdown
    /// runs whatever happened in between.
    pub async fn compile_cycle(&self, session: &Session) -> Result<()> {
        self.lifecycle.claim(session).await?;
        session.log.truncate(session.target()).await?;
        self.lifecycle.launch(session).await?;
        let work = self.build_in_guest(session).await;
        self.finish(session, work).await
    }

    async fn build_in_guest(&self, session: &Session) -> Result<()> {
        self.wait_for_guest(session).await;
        self.pipeline.compile(session, &self.config.source_dir).await
    }

    /// boot → gate → interactive ssh → shutdown.
    pub async fn interactive_cycle(&self, session: &Session) -> Result<()> {
        self.lifecycle.boot(session).await?;
        let work = self.login(session).await;
        self.finish(session, work).await
    }

    async fn login(&self, session: &Session) -> Result<()> {
        self.wait_for_guest(session).await;
        let login = self.channel.transport().interactive(session.port);
        let code = self
            .channel
            .host()
            .run_interactive(&login)
            .await
            .context("start interactive ssh")?;
        info!(guest = session.target(), code = ?code, "interactive session ended");
        Ok(())
    }

    /// Image preparation, operator-driven OS install, then package setup.
    ///
    /// The package boot forwards a different host port than the installer,
    /// whose forward may still be held while its QEMU winds down.
    pub async fn install_cycle(&self, session: &Session) -> Result<()> {
        self.ensure_images(session).await?;

        let installer = session.clone().installing(true);
        self.lifecycle.boot(&installer).await?;
        println!(
            "Install {} in the VM window. Permit password ssh login for {}, \
             make {} its login shell, then power the guest off.",
            session.target(),
            self.config.guest.user,
            session.profile.guest_shell
        );
        self.lifecycle.wait_for_exit(&installer).await?;

        let session = self.next_session(session);
        self.lifecycle.boot(&session).await?;
        let work = self.install_packages(&session).await;
        self.finish(&session, work).await
    }

    async fn install_packages(&self, session: &Session) -> Result<()> {
        self.wait_for_guest(session).await;
        self.provisioner.initialise_os(session).await
    }

    /// Poweroff and wait for the hypervisor to exit. When the poweroff
    /// command cannot even be sent the hypervisor gets SIGTERM instead.
    pub async fn shutdown(&self, session: &Session) -> Result<()> {
        if let Err(e) = self.lifecycle.poweroff(session).await {
            warn!(guest = session.target(), error = %e, "poweroff failed, terminating hypervisor");
            self.lifecycle.terminate(session, false).await?;
        }
        self.lifecycle.wait_for_exit(session).await
    }

    async fn finish(&self, session: &Session, work: Result<()>) -> Result<()> {
        let teardown = self.shutdown(session).await;
        match (work, teardown) {
            (Err(e), Err(t)) => {
                warn!(guest = session.target(), error = %t, "shutdown after failure also failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), teardown) => teardown,
        }
    }

    /// Both images must already be in the working directory; fetching them
    /// is left to the operator.
    async fn ensure_images(&self, session: &Session) -> Result<()> {
        if !exists(&session.installer).await {
            bail!(
                "installer image {} is missing; download it from {}",
                session.installer.display(),
                session.profile.installer_url
            );
        }
        if !exists(&session.disk).await {
            bail!(
                "disk image {} is missing; create it with `qemu-img create -f qcow2 {} 16G`",
                session.disk.display(),
                session.disk.display()
            );
        }
        Ok(())
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Run `action` for every profile in `targets`.
///
/// Install and boot are always sequential. Compile and summary return one
/// report per target; the other actions return none. `quiet` silences
/// compile's console echo; summary is always quiet.
pub async fn run_action(
    orchestrator: &Orchestrator,
    targets: &[TargetProfile],
    action: Action,
    quiet: bool,
) -> Result<Vec<RunReport>> {
    match action {
        Action::Install => {
            for profile in targets {
                orchestrator.install_cycle(&orchestrator.session(profile)).await?;
            }
            Ok(Vec::new())
        }
        Action::Boot => {
            for profile in targets {
                orchestrator.interactive_cycle(&orchestrator.session(profile)).await?;
            }
            Ok(Vec::new())
        }
        Action::Compile => {
            let supervisor = Supervisor::new(
                orchestrator.clone(),
                None,
                orchestrator.config().timing.grace(),
            );
            let reports = supervise(orchestrator, &supervisor, targets, quiet).await?;
            for report in &reports {
                println!("{}", report.summary_line());
                if let Outcome::Failed(reason) = &report.outcome {
                    eprintln!("{}: {reason}", report.target);
                }
            }
            Ok(reports)
        }
        Action::Summary => {
            let timing = &orchestrator.config().timing;
            let supervisor =
                Supervisor::new(orchestrator.clone(), Some(timing.deadline()), timing.grace());
            let reports = supervise(orchestrator, &supervisor, targets, true).await?;
            for report in &reports {
                println!("{}", report.summary_line());
            }
            Ok(reports)
        }
    }
}

async fn supervise(
    orchestrator: &Orchestrator,
    supervisor: &Supervisor,
    targets: &[TargetProfile],
    quiet: bool,
) -> Result<Vec<RunReport>> {
    let sessions: Vec<Session> = targets
        .iter()
        .map(|p| orchestrator.session(p).quiet(quiet))
        .collect();

    if !orchestrator.config().parallel || sessions.len() < 2 {
        let mut reports = Vec::with_capacity(sessions.len());
        for session in sessions {
            reports.push(supervisor.run(session).await);
        }
        return Ok(reports);
    }

    let mut set = JoinSet::new();
    for (index, session) in sessions.into_iter().enumerate() {
        let supervisor = supervisor.clone();
        set.spawn(async move { (index, supervisor.run(session).await) });
    }
    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        reports.push(joined.context("supervisor task died")?);
    }
    // Report in catalog order regardless of finishing order.
    reports.sort_by_key(|(index, _)| *index);
    Ok(reports.into_iter().map(|(_, report)| report).collect())
}
