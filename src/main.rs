//! guestbuild: VM build-test orchestrator.
//!
//! ```text
//! guestbuild [--config FILE] [--source DIR] [--quiet] <target> <action>
//! ```
//!
//! `target` is a catalog name (case-insensitive) or `all`; `action` is one of
//! install, boot, compile, summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::error::ErrorKind;

use guestbuild::config::Config;
use guestbuild::profiles::{self, TargetProfile};
use guestbuild::vm::host::SystemHost;
use guestbuild::workflow::{Action, Orchestrator, run_action};
use guestbuild::logging;

/// Build and test a source tree inside guest VMs
#[derive(Parser, Debug)]
#[command(name = "guestbuild", version, about = "Build and test a source tree inside guest VMs")]
struct Args {
    /// Guest profile name, or `all`
    target: String,

    /// What to do with the target
    #[arg(value_enum)]
    action: Action,

    /// Configuration file (default: ~/.config/guestbuild/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host source tree to build, overrides `source_dir`
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Only print the final result line per target
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit();
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    // summary prints nothing but its result lines.
    let _log_guard = logging::init(args.quiet || args.action == Action::Summary);

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.source_dir = source;
    }

    let Some(targets) = profiles::resolve(&args.target) else {
        let known: Vec<_> = profiles::catalog().iter().map(|p| p.name).collect();
        eprintln!("Unknown target: {} (expected all, {})", args.target, known.join(", "));
        std::process::exit(1);
    };

    let missing = missing_prerequisites(args.action, &targets);
    if !missing.is_empty() {
        eprintln!("Missing host programs: {}", missing.join(", "));
        std::process::exit(1);
    }

    if matches!(args.action, Action::Compile | Action::Summary) && !config.source_dir.is_dir() {
        bail!("source directory {} does not exist", config.source_dir.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let orchestrator = Orchestrator::new(config, Arc::new(SystemHost));
    runtime.block_on(run_action(&orchestrator, &targets, args.action, args.quiet))?;
    Ok(())
}

/// Host programs needed for `action` on `targets` that are not on `PATH`.
fn missing_prerequisites(action: Action, targets: &[TargetProfile]) -> Vec<String> {
    let mut wanted: Vec<&str> = action.prerequisites().to_vec();
    for profile in targets {
        if !wanted.contains(&profile.hypervisor) {
            wanted.push(profile.hypervisor);
        }
    }
    wanted
        .into_iter()
        .filter(|program| which::which(program).is_err())
        .map(str::to_string)
        .collect()
}
