//! Tracing setup for guestbuild.
//!
//! Stage headings and command output are console text, not tracing events;
//! tracing carries the orchestrator's own diagnostics (ports, PIDs, retries,
//! cleanup escalation).
//!
//! Two layers, each with its own filter:
//!
//! - stderr, filtered by `RUST_LOG` or else by [`console_directive`]. A quiet
//!   run keeps the console to its result lines, so only errors get through.
//! - `guestbuild.log` in [`crate::paths::log_dir`], only with
//!   `GUESTBUILD_LOG=1`, always at debug for this crate regardless of the
//!   console level.

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths;

const FILE_NAME: &str = "guestbuild.log";
const FILE_DIRECTIVE: &str = "info,guestbuild=debug";

/// Keeps the file writer's worker alive; buffered lines are flushed on drop.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Default stderr filter when `RUST_LOG` is unset.
pub fn console_directive(quiet: bool) -> &'static str {
    if quiet { "error" } else { "warn,guestbuild=info" }
}

fn console_filter(quiet: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_directive(quiet)))
}

fn file_requested() -> bool {
    std::env::var("GUESTBUILD_LOG").as_deref() == Ok("1")
}

fn file_writer(dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(FILE_NAME)
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber. Call once from `main` and hold the guard
/// until exit.
///
/// `quiet` selects the console default: `summary` and `--quiet` runs pass
/// `true`.
pub fn init(quiet: bool) -> LogGuard {
    // Reported once the subscriber exists.
    let mut file_problem = None;
    let mut file_guard = None;

    let file_layer = if file_requested() {
        match paths::log_dir() {
            Some(dir) => match file_writer(&dir) {
                Ok((writer, guard)) => {
                    file_guard = Some(guard);
                    Some(
                        fmt::layer()
                            .with_writer(writer)
                            .with_ansi(false)
                            .with_filter(EnvFilter::new(FILE_DIRECTIVE)),
                    )
                }
                Err(e) => {
                    file_problem = Some(format!("cannot open log in {}: {e:#}", dir.display()));
                    None
                }
            },
            None => {
                file_problem = Some("no log directory ($HOME is unset)".to_string());
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter(quiet)),
        )
        .with(file_layer)
        .init();

    if let Some(problem) = file_problem {
        tracing::warn!(%problem, "GUESTBUILD_LOG=1 ignored");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}
