//! Deadline supervision for one target cycle.
//!
//! The cycle runs in its own tokio task. When the deadline expires the task is
//! aborted (in-flight ssh/rsync children die with it, see `kill_on_drop` in
//! [`crate::vm::host`]) and cleanup proceeds against a clone of the same
//! session, whatever state the worker left it in:
//!
//! ```text
//! poweroff        bounded by grace
//! wait_for_exit   bounded by grace
//! SIGTERM + wait  bounded by grace
//! SIGKILL + wait  unbounded
//! ```
//!
//! The log is classified afterwards in every case, but only content written
//! by this cycle counts: a log still carrying an earlier run's banner reads
//! as empty. Cleanup only touches a hypervisor this session launched.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::time::{Instant, timeout};
use tracing::{error, info, warn};

use crate::pipeline::Classification;
use crate::vm::session::Session;
use crate::workflow::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The cycle ran to the end, including wait-for-exit.
    Completed,
    /// The cycle stopped on an error before the end.
    Failed(String),
    /// The deadline expired and the worker was aborted.
    TimedOut,
}

/// What one supervised cycle produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: &'static str,
    pub outcome: Outcome,
    pub classification: Classification,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
}

impl RunReport {
    /// `<target>: built OK|FAILED, tested OK|FAILED`
    pub fn summary_line(&self) -> String {
        format!("{}: {}", self.target, self.classification)
    }
}

#[derive(Clone)]
pub struct Supervisor {
    orchestrator: Orchestrator,
    deadline: Option<Duration>,
    grace: Duration,
}

impl Supervisor {
    /// `deadline: None` runs the cycle unbounded.
    pub fn new(orchestrator: Orchestrator, deadline: Option<Duration>, grace: Duration) -> Self {
        Self {
            orchestrator,
            deadline,
            grace,
        }
    }

    /// Run one compile cycle for `session` and classify its log.
    pub async fn run(&self, session: Session) -> RunReport {
        let started_at = Local::now();
        let start = Instant::now();

        let mut worker = {
            let orchestrator = self.orchestrator.clone();
            let session = session.clone();
            tokio::spawn(async move { orchestrator.compile_cycle(&session).await })
        };

        let joined = match self.deadline {
            Some(deadline) => timeout(deadline, &mut worker).await.ok(),
            None => Some((&mut worker).await),
        };

        let outcome = match joined {
            Some(Ok(Ok(()))) => Outcome::Completed,
            Some(Ok(Err(e))) => {
                let message = format!("{e:#}");
                error!(guest = session.target(), error = %message, "cycle failed");
                // A failed launch can still leave a daemonized hypervisor behind.
                self.reclaim(&session).await;
                Outcome::Failed(message)
            }
            Some(Err(join)) => {
                error!(guest = session.target(), error = %join, "cycle task died");
                self.reclaim(&session).await;
                Outcome::Failed(format!("cycle task died: {join}"))
            }
            None => {
                warn!(guest = session.target(), deadline = ?self.deadline, "deadline expired, aborting cycle");
                worker.abort();
                // Let the abort land so the worker's children are dropped.
                let _ = worker.await;
                self.reclaim(&session).await;
                Outcome::TimedOut
            }
        };

        // A log the cycle never truncated is an earlier run's record.
        let log = match session.log.read_since(started_at.with_timezone(&Utc)).await {
            Ok(text) => text,
            Err(e) => {
                warn!(guest = session.target(), error = %e, "run log unreadable");
                String::new()
            }
        };
        let classification = self.orchestrator.pipeline().classify(&log);

        let report = RunReport {
            target: session.target(),
            outcome,
            classification,
            started_at,
            elapsed: start.elapsed(),
        };
        info!(
            guest = report.target,
            outcome = ?report.outcome,
            built = classification.built,
            tested = classification.tested,
            elapsed_secs = report.elapsed.as_secs(),
            "cycle finished"
        );
        report
    }

    /// Make sure the session's hypervisor is gone.
    async fn reclaim(&self, session: &Session) {
        let lifecycle = self.orchestrator.lifecycle();
        if !lifecycle.has_hypervisor(session).await {
            return;
        }

        match timeout(self.grace, lifecycle.poweroff(session)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(guest = session.target(), error = %e, "poweroff failed during cleanup"),
            Err(_) => warn!(guest = session.target(), "poweroff did not return within grace period"),
        }
        if self.bounded_wait(session).await {
            return;
        }

        if let Err(e) = lifecycle.terminate(session, false).await {
            warn!(guest = session.target(), error = %e, "SIGTERM failed");
        }
        if self.bounded_wait(session).await {
            return;
        }

        if let Err(e) = lifecycle.terminate(session, true).await {
            error!(guest = session.target(), error = %e, "SIGKILL failed");
        }
        if let Err(e) = lifecycle.wait_for_exit(session).await {
            error!(guest = session.target(), error = %e, "hypervisor exit could not be confirmed");
        }
    }

    async fn bounded_wait(&self, session: &Session) -> bool {
        match timeout(self.grace, self.orchestrator.lifecycle().wait_for_exit(session)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(guest = session.target(), error = %e, "wait for exit failed");
                // No PID left to wait on.
                !self.orchestrator.lifecycle().has_hypervisor(session).await
            }
            Err(_) => {
                warn!(guest = session.target(), grace = ?self.grace, "hypervisor still running");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_names_target_and_both_markers() {
        let report = RunReport {
            target: "FreeBSD",
            outcome: Outcome::TimedOut,
            classification: Classification { built: false, tested: false },
            started_at: Local::now(),
            elapsed: Duration::from_secs(7200),
        };
        assert_eq!(report.summary_line(), "FreeBSD: built FAILED, tested FAILED");
    }
}
