//! Data structures for tracking orchestrated processes.
//!
//! This module defines the unit of work handed to the process manager
//! (`RunTask`), the tracked runtime state (`RunningProcess`), and the
//! outcome/status types the manager reports.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::docker::{ComposeInfo, NpmDockerInfo};
use crate::resolve::RunOptions;

/// Composite key for the tracking map: one live entry per repository and
/// logical command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    /// Repository name.
    pub repo: String,
    /// Logical command (`dev`, `build`, ...).
    pub command: String,
}

impl ProcessKey {
    pub fn new(repo: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            command: command.into(),
        }
    }
}

/// A fully resolved unit of work: one command against one repository.
#[derive(Debug, Clone)]
pub struct RunTask {
    /// Repository name (tracking key and console prefix).
    pub repo: String,
    /// Repository working directory.
    pub repo_path: PathBuf,
    /// The logical command being run.
    pub command: String,
    /// Resolved argument vector. A leading `compose` token addresses the
    /// `docker` binary.
    pub argv: Vec<String>,
    /// Options for this invocation.
    pub options: RunOptions,
    /// Compose detection result for the repository.
    pub compose: ComposeInfo,
    /// Docker usage detected in the repository's manifest scripts.
    pub npm_docker: NpmDockerInfo,
    /// Whether the command is treated as "started" rather than awaited.
    pub long_running: bool,
}

/// Terminal outcome of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with code 0.
    Completed,
    /// Exited with a non-zero code.
    Failed { code: i32 },
    /// Terminated by a signal (no exit code).
    Signaled,
}

/// Runtime state of one tracked process. Owned by the tracking map; removed
/// on exit, stop, or kill.
#[derive(Debug)]
pub struct RunningProcess {
    /// Repository name.
    pub repo: String,
    /// Logical command.
    pub command: String,
    /// Repository working directory (needed for docker-aware stop).
    pub repo_path: PathBuf,
    /// OS process id.
    pub pid: u32,
    /// Spawn time.
    pub started_at: Instant,
    /// Per-run log file path.
    pub log_file: PathBuf,
    /// Whether the repository is compose-file driven.
    pub is_docker_compose: bool,
    /// The compose file in effect, from either detection path.
    pub compose_file: Option<String>,
    /// Whether the underlying manifest script invokes docker-compose.
    pub npm_uses_docker: bool,
    /// Compose services named by the manifest script.
    pub docker_services: Option<Vec<String>>,
    /// Exit notification; `None` until the process reaches a terminal state.
    pub exit: watch::Receiver<Option<ExitOutcome>>,
}

/// Handle returned by `ProcessManager::start`; await the exit separately.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Tracking key of the started process.
    pub key: ProcessKey,
    pub(crate) exit: watch::Receiver<Option<ExitOutcome>>,
}

impl RunHandle {
    /// Waits for the process to reach a terminal state.
    pub async fn wait(&mut self) -> ExitOutcome {
        loop {
            if let Some(outcome) = *self.exit.borrow() {
                return outcome;
            }
            if self.exit.changed().await.is_err() {
                return ExitOutcome::Signaled;
            }
        }
    }
}

/// Read-only snapshot of one tracking-map entry.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub repo: String,
    pub command: String,
    pub pid: u32,
    pub uptime: Duration,
    pub log_file: PathBuf,
    pub is_docker_compose: bool,
    pub compose_file: Option<String>,
    pub docker_services: Option<Vec<String>>,
}

/// One repository's failure inside a batch.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub repo: String,
    pub error: String,
}

/// Aggregate result of a parallel or sequential batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Number of tasks attempted.
    pub total: usize,
    /// Per-repository failures, in completion order.
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record_failure(&mut self, repo: impl Into<String>, error: impl ToString) {
        self.failures.push(BatchFailure {
            repo: repo.into(),
            error: error.to_string(),
        });
    }
}
