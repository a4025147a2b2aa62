//! Process execution and management.
//!
//! This module contains the `ProcessManager`, which spawns one OS process per
//! resolved task, tracks it in the session map, multiplexes its output into
//! per-run log files, and implements graceful-then-forced termination plus
//! parallel and sequential batch execution.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::output::{log_file_path, sanitize_text, Reporter, StreamKind};
use crate::process::{
    BatchOutcome, ExitOutcome, ProcessKey, RunHandle, RunTask, RunningProcess, StatusEntry,
};

/// Signals the manager delivers to tracked processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Cooperative termination request.
    Term,
    /// Forced kill, no grace.
    Kill,
}

impl StopSignal {
    fn name(&self) -> &'static str {
        match self {
            StopSignal::Term => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// Grace periods for stop escalation and long-running startup.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// How long a SIGTERM'd process gets before SIGKILL.
    pub stop_grace: Duration,
    /// How long a long-running command is watched before it counts as
    /// started.
    pub startup_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            startup_grace: Duration::from_secs(1),
        }
    }
}

type TrackingMap = Arc<Mutex<HashMap<ProcessKey, RunningProcess>>>;

/// Manages the lifecycle and I/O of per-repository processes.
///
/// The tracking map is shared behind a mutex; it is never held across an
/// await point.
#[derive(Clone)]
pub struct ProcessManager {
    tracked: TrackingMap,
    log_dir: PathBuf,
    timings: Timings,
    reporter: Reporter,
}

// Snapshot taken under the lock so stop work happens without holding it.
struct StopTarget {
    key: ProcessKey,
    pid: u32,
    repo_path: PathBuf,
    compose_stop: Option<String>,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessManager {
    pub fn new(log_dir: PathBuf, timings: Timings, reporter: Reporter) -> Self {
        Self {
            tracked: Arc::new(Mutex::new(HashMap::new())),
            log_dir,
            timings,
            reporter,
        }
    }

    /// Spawns the task's process and registers it in the tracking map.
    ///
    /// Fails without spawning when the repository path does not exist or the
    /// `(repo, command)` key is already active. Exit is awaited separately
    /// through the returned handle.
    pub fn start(&self, task: &RunTask) -> Result<RunHandle> {
        if !task.repo_path.is_dir() {
            bail!(
                "repository not found: {} ({})",
                task.repo,
                task.repo_path.display()
            );
        }
        if task.argv.is_empty() {
            bail!("empty command for {}", task.repo);
        }
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create log dir {}", self.log_dir.display()))?;
        let key = ProcessKey::new(&task.repo, &task.command);
        let log_path = log_file_path(&self.log_dir, &task.repo, &task.command);
        let log_file = std::fs::File::create(&log_path)
            .with_context(|| format!("failed to create log file {}", log_path.display()))?;

        let (program, args) = program_and_args(&task.argv);
        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&task.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);

        // Duplicate check, spawn, and registration happen under one lock;
        // nothing in between awaits.
        let mut child = {
            let mut tracked = self.tracked.lock().unwrap();
            if tracked.contains_key(&key) {
                bail!("{} is already running `{}`", task.repo, task.command);
            }
            let child = command.spawn().with_context(|| {
                format!(
                    "failed to spawn `{}` for {}",
                    shell_words::join(&task.argv),
                    task.repo
                )
            })?;
            let pid = child.id().unwrap_or(0);
            tracked.insert(
                key.clone(),
                RunningProcess {
                    repo: task.repo.clone(),
                    command: task.command.clone(),
                    repo_path: task.repo_path.clone(),
                    pid,
                    started_at: Instant::now(),
                    log_file: log_path.clone(),
                    is_docker_compose: task.compose.is_docker_compose,
                    compose_file: task
                        .compose
                        .compose_file
                        .clone()
                        .or_else(|| task.npm_docker.compose_file.clone()),
                    npm_uses_docker: task.npm_docker.uses_docker,
                    docker_services: task.npm_docker.services.clone(),
                    exit: exit_rx.clone(),
                },
            );
            child
        };

        let writer = Arc::new(Mutex::new(log_file));
        let echo_stdout = task.long_running || task.options.watch;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_stream(
                StreamKind::Stdout,
                stdout,
                writer.clone(),
                task.repo.clone(),
                echo_stdout,
                self.reporter,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stream(
                StreamKind::Stderr,
                stderr,
                writer,
                task.repo.clone(),
                true,
                self.reporter,
            ));
        }

        let tracked = self.tracked.clone();
        let monitor_key = key.clone();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(0) => ExitOutcome::Completed,
                    Some(code) => ExitOutcome::Failed { code },
                    None => ExitOutcome::Signaled,
                },
                Err(_) => ExitOutcome::Signaled,
            };
            tracked.lock().unwrap().remove(&monitor_key);
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(RunHandle { key, exit: exit_rx })
    }

    /// Runs one task to its observable end: long-running commands count as
    /// started once they survive the startup grace, everything else is
    /// awaited to exit.
    pub async fn run_single(&self, task: RunTask) -> Result<()> {
        self.reporter.tool(format!(
            "{}: {}",
            task.repo,
            shell_words::join(&task.argv)
        ));
        let mut handle = self.start(&task)?;
        if task.long_running {
            return match tokio::time::timeout(self.timings.startup_grace, handle.wait()).await {
                Ok(ExitOutcome::Completed) => {
                    self.reporter
                        .tool(format!("{}: `{}` exited immediately", task.repo, task.command));
                    Ok(())
                }
                Ok(ExitOutcome::Failed { code }) => {
                    bail!("`{}` exited with code {} during startup", task.command, code)
                }
                Ok(ExitOutcome::Signaled) => {
                    bail!("`{}` was terminated during startup", task.command)
                }
                Err(_) => {
                    self.reporter
                        .tool(format!("{}: `{}` started", task.repo, task.command));
                    Ok(())
                }
            };
        }
        match handle.wait().await {
            ExitOutcome::Completed => {
                self.reporter
                    .tool(format!("{}: `{}` completed", task.repo, task.command));
                Ok(())
            }
            ExitOutcome::Failed { code } => bail!("`{}` exited with code {}", task.command, code),
            ExitOutcome::Signaled => bail!("`{}` was terminated by a signal", task.command),
        }
    }

    /// Fan-out across all tasks, wait for all, aggregate failures.
    pub async fn run_parallel(&self, tasks: Vec<RunTask>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            total: tasks.len(),
            ..Default::default()
        };
        let mut set = JoinSet::new();
        for task in tasks {
            let manager = self.clone();
            set.spawn(async move {
                let repo = task.repo.clone();
                let result = manager.run_single(task).await;
                (repo, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((repo, Err(err))) => {
                    self.reporter.tool_err(format!("{}: {:#}", repo, err));
                    outcome.record_failure(repo, format!("{:#}", err));
                }
                Err(err) => outcome.record_failure("(task)", err),
            }
        }
        outcome
    }

    /// Strictly ordered execution; a failing repository is reported and the
    /// batch continues.
    pub async fn run_sequential(&self, tasks: Vec<RunTask>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            let repo = task.repo.clone();
            if let Err(err) = self.run_single(task).await {
                self.reporter
                    .tool_err(format!("{}: {:#} (continuing)", repo, err));
                outcome.record_failure(repo, format!("{:#}", err));
            }
        }
        outcome
    }

    /// Stops every tracked process.
    pub async fn stop_all(&self) -> BatchOutcome {
        self.stop_matching(None).await
    }

    /// Stops tracked processes belonging to the named repositories.
    pub async fn stop_repositories(&self, names: &[String]) -> BatchOutcome {
        self.stop_matching(Some(names)).await
    }

    async fn stop_matching(&self, names: Option<&[String]>) -> BatchOutcome {
        let targets: Vec<StopTarget> = {
            let tracked = self.tracked.lock().unwrap();
            tracked
                .values()
                .filter(|process| match names {
                    Some(names) => names.iter().any(|name| *name == process.repo),
                    None => true,
                })
                .map(|process| StopTarget {
                    key: ProcessKey::new(&process.repo, &process.command),
                    pid: process.pid,
                    repo_path: process.repo_path.clone(),
                    compose_stop: if process.is_docker_compose || process.npm_uses_docker {
                        process.compose_file.clone()
                    } else {
                        None
                    },
                    exit: process.exit.clone(),
                })
                .collect()
        };
        let mut outcome = BatchOutcome {
            total: targets.len(),
            ..Default::default()
        };
        // Every stop runs to completion; one repository's failure never
        // blocks the others.
        let mut set = JoinSet::new();
        for target in targets {
            let manager = self.clone();
            set.spawn(async move {
                let repo = target.key.repo.clone();
                let result = manager.stop_one(target).await;
                (repo, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((repo, Err(err))) => {
                    self.reporter.tool_err(format!("{}: {:#}", repo, err));
                    outcome.record_failure(repo, format!("{:#}", err));
                }
                Err(err) => outcome.record_failure("(task)", err),
            }
        }
        outcome
    }

    async fn stop_one(&self, mut target: StopTarget) -> Result<()> {
        let mut compose_error = None;
        if let Some(file) = &target.compose_stop {
            let status = Command::new("docker")
                .args(["compose", "-f", file, "stop"])
                .current_dir(&target.repo_path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if status.success() => {
                    self.reporter
                        .tool(format!("{}: docker compose stop", target.key.repo));
                }
                Ok(status) => {
                    compose_error = Some(format!(
                        "docker compose stop exited with code {}",
                        status.code().unwrap_or(1)
                    ));
                }
                Err(err) => {
                    compose_error = Some(format!("docker compose stop failed: {}", err));
                }
            }
        }

        if target.exit.borrow().is_none() {
            send_os_signal(target.pid, StopSignal::Term);
            let exited = tokio::time::timeout(self.timings.stop_grace, wait_outcome(&mut target.exit))
                .await
                .is_ok();
            if !exited {
                send_os_signal(target.pid, StopSignal::Kill);
                let _ =
                    tokio::time::timeout(Duration::from_secs(1), wait_outcome(&mut target.exit))
                        .await;
                self.reporter.tool(format!(
                    "{}: `{}` forced kill after grace period",
                    target.key.repo, target.key.command
                ));
            } else {
                self.reporter.tool(format!(
                    "{}: `{}` stopped",
                    target.key.repo, target.key.command
                ));
            }
        }
        self.tracked.lock().unwrap().remove(&target.key);

        if let Some(error) = compose_error {
            bail!(error);
        }
        Ok(())
    }

    /// Signals every tracked process with no grace period and drains the
    /// tracking map regardless of delivery.
    pub fn kill_all(&self, force: bool) -> usize {
        let drained: HashMap<ProcessKey, RunningProcess> =
            std::mem::take(&mut *self.tracked.lock().unwrap());
        let signal = if force {
            StopSignal::Kill
        } else {
            StopSignal::Term
        };
        let count = drained.len();
        for (key, process) in drained {
            send_os_signal(process.pid, signal);
            self.reporter.tool(format!(
                "{}: sent {} to `{}` (pid {})",
                key.repo,
                signal.name(),
                key.command,
                process.pid
            ));
        }
        count
    }

    /// Read-only snapshot of the tracking map, sorted by repository.
    pub fn status(&self) -> Vec<StatusEntry> {
        let tracked = self.tracked.lock().unwrap();
        let mut entries: Vec<StatusEntry> = tracked
            .values()
            .map(|process| StatusEntry {
                repo: process.repo.clone(),
                command: process.command.clone(),
                pid: process.pid,
                uptime: process.started_at.elapsed(),
                log_file: process.log_file.clone(),
                is_docker_compose: process.is_docker_compose,
                compose_file: process.compose_file.clone(),
                docker_services: process.docker_services.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.repo, &a.command).cmp(&(&b.repo, &b.command)));
        entries
    }
}

// A resolved argv leads with `compose` for compose-managed repositories; the
// actual program is the docker CLI.
fn program_and_args(argv: &[String]) -> (String, Vec<String>) {
    if argv.first().map(String::as_str) == Some("compose") {
        ("docker".to_string(), argv.to_vec())
    } else {
        (argv[0].clone(), argv[1..].to_vec())
    }
}

async fn wait_outcome(exit: &mut watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    loop {
        if let Some(outcome) = *exit.borrow() {
            return outcome;
        }
        if exit.changed().await.is_err() {
            return ExitOutcome::Signaled;
        }
    }
}

async fn forward_stream<R>(
    stream: StreamKind,
    reader: R,
    writer: Arc<Mutex<std::fs::File>>,
    repo: String,
    echo: bool,
    reporter: Reporter,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let clean = sanitize_text(&line);
        {
            let mut writer = writer.lock().unwrap();
            let _ = writeln!(writer, "{} {}", stream.tag(), clean);
        }
        if echo {
            match stream {
                StreamKind::Stdout => reporter.repo_line(&repo, &line),
                StreamKind::Stderr => reporter.repo_err(&repo, &line),
            }
        }
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: StopSignal) {
    // pid 0 would address our own process group.
    if pid == 0 {
        return;
    }
    unsafe {
        let sig = match signal {
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as i32;
        // The process leads its own group; signal the group first, then the
        // leader in case setpgid did not take.
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: StopSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: StopSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGKILL; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: StopSignal) {}
