//! devrack: workspace lifecycle-command runner.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the workspace configuration, wires the detectors and the
//! resolver into the process manager, and drives batch or session execution.

mod config;
mod docker;
mod output;
mod package_manager;
mod process;
mod resolve;
mod runner;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::config::Workspace;
use crate::docker::DockerDetector;
use crate::output::Reporter;
use crate::package_manager::PackageManagerDetector;
use crate::process::{BatchOutcome, RunTask};
use crate::resolve::{CommandResolver, RunOptions};
use crate::runner::{ProcessManager, Timings};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Run lifecycle commands across workspace repositories",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the log directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    /// Target environment (dev, prod, ...).
    #[arg(long, global = true)]
    env: Option<String>,
    /// Run repositories one at a time instead of in parallel.
    #[arg(long, global = true)]
    sequential: bool,
    /// Keep the underlying runner in watch mode.
    #[arg(long, global = true)]
    watch: bool,
    /// Ask the linter to apply fixes.
    #[arg(long, global = true)]
    fix: bool,
    /// Remove volumes and orphans on `down`.
    #[arg(long, global = true)]
    volumes: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Start development servers (stays in the foreground).
    Dev { repos: Vec<String> },
    /// Start services (dev servers in dev, detached containers in prod).
    Start { repos: Vec<String> },
    /// Build repositories.
    Build { repos: Vec<String> },
    /// Run tests.
    Test { repos: Vec<String> },
    /// Run linters.
    Lint { repos: Vec<String> },
    /// Install dependencies with each repository's package manager.
    Install { repos: Vec<String> },
    /// Stop services.
    Stop { repos: Vec<String> },
    /// Tear down compose stacks.
    Down { repos: Vec<String> },
    /// Show or follow a repository's logs.
    Logs {
        repo: String,
        /// Keep following the log file.
        #[arg(long)]
        follow: bool,
    },
    /// Signal every process tracked in this session.
    Kill {
        /// Send SIGKILL instead of SIGTERM.
        #[arg(long)]
        force: bool,
    },
    /// Show tracked processes.
    Status,
    /// Any other name resolves as a repository script.
    #[command(external_subcommand)]
    Run(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config::find_config(cli.config.as_deref())?;
    let workspace = Workspace::from_config(config::load_config(&config_path)?);
    let reporter = Reporter::new(workspace.symbols);
    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| workspace.log_dir.clone());

    let docker = DockerDetector::new();
    let resolver = CommandResolver::new(PackageManagerDetector::new());
    let manager = ProcessManager::new(
        log_dir.clone(),
        Timings {
            stop_grace: workspace.stop_grace,
            ..Timings::default()
        },
        reporter,
    );

    let options = RunOptions {
        environment: cli
            .env
            .clone()
            .unwrap_or_else(|| workspace.environment.clone()),
        parallel: !cli.sequential,
        watch: cli.watch,
        fix: cli.fix,
        volumes: cli.volumes,
    };

    let (command, repos) = match cli.command.clone() {
        Commands::Status => {
            show_status(&manager, reporter);
            return Ok(());
        }
        Commands::Kill { force } => {
            if manager.kill_all(force) == 0 {
                reporter.tool("no processes tracked in this session");
            }
            return Ok(());
        }
        Commands::Logs { repo, follow } => {
            return run_logs(
                &workspace, &docker, &resolver, &manager, &options, &log_dir, reporter, &repo,
                follow,
            )
            .await;
        }
        Commands::Dev { repos } => ("dev".to_string(), repos),
        Commands::Start { repos } => ("start".to_string(), repos),
        Commands::Build { repos } => ("build".to_string(), repos),
        Commands::Test { repos } => ("test".to_string(), repos),
        Commands::Lint { repos } => ("lint".to_string(), repos),
        Commands::Install { repos } => ("install".to_string(), repos),
        Commands::Stop { repos } => ("stop".to_string(), repos),
        Commands::Down { repos } => ("down".to_string(), repos),
        Commands::Run(mut args) => {
            // external_subcommand guarantees at least the command name.
            let command = args.remove(0);
            (command, args)
        }
    };

    let (selected, unknown) = workspace.select(&repos);
    for name in &unknown {
        reporter.tool_err(format!("unknown repository: {}", name));
    }
    if selected.is_empty() {
        bail!("no matching repositories");
    }

    let mut tasks = Vec::with_capacity(selected.len());
    for repo in selected {
        let compose = docker.detect_compose(&repo.path);
        let npm_docker = docker.detect_npm_docker_usage(&repo.path, &command);
        let argv = resolver
            .resolve(&command, &options, &compose, Some(&repo.path))
            .await;
        tasks.push(RunTask {
            repo: repo.name.clone(),
            repo_path: repo.path.clone(),
            command: command.clone(),
            argv,
            options: options.clone(),
            compose,
            npm_docker,
            long_running: resolver.is_long_running(&command),
        });
    }

    let session = tasks.iter().any(|task| task.long_running);
    let outcome = if session {
        let outcome = if options.parallel {
            manager.run_parallel(tasks).await
        } else {
            manager.run_sequential(tasks).await
        };
        if !manager.status().is_empty() {
            show_status(&manager, reporter);
            run_session(&manager, reporter).await;
        }
        outcome
    } else if options.parallel {
        manager.run_parallel(tasks).await
    } else {
        manager.run_sequential(tasks).await
    };

    finish(outcome, unknown)
}

/// Converts the aggregated batch result into the process exit status.
fn finish(outcome: BatchOutcome, unknown: Vec<String>) -> Result<()> {
    let failed = outcome.failures.len() + unknown.len();
    if failed > 0 {
        bail!(
            "{} of {} repositories failed",
            failed,
            outcome.total + unknown.len()
        );
    }
    Ok(())
}

/// Foreground session for long-running commands: stream output until every
/// process exits or a shutdown signal arrives, then stop gracefully.
async fn run_session(manager: &ProcessManager, reporter: Reporter) {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<&'static str>(1);
    spawn_signal_listener(shutdown_tx);
    reporter.tool("press Ctrl-C to stop all repositories");

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            Some(signal) = shutdown_rx.recv() => {
                reporter.tool(format!("received {}, stopping all repositories", signal));
                manager.stop_all().await;
                break;
            }
            _ = ticker.tick() => {
                if manager.status().is_empty() {
                    reporter.tool("all processes exited");
                    break;
                }
            }
        }
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<&'static str>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send("SIGINT").await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send("SIGTERM").await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send("Ctrl-C").await;
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_logs(
    workspace: &Workspace,
    docker: &DockerDetector,
    resolver: &CommandResolver,
    manager: &ProcessManager,
    options: &RunOptions,
    log_dir: &std::path::Path,
    reporter: Reporter,
    repo_name: &str,
    follow: bool,
) -> Result<()> {
    let Some(repo) = workspace.repo(repo_name) else {
        bail!("unknown repository: {}", repo_name);
    };
    let compose = docker.detect_compose(&repo.path);
    if compose.is_docker_compose {
        // Compose repos stream `docker compose logs -f` in the foreground.
        let argv = resolver
            .resolve("logs", options, &compose, Some(&repo.path))
            .await;
        let task = RunTask {
            repo: repo.name.clone(),
            repo_path: repo.path.clone(),
            command: "logs".to_string(),
            argv,
            options: options.clone(),
            compose,
            npm_docker: Default::default(),
            long_running: true,
        };
        manager.run_single(task).await?;
        run_session(manager, reporter).await;
        return Ok(());
    }
    let Some(path) = output::newest_log(log_dir, &repo.name) else {
        bail!(
            "no log files for {} in {}",
            repo.name,
            log_dir.display()
        );
    };
    reporter.tool(format!("tailing {}", path.display()));
    output::tail_log(&path, follow).await
}

fn show_status(manager: &ProcessManager, reporter: Reporter) {
    let entries = manager.status();
    if entries.is_empty() {
        reporter.tool("no processes running");
        return;
    }
    println!(
        "{:<20} {:<12} {:>8} {:>8}  {}",
        "REPO", "COMMAND", "PID", "UPTIME", "LOG"
    );
    for entry in entries {
        let mut notes = String::new();
        if entry.is_docker_compose {
            if let Some(file) = &entry.compose_file {
                notes = format!(" (compose: {})", file);
            }
        }
        if let Some(services) = &entry.docker_services {
            notes.push_str(&format!(" [services: {}]", services.join(", ")));
        }
        println!(
            "{:<20} {:<12} {:>8} {:>8}  {}{}",
            entry.repo,
            entry.command,
            entry.pid,
            format_uptime(entry.uptime),
            entry.log_file.display(),
            notes
        );
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn external_subcommand_carries_script_name_and_repos() {
        let cli = Cli::parse_from(["devrack", "migrate:up", "svc-a", "svc-b"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected external subcommand");
        };
        assert_eq!(args, vec!["migrate:up", "svc-a", "svc-b"]);
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::parse_from(["devrack", "lint", "svc-a", "--fix", "--sequential"]);
        assert!(cli.fix);
        assert!(cli.sequential);
        let Commands::Lint { repos } = cli.command else {
            panic!("expected lint subcommand");
        };
        assert_eq!(repos, vec!["svc-a"]);
    }

    #[test]
    fn uptime_formats_as_minutes_and_seconds() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "00:00");
        assert_eq!(format_uptime(Duration::from_secs(61)), "01:01");
        assert_eq!(format_uptime(Duration::from_secs(600)), "10:00");
    }

    #[test]
    fn batch_failures_produce_a_nonzero_outcome() {
        let mut outcome = BatchOutcome {
            total: 2,
            ..Default::default()
        };
        assert!(finish(outcome.clone(), Vec::new()).is_ok());
        outcome.record_failure("svc-a", "exited with code 1");
        let err = finish(outcome, Vec::new()).unwrap_err();
        assert!(err.to_string().contains("1 of 2"), "{err}");
    }
}
