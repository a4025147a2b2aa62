//! Logical command resolution.
//!
//! Maps a logical command name (`dev`, `build`, `test`, ...) plus run options
//! into the concrete argument vector to spawn, consulting the Docker and
//! package-manager detectors. A leading `compose` token in a resolved argv
//! addresses the `docker` binary.

use std::path::Path;

use crate::docker::ComposeInfo;
use crate::package_manager::{PackageManager, PackageManagerDetector};

/// Prefix that bypasses all project-type logic and runs the rest through `sh`.
pub const SHELL_PREFIX: &str = "sh:";

/// Commands that keep running until explicitly stopped.
const LONG_RUNNING: [&str; 4] = ["dev", "start", "serve", "watch"];

/// Options for one lifecycle invocation, passed down through resolution and
/// spawning. Immutable per invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Target environment name (`dev`, `prod`, ...). Unrecognized values
    /// fall through to the default branches rather than erroring.
    pub environment: String,
    /// Fan out across repositories instead of serializing.
    pub parallel: bool,
    /// Keep the underlying runner in watch mode.
    pub watch: bool,
    /// Ask the linter to apply fixes.
    pub fix: bool,
    /// Remove volumes and orphans on `down`.
    pub volumes: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            parallel: true,
            watch: false,
            fix: false,
            volumes: false,
        }
    }
}

/// Resolves logical commands into concrete argument vectors.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    package_managers: PackageManagerDetector,
}

impl CommandResolver {
    pub fn new(package_managers: PackageManagerDetector) -> Self {
        Self { package_managers }
    }

    /// True for commands treated as "started" rather than awaited to
    /// completion.
    pub fn is_long_running(&self, command: &str) -> bool {
        LONG_RUNNING.contains(&command)
    }

    /// Resolves `command` into an argv: explicit `sh:` escape first, then
    /// the Docker Compose path, then the package-manager path.
    pub async fn resolve(
        &self,
        command: &str,
        options: &RunOptions,
        compose: &ComposeInfo,
        repo_path: Option<&Path>,
    ) -> Vec<String> {
        if let Some(body) = command.strip_prefix(SHELL_PREFIX) {
            return vec!["sh".to_string(), "-c".to_string(), body.trim().to_string()];
        }
        if compose.is_docker_compose {
            return self.resolve_compose(command, options, compose, repo_path).await;
        }
        self.resolve_package_manager(command, options, repo_path).await
    }

    async fn resolve_compose(
        &self,
        command: &str,
        options: &RunOptions,
        compose: &ComposeInfo,
        repo_path: Option<&Path>,
    ) -> Vec<String> {
        let file = compose
            .compose_file
            .clone()
            .unwrap_or_else(|| "docker-compose.yml".to_string());
        let mut argv = vec!["compose".to_string(), "-f".to_string(), file];
        match command {
            "dev" => extend(&mut argv, &["up", "--build"]),
            "start" => match options.environment.as_str() {
                "dev" => extend(&mut argv, &["up", "--build"]),
                "prod" => extend(&mut argv, &["up", "-d"]),
                _ => argv.push("up".to_string()),
            },
            "build" => argv.push("build".to_string()),
            "test" => {
                let manager = self.container_manager(repo_path).await;
                extend(&mut argv, &["run", "--rm", "app", manager.command(), "test"]);
                if options.watch {
                    extend(&mut argv, &["--", "--watch"]);
                }
            }
            "stop" => argv.push("stop".to_string()),
            "down" => {
                argv.push("down".to_string());
                if options.volumes {
                    extend(&mut argv, &["--volumes", "--remove-orphans"]);
                }
            }
            "logs" => extend(&mut argv, &["logs", "-f"]),
            other => {
                let manager = self.container_manager(repo_path).await;
                extend(&mut argv, &["run", "--rm", "app", manager.command(), "run", other]);
            }
        }
        argv
    }

    async fn resolve_package_manager(
        &self,
        command: &str,
        options: &RunOptions,
        repo_path: Option<&Path>,
    ) -> Vec<String> {
        let info = self
            .package_managers
            .best_available(repo_path.unwrap_or_else(|| Path::new(".")))
            .await;
        let manager = info.manager;
        match command {
            "dev" => run_script(manager, "dev"),
            "start" => match options.environment.as_str() {
                "dev" => run_script(manager, "dev"),
                _ => {
                    if manager == PackageManager::Npm {
                        vec!["npm".to_string(), "start".to_string()]
                    } else {
                        run_script(manager, "start")
                    }
                }
            },
            "build" => {
                if options.environment == "dev" {
                    run_script(manager, "build:dev")
                } else {
                    run_script(manager, "build")
                }
            }
            "test" => {
                let mut argv = if manager == PackageManager::Npm {
                    vec!["npm".to_string(), "test".to_string()]
                } else {
                    run_script(manager, "test")
                };
                if options.watch {
                    extend(&mut argv, &["--", "--watch"]);
                }
                argv
            }
            "lint" => {
                let mut argv = run_script(manager, "lint");
                if options.fix {
                    extend(&mut argv, &["--", "--fix"]);
                }
                argv
            }
            "install" => info.install_command,
            other => run_script(manager, other),
        }
    }

    // Package-manager commands used inside the compose container; npm when
    // no repository path is available.
    async fn container_manager(&self, repo_path: Option<&Path>) -> PackageManager {
        match repo_path {
            Some(path) => self.package_managers.best_available(path).await.manager,
            None => PackageManager::Npm,
        }
    }
}

fn run_script(manager: PackageManager, script: &str) -> Vec<String> {
    vec![
        manager.command().to_string(),
        "run".to_string(),
        script.to_string(),
    ]
}

fn extend(argv: &mut Vec<String>, parts: &[&str]) {
    argv.extend(parts.iter().map(|part| part.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn docker_compose() -> ComposeInfo {
        ComposeInfo {
            is_docker_compose: true,
            compose_file: Some("docker-compose.yml".to_string()),
        }
    }

    fn options(environment: &str) -> RunOptions {
        RunOptions {
            environment: environment.to_string(),
            ..RunOptions::default()
        }
    }

    fn resolver_with(managers: &[PackageManager]) -> CommandResolver {
        CommandResolver::new(PackageManagerDetector::with_available(managers))
    }

    fn pnpm_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        dir
    }

    #[tokio::test]
    async fn shell_prefix_bypasses_project_type_logic() {
        let resolver = resolver_with(&[]);
        let argv = resolver
            .resolve("sh:echo hi", &options("dev"), &docker_compose(), None)
            .await;
        assert_eq!(argv, vec!["sh", "-c", "echo hi"]);
    }

    #[tokio::test]
    async fn compose_dev_builds_and_starts() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let argv = resolver
            .resolve("dev", &options("dev"), &docker_compose(), None)
            .await;
        assert_eq!(
            argv,
            vec!["compose", "-f", "docker-compose.yml", "up", "--build"]
        );
    }

    #[tokio::test]
    async fn compose_start_branches_on_environment() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let prod = resolver
            .resolve("start", &options("prod"), &docker_compose(), None)
            .await;
        assert_eq!(prod, vec!["compose", "-f", "docker-compose.yml", "up", "-d"]);

        let staging = resolver
            .resolve("start", &options("staging"), &docker_compose(), None)
            .await;
        assert_eq!(staging, vec!["compose", "-f", "docker-compose.yml", "up"]);
    }

    #[tokio::test]
    async fn compose_test_runs_inside_the_app_service() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let mut opts = options("dev");
        opts.watch = true;
        let argv = resolver.resolve("test", &opts, &docker_compose(), None).await;
        assert_eq!(
            argv,
            vec![
                "compose",
                "-f",
                "docker-compose.yml",
                "run",
                "--rm",
                "app",
                "npm",
                "test",
                "--",
                "--watch"
            ]
        );
    }

    #[tokio::test]
    async fn compose_down_honors_volumes_flag() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let mut opts = options("dev");
        opts.volumes = true;
        let argv = resolver.resolve("down", &opts, &docker_compose(), None).await;
        assert_eq!(
            argv,
            vec![
                "compose",
                "-f",
                "docker-compose.yml",
                "down",
                "--volumes",
                "--remove-orphans"
            ]
        );
    }

    #[tokio::test]
    async fn compose_arbitrary_command_runs_through_the_manager() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let argv = resolver
            .resolve("seed", &options("dev"), &docker_compose(), None)
            .await;
        assert_eq!(
            argv,
            vec![
                "compose",
                "-f",
                "docker-compose.yml",
                "run",
                "--rm",
                "app",
                "npm",
                "run",
                "seed"
            ]
        );
    }

    #[tokio::test]
    async fn lint_fix_resolves_through_pnpm() {
        let repo = pnpm_repo();
        let resolver = resolver_with(&[PackageManager::Pnpm]);
        let mut opts = options("dev");
        opts.fix = true;
        let argv = resolver
            .resolve("lint", &opts, &ComposeInfo::none(), Some(repo.path()))
            .await;
        assert_eq!(argv, vec!["pnpm", "run", "lint", "--", "--fix"]);
    }

    #[tokio::test]
    async fn build_branches_on_environment() {
        let repo = pnpm_repo();
        let resolver = resolver_with(&[PackageManager::Pnpm]);
        let prod = resolver
            .resolve("build", &options("prod"), &ComposeInfo::none(), Some(repo.path()))
            .await;
        assert_eq!(prod, vec!["pnpm", "run", "build"]);

        let dev = resolver
            .resolve("build", &options("dev"), &ComposeInfo::none(), Some(repo.path()))
            .await;
        assert_eq!(dev, vec!["pnpm", "run", "build:dev"]);
    }

    #[tokio::test]
    async fn npm_keeps_its_bare_test_and_start_forms() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let test = resolver
            .resolve("test", &options("dev"), &ComposeInfo::none(), None)
            .await;
        assert_eq!(test, vec!["npm", "test"]);

        let start = resolver
            .resolve("start", &options("prod"), &ComposeInfo::none(), None)
            .await;
        assert_eq!(start, vec!["npm", "start"]);
    }

    #[tokio::test]
    async fn non_npm_start_uses_run_in_prod() {
        let repo = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("yarn.lock"), "").unwrap();
        let resolver = resolver_with(&[PackageManager::Yarn]);
        let argv = resolver
            .resolve("start", &options("prod"), &ComposeInfo::none(), Some(repo.path()))
            .await;
        assert_eq!(argv, vec!["yarn", "run", "start"]);
    }

    #[tokio::test]
    async fn install_uses_the_canonical_install_command() {
        let repo = pnpm_repo();
        let resolver = resolver_with(&[PackageManager::Pnpm]);
        let argv = resolver
            .resolve("install", &options("dev"), &ComposeInfo::none(), Some(repo.path()))
            .await;
        assert_eq!(argv, vec!["pnpm", "install"]);
    }

    #[tokio::test]
    async fn arbitrary_script_resolves_permissively() {
        let resolver = resolver_with(&[PackageManager::Npm]);
        let argv = resolver
            .resolve("migrate:up", &options("integration"), &ComposeInfo::none(), None)
            .await;
        assert_eq!(argv, vec!["npm", "run", "migrate:up"]);
    }

    #[test]
    fn long_running_commands_are_classified() {
        let resolver = resolver_with(&[]);
        for command in ["dev", "start", "serve", "watch"] {
            assert!(resolver.is_long_running(command), "{command}");
        }
        for command in ["build", "test", "lint", "stop", "logs"] {
            assert!(!resolver.is_long_running(command), "{command}");
        }
    }
}
