//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file
//! and the resolved workspace view (absolute repository paths, log directory,
//! runtime defaults).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Workspace base path; repository paths resolve against it.
    pub root: String,
    /// Directory for per-run log files (default: `<root>/.devrack/logs`).
    pub log_dir: Option<String>,
    /// Default environment for `--env` (default: "dev").
    pub environment: Option<String>,
    /// Graceful-stop escalation timeout in milliseconds (default: 5000).
    pub stop_grace_ms: Option<u64>,
    /// Whether to use Unicode symbols in tool messages (default: true).
    pub symbols: Option<bool>,
    /// Repositories managed by this workspace.
    #[serde(rename = "repo", default)]
    pub repos: Vec<RepoConfig>,
}

/// Configuration for a single repository.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Repository name; also the default directory name under `root`.
    pub name: String,
    /// Path override, relative to `root` or absolute.
    pub path: Option<String>,
}

/// A repository with its resolved absolute path.
#[derive(Debug, Clone)]
pub struct Repo {
    pub name: String,
    pub path: PathBuf,
}

/// The resolved workspace: configuration with paths expanded and defaults
/// applied.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub log_dir: PathBuf,
    pub environment: String,
    pub stop_grace: Duration,
    pub symbols: bool,
    pub repos: Vec<Repo>,
}

impl Workspace {
    /// Resolves a parsed config into absolute paths and defaults.
    pub fn from_config(config: Config) -> Self {
        let root = expand_home(&config.root);
        let log_dir = config
            .log_dir
            .map(|dir| resolve_against(&root, &expand_home(&dir)))
            .unwrap_or_else(|| root.join(".devrack").join("logs"));
        let repos = config
            .repos
            .into_iter()
            .map(|repo| {
                let path = match repo.path {
                    Some(path) => resolve_against(&root, &expand_home(&path)),
                    None => root.join(&repo.name),
                };
                Repo {
                    name: repo.name,
                    path,
                }
            })
            .collect();
        Self {
            root,
            log_dir,
            environment: config.environment.unwrap_or_else(|| "dev".to_string()),
            stop_grace: Duration::from_millis(config.stop_grace_ms.unwrap_or(5000)),
            symbols: config.symbols.unwrap_or(true),
            repos,
        }
    }

    /// Looks up a repository by name.
    pub fn repo(&self, name: &str) -> Option<&Repo> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    /// Selects target repositories: an empty request selects every
    /// configured repository; unknown names are returned separately so the
    /// caller can fail them without aborting the rest.
    pub fn select(&self, names: &[String]) -> (Vec<&Repo>, Vec<String>) {
        if names.is_empty() {
            return (self.repos.iter().collect(), Vec::new());
        }
        let mut selected = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            match self.repo(name) {
                Some(repo) => selected.push(repo),
                None => unknown.push(name.clone()),
            }
        }
        (selected, unknown)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Finds the configuration file: the explicit flag wins, else `devrack.toml`
/// in the current directory.
pub fn find_config(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let default = Path::new("devrack.toml");
    if default.exists() {
        return Ok(default.to_path_buf());
    }
    bail!("no devrack.toml in the current directory (use --config to point at one)");
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn resolve_against(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
root = "/work"
log_dir = "logs"
environment = "prod"
stop_grace_ms = 2500
symbols = false

[[repo]]
name = "svc-a"

[[repo]]
name = "svc-b"
path = "services/svc-b"

[[repo]]
name = "svc-c"
path = "/elsewhere/svc-c"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let workspace = Workspace::from_config(config);
        assert_eq!(workspace.root, PathBuf::from("/work"));
        assert_eq!(workspace.log_dir, PathBuf::from("/work/logs"));
        assert_eq!(workspace.environment, "prod");
        assert_eq!(workspace.stop_grace, Duration::from_millis(2500));
        assert!(!workspace.symbols);
        assert_eq!(workspace.repos.len(), 3);
        assert_eq!(workspace.repos[0].path, PathBuf::from("/work/svc-a"));
        assert_eq!(
            workspace.repos[1].path,
            PathBuf::from("/work/services/svc-b")
        );
        assert_eq!(workspace.repos[2].path, PathBuf::from("/elsewhere/svc-c"));
    }

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let config: Config = toml::from_str(r#"root = "/work""#).unwrap();
        let workspace = Workspace::from_config(config);
        assert_eq!(workspace.log_dir, PathBuf::from("/work/.devrack/logs"));
        assert_eq!(workspace.environment, "dev");
        assert_eq!(workspace.stop_grace, Duration::from_millis(5000));
        assert!(workspace.symbols);
        assert!(workspace.repos.is_empty());
    }

    #[test]
    fn select_returns_all_repos_for_empty_request() {
        let config: Config = toml::from_str(
            r#"
root = "/work"
[[repo]]
name = "a"
[[repo]]
name = "b"
"#,
        )
        .unwrap();
        let workspace = Workspace::from_config(config);
        let (selected, unknown) = workspace.select(&[]);
        assert_eq!(selected.len(), 2);
        assert!(unknown.is_empty());
    }

    #[test]
    fn select_separates_unknown_names() {
        let config: Config = toml::from_str(
            r#"
root = "/work"
[[repo]]
name = "a"
"#,
        )
        .unwrap();
        let workspace = Workspace::from_config(config);
        let (selected, unknown) = workspace.select(&["a".to_string(), "nope".to_string()]);
        assert_eq!(selected.len(), 1);
        assert_eq!(unknown, vec!["nope".to_string()]);
    }
}
