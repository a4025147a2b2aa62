//! Docker Compose detection.
//!
//! A repository can be container-orchestrated two ways: directly, via a
//! compose file in its root, or indirectly, via a package-manager script
//! whose body invokes docker-compose. This module detects both.

use std::path::Path;

use regex::Regex;

/// Candidate compose filenames; order encodes precedence.
const COMPOSE_FILES: [&str; 6] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
    "docker-compose.dev.yml",
    "docker-compose.dev.yaml",
];

/// Result of scanning a repository for a compose file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInfo {
    /// Whether the repository is driven by a compose file.
    pub is_docker_compose: bool,
    /// The matched compose filename, relative to the repository root.
    pub compose_file: Option<String>,
}

impl ComposeInfo {
    /// A repository with no compose file.
    pub fn none() -> Self {
        Self {
            is_docker_compose: false,
            compose_file: None,
        }
    }
}

/// Docker usage detected inside a package-manager script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NpmDockerInfo {
    /// Whether the script behind the logical command invokes docker-compose.
    pub uses_docker: bool,
    /// The matched script body.
    pub docker_command: Option<String>,
    /// Service names the script passes to `up`, if any.
    pub services: Option<Vec<String>>,
    /// Compose file named by `-f`/`--file`, else the compose default.
    pub compose_file: Option<String>,
}

/// Detects Docker Compose usage for a repository. Read-only.
#[derive(Debug, Clone, Default)]
pub struct DockerDetector;

impl DockerDetector {
    pub fn new() -> Self {
        Self
    }

    /// Scans for a compose file; the first candidate found wins.
    pub fn detect_compose(&self, repo_path: &Path) -> ComposeInfo {
        for name in COMPOSE_FILES {
            if repo_path.join(name).exists() {
                return ComposeInfo {
                    is_docker_compose: true,
                    compose_file: Some(name.to_string()),
                };
            }
        }
        ComposeInfo::none()
    }

    /// Checks whether the manifest script behind `command` invokes
    /// docker-compose, extracting the compose file and service names.
    pub fn detect_npm_docker_usage(&self, repo_path: &Path, command: &str) -> NpmDockerInfo {
        let Some(scripts) = manifest_scripts(repo_path) else {
            return NpmDockerInfo::default();
        };
        for name in candidate_scripts(command) {
            let Some(body) = scripts.get(&name).and_then(|value| value.as_str()) else {
                continue;
            };
            if !invokes_compose(body) {
                continue;
            }
            return NpmDockerInfo {
                uses_docker: true,
                docker_command: Some(body.to_string()),
                services: services_after_up(body),
                compose_file: Some(
                    compose_file_argument(body)
                        .unwrap_or_else(|| "docker-compose.yml".to_string()),
                ),
            };
        }
        NpmDockerInfo::default()
    }
}

// Candidate script names for a logical command, most specific first.
fn candidate_scripts(command: &str) -> Vec<String> {
    let names: &[&str] = match command {
        "dev" => &["dev", "start:dev", "develop"],
        "start" => &["start", "serve", "dev"],
        "build" => &["build", "build:prod", "build:dev"],
        "test" => &["test", "test:unit", "test:integration"],
        "lint" => &["lint", "lint:check"],
        _ => return vec![command.to_string()],
    };
    names.iter().map(|name| name.to_string()).collect()
}

fn manifest_scripts(repo_path: &Path) -> Option<serde_json::Map<String, serde_json::Value>> {
    let raw = std::fs::read_to_string(repo_path.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    manifest.get("scripts")?.as_object().cloned()
}

// The word boundary keeps bare `compose` wrappers matching without also
// matching names like "composer".
fn invokes_compose(body: &str) -> bool {
    Regex::new(r"docker-compose|docker\s+compose|\bcompose\b")
        .map(|re| re.is_match(body))
        .unwrap_or(false)
}

fn compose_file_argument(body: &str) -> Option<String> {
    let re = Regex::new(r"(?:-f|--file)\s+(\S+)").ok()?;
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

// Service names following an `up` token, excluding flags and the literal
// tokens up/down/build. Collection stops at shell operators so chained
// commands do not bleed in.
fn services_after_up(body: &str) -> Option<Vec<String>> {
    let tokens = shell_words::split(body).ok()?;
    let up_idx = tokens.iter().position(|token| token == "up")?;
    let mut services = Vec::new();
    for token in &tokens[up_idx + 1..] {
        if matches!(token.as_str(), "&&" | "||" | ";" | "|") {
            break;
        }
        if token.starts_with('-') {
            continue;
        }
        if matches!(token.as_str(), "up" | "down" | "build") {
            continue;
        }
        services.push(token.clone());
    }
    if services.is_empty() {
        None
    } else {
        Some(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn repo_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    fn manifest_with_scripts(scripts: &str) -> String {
        format!(r#"{{"name": "fixture", "scripts": {scripts}}}"#)
    }

    #[test]
    fn compose_candidate_order_holds() {
        let dir = repo_with(&[("docker-compose.yml", ""), ("compose.yaml", "")]);
        let info = DockerDetector::new().detect_compose(dir.path());
        assert!(info.is_docker_compose);
        assert_eq!(info.compose_file.as_deref(), Some("docker-compose.yml"));
    }

    #[test]
    fn dev_variant_detected_when_primary_names_missing() {
        let dir = repo_with(&[("docker-compose.dev.yml", "")]);
        let info = DockerDetector::new().detect_compose(dir.path());
        assert_eq!(info.compose_file.as_deref(), Some("docker-compose.dev.yml"));
    }

    #[test]
    fn no_compose_file_detects_nothing() {
        let dir = repo_with(&[("package.json", "{}")]);
        assert_eq!(
            DockerDetector::new().detect_compose(dir.path()),
            ComposeInfo::none()
        );
    }

    #[test]
    fn detect_compose_is_stable_across_calls() {
        let dir = repo_with(&[("compose.yml", "")]);
        let detector = DockerDetector::new();
        let first = detector.detect_compose(dir.path());
        let second = detector.detect_compose(dir.path());
        assert_eq!(first, second);
    }

    #[test]
    fn script_candidates_cover_dev_aliases() {
        let manifest =
            manifest_with_scripts(r#"{"start:dev": "docker compose up --build"}"#);
        let dir = repo_with(&[("package.json", &manifest)]);
        let info = DockerDetector::new().detect_npm_docker_usage(dir.path(), "dev");
        assert!(info.uses_docker);
        assert_eq!(info.compose_file.as_deref(), Some("docker-compose.yml"));
    }

    #[test]
    fn non_docker_script_is_ignored() {
        let manifest = manifest_with_scripts(r#"{"dev": "vite --port 3000"}"#);
        let dir = repo_with(&[("package.json", &manifest)]);
        let info = DockerDetector::new().detect_npm_docker_usage(dir.path(), "dev");
        assert!(!info.uses_docker);
    }

    #[test]
    fn composer_does_not_count_as_compose() {
        let manifest = manifest_with_scripts(r#"{"build": "composer install"}"#);
        let dir = repo_with(&[("package.json", &manifest)]);
        let info = DockerDetector::new().detect_npm_docker_usage(dir.path(), "build");
        assert!(!info.uses_docker);
    }

    #[test]
    fn compose_file_argument_is_extracted() {
        let manifest = manifest_with_scripts(
            r#"{"dev": "docker-compose -f docker/dev.yml up -d api worker"}"#,
        );
        let dir = repo_with(&[("package.json", &manifest)]);
        let info = DockerDetector::new().detect_npm_docker_usage(dir.path(), "dev");
        assert!(info.uses_docker);
        assert_eq!(info.compose_file.as_deref(), Some("docker/dev.yml"));
        assert_eq!(
            info.services,
            Some(vec!["api".to_string(), "worker".to_string()])
        );
    }

    #[test]
    fn service_extraction_skips_flags_and_stops_at_operators() {
        let services = services_after_up("docker compose up -d api && echo done");
        assert_eq!(services, Some(vec!["api".to_string()]));

        let none = services_after_up("docker compose up -d --build");
        assert_eq!(none, None);
    }

    #[test]
    fn arbitrary_command_matches_verbatim_script_name() {
        let manifest = manifest_with_scripts(r#"{"seed": "docker compose run --rm app npm run seed"}"#);
        let dir = repo_with(&[("package.json", &manifest)]);
        let info = DockerDetector::new().detect_npm_docker_usage(dir.path(), "seed");
        assert!(info.uses_docker);
        assert_eq!(info.services, None);
    }
}
