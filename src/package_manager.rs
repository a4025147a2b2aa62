//! Package manager detection for npm-family repositories.
//!
//! This module chooses between npm, pnpm, yarn, and bun by inspecting a
//! repository's lockfiles and manifest, and re-validates the choice against
//! the manager binaries actually runnable on the host.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// A Node.js package manager devrack knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// npm (the default).
    Npm,
    /// pnpm.
    Pnpm,
    /// Yarn (classic or berry; invoked the same way).
    Yarn,
    /// Bun.
    Bun,
}

/// Lockfile precedence when several are present.
const LOCKFILE_ORDER: [PackageManager; 4] = [
    PackageManager::Pnpm,
    PackageManager::Yarn,
    PackageManager::Bun,
    PackageManager::Npm,
];

/// Substitution order when the detected manager is not runnable.
const FALLBACK_ORDER: [PackageManager; 4] = [
    PackageManager::Pnpm,
    PackageManager::Yarn,
    PackageManager::Npm,
    PackageManager::Bun,
];

impl PackageManager {
    /// The binary name used to invoke this manager.
    pub fn command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
        }
    }

    /// The lockfile that identifies this manager.
    pub fn lock_file(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Yarn => "yarn.lock",
            PackageManager::Bun => "bun.lockb",
        }
    }

    /// The manager's canonical install invocation.
    pub fn install_command(&self) -> Vec<String> {
        vec![self.command().to_string(), "install".to_string()]
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "npm" => Some(PackageManager::Npm),
            "pnpm" => Some(PackageManager::Pnpm),
            "yarn" => Some(PackageManager::Yarn),
            "bun" => Some(PackageManager::Bun),
            _ => None,
        }
    }
}

/// The detected manager plus the evidence behind the choice.
#[derive(Debug, Clone)]
pub struct PackageManagerInfo {
    /// The selected manager.
    pub manager: PackageManager,
    /// Diagnostic label naming the evidence (lockfile name, manifest field,
    /// fallback, or "default").
    pub lock_file: String,
    /// The manager's canonical install invocation.
    pub install_command: Vec<String>,
}

impl PackageManagerInfo {
    fn new(manager: PackageManager, label: impl Into<String>) -> Self {
        Self {
            manager,
            lock_file: label.into(),
            install_command: manager.install_command(),
        }
    }
}

// How `best_available` decides whether a manager binary is runnable.
#[derive(Debug, Clone)]
enum Availability {
    /// Probe the host with `<manager> --version`.
    Probe,
    /// Treat exactly these managers as runnable (injected in tests).
    Fixed(Vec<PackageManager>),
}

/// Detects the package manager for a repository.
///
/// Purely read-only; absence of evidence degrades to a default rather than
/// raising.
#[derive(Debug, Clone)]
pub struct PackageManagerDetector {
    availability: Availability,
}

impl PackageManagerDetector {
    /// Creates a detector that probes the host for runnable managers.
    pub fn new() -> Self {
        Self {
            availability: Availability::Probe,
        }
    }

    /// Creates a detector that treats exactly `managers` as runnable.
    pub fn with_available(managers: &[PackageManager]) -> Self {
        Self {
            availability: Availability::Fixed(managers.to_vec()),
        }
    }

    /// Detects the manager from lockfiles, then the manifest's
    /// `packageManager` field, defaulting to npm.
    pub fn detect(&self, repo_path: &Path) -> PackageManagerInfo {
        for manager in LOCKFILE_ORDER {
            if repo_path.join(manager.lock_file()).exists() {
                return PackageManagerInfo::new(manager, manager.lock_file());
            }
        }
        if let Some(manager) = manifest_package_manager(repo_path) {
            return PackageManagerInfo::new(manager, "package.json (packageManager)");
        }
        PackageManagerInfo::new(PackageManager::Npm, "default")
    }

    /// Detects the manager, substituting the first runnable fallback when the
    /// detected manager's binary is missing from the host.
    ///
    /// Returns npm as a last resort even when nothing is runnable; the
    /// eventual spawn then fails with a clear OS error.
    pub async fn best_available(&self, repo_path: &Path) -> PackageManagerInfo {
        let detected = self.detect(repo_path);
        if self.is_runnable(detected.manager).await {
            return detected;
        }
        for fallback in FALLBACK_ORDER {
            if fallback == detected.manager {
                continue;
            }
            if self.is_runnable(fallback).await {
                return PackageManagerInfo::new(
                    fallback,
                    format!("fallback ({} unavailable)", detected.manager.command()),
                );
            }
        }
        PackageManagerInfo::new(PackageManager::Npm, "default")
    }

    async fn is_runnable(&self, manager: PackageManager) -> bool {
        match &self.availability {
            Availability::Fixed(available) => available.contains(&manager),
            Availability::Probe => Command::new(manager.command())
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|status| status.success())
                .unwrap_or(false),
        }
    }
}

impl Default for PackageManagerDetector {
    fn default() -> Self {
        Self::new()
    }
}

// Reads the manifest's `packageManager` field ("<name>@<version>").
// Unknown manager names are ignored.
fn manifest_package_manager(repo_path: &Path) -> Option<PackageManager> {
    let raw = std::fs::read_to_string(repo_path.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let field = manifest.get("packageManager")?.as_str()?;
    let name = field.split('@').next().unwrap_or(field);
    PackageManager::from_name(name)
}
