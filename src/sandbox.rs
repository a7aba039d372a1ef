//! Sandboxed upgrade simulation
//!
//! A sandbox is a disposable copy of the project tree (an arena) plus one
//! containerized run of `install && test` against a candidate dependency
//! version. Arenas have an explicit lifecycle: created (wiping any stale
//! copy) before a run, patched in place between attempts, destroyed when
//! their incident is done. The container is the only place install and
//! test commands execute; nothing runs on the host tree.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::evidence::EvidenceExtractor;
use crate::model::{CrashEvidence, DependencyUpdate, Ecosystem};

/// Directories never mirrored into an arena.
const EXCLUDED_DIRS: &[&str] = &[
    ".remedy",
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "target",
];

// ============================================================================
// Arena lifecycle
// ============================================================================

/// A per-key sandbox directory holding a disposable project copy.
pub struct SandboxArena {
    root: PathBuf,
}

impl SandboxArena {
    /// Create the arena for `key`, wiping any stale copy, and mirror the
    /// project tree into it.
    pub fn create(arena_root: &Path, key: &str, project_root: &Path) -> Result<Self> {
        let root = arena_root.join(sanitize_key(key));
        if root.exists() {
            std::fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to wipe stale sandbox {}", root.display()))?;
        }
        let project_dir = root.join("project");
        std::fs::create_dir_all(&project_dir)
            .with_context(|| format!("Failed to create sandbox {}", project_dir.display()))?;
        mirror_project(project_root, &project_dir)?;
        Ok(Self { root })
    }

    /// The mirrored project copy inside this arena.
    pub fn project_dir(&self) -> PathBuf {
        self.root.join("project")
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Remove the arena from disk.
    pub fn destroy(self) -> Result<()> {
        std::fs::remove_dir_all(&self.root)
            .with_context(|| format!("Failed to remove sandbox {}", self.root.display()))
    }
}

/// Arena directory names must stay flat even for scoped packages.
fn sanitize_key(key: &str) -> String {
    key.replace(['/', '\\'], "__")
}

fn mirror_project(src: &Path, dst: &Path) -> Result<()> {
    let walker = walkdir::WalkDir::new(src)
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry));
    for entry in walker {
        let entry = entry.context("Failed to walk project tree")?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("Walked path escaped the project root")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn is_excluded(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| EXCLUDED_DIRS.contains(&name))
            .unwrap_or(false)
}

// ============================================================================
// Containerized execution
// ============================================================================

/// Outcome of one sandboxed pipeline run.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub crashed: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// The shell pipeline that ran inside the container.
    pub command: String,
    pub timed_out: bool,
    /// Present exactly when `crashed` is true.
    pub evidence: Option<CrashEvidence>,
}

pub struct SandboxRunner {
    image: String,
    workdir: String,
    timeout: Duration,
    extractor: EvidenceExtractor,
}

impl SandboxRunner {
    pub fn new(image: String, workdir: String, timeout: Duration) -> Self {
        Self {
            image,
            workdir,
            timeout,
            extractor: EvidenceExtractor::default(),
        }
    }

    /// Install the candidate version and run the project test command inside
    /// the container, against the project copy at `project_dir`.
    ///
    /// Execution problems (spawn failure, timeout, kill) are reported as
    /// crashes with evidence, never as errors; a crash is the signal this
    /// whole system exists to capture.
    pub async fn run(
        &self,
        update: &DependencyUpdate,
        test_cmd: &str,
        project_dir: &Path,
    ) -> SandboxResult {
        let pipeline = compose_pipeline(update, test_cmd);
        let args = self.docker_invocation(project_dir, &pipeline);

        let mut command = Command::new("docker");
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(package = %update.name, version = %update.latest_version, "starting sandbox run");

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let stderr = format!("failed to start sandbox container: {}", err);
                return self.crash_result(String::new(), stderr, None, pipeline, false);
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();
                if output.status.success() {
                    SandboxResult {
                        crashed: false,
                        stdout,
                        stderr,
                        exit_code,
                        command: pipeline,
                        timed_out: false,
                        evidence: None,
                    }
                } else {
                    self.crash_result(stdout, stderr, exit_code, pipeline, false)
                }
            }
            Ok(Err(err)) => {
                let stderr = format!("failed to collect sandbox output: {}", err);
                self.crash_result(String::new(), stderr, None, pipeline, false)
            }
            // Dropping the wait future kills the container via kill_on_drop.
            Err(_) => {
                let stderr = format!(
                    "sandbox run exceeded the {}s wall-clock limit",
                    self.timeout.as_secs()
                );
                self.crash_result(String::new(), stderr, None, pipeline, true)
            }
        }
    }

    fn crash_result(
        &self,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        command: String,
        timed_out: bool,
    ) -> SandboxResult {
        let evidence = self.extractor.extract(&stdout, &stderr, exit_code);
        SandboxResult {
            crashed: true,
            stdout,
            stderr,
            exit_code,
            command,
            timed_out,
            evidence: Some(evidence),
        }
    }

    /// Full `docker` argv for one run (everything after the program name).
    fn docker_invocation(&self, project_dir: &Path, pipeline: &str) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{}", project_dir.display(), self.workdir),
            "-w".to_string(),
            self.workdir.clone(),
            self.image.clone(),
            "bash".to_string(),
            "-lc".to_string(),
            pipeline.to_string(),
        ]
    }
}

/// The single shell pipeline a sandbox run executes: candidate install
/// chained with the project test command.
pub fn compose_pipeline(update: &DependencyUpdate, test_cmd: &str) -> String {
    format!("{} && {}", install_command(update), test_cmd)
}

fn install_command(update: &DependencyUpdate) -> String {
    match update.ecosystem {
        Ecosystem::Npm => format!(
            "npm install {}@{} --no-audit --no-fund && npm install --no-audit --no-fund",
            update.name, update.latest_version
        ),
        // The candidate install must be able to fail the run; the rest of
        // the requirements are best-effort (the file may not sit at the
        // container workdir root).
        Ecosystem::Pip => format!(
            "pip install {}=={} && (pip install -r requirements.txt || true)",
            update.name, update.latest_version
        ),
    }
}
