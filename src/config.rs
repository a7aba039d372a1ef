//! Runtime configuration for remedy
//!
//! Everything is sourced from the environment (with `.env` support) so the
//! daemon can run unmodified in a container. Unset or unparseable values
//! fall back to defaults; only the workspace root lookup can fail.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Ecosystem;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the project tree being watched.
    pub workspace: PathBuf,
    pub registry_timeout: Duration,
    /// Container image sandbox pipelines run in.
    pub sandbox_image: String,
    /// Mount point for the sandbox copy inside the container.
    pub sandbox_workdir: String,
    pub npm_test_cmd: String,
    pub py_test_cmd: String,
    pub max_attempts: u32,
    pub detect_interval: Duration,
    pub max_parallel_incidents: usize,
    /// Wall-clock bound for one sandbox run; expiry counts as a crash.
    pub sandbox_timeout: Duration,
    pub model: String,
    pub reasoner_url: String,
    pub reasoner_key: Option<String>,
    pub mission_url: String,
    pub dashboard_origin: String,
    pub api_bind: String,
    /// When set, /incidents and /events require this bearer token.
    pub api_token: Option<String>,
    pub github_token: Option<String>,
    /// `owner/name` of the repository pull requests go to.
    pub repo: Option<String>,
    pub pr_reviewer: Option<String>,
}

impl Config {
    /// Load configuration from the environment, reading `.env` first.
    pub fn load() -> Result<Config> {
        dotenvy::dotenv().ok();

        let workspace = match env_opt("REMEDY_WORKSPACE") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("Failed to resolve working directory")?,
        };

        Ok(Config {
            workspace,
            registry_timeout: env_millis("REMEDY_REGISTRY_TIMEOUT_MS", 8_000),
            sandbox_image: env_str("REMEDY_SANDBOX_IMAGE", "node:20-bookworm"),
            sandbox_workdir: env_str("REMEDY_SANDBOX_WORKDIR", "/workspace"),
            npm_test_cmd: env_str("REMEDY_TEST_CMD", "npm test -- --runInBand"),
            py_test_cmd: env_str("REMEDY_PY_TEST_CMD", "pytest -q"),
            max_attempts: env_parse("REMEDY_MAX_ATTEMPTS", 3),
            detect_interval: env_millis("REMEDY_DETECT_INTERVAL_MS", 900_000),
            max_parallel_incidents: env_parse("REMEDY_MAX_PARALLEL_INCIDENTS", 2),
            sandbox_timeout: env_millis("REMEDY_SANDBOX_TIMEOUT_MS", 900_000),
            model: env_str("REMEDY_MODEL", "gpt-4o-mini"),
            reasoner_url: env_str(
                "REMEDY_REASONER_URL",
                "http://localhost:8000/v1/chat/completions",
            ),
            reasoner_key: env_opt("REMEDY_REASONER_KEY"),
            mission_url: env_str("REMEDY_MISSION_URL", "http://localhost:3005/v1/mission"),
            dashboard_origin: env_str("REMEDY_DASHBOARD_ORIGIN", "http://localhost:3001"),
            api_bind: env_str("REMEDY_API_BIND", "127.0.0.1:3000"),
            api_token: env_opt("REMEDY_API_TOKEN"),
            github_token: env_opt("GITHUB_TOKEN"),
            repo: env_opt("REMEDY_REPO"),
            pr_reviewer: env_opt("REMEDY_PR_REVIEWER"),
        })
    }

    /// State directory for the store and sandbox arenas.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace.join(".remedy")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("remedy.db")
    }

    pub fn arena_root(&self) -> PathBuf {
        self.state_dir().join("sandboxes")
    }

    /// Project test command for the given ecosystem.
    pub fn test_command(&self, ecosystem: Ecosystem) -> &str {
        match ecosystem {
            Ecosystem::Npm => &self.npm_test_cmd,
            Ecosystem::Pip => &self.py_test_cmd,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}
