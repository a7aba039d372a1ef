//! Fixed-incident reporting
//!
//! Copies the validated patches back into the workspace, ships them on a
//! `remedy/` branch, opens the pull request, and streams pipeline events to
//! the dashboard. Everything here runs downstream of a fix; a reporting
//! failure never changes an incident's status.

use anyhow::{anyhow, bail, Context, Result};
use git2::{Repository, Signature};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::model::{Event, Incident, RepairPlan, ValidationResult};
use crate::planner::truncate_str;
use crate::workflow::IncidentReporter;

const API_TIMEOUT: Duration = Duration::from_secs(30);
const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

#[derive(Serialize)]
struct CreatePrRequest {
    title: String,
    body: String,
    head: String,
    base: String,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
    number: u64,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[derive(Serialize)]
struct ReviewerRequest {
    reviewers: Vec<String>,
}

#[derive(Clone)]
pub struct Reporter {
    client: reqwest::Client,
    dashboard_origin: String,
    workspace: PathBuf,
    github_token: Option<String>,
    repo: Option<String>,
    pr_reviewer: Option<String>,
    /// Serializes the branch/commit/push phase; incident jobs run in
    /// parallel but share one workspace checkout.
    git_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Reporter {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("Failed to create reporting HTTP client")?;
        Ok(Self {
            client,
            dashboard_origin: config.dashboard_origin.clone(),
            workspace: config.workspace.clone(),
            github_token: config.github_token.clone(),
            repo: config.repo.clone(),
            pr_reviewer: config.pr_reviewer.clone(),
            git_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Best-effort push of one event to the dashboard ingest endpoint. The
    /// dashboard is optional; failures are logged and dropped.
    pub async fn push(&self, event: &Event) {
        let url = events_endpoint(&self.dashboard_origin);
        let sent = self
            .client
            .post(&url)
            .timeout(DASHBOARD_TIMEOUT)
            .json(event)
            .send()
            .await;
        match sent {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), kind = %event.kind, "dashboard rejected event");
            }
            Err(err) => tracing::debug!(%err, kind = %event.kind, "dashboard push failed"),
        }
    }

    /// Ship a fixed incident: copy the validated patches into the workspace,
    /// commit them on a `remedy/` branch, push, and open the pull request.
    ///
    /// Skips with a warning when `GITHUB_TOKEN` or the target repository is
    /// not configured.
    pub async fn open_pull_request(
        &self,
        incident: &Incident,
        plan: &RepairPlan,
        validation: &ValidationResult,
        project_dir: &Path,
    ) -> Result<()> {
        let (Some(token), Some(repo)) = (&self.github_token, &self.repo) else {
            tracing::warn!(
                incident = incident.short_id(),
                "GITHUB_TOKEN or REMEDY_REPO unset, skipping pull request"
            );
            return Ok(());
        };

        let _guard = self.git_lock.lock().await;

        let branch = branch_name(incident);
        let ctx = prepare_branch(&self.workspace, &branch)?;
        let shipped: Result<()> = async {
            let paths = copy_patches(project_dir, &self.workspace, plan)?;
            let message = format!("fix: repair {} upgrade", incident.dependency.name);
            commit_patches(&self.workspace, &paths, &message)?;
            push_branch(&self.workspace, repo, token, &branch).await
        }
        .await;
        // The workspace goes back to the branch it started on either way.
        if let Err(err) = restore_checkout(&self.workspace, &ctx.prior) {
            tracing::warn!(%err, branch = %ctx.prior, "failed to restore workspace branch");
        }
        shipped?;

        let title = pr_title(incident);
        let body = pr_body(incident, plan, validation);
        let (url, number) = self
            .create_pr(token, repo, &branch, &ctx.base, &title, &body)
            .await?;
        tracing::info!(incident = incident.short_id(), pr = %url, "pull request opened");

        if let Some(reviewer) = &self.pr_reviewer {
            self.request_reviewer(token, repo, number, reviewer).await;
        }
        Ok(())
    }

    async fn create_pr(
        &self,
        token: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<(String, u64)> {
        let url = format!("https://api.github.com/repos/{}/pulls", repo);
        let request = CreatePrRequest {
            title: title.to_string(),
            body: body.to_string(),
            head: head.to_string(),
            base: base.to_string(),
        };

        let resp = self
            .api_post(&url, token)
            .json(&request)
            .send()
            .await
            .context("Failed to send pull request creation")?;

        let status = resp.status();
        if status.is_success() {
            let pr: CreatePrResponse = resp
                .json()
                .await
                .context("Failed to parse pull request response")?;
            return Ok((pr.html_url, pr.number));
        }

        let error_body = resp.text().await.unwrap_or_default();
        if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
            let detail = api_error
                .errors
                .first()
                .and_then(|e| e.message.clone())
                .unwrap_or_default();
            let msg = if detail.is_empty() {
                api_error.message
            } else {
                format!("{}: {}", api_error.message, detail)
            };
            return Err(anyhow!("GitHub API error: {}", msg));
        }
        Err(anyhow!(
            "GitHub API error ({}): {}",
            status,
            sanitize_error_body(&error_body)
        ))
    }

    /// Non-fatal by contract: a missing or unauthorized reviewer only logs.
    async fn request_reviewer(&self, token: &str, repo: &str, number: u64, reviewer: &str) {
        let url = format!(
            "https://api.github.com/repos/{}/pulls/{}/requested_reviewers",
            repo, number
        );
        let request = ReviewerRequest {
            reviewers: vec![reviewer.to_string()],
        };
        match self.api_post(&url, token).json(&request).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(reviewer, number, "review requested");
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), reviewer, "review request rejected");
            }
            Err(err) => tracing::warn!(%err, reviewer, "review request failed"),
        }
    }

    fn api_post(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", concat!("remedy/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28")
    }
}

impl IncidentReporter for Reporter {
    async fn report_fixed(
        &self,
        incident: &Incident,
        plan: &RepairPlan,
        validation: &ValidationResult,
        project_dir: &Path,
    ) -> Result<()> {
        self.open_pull_request(incident, plan, validation, project_dir)
            .await
    }

    async fn push_event(&self, event: &Event) {
        self.push(event).await;
    }
}

// ============================================================================
// Git plumbing
// ============================================================================

struct BranchContext {
    /// Branch the pull request targets.
    base: String,
    /// Branch the workspace was on before, restored afterwards.
    prior: String,
}

/// Branch names keep the package readable; scoped npm names flatten.
fn branch_name(incident: &Incident) -> String {
    let name = incident.dependency.name.replace(['/', '@'], "-");
    format!("remedy/{}-{}", name.trim_matches('-'), incident.short_id())
}

/// Create the remedy branch from the default branch and check it out.
fn prepare_branch(workspace: &Path, branch: &str) -> Result<BranchContext> {
    let repo = Repository::open(workspace).context("Workspace is not a git repository")?;
    let prior = repo
        .head()
        .context("Failed to read HEAD")?
        .shorthand()
        .unwrap_or("HEAD")
        .to_string();

    let (base, base_commit) = match repo
        .find_branch("main", git2::BranchType::Local)
        .or_else(|_| repo.find_branch("master", git2::BranchType::Local))
    {
        Ok(default) => {
            let commit = default
                .get()
                .peel_to_commit()
                .context("Failed to resolve default branch commit")?;
            let name = default.name()?.unwrap_or("main").to_string();
            (name, commit)
        }
        Err(_) => {
            let commit = repo
                .head()?
                .peel_to_commit()
                .context("Failed to resolve HEAD commit")?;
            (prior.clone(), commit)
        }
    };

    // force=true: a redelivered job may recreate the same branch.
    repo.branch(branch, &base_commit, true)
        .with_context(|| format!("Failed to create branch '{}'", branch))?;
    checkout(&repo, branch)?;
    Ok(BranchContext { base, prior })
}

fn restore_checkout(workspace: &Path, branch: &str) -> Result<()> {
    let repo = Repository::open(workspace)?;
    checkout(&repo, branch)
}

fn checkout(repo: &Repository, name: &str) -> Result<()> {
    let (object, reference) = repo
        .revparse_ext(name)
        .with_context(|| format!("Branch '{}' not found", name))?;
    repo.checkout_tree(&object, None)
        .with_context(|| format!("Failed to check out '{}'", name))?;
    match reference {
        Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
        None => repo.set_head_detached(object.id())?,
    }
    Ok(())
}

/// Copy the files a plan touched from the sandbox copy back into the
/// workspace, creating directories as needed. Returns the copied paths,
/// relative to the workspace root.
fn copy_patches(project_dir: &Path, workspace: &Path, plan: &RepairPlan) -> Result<Vec<String>> {
    let mut copied = Vec::new();
    for patch in &plan.patchset {
        let rel = Path::new(&patch.path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
            bail!("Refusing to copy patch path '{}'", patch.path);
        }
        let src = project_dir.join(rel);
        if !src.exists() {
            bail!("Patched file '{}' missing from sandbox copy", patch.path);
        }
        let dst = workspace.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::copy(&src, &dst)
            .with_context(|| format!("Failed to copy '{}' into the workspace", patch.path))?;
        copied.push(patch.path.clone());
    }
    Ok(copied)
}

/// Stage the copied paths and commit them on the current branch.
fn commit_patches(workspace: &Path, paths: &[String], message: &str) -> Result<String> {
    let repo = Repository::open(workspace)?;
    let mut index = repo.index()?;
    for path in paths {
        index
            .add_path(Path::new(path))
            .with_context(|| format!("Failed to stage '{}'", path))?;
    }
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head()?.peel_to_commit()?;

    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "remedy".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "remedy@local".to_string());
    let sig = Signature::now(&name, &email)?;

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    Ok(oid.to_string())
}

/// Push the branch with the token inlined in the remote URL (shells out to
/// git). Never echo the URL: stderr goes through the sanitizer.
async fn push_branch(workspace: &Path, repo: &str, token: &str, branch: &str) -> Result<()> {
    let url = format!("https://x-access-token:{}@github.com/{}.git", token, repo);
    let refspec = format!("{}:{}", branch, branch);
    let output = tokio::process::Command::new("git")
        .current_dir(workspace)
        .args(["push", &url, &refspec])
        .output()
        .await
        .context("Failed to execute git push")?;

    if !output.status.success() {
        bail!(
            "git push failed: {}",
            sanitize_error_body(&String::from_utf8_lossy(&output.stderr))
        );
    }
    Ok(())
}

// ============================================================================
// Dashboard push
// ============================================================================

/// Where the dashboard ingests pipeline events.
fn events_endpoint(origin: &str) -> String {
    format!("{}/api/events", origin.trim_end_matches('/'))
}

// ============================================================================
// Pull request content
// ============================================================================

fn pr_title(incident: &Incident) -> String {
    format!("Fix {} upgrade failure", incident.dependency.name)
}

fn pr_body(incident: &Incident, plan: &RepairPlan, validation: &ValidationResult) -> String {
    let dep = &incident.dependency;
    let evidence = &incident.crash_evidence;

    let mut body = format!(
        "## Incident\n\n- Package: `{}` `{}` -> `{}`\n- Manifest: `{}`\n- Command: `{}`\n",
        dep.name, dep.current_version, dep.latest_version, dep.manifest_path, incident.command
    );
    if let (Some(file), Some(line)) = (&evidence.file, evidence.line) {
        body.push_str(&format!("- Crash site: `{}:{}`\n", file, line));
    }
    if let Some(api) = &evidence.api {
        body.push_str(&format!("- Deprecated API: `{}`\n", api));
    }
    if !evidence.stacktrace.is_empty() {
        body.push_str(&format!(
            "\n```\n{}\n```\n",
            truncate_str(&evidence.stacktrace, 1500)
        ));
    }

    body.push_str(&format!(
        "\n## Plan\n\n{}\n\nConfidence: {:.2}\n\n{}\n\nFiles:\n",
        plan.summary, plan.confidence, plan.rationale
    ));
    for patch in &plan.patchset {
        body.push_str(&format!("- `{}`: {}\n", patch.path, patch.instructions));
    }

    let exit = validation
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    body.push_str(&format!(
        "\n## Validation\n\nTest suite passed against the upgraded dependency (exit code {}).\n",
        exit
    ));
    body
}

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "auth",
        "bearer",
        "ghp_",
        "github_pat_",
    ];

    let truncated = if body.len() > MAX_ERROR_BODY_LEN {
        format!("{}... (truncated)", &body[..MAX_ERROR_BODY_LEN])
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}
