//! Patch delivery
//!
//! Each file patch in a plan goes to the remote patching service first;
//! any failure on that channel falls back to local application with
//! `patch(1)` against the incident's sandboxed project copy. Local
//! application is idempotent: a dry run that reports the patch as already
//! applied is a success, not an error. A patch that fails both channels
//! fails the whole attempt.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::model::{FilePatch, RepairPlan};
use crate::planner::truncate_str;
use crate::workflow::PatchDelivery;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(15);

/// GNU patch prints this when a dry run sees the change already in place.
const REVERSED_MARKER: &str = "Reversed (or previously applied) patch detected";

#[derive(Serialize)]
struct MissionRequest {
    mission: String,
    patch: String,
}

pub struct Dispatcher {
    client: reqwest::Client,
    mission_url: String,
}

impl Dispatcher {
    pub fn new(mission_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .context("Failed to create dispatch HTTP client")?;
        Ok(Self {
            client,
            mission_url,
        })
    }

    async fn dispatch_patch(&self, patch: &FilePatch, project_dir: &Path) -> Result<()> {
        match self.send_remote(patch).await {
            Ok(()) => {
                tracing::debug!(path = %patch.path, "patch delivered remotely");
                Ok(())
            }
            Err(err) => {
                tracing::debug!(path = %patch.path, %err, "remote dispatch failed, applying locally");
                apply_locally(patch, project_dir).await
            }
        }
    }

    async fn send_remote(&self, patch: &FilePatch) -> Result<()> {
        let request = MissionRequest {
            mission: mission_text(patch),
            patch: patch.patch_text.clone(),
        };
        self.client
            .post(&self.mission_url)
            .json(&request)
            .send()
            .await
            .context("Mission request failed")?
            .error_for_status()
            .context("Mission endpoint rejected the patch")?;
        Ok(())
    }
}

impl PatchDelivery for Dispatcher {
    /// Deliver every patch in the plan to the project copy at `project_dir`.
    /// Fails on the first patch that neither channel can apply.
    async fn dispatch(&self, plan: &RepairPlan, project_dir: &Path) -> Result<()> {
        for patch in &plan.patchset {
            self.dispatch_patch(patch, project_dir)
                .await
                .with_context(|| format!("Failed to deliver patch for {}", patch.path))?;
        }
        Ok(())
    }
}

fn mission_text(patch: &FilePatch) -> String {
    format!("Apply fix to {}: {}", patch.path, patch.instructions)
}

/// Apply one patch with `patch -p0` from the project copy root.
///
/// The patch text lives in a named temp file inside the project copy for
/// the duration of the call; dropping the handle removes it on every exit
/// path.
async fn apply_locally(patch: &FilePatch, project_dir: &Path) -> Result<()> {
    let mut file = tempfile::Builder::new()
        .prefix("remedy-")
        .suffix(".patch")
        .tempfile_in(project_dir)
        .context("Failed to create temporary patch file")?;
    file.write_all(patch.patch_text.as_bytes())
        .context("Failed to write patch file")?;
    file.flush().context("Failed to flush patch file")?;
    let patch_path = file.path().to_path_buf();

    let (ok, output) = run_patch(&["--dry-run", "-p0", "-i"], &patch_path, project_dir).await?;
    if output.contains(REVERSED_MARKER) {
        tracing::info!(path = %patch.path, "patch already applied, skipping");
        return Ok(());
    }
    if !ok {
        bail!(
            "patch dry-run failed for {}: {}",
            patch.path,
            truncate_str(output.trim(), 200)
        );
    }

    let (ok, output) = run_patch(&["-p0", "-i"], &patch_path, project_dir).await?;
    if !ok {
        bail!(
            "patch application failed for {}: {}",
            patch.path,
            truncate_str(output.trim(), 200)
        );
    }
    Ok(())
}

async fn run_patch(args: &[&str], patch_path: &Path, cwd: &Path) -> Result<(bool, String)> {
    let output = Command::new("patch")
        .args(args)
        .arg(patch_path)
        .current_dir(cwd)
        .output()
        .await
        .context("Failed to run patch")?;
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.success(), combined))
}
