//! Attempt validation
//!
//! Re-runs the sandbox against the incident's patched project copy and
//! converts the outcome into a ValidationResult plus exactly one binary
//! reward for the attempt. The reward row is written even when validation
//! fails; the absence of a crash is the only thing that counts as success.

use anyhow::{Context, Result};
use std::path::Path;

use crate::model::{Ecosystem, Incident, RewardSignal, ValidationResult};
use crate::sandbox::{SandboxResult, SandboxRunner};
use crate::store::Store;
use crate::workflow::AttemptValidator;

/// Validate one attempt: rerun the pipeline in the patched project copy,
/// persist the result, and append the attempt's reward.
pub async fn validate(
    runner: &SandboxRunner,
    store: &Store,
    incident: &Incident,
    attempt: u32,
    test_cmd: &str,
    project_dir: &Path,
) -> Result<ValidationResult> {
    let run = runner
        .run(&incident.dependency, test_cmd, project_dir)
        .await;
    let result = to_validation(&incident.id, &run);
    record(store, &result, attempt)?;

    tracing::info!(
        incident = incident.short_id(),
        attempt,
        success = result.success,
        "validation finished"
    );
    Ok(result)
}

/// Convert a sandbox outcome into the attempt's validation record.
pub fn to_validation(incident_id: &str, run: &SandboxResult) -> ValidationResult {
    let new_errors = run
        .evidence
        .as_ref()
        .map(|evidence| evidence.stacktrace.clone())
        .filter(|s| !s.is_empty());
    ValidationResult {
        incident_id: incident_id.to_string(),
        success: !run.crashed,
        stdout: run.stdout.clone(),
        stderr: run.stderr.clone(),
        exit_code: run.exit_code,
        new_errors,
    }
}

/// Persist the validation and its reward. One reward row per attempt; the
/// store rejects a duplicate.
pub fn record(store: &Store, result: &ValidationResult, attempt: u32) -> Result<()> {
    store
        .insert_validation(result)
        .context("Failed to persist validation")?;
    store
        .insert_reward(&RewardSignal {
            incident_id: result.incident_id.clone(),
            attempt,
            reward: if result.success { 1 } else { 0 },
        })
        .context("Failed to persist reward")
}

/// The live validator: reruns each attempt in the incident's sandbox copy
/// with the ecosystem's test command.
pub struct SandboxValidator {
    runner: SandboxRunner,
    store: Store,
    npm_test_cmd: String,
    py_test_cmd: String,
}

impl SandboxValidator {
    pub fn new(
        runner: SandboxRunner,
        store: Store,
        npm_test_cmd: String,
        py_test_cmd: String,
    ) -> Self {
        Self {
            runner,
            store,
            npm_test_cmd,
            py_test_cmd,
        }
    }
}

impl AttemptValidator for SandboxValidator {
    async fn validate(
        &self,
        incident: &Incident,
        attempt: u32,
        project_dir: &Path,
    ) -> Result<ValidationResult> {
        let test_cmd = match incident.dependency.ecosystem {
            Ecosystem::Npm => &self.npm_test_cmd,
            Ecosystem::Pip => &self.py_test_cmd,
        };
        validate(&self.runner, &self.store, incident, attempt, test_cmd, project_dir).await
    }
}
