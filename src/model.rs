//! Core domain records shared across the pipeline
//!
//! Everything here serializes with the camelCase field names used by the
//! store payloads, the dashboard feed, and the read-only API, so a record
//! written by one component round-trips for every observer.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RFC 3339 UTC timestamp for persisted records.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

// ============================================================================
// Ecosystems
// ============================================================================

/// Package ecosystem a dependency belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Pip,
}

impl Ecosystem {
    pub fn label(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Pip => "pip",
        }
    }
}

// ============================================================================
// Incident lifecycle
// ============================================================================

/// Where an incident sits in the remediation state machine.
///
/// Progression is strict: `Detected → Analyzing → Patching → Validating`,
/// then either `Fixed` or a loop back to `Analyzing` for the next attempt,
/// with `Failed` once attempts are exhausted. The two terminal states never
/// transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Detected,
    Analyzing,
    Patching,
    Validating,
    Fixed,
    Failed,
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Detected => "DETECTED",
            Status::Analyzing => "ANALYZING",
            Status::Patching => "PATCHING",
            Status::Validating => "VALIDATING",
            Status::Fixed => "FIXED",
            Status::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Fixed | Status::Failed)
    }
}

/// Pipeline stage an attempt failed in, recorded on attempt events so a
/// planner rejection is never mistaken for a failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Dispatch,
    Validation,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Dispatch => "dispatch",
            Stage::Validation => "validation",
        }
    }
}

// ============================================================================
// Detection records
// ============================================================================

/// A dependency with a newer published version than the manifest pins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyUpdate {
    pub name: String,
    pub current_version: String,
    pub latest_version: String,
    pub ecosystem: Ecosystem,
    pub manifest_path: String,
}

/// Evidence captured from a crashed sandbox run.
///
/// `file`/`line`/`api` are best-effort extractions; a crash with none of
/// them is still a crash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashEvidence {
    pub stacktrace: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
}

impl CrashEvidence {
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = Some(api.into());
        self
    }
}

/// A reproducible breakage caused by one dependency upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub dependency: DependencyUpdate,
    pub crash_evidence: CrashEvidence,
    /// The shell pipeline whose failure produced the evidence.
    pub command: String,
    pub created_at: String,
    pub status: Status,
}

impl Incident {
    pub fn new(dependency: DependencyUpdate, crash_evidence: CrashEvidence, command: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dependency,
            crash_evidence,
            command,
            created_at: timestamp(),
            status: Status::Detected,
        }
    }

    /// First six characters of the id, used in branch names and logs.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(6);
        &self.id[..end]
    }
}

// ============================================================================
// Repair records
// ============================================================================

/// One file-level change proposed by the reasoner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    pub path: String,
    pub instructions: String,
    pub patch_text: String,
}

/// A structured repair proposal for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairPlan {
    pub incident_id: String,
    pub summary: String,
    /// Advisory only; never gates dispatch.
    pub confidence: f64,
    pub rationale: String,
    pub patchset: Vec<FilePatch>,
}

/// Outcome of re-running the sandbox against the patched tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub incident_id: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_errors: Option<String>,
}

/// Binary outcome of one attempt, the feedback the reasoner sees next time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardSignal {
    pub incident_id: String,
    /// 1-based, strictly increasing per incident.
    pub attempt: u32,
    /// 1 on success, 0 on failure.
    pub reward: u32,
}

// ============================================================================
// Audit trail
// ============================================================================

/// Append-only audit record emitted at every meaningful transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl Event {
    pub fn new(kind: &str, incident_id: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            incident_id: incident_id.map(|s| s.to_string()),
            payload,
            created_at: timestamp(),
        }
    }
}
