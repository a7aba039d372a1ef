//! Incident repair workflow
//!
//! Drives one incident through: analyze -> patch -> validate -> fixed/failed
//!
//! Every status change persists a snapshot, every finished attempt appends
//! one `attempt` event tagged with the stage it ended in, and the terminal
//! outcomes append a `fixed` or `failed` event. Attempts run strictly
//! sequentially within an incident; the queue layer decides how many
//! incidents run at once.
//!
//! The planner, dispatcher, validator, and reporter sit behind traits so the
//! machine can be exercised end to end without a network, a container
//! runtime, or a git remote.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::model::{Event, Incident, RepairPlan, RewardSignal, Stage, Status, ValidationResult};
use crate::sandbox::SandboxArena;
use crate::store::Store;

// ============================================================================
// Collaborator seams
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait PlanProvider {
    /// Propose a repair plan for this attempt.
    async fn propose(
        &self,
        incident: &Incident,
        attempt: u32,
        latest_reward: Option<&RewardSignal>,
    ) -> Result<RepairPlan>;
}

#[allow(async_fn_in_trait)]
pub trait PatchDelivery {
    /// Deliver every patch in the plan to the project copy.
    async fn dispatch(&self, plan: &RepairPlan, project_dir: &Path) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait AttemptValidator {
    /// Rerun the incident's failing pipeline against the patched copy,
    /// persisting the validation and exactly one reward for the attempt.
    async fn validate(
        &self,
        incident: &Incident,
        attempt: u32,
        project_dir: &Path,
    ) -> Result<ValidationResult>;
}

#[allow(async_fn_in_trait)]
pub trait IncidentReporter {
    /// Open a pull request for a fixed incident.
    async fn report_fixed(
        &self,
        incident: &Incident,
        plan: &RepairPlan,
        validation: &ValidationResult,
        project_dir: &Path,
    ) -> Result<()>;

    /// Best-effort push of an event to the dashboard.
    async fn push_event(&self, event: &Event);
}

// ============================================================================
// Orchestrator
// ============================================================================

enum AttemptOutcome {
    Fixed(RepairPlan, ValidationResult),
    Retry,
}

pub struct Orchestrator<P, D, V, R> {
    store: Store,
    planner: P,
    dispatcher: D,
    validator: V,
    reporter: R,
    max_attempts: u32,
    arena_root: PathBuf,
    workspace: PathBuf,
}

impl<P, D, V, R> Orchestrator<P, D, V, R>
where
    P: PlanProvider,
    D: PatchDelivery,
    V: AttemptValidator,
    R: IncidentReporter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        planner: P,
        dispatcher: D,
        validator: V,
        reporter: R,
        max_attempts: u32,
        arena_root: PathBuf,
        workspace: PathBuf,
    ) -> Self {
        Self {
            store,
            planner,
            dispatcher,
            validator,
            reporter,
            max_attempts,
            arena_root,
            workspace,
        }
    }

    /// Run the repair loop for one incident to a terminal state.
    ///
    /// Attempt numbering resumes from the persisted history, so a job
    /// redelivered by the queue continues where the last invocation stopped
    /// instead of reusing attempt numbers.
    pub async fn run_incident(&self, incident: Incident) -> Result<Status> {
        if let Some(existing) = self.store.get_incident(&incident.id)? {
            if existing.status.is_terminal() {
                tracing::info!(
                    incident = incident.short_id(),
                    status = existing.status.label(),
                    "incident already terminal, skipping redelivery"
                );
                return Ok(existing.status);
            }
        }

        let arena = SandboxArena::create(&self.arena_root, &incident.id, &self.workspace)
            .context("Failed to create incident sandbox")?;

        // Tear the sandbox down whether the loop finishes or errors out.
        let project_dir = arena.project_dir();
        let mut incident = incident;
        let result = self.repair_loop(&mut incident, &project_dir).await;
        if let Err(err) = arena.destroy() {
            tracing::warn!(incident = incident.short_id(), %err, "failed to remove sandbox");
        }
        result
    }

    async fn repair_loop(&self, incident: &mut Incident, project_dir: &Path) -> Result<Status> {
        let mut attempt = self.store.latest_attempt(&incident.id)? + 1;
        let mut fixed = None;

        while attempt <= self.max_attempts && fixed.is_none() {
            tracing::info!(
                incident = incident.short_id(),
                package = %incident.dependency.name,
                attempt,
                "starting repair attempt"
            );
            match self.run_attempt(incident, attempt, project_dir).await? {
                AttemptOutcome::Fixed(plan, validation) => fixed = Some((plan, validation)),
                AttemptOutcome::Retry => attempt += 1,
            }
        }

        match fixed {
            Some((plan, validation)) => {
                self.finish_fixed(incident, &plan, &validation, project_dir)
                    .await
            }
            None => self.finish_failed(incident, attempt - 1).await,
        }
    }

    async fn run_attempt(
        &self,
        incident: &mut Incident,
        attempt: u32,
        project_dir: &Path,
    ) -> Result<AttemptOutcome> {
        self.transition(incident, Status::Analyzing)?;
        let latest_reward = self.store.latest_reward(&incident.id)?;
        let plan = match self
            .planner
            .propose(incident, attempt, latest_reward.as_ref())
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(incident = incident.short_id(), attempt, %err, "planning failed");
                self.attempt_event(
                    incident,
                    attempt,
                    Stage::Planning,
                    serde_json::json!({ "error": err.to_string() }),
                )
                .await?;
                return Ok(AttemptOutcome::Retry);
            }
        };
        self.store.insert_plan(&plan)?;

        self.transition(incident, Status::Patching)?;
        if let Err(err) = self.dispatcher.dispatch(&plan, project_dir).await {
            tracing::warn!(incident = incident.short_id(), attempt, %err, "dispatch failed");
            self.attempt_event(
                incident,
                attempt,
                Stage::Dispatch,
                serde_json::json!({ "plan": plan, "error": err.to_string() }),
            )
            .await?;
            return Ok(AttemptOutcome::Retry);
        }

        self.transition(incident, Status::Validating)?;
        let validation = self
            .validator
            .validate(incident, attempt, project_dir)
            .await?;
        self.attempt_event(
            incident,
            attempt,
            Stage::Validation,
            serde_json::json!({ "plan": plan, "validation": validation }),
        )
        .await?;

        if validation.success {
            Ok(AttemptOutcome::Fixed(plan, validation))
        } else {
            Ok(AttemptOutcome::Retry)
        }
    }

    async fn finish_fixed(
        &self,
        incident: &mut Incident,
        plan: &RepairPlan,
        validation: &ValidationResult,
        project_dir: &Path,
    ) -> Result<Status> {
        self.transition(incident, Status::Fixed)?;
        let event = Event::new(
            "fixed",
            Some(&incident.id),
            serde_json::json!({ "incident": incident, "plan": plan }),
        );
        self.store.insert_event(&event)?;
        self.reporter.push_event(&event).await;

        if let Err(err) = self
            .reporter
            .report_fixed(incident, plan, validation, project_dir)
            .await
        {
            tracing::warn!(incident = incident.short_id(), %err, "pull request creation failed");
        }

        tracing::info!(
            incident = incident.short_id(),
            package = %incident.dependency.name,
            "incident fixed"
        );
        Ok(Status::Fixed)
    }

    async fn finish_failed(&self, incident: &mut Incident, attempts: u32) -> Result<Status> {
        self.transition(incident, Status::Failed)?;
        let event = Event::new(
            "failed",
            Some(&incident.id),
            serde_json::json!({ "incident": incident, "attempts": attempts }),
        );
        self.store.insert_event(&event)?;
        self.reporter.push_event(&event).await;

        tracing::warn!(
            incident = incident.short_id(),
            package = %incident.dependency.name,
            attempts,
            "attempts exhausted, incident failed"
        );
        Ok(Status::Failed)
    }

    /// Persist a status change. Terminal states never transition again.
    fn transition(&self, incident: &mut Incident, status: Status) -> Result<()> {
        if incident.status.is_terminal() {
            bail!(
                "incident {} cannot leave terminal state {}",
                incident.id,
                incident.status.label()
            );
        }
        incident.status = status;
        self.store.upsert_incident(incident)
    }

    async fn attempt_event(
        &self,
        incident: &Incident,
        attempt: u32,
        stage: Stage,
        mut payload: serde_json::Value,
    ) -> Result<()> {
        payload["attempt"] = attempt.into();
        payload["stage"] = stage.label().into();
        let event = Event::new("attempt", Some(&incident.id), payload);
        self.store.insert_event(&event)?;
        self.reporter.push_event(&event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrashEvidence, DependencyUpdate, Ecosystem, FilePatch};
    use crate::validate;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // ========================================================================
    // Scripted collaborators
    // ========================================================================

    struct ScriptedPlanner {
        script: Mutex<VecDeque<Result<String>>>,
    }

    impl ScriptedPlanner {
        fn ok(summaries: &[&str]) -> Self {
            Self {
                script: Mutex::new(summaries.iter().map(|s| Ok(s.to_string())).collect()),
            }
        }

        fn with_script(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl PlanProvider for ScriptedPlanner {
        async fn propose(
            &self,
            incident: &Incident,
            _attempt: u32,
            _latest_reward: Option<&RewardSignal>,
        ) -> Result<RepairPlan> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("planner called more times than scripted");
            next.map(|summary| RepairPlan {
                incident_id: incident.id.clone(),
                summary,
                confidence: 0.9,
                rationale: "scripted".to_string(),
                patchset: vec![FilePatch {
                    path: "src/index.js".to_string(),
                    instructions: "scripted".to_string(),
                    patch_text: "--- a\n+++ b\n".to_string(),
                }],
            })
        }
    }

    struct ScriptedDispatcher {
        script: Mutex<VecDeque<Result<()>>>,
    }

    impl ScriptedDispatcher {
        fn always_ok() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
            }
        }

        fn with_script(script: Vec<Result<()>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl PatchDelivery for ScriptedDispatcher {
        async fn dispatch(&self, _plan: &RepairPlan, _project_dir: &Path) -> Result<()> {
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    /// Scripts pass/fail outcomes while keeping the real persistence
    /// contract: one validation row and one reward row per attempt.
    struct ScriptedValidator {
        store: Store,
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedValidator {
        fn new(store: Store, outcomes: &[bool]) -> Self {
            Self {
                store,
                script: Mutex::new(outcomes.iter().copied().collect()),
            }
        }
    }

    impl AttemptValidator for ScriptedValidator {
        async fn validate(
            &self,
            incident: &Incident,
            attempt: u32,
            _project_dir: &Path,
        ) -> Result<ValidationResult> {
            let success = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("validator called more times than scripted");
            let result = ValidationResult {
                incident_id: incident.id.clone(),
                success,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(if success { 0 } else { 1 }),
                new_errors: None,
            };
            validate::record(&self.store, &result, attempt)?;
            Ok(result)
        }
    }

    /// Fails the way a broken container runtime would, before any
    /// validation or reward row is written.
    struct BrokenValidator;

    impl AttemptValidator for BrokenValidator {
        async fn validate(
            &self,
            _incident: &Incident,
            _attempt: u32,
            _project_dir: &Path,
        ) -> Result<ValidationResult> {
            anyhow::bail!("container runtime unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        fixed: Mutex<Vec<String>>,
        pushed: Mutex<Vec<String>>,
    }

    impl IncidentReporter for RecordingReporter {
        async fn report_fixed(
            &self,
            _incident: &Incident,
            plan: &RepairPlan,
            _validation: &ValidationResult,
            _project_dir: &Path,
        ) -> Result<()> {
            self.fixed.lock().unwrap().push(plan.summary.clone());
            Ok(())
        }

        async fn push_event(&self, event: &Event) {
            self.pushed.lock().unwrap().push(event.kind.clone());
        }
    }

    // ========================================================================
    // Fixtures
    // ========================================================================

    fn sample_incident() -> Incident {
        Incident::new(
            DependencyUpdate {
                name: "left-pad".to_string(),
                current_version: "1.2.0".to_string(),
                latest_version: "1.3.0".to_string(),
                ecosystem: Ecosystem::Npm,
                manifest_path: "package.json".to_string(),
            },
            CrashEvidence::default(),
            "npm install && npm test".to_string(),
        )
    }

    struct Harness {
        store: Store,
        workspace: tempfile::TempDir,
        arenas: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let workspace = tempdir().unwrap();
            std::fs::write(workspace.path().join("package.json"), "{}").unwrap();
            Self {
                store: Store::open_in_memory().unwrap(),
                workspace,
                arenas: tempdir().unwrap(),
            }
        }

        fn orchestrator<P, D, V, R>(
            &self,
            planner: P,
            dispatcher: D,
            validator: V,
            reporter: R,
            max_attempts: u32,
        ) -> Orchestrator<P, D, V, R>
        where
            P: PlanProvider,
            D: PatchDelivery,
            V: AttemptValidator,
            R: IncidentReporter,
        {
            Orchestrator::new(
                self.store.clone(),
                planner,
                dispatcher,
                validator,
                reporter,
                max_attempts,
                self.arenas.path().to_path_buf(),
                self.workspace.path().to_path_buf(),
            )
        }
    }

    fn attempt_numbers(store: &Store, incident_id: &str) -> Vec<u32> {
        store
            .events_for(incident_id)
            .unwrap()
            .iter()
            .filter(|e| e.kind == "attempt")
            .map(|e| e.payload["attempt"].as_u64().unwrap() as u32)
            .collect()
    }

    fn event_kinds(store: &Store, incident_id: &str) -> Vec<String> {
        store
            .events_for(incident_id)
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }

    // ========================================================================
    // State-machine properties
    // ========================================================================

    #[tokio::test]
    async fn test_exhausted_attempts_end_failed() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&["p1", "p2", "p3"]),
            ScriptedDispatcher::always_ok(),
            ScriptedValidator::new(h.store.clone(), &[false, false, false]),
            RecordingReporter::default(),
            3,
        );

        let incident = sample_incident();
        let id = incident.id.clone();
        let status = orchestrator.run_incident(incident).await.unwrap();

        assert_eq!(status, Status::Failed);
        assert_eq!(
            h.store.get_incident(&id).unwrap().unwrap().status,
            Status::Failed
        );

        let rewards = h.store.rewards_for(&id).unwrap();
        assert_eq!(rewards.len(), 3);
        assert!(rewards.iter().all(|r| r.reward == 0));

        assert_eq!(attempt_numbers(&h.store, &id), vec![1, 2, 3]);
        assert_eq!(
            event_kinds(&h.store, &id),
            vec!["attempt", "attempt", "attempt", "failed"]
        );
        assert!(orchestrator.reporter.fixed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_on_second_attempt_ends_fixed() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&["plan-1", "plan-2"]),
            ScriptedDispatcher::always_ok(),
            ScriptedValidator::new(h.store.clone(), &[false, true]),
            RecordingReporter::default(),
            3,
        );

        let incident = sample_incident();
        let id = incident.id.clone();
        let status = orchestrator.run_incident(incident).await.unwrap();

        assert_eq!(status, Status::Fixed);
        let rewards = h.store.rewards_for(&id).unwrap();
        assert_eq!(rewards.len(), 2);
        assert_eq!(rewards[0].reward, 0);
        assert_eq!(rewards[1].reward, 1);

        assert_eq!(attempt_numbers(&h.store, &id), vec![1, 2]);
        assert_eq!(event_kinds(&h.store, &id), vec!["attempt", "attempt", "fixed"]);

        // Exactly one pull request, for the plan that validated.
        let fixed = orchestrator.reporter.fixed.lock().unwrap();
        assert_eq!(fixed.as_slice(), ["plan-2"]);
    }

    #[tokio::test]
    async fn test_planning_failure_counts_against_budget() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(
            ScriptedPlanner::with_script(vec![
                Err(anyhow::anyhow!("schema violation")),
                Ok("plan-2".to_string()),
            ]),
            ScriptedDispatcher::always_ok(),
            ScriptedValidator::new(h.store.clone(), &[true]),
            RecordingReporter::default(),
            3,
        );

        let incident = sample_incident();
        let id = incident.id.clone();
        let status = orchestrator.run_incident(incident).await.unwrap();

        assert_eq!(status, Status::Fixed);
        // No reward for the attempt that never reached validation.
        let rewards = h.store.rewards_for(&id).unwrap();
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].attempt, 2);

        let events = h.store.events_for(&id).unwrap();
        let first_attempt = events.iter().find(|e| e.kind == "attempt").unwrap();
        assert_eq!(first_attempt.payload["stage"], "planning");
        assert!(first_attempt.payload["error"]
            .as_str()
            .unwrap()
            .contains("schema violation"));
        assert_eq!(attempt_numbers(&h.store, &id), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_stage_tagged() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&["p1", "p2"]),
            ScriptedDispatcher::with_script(vec![
                Err(anyhow::anyhow!("patch dry-run failed")),
                Err(anyhow::anyhow!("patch dry-run failed")),
            ]),
            ScriptedValidator::new(h.store.clone(), &[]),
            RecordingReporter::default(),
            2,
        );

        let incident = sample_incident();
        let id = incident.id.clone();
        let status = orchestrator.run_incident(incident).await.unwrap();

        assert_eq!(status, Status::Failed);
        assert!(h.store.rewards_for(&id).unwrap().is_empty());
        let events = h.store.events_for(&id).unwrap();
        let stages: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == "attempt")
            .map(|e| e.payload["stage"].as_str().unwrap())
            .collect();
        assert_eq!(stages, vec!["dispatch", "dispatch"]);
    }

    #[tokio::test]
    async fn test_terminal_incident_skips_redelivery() {
        let h = Harness::new();
        let mut incident = sample_incident();
        incident.status = Status::Fixed;
        h.store.upsert_incident(&incident).unwrap();

        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&[]),
            ScriptedDispatcher::always_ok(),
            ScriptedValidator::new(h.store.clone(), &[]),
            RecordingReporter::default(),
            3,
        );

        let status = orchestrator.run_incident(incident.clone()).await.unwrap();
        assert_eq!(status, Status::Fixed);
        // No events appended after the terminal snapshot.
        assert!(h.store.events_for(&incident.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_numbering_resumes_from_history() {
        let h = Harness::new();
        let incident = sample_incident();
        let id = incident.id.clone();
        h.store.upsert_incident(&incident).unwrap();
        // A previous job invocation already consumed attempt 1.
        h.store
            .insert_reward(&RewardSignal {
                incident_id: id.clone(),
                attempt: 1,
                reward: 0,
            })
            .unwrap();

        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&["plan-2"]),
            ScriptedDispatcher::always_ok(),
            ScriptedValidator::new(h.store.clone(), &[true]),
            RecordingReporter::default(),
            3,
        );

        let status = orchestrator.run_incident(incident).await.unwrap();
        assert_eq!(status, Status::Fixed);
        assert_eq!(attempt_numbers(&h.store, &id), vec![2]);
        assert_eq!(h.store.rewards_for(&id).unwrap().last().unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_sandbox_arena_removed_after_run() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&["p1"]),
            ScriptedDispatcher::always_ok(),
            ScriptedValidator::new(h.store.clone(), &[true]),
            RecordingReporter::default(),
            3,
        );

        let incident = sample_incident();
        let id = incident.id.clone();
        orchestrator.run_incident(incident).await.unwrap();
        assert!(!h.arenas.path().join(&id).exists());
    }

    #[tokio::test]
    async fn test_sandbox_arena_removed_when_attempt_errors() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(
            ScriptedPlanner::ok(&["p1"]),
            ScriptedDispatcher::always_ok(),
            BrokenValidator,
            RecordingReporter::default(),
            3,
        );

        let incident = sample_incident();
        let id = incident.id.clone();
        let result = orchestrator.run_incident(incident).await;

        assert!(result.is_err());
        assert!(!h.arenas.path().join(&id).exists());
    }
}
