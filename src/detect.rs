//! Upgrade detection
//!
//! One detection pass walks the watched project for exact-pinned
//! dependencies, asks each registry for the latest published version, and
//! simulates every strict upgrade inside a throwaway sandbox copy. A clean
//! simulation is discarded without a trace; a crashing one becomes an
//! incident with its evidence attached and an `incident` event in the log.
//!
//! A registry miss or a botched simulation never aborts the pass. Passes
//! are serialized by the queue, so the per-package arena names cannot
//! collide.

use anyhow::Result;
use std::path::PathBuf;

use crate::config::Config;
use crate::manifest::{self, PinnedDependency};
use crate::model::{DependencyUpdate, Ecosystem, Event, Incident};
use crate::registry::RegistryClient;
use crate::report::Reporter;
use crate::sandbox::{SandboxArena, SandboxResult, SandboxRunner};
use crate::store::Store;
use crate::version;

/// What one detection pass saw, for logs and the `detect` subcommand.
#[derive(Debug, Default)]
pub struct DetectionSummary {
    /// Exact-pinned dependencies found in the manifests.
    pub pinned: usize,
    /// Pins with a strictly newer published version.
    pub upgrades: usize,
    /// Upgrades whose simulation crashed.
    pub incidents: Vec<Incident>,
}

pub struct Detector {
    registry: RegistryClient,
    runner: SandboxRunner,
    store: Store,
    reporter: Reporter,
    workspace: PathBuf,
    arena_root: PathBuf,
    npm_test_cmd: String,
    py_test_cmd: String,
}

impl Detector {
    pub fn new(config: &Config, store: Store, reporter: Reporter) -> Result<Self> {
        Ok(Self {
            registry: RegistryClient::new(config.registry_timeout)?,
            runner: SandboxRunner::new(
                config.sandbox_image.clone(),
                config.sandbox_workdir.clone(),
                config.sandbox_timeout,
            ),
            store,
            reporter,
            workspace: config.workspace.clone(),
            arena_root: config.arena_root(),
            npm_test_cmd: config.npm_test_cmd.clone(),
            py_test_cmd: config.py_test_cmd.clone(),
        })
    }

    /// Run one detection pass over the workspace.
    ///
    /// Returns the incidents it opened; the caller decides whether to queue
    /// them for repair.
    pub async fn run_pass(&self) -> Result<DetectionSummary> {
        let pins = manifest::scan(&self.workspace)?;
        tracing::info!(pinned = pins.len(), "detection pass started");

        let mut summary = DetectionSummary {
            pinned: pins.len(),
            ..Default::default()
        };

        for pin in &pins {
            let Some(latest) = self.registry.latest_version(pin.ecosystem, &pin.name).await
            else {
                continue;
            };
            let Some(update) = upgrade_candidate(pin, latest) else {
                continue;
            };
            summary.upgrades += 1;

            tracing::info!(
                package = %update.name,
                from = %update.current_version,
                to = %update.latest_version,
                "simulating upgrade"
            );
            match self.simulate(&update).await {
                Ok(Some(incident)) => {
                    tracing::warn!(
                        package = %update.name,
                        incident = incident.short_id(),
                        "upgrade crashed, incident opened"
                    );
                    summary.incidents.push(incident);
                }
                Ok(None) => {
                    tracing::info!(package = %update.name, "upgrade passed cleanly");
                }
                Err(err) => {
                    tracing::warn!(package = %update.name, %err, "simulation setup failed");
                }
            }
        }

        tracing::info!(
            pinned = summary.pinned,
            upgrades = summary.upgrades,
            incidents = summary.incidents.len(),
            "detection pass finished"
        );
        Ok(summary)
    }

    /// Try the upgrade in a fresh sandbox copy of the workspace. Returns a
    /// persisted incident when the pipeline crashes, `None` when it passes.
    async fn simulate(&self, update: &DependencyUpdate) -> Result<Option<Incident>> {
        let arena = SandboxArena::create(&self.arena_root, &update.name, &self.workspace)?;
        let test_cmd = match update.ecosystem {
            Ecosystem::Npm => &self.npm_test_cmd,
            Ecosystem::Pip => &self.py_test_cmd,
        };
        let run = self
            .runner
            .run(update, test_cmd, &arena.project_dir())
            .await;
        if let Err(err) = arena.destroy() {
            tracing::warn!(package = %update.name, %err, "failed to remove detection sandbox");
        }

        if !run.crashed {
            return Ok(None);
        }
        let incident = incident_from(update.clone(), &run);
        self.store.upsert_incident(&incident)?;
        let event = Event::new(
            "incident",
            Some(&incident.id),
            serde_json::json!({ "incident": incident }),
        );
        self.store.insert_event(&event)?;
        self.reporter.push(&event).await;
        Ok(Some(incident))
    }
}

/// Promote a pin to an upgrade candidate when a strictly newer version is
/// published. Anything else, including versions we cannot parse, is left
/// alone.
fn upgrade_candidate(pin: &PinnedDependency, latest: String) -> Option<DependencyUpdate> {
    if !version::is_upgrade(&latest, &pin.version) {
        return None;
    }
    Some(DependencyUpdate {
        name: pin.name.clone(),
        current_version: pin.version.clone(),
        latest_version: latest,
        ecosystem: pin.ecosystem,
        manifest_path: pin.manifest_path.clone(),
    })
}

fn incident_from(update: DependencyUpdate, run: &SandboxResult) -> Incident {
    let evidence = run.evidence.clone().unwrap_or_default();
    Incident::new(update, evidence, run.command.clone())
}
