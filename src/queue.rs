//! Job queue for the daemon
//!
//! Two workers share the load: detection passes run strictly one at a time
//! on their own channel, and incident repairs fan out up to the configured
//! parallelism on theirs. Handles are cheap to clone; enqueueing never
//! blocks the caller.
//!
//! A worker outlives any single job: a panicking incident run is caught and
//! logged, not allowed to take the worker down with it.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

use crate::detect::Detector;
use crate::dispatch::Dispatcher;
use crate::model::Incident;
use crate::planner::Planner;
use crate::report::Reporter;
use crate::validate::SandboxValidator;
use crate::workflow::Orchestrator;

/// The orchestrator wired with the live collaborators.
pub type LiveOrchestrator = Orchestrator<Planner, Dispatcher, SandboxValidator, Reporter>;

#[derive(Clone)]
pub struct JobQueue {
    detection_tx: mpsc::UnboundedSender<()>,
    incident_tx: mpsc::UnboundedSender<Incident>,
}

impl JobQueue {
    pub fn enqueue_detection(&self) {
        if self.detection_tx.send(()).is_err() {
            tracing::warn!("detection worker is gone, dropping job");
        }
    }

    pub fn enqueue_incident(&self, incident: Incident) {
        let short = incident.short_id().to_string();
        if self.incident_tx.send(incident).is_err() {
            tracing::warn!(incident = %short, "incident worker is gone, dropping job");
        }
    }
}

/// Spawn the two workers and hand back the shared queue handle.
pub fn start(
    detector: Detector,
    orchestrator: LiveOrchestrator,
    max_parallel_incidents: usize,
) -> JobQueue {
    let (detection_tx, detection_rx) = mpsc::unbounded_channel();
    let (incident_tx, incident_rx) = mpsc::unbounded_channel();
    let queue = JobQueue {
        detection_tx,
        incident_tx,
    };

    tokio::spawn(detection_worker(detection_rx, detector, queue.clone()));
    tokio::spawn(incident_worker(
        incident_rx,
        orchestrator,
        max_parallel_incidents,
    ));
    queue
}

/// Enqueue a detection pass now and then on every interval tick.
pub fn spawn_scheduler(queue: JobQueue, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            queue.enqueue_detection();
        }
    });
}

async fn detection_worker(
    mut rx: mpsc::UnboundedReceiver<()>,
    detector: Detector,
    queue: JobQueue,
) {
    while rx.recv().await.is_some() {
        match detector.run_pass().await {
            Ok(summary) => {
                for incident in summary.incidents {
                    queue.enqueue_incident(incident);
                }
            }
            Err(err) => tracing::error!(%err, "detection pass failed"),
        }
    }
}

async fn incident_worker(
    mut rx: mpsc::UnboundedReceiver<Incident>,
    orchestrator: LiveOrchestrator,
    max_parallel: usize,
) {
    let orchestrator = Arc::new(orchestrator);
    let limiter = Arc::new(Semaphore::new(max_parallel.max(1)));

    while let Some(incident) = rx.recv().await {
        let Ok(permit) = limiter.clone().acquire_owned().await else {
            break;
        };
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let short = incident.short_id().to_string();
            match AssertUnwindSafe(orchestrator.run_incident(incident))
                .catch_unwind()
                .await
            {
                Ok(Ok(status)) => {
                    tracing::info!(incident = %short, status = status.label(), "incident job finished");
                }
                Ok(Err(err)) => tracing::error!(incident = %short, %err, "incident job failed"),
                Err(_) => tracing::error!(incident = %short, "incident job panicked"),
            }
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrashEvidence, DependencyUpdate, Ecosystem};

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

    #[tokio::test]
    async fn test_enqueue_delivers_jobs() {
        let (detection_tx, mut detection_rx) = mpsc::unbounded_channel();
        let (incident_tx, mut incident_rx) = mpsc::unbounded_channel();
        let queue = JobQueue {
            detection_tx,
            incident_tx,
        };

        queue.enqueue_detection();
        assert!(detection_rx.recv().await.is_some());

        let incident = sample_incident();
        let id = incident.id.clone();
        queue.enqueue_incident(incident);
        assert_eq!(incident_rx.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_enqueue_survives_dead_workers() {
        let (detection_tx, detection_rx) = mpsc::unbounded_channel();
        let (incident_tx, incident_rx) = mpsc::unbounded_channel();
        drop(detection_rx);
        drop(incident_rx);

        let queue = JobQueue {
            detection_tx,
            incident_tx,
        };
        queue.enqueue_detection();
        queue.enqueue_incident(sample_incident());
    }

    #[tokio::test]
    async fn test_scheduler_fires_immediately() {
        let (detection_tx, mut detection_rx) = mpsc::unbounded_channel();
        let (incident_tx, _incident_rx) = mpsc::unbounded_channel();
        let queue = JobQueue {
            detection_tx,
            incident_tx,
        };

        spawn_scheduler(queue, Duration::from_secs(3600));
        tokio::time::timeout(Duration::from_secs(2), detection_rx.recv())
            .await
            .expect("first tick fires without waiting for the interval")
            .expect("job delivered");
    }
}
