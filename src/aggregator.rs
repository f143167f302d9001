//! Progress Aggregator (§4.7): correlates upstream worker events with
//! internal job/session identities and fans them out to per-session
//! subscriber channels as normalized `SessionEvent`s.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{model::SessionEvent, worker_client::WorkerEvent};

#[derive(Debug, Clone, Copy)]
struct Correlation {
    job_id: Uuid,
    session_id: Uuid,
}

#[derive(Default)]
struct AggregatorState {
    correlations: HashMap<String, Correlation>,
    subscribers: HashMap<Uuid, Vec<mpsc::Sender<SessionEvent>>>,
}

/// Owns the correlation table (`worker_job_id -> (job_id, session_id)`) and
/// the per-session subscriber fan-out. Cheap to clone; state lives behind an
/// `Arc<RwLock<_>>` as with the Registry.
#[derive(Clone, Default)]
pub struct Aggregator {
    state: Arc<RwLock<AggregatorState>>,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserted by the Job Executor immediately after a successful submit;
    /// removed once the job reaches a terminal state.
    pub async fn register(&self, worker_job_id: String, job_id: Uuid, session_id: Uuid) {
        let mut guard = self.state.write().await;
        guard
            .correlations
            .insert(worker_job_id, Correlation { job_id, session_id });
    }

    pub async fn deregister(&self, worker_job_id: &str) {
        let mut guard = self.state.write().await;
        guard.correlations.remove(worker_job_id);
    }

    /// Opens a new bounded subscription for a session's downstream events.
    #[must_use]
    pub async fn subscribe(&self, session_id: Uuid, capacity: usize) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut guard = self.state.write().await;
        guard.subscribers.entry(session_id).or_default().push(tx);
        rx
    }

    /// Normalizes one upstream event for a node's worker-job id and
    /// publishes it to the corresponding session, if any subscriber is
    /// registered. Events for unrecognized worker-job ids (already
    /// deregistered, or belonging to another orchestrator instance) are
    /// silently discarded.
    pub async fn handle_worker_event(&self, worker_job_id: &str, event: WorkerEvent) {
        let correlation = {
            let guard = self.state.read().await;
            guard.correlations.get(worker_job_id).copied()
        };
        let Some(correlation) = correlation else {
            return;
        };

        let normalized = match event {
            WorkerEvent::Progress { value, max, .. } => Some(SessionEvent::Progress {
                generation_id: correlation.job_id,
                current_step: value,
                total_steps: max,
            }),
            WorkerEvent::Executed { .. } | WorkerEvent::Status { .. } | WorkerEvent::Heartbeat => None,
        };

        if let Some(event) = normalized {
            self.publish(correlation.session_id, event).await;
        }
    }

    /// Publishes a normalized event to every subscriber of a session.
    /// `Complete`/`Error`/`BatchComplete` are never dropped for backpressure;
    /// plain `Progress`/`BatchProgress` updates are dropped on a full channel
    /// rather than blocking the publisher.
    pub async fn publish(&self, session_id: Uuid, event: SessionEvent) {
        let senders = {
            let guard = self.state.read().await;
            guard.subscribers.get(&session_id).cloned().unwrap_or_default()
        };
        if senders.is_empty() {
            return;
        }

        let critical = matches!(
            event,
            SessionEvent::Complete { .. } | SessionEvent::Error { .. } | SessionEvent::BatchComplete { .. }
        );

        let mut dead = Vec::new();
        for (i, tx) in senders.iter().enumerate() {
            let delivered = if critical {
                tx.send(event.clone()).await.is_ok()
            } else {
                match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            };
            if !delivered {
                dead.push(i);
            }
        }

        if !dead.is_empty() {
            let mut guard = self.state.write().await;
            if let Some(list) = guard.subscribers.get_mut(&session_id) {
                for &i in dead.iter().rev() {
                    if i < list.len() {
                        list.remove(i);
                    }
                }
            }
        }
    }

    /// Spawns the task draining one node's `WorkerClient` event-stream
    /// receiver for the lifetime of the process.
    pub fn spawn_consumer(&self, node_id: String, mut rx: mpsc::Receiver<WorkerEvent>) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let prompt_id = match &event {
                    WorkerEvent::Progress { prompt_id, .. } | WorkerEvent::Executed { prompt_id, .. } => {
                        Some(prompt_id.clone())
                    }
                    WorkerEvent::Status { .. } | WorkerEvent::Heartbeat => None,
                };
                if let Some(prompt_id) = prompt_id {
                    aggregator.handle_worker_event(&prompt_id, event).await;
                }
            }
            tracing::info!(node_id = %node_id, "worker event stream consumer exiting");
        })
    }
}
