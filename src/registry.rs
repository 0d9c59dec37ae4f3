//! Workers streaming on this instance, by session.
//!
//! Whoever needs a session's worker gone (a newer request for the same
//! owner, the reaper, an explicit teardown) asks the stream driving it to
//! stop. The stream kills the worker's process group and then acknowledges,
//! so the caller knows the worker is dead before it proceeds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Sent to a stream to make it stop its worker; the stream replies on the
/// enclosed channel once the worker is dead.
pub type PreemptRequest = oneshot::Sender<()>;

/// Outcome of asking a registered worker to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preemption {
    /// No stream on this instance drives the session.
    NotRegistered,
    /// The stream confirmed its worker is dead.
    Stopped,
    /// The stream did not answer in time; the worker may still run.
    Unacknowledged,
}

struct Slot {
    worker_id: String,
    preempt: oneshot::Sender<PreemptRequest>,
}

pub struct WorkerRegistry {
    instance_id: String,
    slots: Mutex<HashMap<String, Slot>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Identifies this broker process in recorded worker references.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register the worker now driving `session_id`. The returned receiver
    /// yields a request when someone wants the worker stopped.
    pub fn register(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> oneshot::Receiver<PreemptRequest> {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(
            session_id.to_string(),
            Slot {
                worker_id: worker_id.to_string(),
                preempt: tx,
            },
        );
        if let Some(previous) = previous {
            warn!(session_id, worker_id = %previous.worker_id, "Replaced a still-registered worker");
        }
        rx
    }

    /// Drop the registration if it still belongs to `worker_id`.
    pub fn unregister(&self, session_id: &str, worker_id: &str) {
        let mut slots = self.lock();
        if slots
            .get(session_id)
            .is_some_and(|slot| slot.worker_id == worker_id)
        {
            slots.remove(session_id);
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Stop the worker registered for `session_id` and wait up to `wait` for
    /// its stream to confirm it is dead.
    pub async fn preempt(&self, session_id: &str, wait: Duration) -> Preemption {
        let slot = self.lock().remove(session_id);
        let Some(slot) = slot else {
            return Preemption::NotRegistered;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if slot.preempt.send(ack_tx).is_err() {
            // The stream already finished and took its worker with it.
            debug!(session_id, worker_id = %slot.worker_id, "Worker stream already gone");
            return Preemption::Stopped;
        }

        match tokio::time::timeout(wait, ack_rx).await {
            // A dropped ack means the stream returned, which it only does
            // once the worker is gone.
            Ok(_) => {
                debug!(session_id, worker_id = %slot.worker_id, "Worker preempted");
                Preemption::Stopped
            }
            Err(_) => {
                warn!(session_id, worker_id = %slot.worker_id, "Preemption not acknowledged in time");
                Preemption::Unacknowledged
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preempt_waits_for_acknowledgement() {
        let registry = WorkerRegistry::new();
        let rx = registry.register("s1", "w1");

        let stream = tokio::spawn(async move {
            let ack = rx.await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            ack.send(()).unwrap();
        });

        assert_eq!(registry.preempt("s1", Duration::from_secs(2)).await, Preemption::Stopped);
        stream.await.unwrap();
        assert!(!registry.contains("s1"));
    }

    #[tokio::test]
    async fn preempt_without_registration_reports_not_registered() {
        let registry = WorkerRegistry::new();
        assert_eq!(
            registry.preempt("missing", Duration::from_millis(10)).await,
            Preemption::NotRegistered
        );
    }

    #[tokio::test]
    async fn silent_stream_is_reported_unacknowledged() {
        let registry = WorkerRegistry::new();
        let rx = registry.register("s1", "w1");

        // Takes the request but never answers it.
        let stream = tokio::spawn(async move {
            let ack = rx.await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(ack);
        });

        assert_eq!(
            registry.preempt("s1", Duration::from_millis(50)).await,
            Preemption::Unacknowledged
        );
        stream.await.unwrap();
    }

    #[tokio::test]
    async fn finished_stream_counts_as_stopped() {
        let registry = WorkerRegistry::new();
        drop(registry.register("s1", "w1"));
        assert_eq!(registry.preempt("s1", Duration::from_millis(50)).await, Preemption::Stopped);
    }

    #[test]
    fn stale_unregister_keeps_newer_worker() {
        let registry = WorkerRegistry::new();
        let _old = registry.register("s1", "old");
        let _new = registry.register("s1", "new");
        registry.unregister("s1", "old");
        assert!(registry.contains("s1"));
        registry.unregister("s1", "new");
        assert!(!registry.contains("s1"));
    }
}
