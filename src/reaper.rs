//! Reclamation of idle sessions.

use crate::affinity::OwnerLock;
use crate::error::StoreError;
use crate::process_signal::signal_group;
use crate::provisioner::SandboxProvisioner;
use crate::registry::{Preemption, WorkerRegistry};
use crate::state::{Session, SessionState};
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Tears sessions down: stops the worker, releases the sandbox, and removes
/// the record and owner mapping. Shared by the reaper, the affinity resolver
/// and explicit deletes so they all mutate sessions the same way.
pub struct Reclaimer {
    store: SessionStore,
    provisioner: Arc<dyn SandboxProvisioner>,
    registry: Arc<WorkerRegistry>,
    kill_grace: Duration,
}

impl Reclaimer {
    pub fn new(
        store: SessionStore,
        provisioner: Arc<dyn SandboxProvisioner>,
        registry: Arc<WorkerRegistry>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            registry,
            kill_grace,
        }
    }

    /// Make sure no worker is running for `session`.
    pub async fn stop_worker(&self, session: &Session) {
        let wait = self.kill_grace + Duration::from_secs(5);
        if self.registry.preempt(&session.id, wait).await == Preemption::Stopped {
            return;
        }
        let Some(process) = &session.current_process else {
            return;
        };
        if process.instance_id == self.registry.instance_id() {
            // Recorded here but no stream confirmed its death.
            warn!(session_id = %session.id, pid = process.pid, "Killing unattended worker");
            if let Err(e) = signal_group(process.pid, Signal::SIGKILL) {
                warn!(pid = process.pid, "Kill failed: {}", e);
            }
        } else {
            warn!(
                session_id = %session.id,
                instance = %process.instance_id,
                "Worker belongs to another instance; it dies with its stream"
            );
        }
    }

    /// Tear a session down. Sandbox release failures are logged and the
    /// record is removed regardless.
    pub async fn reclaim(&self, mut session: Session) -> Result<(), StoreError> {
        info!(session_id = %session.id, owner = %session.owner_key, "Reclaiming session");
        session.state = SessionState::Reclaiming;
        self.store.put(&session).await?;

        self.stop_worker(&session).await;

        if let Some(sandbox) = &session.sandbox {
            if let Err(e) = self.provisioner.release(sandbox).await {
                warn!(session_id = %session.id, sandbox = %sandbox.id, "Sandbox release failed: {}", e);
            }
        }

        self.store.delete(&session.id).await?;
        self.store
            .delete_owner_mapping_if(&session.owner_key, &session.id)
            .await?;
        debug!(session_id = %session.id, "Session closed");
        Ok(())
    }
}

/// Periodic sweep reclaiming sessions idle past the TTL.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct Reaper {
    store: SessionStore,
    reclaimer: Arc<Reclaimer>,
    ttl: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        store: SessionStore,
        reclaimer: Arc<Reclaimer>,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            reclaimer,
            ttl,
            // A zero period would make the ticker panic.
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Sweep until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(ttl = ?self.ttl, interval = ?self.interval, "Reaper started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reclaimed = self.sweep_at(Utc::now()).await;
                    if reclaimed > 0 {
                        info!(reclaimed, "Reaper sweep finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reaper stopped");
    }

    /// One sweep as of `now`. Returns how many sessions were reclaimed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let sessions = match self.store.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("Reaper could not list sessions: {}", e);
                return 0;
            }
        };

        let mut reclaimed = 0;
        for session in sessions {
            if !session.is_expired(now, self.ttl) {
                continue;
            }
            match self.reclaim_if_idle(&session.owner_key, &session.id, now).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id, "Reclaim failed: {}", e),
            }
        }
        reclaimed
    }

    async fn reclaim_if_idle(
        &self,
        owner: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // A request holding the owner's lock may be reviving this session;
        // leave it for the next sweep.
        let Some(lock) = OwnerLock::try_acquire(self.store.kv(), owner).await? else {
            debug!(session_id = %id, "Owner busy, skipping");
            return Ok(false);
        };

        let result = match self.store.get(id).await {
            Ok(Some(session)) if session.is_expired(now, self.ttl) => {
                self.reclaimer.reclaim(session).await.map(|_| true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        lock.release().await;
        result
    }
}
