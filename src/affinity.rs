//! Caller affinity: each owner key maps to at most one live session.
//!
//! Every read-decide-write on an owner's mapping happens under an
//! `OwnerLock`, a lease held in the shared store, so two instances (or two
//! requests on one instance) never both decide to create a session.

use crate::error::{BrokerError, StoreError};
use crate::reaper::Reclaimer;
use crate::state::Session;
use crate::store::{lock_key, KvStore, SessionStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest a lease survives a holder that never releases it.
const LOCK_LEASE: Duration = Duration::from_secs(90);
const LOCK_POLL: Duration = Duration::from_millis(100);

/// Lease on one owner's session state.
pub struct OwnerLock {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    held: bool,
}

impl OwnerLock {
    /// Take the lease, waiting up to `wait` for the current holder.
    pub async fn acquire(
        kv: &Arc<dyn KvStore>,
        owner: &str,
        wait: Duration,
    ) -> Result<Self, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(kv, owner).await? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::LockTimeout(owner.to_string()));
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    /// Take the lease only if it is free right now.
    pub async fn try_acquire(
        kv: &Arc<dyn KvStore>,
        owner: &str,
    ) -> Result<Option<Self>, StoreError> {
        let key = lock_key(owner);
        let token = uuid::Uuid::new_v4().to_string();
        if kv.set_if_absent(&key, &token, Some(LOCK_LEASE)).await? {
            debug!(owner, "Owner lock acquired");
            Ok(Some(Self {
                kv: Arc::clone(kv),
                key,
                token,
                held: true,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) {
        self.held = false;
        if let Err(e) = self.kv.delete_if_equals(&self.key, &self.token).await {
            warn!(key = %self.key, "Owner lock release failed: {}", e);
        }
    }
}

impl Drop for OwnerLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        // Dropped without release (early return or panic): free it in the
        // background, otherwise the lease runs out on its own.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let kv = Arc::clone(&self.kv);
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                let _ = kv.delete_if_equals(&key, &token).await;
            });
        }
    }
}

/// Decides whether an owner's request reuses its existing session.
pub struct AffinityResolver {
    store: SessionStore,
    reclaimer: Arc<Reclaimer>,
    ttl: Duration,
}

impl AffinityResolver {
    pub fn new(store: SessionStore, reclaimer: Arc<Reclaimer>, ttl: Duration) -> Self {
        Self {
            store,
            reclaimer,
            ttl,
        }
    }

    /// Return the owner's live session, marking it active. A mapped session
    /// idle past the TTL is torn down instead and `None` is returned.
    /// Callers hold the owner's lock.
    pub async fn resolve(
        &self,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let Some(id) = self.store.get_by_owner(owner).await? else {
            return Ok(None);
        };

        let Some(mut session) = self.store.get(&id).await? else {
            debug!(owner, session_id = %id, "Dropping mapping to a missing session");
            self.store.delete_owner_mapping_if(owner, &id).await?;
            return Ok(None);
        };

        if session.is_expired(now, self.ttl) {
            info!(owner, session_id = %id, "Owner's session expired, tearing it down");
            self.reclaimer.reclaim(session).await?;
            return Ok(None);
        }

        session.touch(now);
        self.store.put(&session).await?;
        info!(owner, session_id = %id, "Reusing session");
        Ok(Some(session))
    }

    /// Map `owner` to a freshly created session. Fails with `AffinityRace`
    /// if another session claimed the owner first.
    pub async fn assign(&self, owner: &str, id: &str) -> Result<(), BrokerError> {
        match self.store.claim_owner(owner, id).await? {
            None => Ok(()),
            Some(existing) if existing == id => Ok(()),
            Some(existing) => {
                warn!(owner, winner = %existing, loser = %id, "Lost owner claim");
                Err(BrokerError::AffinityRace(owner.to_string()))
            }
        }
    }
}
