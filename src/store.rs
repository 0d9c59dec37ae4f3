//! Shared session storage.
//!
//! Sessions live in a key-value store shared by every broker instance. Redis
//! is the production backend; `MemoryKv` serves single-instance runs and tests.
//! Nothing here caches: every read goes to the store.

use crate::affinity::OwnerLock;
use crate::error::StoreError;
use crate::state::Session;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

const SESSION_PREFIX: &str = "broker:session:";
const OWNER_PREFIX: &str = "broker:owner:";
const LOCK_PREFIX: &str = "broker:lock:";

pub type Result<T> = std::result::Result<T, StoreError>;

/// Minimal key-value capability the broker needs from a shared store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically create `key`. Returns false if it already exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically delete `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store. Only correct when a single broker instance runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.live(now) && e.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live(now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Redis-backed store shared across broker instances.
///
/// One multiplexed connection serves every call; it reconnects on its own
/// after the server drops it.
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            conn: ConnectionManager::new(client).await?,
        })
    }
}

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(COMPARE_AND_DELETE);
        let removed: i64 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

fn session_key(id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

fn owner_key(owner: &str) -> String {
    format!("{}{}", OWNER_PREFIX, owner)
}

pub(crate) fn lock_key(owner: &str) -> String {
    format!("{}{}", LOCK_PREFIX, owner)
}

/// Session records plus the owner → session index, both write-through to
/// the shared store.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        match self.kv.get(&session_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, session: &Session) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.kv.set(&session_key(&session.id), &raw).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.kv.delete(&session_key(id)).await
    }

    pub async fn get_by_owner(&self, owner: &str) -> Result<Option<String>> {
        self.kv.get(&owner_key(owner)).await
    }

    pub async fn set_owner_mapping(&self, owner: &str, id: &str) -> Result<()> {
        self.kv.set(&owner_key(owner), id).await
    }

    /// Map `owner` to `id` unless a mapping already exists. Returns the
    /// existing session id when the claim loses.
    pub async fn claim_owner(&self, owner: &str, id: &str) -> Result<Option<String>> {
        let key = owner_key(owner);
        if self.kv.set_if_absent(&key, id, None).await? {
            return Ok(None);
        }
        Ok(Some(self.kv.get(&key).await?.unwrap_or_default()))
    }

    pub async fn delete_owner_mapping(&self, owner: &str) -> Result<()> {
        self.kv.delete(&owner_key(owner)).await
    }

    /// Remove the owner mapping only if it still points at `id`.
    pub async fn delete_owner_mapping_if(&self, owner: &str, id: &str) -> Result<bool> {
        self.kv.delete_if_equals(&owner_key(owner), id).await
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        let keys = self.kv.keys_with_prefix(SESSION_PREFIX).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            // A record may vanish between the scan and the read.
            if let Some(raw) = self.kv.get(&key).await? {
                sessions.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(sessions)
    }

    /// Refresh a session's liveness. Returns false if the session is gone,
    /// being reclaimed, or its owner's lock is held elsewhere; such records
    /// are never written back.
    ///
    /// The write happens under the owner's lock, the same lock a reclaim
    /// holds, so a touch cannot land after a teardown deleted the record.
    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(session) = self.get(id).await? else {
            debug!(session_id = %id, "Touch on missing session");
            return Ok(false);
        };
        if session.is_reclaiming() {
            return Ok(false);
        }
        let Some(lock) = OwnerLock::try_acquire(&self.kv, &session.owner_key).await? else {
            debug!(session_id = %id, "Owner busy, skipping touch");
            return Ok(false);
        };

        let touched = match self.get(id).await {
            Ok(Some(mut session)) if !session.is_reclaiming() => {
                session.touch(now);
                self.put(&session).await.map(|()| true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        lock.release().await;
        touched
    }
}
