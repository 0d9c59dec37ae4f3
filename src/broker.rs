//! Request orchestration for `/start` and the session administration routes.
//!
//! A start takes the owner's lock, reuses or provisions the session, launches
//! the worker and releases the lock; the multiplexer then streams without it.

use crate::affinity::{AffinityResolver, OwnerLock};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, ProvisioningError};
use crate::provisioner::SandboxProvisioner;
use crate::reaper::{Reaper, Reclaimer};
use crate::registry::{PreemptRequest, WorkerRegistry};
use crate::state::{ProcessRef, Session, SessionState};
use crate::store::{KvStore, SessionStore};
use crate::stream::{Multiplexer, StreamEvent};
use crate::supervisor::{ProcessHandle, Supervisor};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Longest a request waits for another request of the same owner.
const LOCK_WAIT: Duration = Duration::from_secs(60);
const EVENT_BUFFER: usize = 64;

struct Launch {
    session: Session,
    handle: ProcessHandle,
    preempt: oneshot::Receiver<PreemptRequest>,
    reused: bool,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    store: SessionStore,
    provisioner: Arc<dyn SandboxProvisioner>,
    supervisor: Supervisor,
    registry: Arc<WorkerRegistry>,
    reclaimer: Arc<Reclaimer>,
    affinity: AffinityResolver,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        kv: Arc<dyn KvStore>,
        provisioner: Arc<dyn SandboxProvisioner>,
    ) -> Self {
        let config = Arc::new(config);
        let store = SessionStore::new(kv);
        let registry = Arc::new(WorkerRegistry::new());
        let reclaimer = Arc::new(Reclaimer::new(
            store.clone(),
            Arc::clone(&provisioner),
            Arc::clone(&registry),
            config.kill_grace,
        ));
        let affinity = AffinityResolver::new(store.clone(), Arc::clone(&reclaimer), config.session_ttl);
        Self {
            supervisor: Supervisor::new(config.worker_command.clone()),
            config,
            store,
            provisioner,
            registry,
            reclaimer,
            affinity,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The idle-session sweep sharing this broker's store and teardown path.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.store.clone(),
            Arc::clone(&self.reclaimer),
            self.config.session_ttl,
            self.config.reap_interval,
        )
    }

    /// Start a worker for `owner` and stream its output. The receiver always
    /// ends with `StreamEvent::Close` unless it is dropped first.
    pub fn start(self: &Arc<Self>, owner: String, payload: Value) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let broker = Arc::clone(self);
        tokio::spawn(async move { broker.run_start(owner, payload, tx).await });
        rx
    }

    async fn run_start(&self, owner: String, payload: Value, tx: mpsc::Sender<StreamEvent>) {
        let launch = match self.launch(&owner, &payload).await {
            Ok(launch) => launch,
            Err(e) => {
                error!(owner = %owner, "Start failed: {}", e);
                let _ = tx.send(StreamEvent::Data(format!("error: {}", e))).await;
                let _ = tx.send(StreamEvent::Close).await;
                return;
            }
        };
        let Launch {
            session,
            mut handle,
            preempt,
            reused,
        } = launch;

        for notice in start_notices(&session, reused) {
            // A caller that already left is noticed by the multiplexer.
            let _ = tx.send(StreamEvent::Data(notice)).await;
        }

        let cause = Multiplexer::new(
            self.store.clone(),
            &session.id,
            self.config.worker_deadline,
            self.config.kill_grace,
        )
        .run(&mut handle, &tx, preempt)
        .await;
        info!(session_id = %session.id, worker_id = %handle.worker_id, ?cause, "Stream finished");

        self.finish(&session, &handle.worker_id).await;
    }

    async fn launch(&self, owner: &str, payload: &Value) -> Result<Launch, BrokerError> {
        let lock = if self.config.enforce_affinity {
            Some(OwnerLock::acquire(self.store.kv(), owner, LOCK_WAIT).await?)
        } else {
            None
        };
        let result = self.launch_locked(owner, payload).await;
        if let Some(lock) = lock {
            lock.release().await;
        }
        result
    }

    async fn launch_locked(&self, owner: &str, payload: &Value) -> Result<Launch, BrokerError> {
        let (mut session, reused) = self.claim_session(owner).await?;
        let control = session
            .sandbox
            .as_ref()
            .map(|sandbox| sandbox.endpoints.control.clone())
            .unwrap_or_default();

        let mut handle = match self.supervisor.start(&control, payload) {
            Ok(handle) => handle,
            Err(e) => {
                // The sandbox stays allocated for the owner's next request.
                session.state = SessionState::Idle;
                self.store.put(&session).await?;
                return Err(e.into());
            }
        };

        let preempt = self.registry.register(&session.id, &handle.worker_id);
        session.begin_work(ProcessRef {
            worker_id: handle.worker_id.clone(),
            pid: handle.pid,
            instance_id: self.registry.instance_id().to_string(),
            started_at: Utc::now(),
        });
        session.touch(Utc::now());
        if let Err(e) = self.store.put(&session).await {
            self.registry.unregister(&session.id, &handle.worker_id);
            handle.kill().await;
            return Err(e.into());
        }

        Ok(Launch {
            session,
            handle,
            preempt,
            reused,
        })
    }

    /// The owner's session with no worker running, and whether it was reused.
    async fn claim_session(&self, owner: &str) -> Result<(Session, bool), BrokerError> {
        if self.config.enforce_affinity {
            if let Some(session) = self.reusable(owner).await? {
                return Ok((session, true));
            }
        }
        match self.provision(owner).await {
            Ok(session) => Ok((session, false)),
            Err(BrokerError::AffinityRace(race)) => {
                // Another instance created the owner's session; use theirs.
                match self.reusable(owner).await? {
                    Some(session) => Ok((session, true)),
                    None => Err(BrokerError::AffinityRace(race)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the owner's session and get it ready for a new worker.
    async fn reusable(&self, owner: &str) -> Result<Option<Session>, BrokerError> {
        let Some(session) = self.affinity.resolve(owner, Utc::now()).await? else {
            return Ok(None);
        };
        if session.is_reclaiming() || session.sandbox.is_none() {
            // Left behind by an instance that died mid-teardown or mid-provisioning.
            warn!(session_id = %session.id, state = ?session.state, "Discarding unusable session");
            self.reclaimer.reclaim(session).await?;
            return Ok(None);
        }

        self.reclaimer.stop_worker(&session).await;

        // The previous stream may have written the record while stopping.
        let Some(mut session) = self.store.get(&session.id).await? else {
            return Ok(None);
        };
        session.current_process = None;
        session.state = SessionState::Ready;

        if let Some(sandbox) = session.sandbox.clone() {
            match self.provisioner.refresh(&sandbox).await {
                Ok(fresh) => {
                    session.set_sandbox(fresh);
                }
                Err(ProvisioningError::Gone(id)) => {
                    warn!(session_id = %session.id, sandbox = %id, "Sandbox vanished, provisioning a new one");
                    self.reclaimer.reclaim(session).await?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.store.put(&session).await?;
        Ok(Some(session))
    }

    /// Create a session with a fresh sandbox and map the owner to it.
    async fn provision(&self, owner: &str) -> Result<Session, BrokerError> {
        let mut session = Session::new(owner, Utc::now());
        self.store.put(&session).await?;
        info!(session_id = %session.id, owner, "Provisioning sandbox");

        let sandbox = match self.provisioner.acquire(&session.id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                if let Err(de) = self.store.delete(&session.id).await {
                    warn!(session_id = %session.id, "Failed to drop provisioning record: {}", de);
                }
                return Err(e.into());
            }
        };
        info!(session_id = %session.id, sandbox = %sandbox.id, "Sandbox acquired");
        session.set_sandbox(sandbox);
        session.state = SessionState::Ready;
        session.touch(Utc::now());

        if let Err(e) = self.store.put(&session).await {
            self.discard(session).await;
            return Err(e.into());
        }

        if self.config.enforce_affinity {
            if let Err(e) = self.affinity.assign(owner, &session.id).await {
                self.discard(session).await;
                return Err(e);
            }
        }
        Ok(session)
    }

    async fn discard(&self, session: Session) {
        let id = session.id.clone();
        if let Err(e) = self.reclaimer.reclaim(session).await {
            warn!(session_id = %id, "Failed to discard session: {}", e);
        }
    }

    /// Clear the worker reference once its stream has ended, unless a newer
    /// worker already owns the session.
    async fn finish(&self, session: &Session, worker_id: &str) {
        self.registry.unregister(&session.id, worker_id);

        let lock = match OwnerLock::acquire(self.store.kv(), &session.owner_key, LOCK_WAIT).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(session_id = %session.id, "Could not record worker exit: {}", e);
                return;
            }
        };
        match self.store.get(&session.id).await {
            Ok(Some(mut current)) if !current.is_reclaiming() => {
                if current.end_work(worker_id) {
                    current.touch(Utc::now());
                    if let Err(e) = self.store.put(&current).await {
                        warn!(session_id = %session.id, "Could not record worker exit: {}", e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %session.id, "Could not record worker exit: {}", e),
        }
        lock.release().await;
    }

    /// Look up a session for the display viewer, refreshing its liveness and
    /// its endpoints. `None` if it is gone or being torn down.
    pub async fn viewer_session(&self, id: &str) -> Result<Option<Session>, BrokerError> {
        let Some(mut session) = self.store.get(id).await? else {
            return Ok(None);
        };
        if session.is_reclaiming() {
            return Ok(None);
        }
        let Some(sandbox) = session.sandbox.clone() else {
            return Ok(None);
        };
        match self.provisioner.refresh(&sandbox).await {
            Ok(fresh) => {
                session.set_sandbox(fresh);
            }
            Err(ProvisioningError::Gone(_)) => return Ok(None),
            Err(e) => warn!(session_id = %id, "Endpoint refresh failed, using stored ports: {}", e),
        }
        self.store.touch(id, Utc::now()).await?;
        Ok(Some(session))
    }

    /// Tear a session down now. Returns false if it does not exist.
    pub async fn teardown(&self, id: &str) -> Result<bool, BrokerError> {
        let Some(session) = self.store.get(id).await? else {
            return Ok(false);
        };
        let lock = OwnerLock::acquire(self.store.kv(), &session.owner_key, LOCK_WAIT).await?;
        let result = match self.store.get(id).await {
            Ok(Some(session)) => self.reclaimer.reclaim(session).await.map(|_| true),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        lock.release().await;
        Ok(result?)
    }
}

fn start_notices(session: &Session, reused: bool) -> Vec<String> {
    let mut notices = Vec::with_capacity(4);
    let name = session
        .sandbox
        .as_ref()
        .map(|sandbox| sandbox.name.as_str())
        .unwrap_or_default();
    notices.push(format!(
        "Session started with ID: {}. Container: {}",
        session.id, name
    ));
    if reused {
        notices.push(format!("Reusing existing sandbox for session {}", session.id));
    }
    if let Some(sandbox) = &session.sandbox {
        notices.push(format!("cdp_url: {}", sandbox.endpoints.control));
    }
    notices.push(format!("sandbox_view: /sandbox-view/{}", session.id));
    notices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use crate::testing::FakeProvisioner;
    use serde_json::json;

    struct Fixture {
        broker: Arc<Broker>,
        provisioner: Arc<FakeProvisioner>,
    }

    fn config(script: &str) -> BrokerConfig {
        BrokerConfig {
            worker_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "worker".to_string(),
            ],
            worker_deadline: Duration::from_secs(10),
            kill_grace: Duration::from_millis(200),
            ..BrokerConfig::default()
        }
    }

    fn fixture(config: BrokerConfig) -> Fixture {
        let provisioner = Arc::new(FakeProvisioner::default());
        let broker = Arc::new(Broker::new(
            config,
            Arc::new(MemoryKv::new()),
            provisioner.clone(),
        ));
        Fixture {
            broker,
            provisioner,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
        })
        .await
        .unwrap();
        events
    }

    async fn next_data(rx: &mut mpsc::Receiver<StreamEvent>) -> String {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(StreamEvent::Data(line))) => line,
            other => panic!("expected a data event, got {:?}", other),
        }
    }

    fn lines(events: &[StreamEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Data(line) => Some(line.as_str()),
                StreamEvent::Close => None,
            })
            .collect()
    }

    async fn wait_idle(store: &SessionStore, owner: &str) -> Session {
        for _ in 0..100 {
            if let Some(id) = store.get_by_owner(owner).await.unwrap() {
                if let Some(session) = store.get(&id).await.unwrap() {
                    if session.state == SessionState::Idle {
                        return session;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session for {} never went idle", owner);
    }

    #[tokio::test]
    async fn fresh_owner_gets_notices_lines_and_completion() {
        let f = fixture(config("echo one; echo two; echo three"));
        let events = collect(f.broker.start("10.0.0.1".to_string(), json!({"task": "t"}))).await;

        let lines = lines(&events);
        assert!(lines[0].starts_with("Session started with ID: "));
        assert!(lines.contains(&"cdp_url: ws://127.0.0.1:9333"));
        let output: Vec<_> = lines
            .iter()
            .filter(|l| ["one", "two", "three"].contains(l))
            .collect();
        assert_eq!(output, vec![&"one", &"two", &"three"]);
        assert_eq!(lines.last(), Some(&"Task completed."));
        assert_eq!(events.last(), Some(&StreamEvent::Close));

        let session = wait_idle(f.broker.store(), "10.0.0.1").await;
        assert!(session.current_process.is_none());
        assert_eq!(f.provisioner.acquired(), 1);
    }

    #[tokio::test]
    async fn deadline_kills_worker_but_keeps_sandbox() {
        let mut config = config("echo started; sleep 30");
        config.worker_deadline = Duration::from_millis(300);
        let f = fixture(config);

        let events = collect(f.broker.start("o".to_string(), json!({"task": "t"}))).await;
        let lines = lines(&events);
        assert!(lines.contains(&"started"));
        assert_eq!(lines.last(), Some(&"Task timed out, killing process..."));
        assert_eq!(events.last(), Some(&StreamEvent::Close));

        let session = wait_idle(f.broker.store(), "o").await;
        assert!(session.sandbox.is_some());
        assert!(f.provisioner.released().is_empty());
    }

    #[tokio::test]
    async fn second_start_reuses_sandbox_after_stopping_first_worker() {
        let f = fixture(config("echo ready; sleep 30"));

        let mut first = f.broker.start("o".to_string(), json!({"task": "a"}));
        let started = next_data(&mut first).await;
        while next_data(&mut first).await != "ready" {}

        let mut second = f.broker.start("o".to_string(), json!({"task": "b"}));
        // The first stream ends before the second worker exists.
        let rest = collect(first).await;
        assert_eq!(
            rest,
            vec![
                StreamEvent::Data("error: worker superseded by a newer request".to_string()),
                StreamEvent::Close
            ]
        );

        assert_eq!(next_data(&mut second).await, started);
        assert!(next_data(&mut second).await.starts_with("Reusing existing sandbox"));
        while next_data(&mut second).await != "ready" {}
        assert_eq!(f.provisioner.acquired(), 1);
        assert_eq!(f.broker.store().list().await.unwrap().len(), 1);

        drop(second);
        wait_idle(f.broker.store(), "o").await;
    }

    #[tokio::test]
    async fn second_start_stops_worker_of_caller_that_stopped_reading() {
        let f = fixture(config(
            "echo ready; i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done; sleep 30",
        ));

        // Held but never read, so the first stream backs up.
        let first = f.broker.start("o".to_string(), json!({"task": "a"}));
        let mut first_pid = None;
        for _ in 0..250 {
            let busy = match f.broker.store().get_by_owner("o").await.unwrap() {
                Some(id) => f.broker.store().get(&id).await.unwrap(),
                None => None,
            };
            if let Some(process) = busy.and_then(|s| s.current_process) {
                first_pid = Some(process.pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let first_pid = first_pid.expect("first worker never started");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut second = f.broker.start("o".to_string(), json!({"task": "b"}));
        let reached = tokio::time::timeout(Duration::from_secs(10), async {
            while next_data(&mut second).await != "ready" {}
        })
        .await;
        assert!(reached.is_ok(), "second worker never started");
        assert!(!crate::process_signal::group_alive(first_pid));
        assert_eq!(f.provisioner.acquired(), 1);

        drop(first);
        drop(second);
        wait_idle(f.broker.store(), "o").await;
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_session() {
        let f = fixture(config("echo hi"));
        f.provisioner.set_acquire_delay(Duration::from_millis(100));

        let a = f.broker.start("o".to_string(), json!({"task": "a"}));
        let b = f.broker.start("o".to_string(), json!({"task": "b"}));
        let (a, b) = tokio::join!(collect(a), collect(b));
        assert_eq!(a.last(), Some(&StreamEvent::Close));
        assert_eq!(b.last(), Some(&StreamEvent::Close));

        assert_eq!(f.provisioner.acquired(), 1);
        assert_eq!(f.broker.store().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reclaimed_owner_gets_a_new_sandbox() {
        let f = fixture(config("echo hi"));
        collect(f.broker.start("o".to_string(), json!({"task": "a"}))).await;
        let first = wait_idle(f.broker.store(), "o").await;

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(f.broker.reaper().sweep_at(later).await, 1);
        assert!(f.broker.store().get(&first.id).await.unwrap().is_none());
        assert!(f.broker.store().get_by_owner("o").await.unwrap().is_none());

        collect(f.broker.start("o".to_string(), json!({"task": "b"}))).await;
        let second = wait_idle(f.broker.store(), "o").await;
        assert_ne!(second.id, first.id);
        assert_ne!(
            second.sandbox.map(|s| s.id),
            first.sandbox.as_ref().map(|s| s.id.clone())
        );
        assert_eq!(f.provisioner.acquired(), 2);
        assert_eq!(f.provisioner.released().len(), 1);
    }

    #[tokio::test]
    async fn provisioning_failure_is_an_error_event_then_close() {
        let f = fixture(config("echo hi"));
        f.provisioner.fail_acquire(true);

        let events = collect(f.broker.start("o".to_string(), json!({"task": "t"}))).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Data(l) if l.starts_with("error: provisioning failed")));
        assert_eq!(events[1], StreamEvent::Close);
        assert!(f.broker.store().list().await.unwrap().is_empty());
        assert!(f.broker.store().get_by_owner("o").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn worker_start_failure_keeps_session_idle() {
        let mut config = config("unused");
        config.worker_command = vec!["/nonexistent/worker-binary".to_string()];
        let f = fixture(config);

        let events = collect(f.broker.start("o".to_string(), json!({"task": "t"}))).await;
        assert!(matches!(&events[0], StreamEvent::Data(l) if l.starts_with("error: worker start failed")));
        assert_eq!(events.last(), Some(&StreamEvent::Close));

        let session = wait_idle(f.broker.store(), "o").await;
        assert!(session.current_process.is_none());
    }

    #[tokio::test]
    async fn teardown_releases_once() {
        let f = fixture(config("echo hi"));
        collect(f.broker.start("o".to_string(), json!({"task": "t"}))).await;
        let session = wait_idle(f.broker.store(), "o").await;

        assert!(f.broker.teardown(&session.id).await.unwrap());
        assert!(!f.broker.teardown(&session.id).await.unwrap());
        assert_eq!(f.provisioner.released(), vec![format!("sbx-{}", session.id)]);
        assert!(f.broker.viewer_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn viewer_lookup_refreshes_liveness() {
        let f = fixture(config("echo hi"));
        collect(f.broker.start("o".to_string(), json!({"task": "t"}))).await;
        let session = wait_idle(f.broker.store(), "o").await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let viewed = f.broker.viewer_session(&session.id).await.unwrap().unwrap();
        assert_eq!(viewed.sandbox, session.sandbox);
        let stored = f.broker.store().get(&session.id).await.unwrap().unwrap();
        assert!(stored.last_active_at > session.last_active_at);
        assert!(f.broker.viewer_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn without_affinity_every_start_provisions() {
        let mut config = config("echo hi");
        config.enforce_affinity = false;
        let f = fixture(config);

        collect(f.broker.start("o".to_string(), json!({"task": "a"}))).await;
        collect(f.broker.start("o".to_string(), json!({"task": "b"}))).await;
        assert_eq!(f.provisioner.acquired(), 2);
        assert!(f.broker.store().get_by_owner("o").await.unwrap().is_none());
    }
}
