//! Session records and shared application state.

use crate::broker::Broker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a session. `Closed` sessions are removed from the store, so
/// that state is only ever observed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Provisioning,
    Ready,
    Busy,
    Idle,
    Reclaiming,
    Closed,
}

/// Network endpoints a sandbox exposes on the public host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Browser control (CDP) URL handed to the worker.
    pub control: String,
    /// Host port serving the noVNC web client.
    pub display_port: u16,
    /// Raw VNC host port.
    pub companion_port: u16,
}

/// Handle to a provisioned sandbox. `id` is fixed for the sandbox's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRef {
    pub id: String,
    pub name: String,
    pub endpoints: Endpoints,
}

/// The worker currently driving a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    /// Unique per worker start; used to tell successive workers apart.
    pub worker_id: String,
    /// Process (and process group) id on the owning instance.
    pub pid: u32,
    /// Broker instance that spawned the worker.
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

/// One caller's claim on a sandbox and its current worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub owner_key: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub sandbox: Option<SandboxRef>,
    pub current_process: Option<ProcessRef>,
}

impl Session {
    pub fn new(owner_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Provisioning,
            owner_key: owner_key.to_string(),
            created_at: now,
            last_active_at: now,
            sandbox: None,
            current_process: None,
        }
    }

    /// Advance `last_active_at`; never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active_at {
            self.last_active_at = now;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.idle_for(now) > ttl
    }

    pub fn is_reclaiming(&self) -> bool {
        matches!(self.state, SessionState::Reclaiming | SessionState::Closed)
    }

    /// Attach a sandbox. A session's sandbox id never changes once set; a
    /// later call with the same id only refreshes the endpoints.
    pub fn set_sandbox(&mut self, sandbox: SandboxRef) -> bool {
        match &mut self.sandbox {
            Some(existing) if existing.id != sandbox.id => false,
            Some(existing) => {
                existing.endpoints = sandbox.endpoints;
                true
            }
            None => {
                self.sandbox = Some(sandbox);
                true
            }
        }
    }

    /// Record a running worker and mark the session busy.
    pub fn begin_work(&mut self, process: ProcessRef) {
        self.current_process = Some(process);
        self.state = SessionState::Busy;
    }

    /// Clear the worker reference if it still names `worker_id`. Returns
    /// false when a newer worker has taken over the session.
    pub fn end_work(&mut self, worker_id: &str) -> bool {
        match &self.current_process {
            Some(p) if p.worker_id == worker_id => {
                self.current_process = None;
                self.state = SessionState::Idle;
                true
            }
            _ => false,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}
