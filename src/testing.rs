//! Test doubles shared across module tests.

use crate::error::{ProvisioningError, TeardownError};
use crate::provisioner::SandboxProvisioner;
use crate::state::{Endpoints, SandboxRef};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory sandboxes. Ids are `sbx-<session id>`; releases are recorded.
#[derive(Default)]
pub struct FakeProvisioner {
    acquired: AtomicUsize,
    live: Mutex<HashSet<String>>,
    released: Mutex<Vec<String>>,
    fail_acquire: AtomicBool,
    fail_release: AtomicBool,
    acquire_delay: Mutex<Duration>,
}

impl FakeProvisioner {
    pub fn sandbox_for(session_id: &str) -> SandboxRef {
        SandboxRef {
            id: format!("sbx-{}", session_id),
            name: format!("sandbox_{}", session_id),
            endpoints: Endpoints {
                control: "ws://127.0.0.1:9333".to_string(),
                display_port: 6080,
                companion_port: 5900,
            },
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl SandboxProvisioner for FakeProvisioner {
    async fn acquire(&self, session_id: &str) -> Result<SandboxRef, ProvisioningError> {
        let delay = *self.acquire_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(ProvisioningError::MissingPort("9333/tcp".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let sandbox = Self::sandbox_for(session_id);
        self.live.lock().unwrap().insert(sandbox.id.clone());
        Ok(sandbox)
    }

    async fn refresh(&self, sandbox: &SandboxRef) -> Result<SandboxRef, ProvisioningError> {
        if self.live.lock().unwrap().contains(&sandbox.id) {
            Ok(sandbox.clone())
        } else {
            Err(ProvisioningError::Gone(sandbox.id.clone()))
        }
    }

    async fn release(&self, sandbox: &SandboxRef) -> Result<(), TeardownError> {
        self.live.lock().unwrap().remove(&sandbox.id);
        self.released.lock().unwrap().push(sandbox.id.clone());
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(TeardownError::Backend(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 500,
                    message: "daemon unavailable".to_string(),
                },
            ));
        }
        Ok(())
    }
}
