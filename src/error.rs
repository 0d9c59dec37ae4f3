//! Error types for the broker.

use thiserror::Error;

/// Failures talking to the shared session store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("session record encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Sandbox creation failed. Anything partially created has already been
/// cleaned up (best effort) by the time this is returned.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("container backend: {0}")]
    Backend(#[from] bollard::errors::Error),

    #[error("image pull failed for {image}: {reason}")]
    Image { image: String, reason: String },

    #[error("no host port published for {0}")]
    MissingPort(String),

    #[error("sandbox {id} not reachable at {addr} after {attempts} attempts")]
    NotReachable {
        id: String,
        addr: String,
        attempts: u32,
    },

    #[error("sandbox {0} no longer exists")]
    Gone(String),
}

/// The worker process could not be launched.
#[derive(Error, Debug)]
pub enum ProcessStartError {
    #[error("worker command is empty")]
    EmptyCommand,

    #[error("task payload must be a JSON object")]
    InvalidPayload,

    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Teardown of a sandbox or record failed. Logged, never surfaced to callers.
#[derive(Error, Debug)]
pub enum TeardownError {
    #[error("container backend: {0}")]
    Backend(#[from] bollard::errors::Error),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Request-level failure of a `/start` call.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("worker start failed: {0}")]
    ProcessStart(#[from] ProcessStartError),

    #[error("concurrent session creation for owner {0}")]
    AffinityRace(String),

    #[error("timed out waiting for the session lock of owner {0}")]
    LockTimeout(String),
}
