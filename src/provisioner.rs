//! Sandbox provisioning.
//!
//! A sandbox is a container running a browser with a CDP control port, a
//! noVNC display port and a raw VNC port. Ports are published on ephemeral
//! host ports and read back from the daemon after start.

use crate::config::BrokerConfig;
use crate::error::{ProvisioningError, TeardownError};
use crate::state::{Endpoints, SandboxRef};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortMap};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const CONTROL_PORT: &str = "9333/tcp";
const DISPLAY_PORT: &str = "6080/tcp";
const COMPANION_PORT: &str = "5900/tcp";
const MANAGED_LABEL: &str = "sandbox-broker.managed";
const SHM_SIZE: i64 = 2 * 1024 * 1024 * 1024;
const PROBE_ATTEMPTS: u32 = 10;
const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const STOP_TIMEOUT_SECS: i64 = 5;

/// Creates and releases isolated execution environments.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Launch a sandbox for `session_id` and wait until it is reachable.
    async fn acquire(&self, session_id: &str) -> Result<SandboxRef, ProvisioningError>;

    /// Re-read the endpoints of an existing sandbox. The id is unchanged.
    async fn refresh(&self, sandbox: &SandboxRef) -> Result<SandboxRef, ProvisioningError>;

    /// Stop and remove a sandbox. Releasing one that is already gone succeeds.
    async fn release(&self, sandbox: &SandboxRef) -> Result<(), TeardownError>;
}

/// Docker-backed sandboxes.
pub struct DockerProvisioner {
    client: Docker,
    image: String,
    public_host: String,
    dial_host: String,
    settle_delay: Duration,
}

impl DockerProvisioner {
    pub fn connect(config: &BrokerConfig) -> Result<Self, ProvisioningError> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: &BrokerConfig) -> Self {
        Self {
            client,
            image: config.sandbox_image.clone(),
            public_host: config.public_host.clone(),
            dial_host: config.dial_host.clone(),
            settle_delay: config.settle_delay,
        }
    }

    async fn ensure_image(&self) -> Result<(), ProvisioningError> {
        match self.client.inspect_image(&self.image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        info!(image = %self.image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| ProvisioningError::Image {
                image: self.image.clone(),
                reason: e.to_string(),
            })?;
            if let Some(error) = progress.error {
                return Err(ProvisioningError::Image {
                    image: self.image.clone(),
                    reason: error,
                });
            }
        }
        Ok(())
    }

    fn container_config(&self) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        for port in [CONTROL_PORT, DISPLAY_PORT, COMPANION_PORT] {
            exposed_ports.insert(port.to_string(), HashMap::new());
        }

        Config {
            image: Some(self.image.clone()),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                shm_size: Some(SHM_SIZE),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn inspect_ports(&self, id: &str) -> Result<PortMap, ProvisioningError> {
        let inspect = match self.client.inspect_container(id, None).await {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Err(ProvisioningError::Gone(id.to_string())),
            Err(e) => return Err(e.into()),
        };
        Ok(inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default())
    }

    /// Start the container, let it settle, and wait for the control port.
    async fn bring_up(&self, id: &str, name: &str) -> Result<SandboxRef, ProvisioningError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        tokio::time::sleep(self.settle_delay).await;

        let ports = self.inspect_ports(id).await?;
        let endpoints = endpoints_from_ports(&self.public_host, &ports)?;
        wait_reachable(id, &dial_address(&ports, CONTROL_PORT, &self.dial_host)?).await?;

        Ok(SandboxRef {
            id: id.to_string(),
            name: name.to_string(),
            endpoints,
        })
    }

    async fn remove(&self, id: &str) -> Result<(), bollard::errors::Error> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SandboxProvisioner for DockerProvisioner {
    async fn acquire(&self, session_id: &str) -> Result<SandboxRef, ProvisioningError> {
        self.ensure_image().await?;

        let name = format!("sandbox_{}", session_id);
        info!(name = %name, image = %self.image, "Creating sandbox");
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.container_config())
            .await?;

        match self.bring_up(&container.id, &name).await {
            Ok(sandbox) => {
                info!(id = %sandbox.id, control = %sandbox.endpoints.control, "Sandbox ready");
                Ok(sandbox)
            }
            Err(e) => {
                warn!(id = %container.id, "Sandbox failed to come up, removing: {}", e);
                if let Err(cleanup) = self.remove(&container.id).await {
                    warn!(id = %container.id, "Cleanup of failed sandbox failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn refresh(&self, sandbox: &SandboxRef) -> Result<SandboxRef, ProvisioningError> {
        let ports = self.inspect_ports(&sandbox.id).await?;
        let endpoints = endpoints_from_ports(&self.public_host, &ports)?;
        if endpoints != sandbox.endpoints {
            info!(id = %sandbox.id, "Sandbox endpoints changed");
        }
        Ok(SandboxRef {
            endpoints,
            ..sandbox.clone()
        })
    }

    async fn release(&self, sandbox: &SandboxRef) -> Result<(), TeardownError> {
        info!(id = %sandbox.id, name = %sandbox.name, "Releasing sandbox");
        let stop = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.client.stop_container(&sandbox.id, Some(stop)).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                debug!(id = %sandbox.id, "Sandbox already removed");
                return Ok(());
            }
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => warn!(id = %sandbox.id, "Stop failed, forcing removal: {}", e),
        }
        self.remove(&sandbox.id).await?;
        Ok(())
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn host_port(ports: &PortMap, container_port: &str) -> Result<u16, ProvisioningError> {
    ports
        .get(container_port)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.iter().find_map(|b| b.host_port.as_deref()))
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| ProvisioningError::MissingPort(container_port.to_string()))
}

fn endpoints_from_ports(public_host: &str, ports: &PortMap) -> Result<Endpoints, ProvisioningError> {
    Ok(Endpoints {
        control: format!("ws://{}:{}", public_host, host_port(ports, CONTROL_PORT)?),
        display_port: host_port(ports, DISPLAY_PORT)?,
        companion_port: host_port(ports, COMPANION_PORT)?,
    })
}

/// Where the broker dials a published port: the binding's own address, or
/// `fallback_host` when the port is bound on every interface.
fn dial_address(
    ports: &PortMap,
    container_port: &str,
    fallback_host: &str,
) -> Result<String, ProvisioningError> {
    let port = host_port(ports, container_port)?;
    let bound = ports
        .get(container_port)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| {
            bindings
                .iter()
                .filter(|b| b.host_port.is_some())
                .find_map(|b| b.host_ip.as_deref())
        })
        .filter(|ip| !matches!(*ip, "" | "0.0.0.0" | "::"));
    let host = bound.unwrap_or(fallback_host);
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}

async fn wait_reachable(id: &str, addr: &str) -> Result<(), ProvisioningError> {
    for attempt in 1..=PROBE_ATTEMPTS {
        match tokio::time::timeout(PROBE_INTERVAL, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => debug!(id, attempt, "Control port not ready: {}", e),
            Err(_) => debug!(id, attempt, "Control port probe timed out"),
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
    Err(ProvisioningError::NotReachable {
        id: id.to_string(),
        addr: addr.to_string(),
        attempts: PROBE_ATTEMPTS,
    })
}
