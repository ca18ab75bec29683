use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{EventMessage, EventMessageTypeEnum, MountPoint};
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use futures::StreamExt;
use futures::stream::BoxStream;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// A running container and the host sources of its mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMounts {
    pub id: String,
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Start { id: String },
    Destroy { id: String },
    Other { id: String, action: String },
}

impl ContainerEvent {
    fn from_message(message: EventMessage) -> Option<Self> {
        if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
            return None;
        }
        let id = message.actor.and_then(|actor| actor.id).filter(|id| !id.is_empty())?;
        let action = message.action.unwrap_or_default();
        Some(match action.as_str() {
            "start" => ContainerEvent::Start { id },
            "destroy" => ContainerEvent::Destroy { id },
            _ => ContainerEvent::Other { id, action },
        })
    }
}

/// The container runtime whose containers reference managed mounts.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn running_containers(&self) -> Result<Vec<ContainerMounts>>;

    async fn container_mounts(&self, id: &str) -> Result<Vec<PathBuf>>;

    /// Lifecycle events; the stream ends or yields an error when the connection drops.
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to `unix://`, `tcp://` or `http://` hosts; an empty host uses the local defaults.
    pub fn connect(docker_host: &str) -> Result<Self> {
        let docker = if docker_host.is_empty() {
            Docker::connect_with_local_defaults()
        } else if let Some(path) = docker_host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
        } else if docker_host.starts_with("tcp://") || docker_host.starts_with("http://") {
            Docker::connect_with_http(docker_host, 120, bollard::API_DEFAULT_VERSION)
        } else {
            anyhow::bail!("Unsupported docker host {docker_host}");
        }
        .with_context(|| format!("Failed to connect to docker at {docker_host}"))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.context("Docker is not reachable")?;
        Ok(())
    }
}

fn sources(mounts: Option<Vec<MountPoint>>) -> Vec<PathBuf> {
    mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| m.source)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn running_containers(&self) -> Result<Vec<ContainerMounts>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions { all: false, ..Default::default() }))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| Some(ContainerMounts { id: c.id?, sources: sources(c.mounts) }))
            .collect())
    }

    async fn container_mounts(&self, id: &str) -> Result<Vec<PathBuf>> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {id}"))?;
        Ok(sources(inspect.mounts))
    }

    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>> {
        self.docker
            .events(None::<EventsOptions>)
            .filter_map(|item| async move {
                match item {
                    Ok(message) => ContainerEvent::from_message(message).map(Ok),
                    Err(e) => Some(Err(anyhow::Error::new(e).context("Docker event stream error"))),
                }
            })
            .boxed()
    }
}
