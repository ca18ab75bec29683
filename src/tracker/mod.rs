// Container mount tracker
//
// Which running containers reference which managed mount. Fed by a periodic
// full resync and by the runtime's event stream; each feed corrects the other.

pub mod runtime;

pub use runtime::{ContainerEvent, ContainerMounts, ContainerRuntime, DockerRuntime};

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::reconciler::GcTrigger;

/// Membership changes are stamped with the generation they happened in, so a
/// resync can tell which ones are newer than its container listing.
#[derive(Default)]
struct Mounts {
    generation: u64,
    paths: HashMap<PathBuf, HashMap<String, u64>>,
    destroyed: HashMap<String, u64>,
}

pub struct ContainerTracker {
    root: PathBuf,
    mounts: RwLock<Mounts>,
}

impl ContainerTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), mounts: RwLock::new(Mounts::default()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Strictly below the managed root, without `..` or `.` segments.
    pub fn is_managed(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(rest) => {
                rest.components().next().is_some()
                    && rest.components().all(|c| matches!(c, Component::Normal(_)))
            }
            Err(_) => false,
        }
    }

    pub async fn add_container(&self, id: &str, sources: &[PathBuf]) -> usize {
        let mut mounts = self.mounts.write().await;
        let stamp = mounts.generation;
        let mut added = 0;
        for source in sources.iter().filter(|s| self.is_managed(s)) {
            mounts.paths.entry(source.clone()).or_default().insert(id.to_string(), stamp);
            added += 1;
        }
        added
    }

    /// Drops `id` from every mount; returns how many mounts it referenced.
    pub async fn remove_container(&self, id: &str) -> usize {
        let mut mounts = self.mounts.write().await;
        let stamp = mounts.generation;
        mounts.destroyed.insert(id.to_string(), stamp);
        mounts.paths.values_mut().map(|ids| ids.remove(id)).filter(Option::is_some).count()
    }

    /// `None` when the path is not tracked at all.
    pub async fn references(&self, path: &Path) -> Option<usize> {
        self.mounts.read().await.paths.get(path).map(HashMap::len)
    }

    pub async fn snapshot(&self) -> HashMap<PathBuf, usize> {
        self.mounts.read().await.paths.iter().map(|(path, ids)| (path.clone(), ids.len())).collect()
    }

    /// Forgets unreferenced entries that are no longer mounted.
    pub async fn prune(&self, still_mounted: &HashSet<PathBuf>) -> usize {
        let mut mounts = self.mounts.write().await;
        let before = mounts.paths.len();
        mounts.paths.retain(|path, ids| !ids.is_empty() || still_mounted.contains(path));
        before - mounts.paths.len()
    }

    /// Rebuilds membership from the running containers.
    ///
    /// Known paths are kept with empty sets so that a mount nobody uses any
    /// more shows up as unreferenced rather than untracked. Events applied
    /// while the listing was in flight win over the listing.
    pub async fn resync(&self, runtime: &dyn ContainerRuntime) -> Result<usize> {
        let started = {
            let mut mounts = self.mounts.write().await;
            mounts.generation += 1;
            mounts.generation
        };

        let containers = runtime.running_containers().await?;

        let mut mounts = self.mounts.write().await;
        let Mounts { paths, destroyed, .. } = &mut *mounts;
        for ids in paths.values_mut() {
            ids.retain(|_, stamp| *stamp >= started);
        }
        for container in &containers {
            if destroyed.get(&container.id).is_some_and(|stamp| *stamp >= started) {
                continue;
            }
            for source in container.sources.iter().filter(|s| self.is_managed(s)) {
                paths.entry(source.clone()).or_default().entry(container.id.clone()).or_insert(started);
            }
        }
        destroyed.retain(|_, stamp| *stamp >= started);

        tracing::debug!(containers = containers.len(), mounts = paths.len(), "Resynced container mounts");
        Ok(paths.len())
    }

    pub async fn apply(
        &self,
        event: &ContainerEvent,
        runtime: &dyn ContainerRuntime,
        gc: &GcTrigger,
    ) -> Result<()> {
        match event {
            ContainerEvent::Start { id } => {
                let sources = runtime.container_mounts(id).await?;
                let added = self.add_container(id, &sources).await;
                if added > 0 {
                    tracing::debug!(container = %id, mounts = added, "Container started");
                }
            }
            ContainerEvent::Destroy { id } => {
                tracing::info!(container = %id, "Container destroyed");
                self.remove_container(id).await;
                gc.kick();
            }
            ContainerEvent::Other { id, action } => {
                tracing::trace!(container = %id, action = %action, "Ignoring container event");
            }
        }
        Ok(())
    }

    /// Consumes one event-stream session; returns when the stream ends or fails.
    pub async fn watch_events(
        &self,
        runtime: &dyn ContainerRuntime,
        gc: &GcTrigger,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut events = runtime.events();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if let Err(e) = self.apply(&event, runtime, gc).await {
                        tracing::error!(error = %e, "Failed to apply container event");
                    }
                }
                Some(Err(e)) => return Err(e),
                None => anyhow::bail!("Container event stream closed"),
            }
        }
    }

    pub async fn resync_loop(
        self: Arc<Self>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.resync(runtime.as_ref()).await {
                tracing::warn!(error = %e, "Failed to resync container mounts");
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
