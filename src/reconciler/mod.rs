// Mount reconciler
//
// Releases managed mounts that no running container references. The
// container tracker is the only authority consulted; a mount under the
// managed root that the tracker has never seen is drift and is released too.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::driver::VolumeDriver;
use crate::error::PluginResult;
use crate::metrics::PluginMetrics;
use crate::mount;
use crate::tracker::ContainerTracker;

/// Wakes the reconciler ahead of its next scheduled pass.
///
/// Kicks coalesce: any number of kicks before the reconciler wakes produce one pass.
#[derive(Clone, Default)]
pub struct GcTrigger(Arc<Notify>);

impl GcTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kick(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct GcSettings {
    pub interval: Duration,
    /// Delay between a kick and the pass it triggers.
    pub kick_delay: Duration,
    /// Mounts younger than this are left alone; their container may not be tracked yet.
    pub mount_grace: Duration,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            kick_delay: Duration::from_secs(1),
            mount_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub candidates: Vec<PathBuf>,
    pub unmounted: usize,
    pub failed: usize,
}

pub struct Reconciler {
    driver: Arc<VolumeDriver>,
    tracker: Arc<ContainerTracker>,
    trigger: GcTrigger,
    settings: GcSettings,
    metrics: Option<Arc<PluginMetrics>>,
    pass: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        driver: Arc<VolumeDriver>,
        tracker: Arc<ContainerTracker>,
        trigger: GcTrigger,
        settings: GcSettings,
    ) -> Self {
        Self { driver, tracker, trigger, settings, metrics: None, pass: Mutex::new(()) }
    }

    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn managed_mounts(&self) -> PluginResult<HashSet<PathBuf>> {
        Ok(self
            .driver
            .mounter()
            .list()
            .await?
            .into_iter()
            .map(|m| m.path)
            .filter(|path| self.tracker.is_managed(path))
            .collect())
    }

    /// One GC pass. Per-mount failures are logged and counted; only a failure
    /// to read the mount table aborts the pass.
    pub async fn collect(&self) -> PluginResult<GcReport> {
        let _pass = self.pass.lock().await;

        let mounted = self.managed_mounts().await?;
        let references = self.tracker.snapshot().await;

        let mut candidates: Vec<PathBuf> = mounted
            .iter()
            .filter(|path| match references.get(*path) {
                Some(0) => true,
                Some(_) => false,
                None => {
                    tracing::error!(mountpoint = %path.display(), "Mount not tracked by any container, releasing");
                    true
                }
            })
            .filter(|path| {
                let recent = self.driver.mounted_within(path, self.settings.mount_grace);
                if recent {
                    tracing::debug!(mountpoint = %path.display(), "Skipping recent mount");
                }
                !recent
            })
            .cloned()
            .collect();
        candidates.sort();

        let mut report = GcReport::default();
        let mut still_mounted = mounted;
        for path in &candidates {
            match self.driver.detach_path(path).await {
                Ok(()) => {
                    report.unmounted += 1;
                    still_mounted.remove(path);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(mountpoint = %path.display(), error = %e, "Failed to release mount");
                }
            }
        }
        report.candidates = candidates;

        let pruned = self.tracker.prune(&still_mounted).await;
        if pruned > 0 {
            tracing::debug!(pruned, "Forgot unmounted entries");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_gc(report.unmounted, report.failed, self.tracker.snapshot().await.len());
        }
        Ok(report)
    }

    /// Releases `path` if it is mounted and nothing references it. Returns
    /// whether anything was released.
    pub async fn release(&self, path: &Path) -> PluginResult<bool> {
        if !self.tracker.is_managed(path) {
            tracing::warn!(mountpoint = %path.display(), "Not under the managed root, refusing to release");
            return Ok(false);
        }
        if !mount::is_mounted(self.driver.mounter().as_ref(), path).await? {
            tracing::debug!(mountpoint = %path.display(), "Not mounted, nothing to release");
            return Ok(false);
        }
        if let Some(refs @ 1..) = self.tracker.references(path).await {
            tracing::info!(mountpoint = %path.display(), references = refs, "Still in use, not releasing");
            return Ok(false);
        }
        if self.driver.mounted_within(path, self.settings.mount_grace) {
            tracing::info!(mountpoint = %path.display(), "Mounted moments ago, not releasing");
            return Ok(false);
        }

        self.driver.detach_path(path).await?;
        Ok(true)
    }

    /// Runs passes on the interval and after kicks until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.settings.interval,
            self.settings.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.settings.kick_delay) => {}
                    }
                }
            }

            match self.collect().await {
                Ok(report) if !report.candidates.is_empty() => {
                    tracing::info!(
                        unmounted = report.unmounted,
                        failed = report.failed,
                        "GC pass released mounts"
                    );
                }
                Ok(_) => tracing::debug!("GC pass found nothing to release"),
                Err(e) => tracing::warn!(error = %e, "GC pass failed"),
            }
        }
    }
}
