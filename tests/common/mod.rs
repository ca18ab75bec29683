#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cattle_storage::bridge::{CommandResult, DriverCommand, Outcome, Verb};
use cattle_storage::driver::{DriverSettings, VolumeDriver};
use cattle_storage::error::{ApiError, BridgeError, MountError};
use cattle_storage::mount::{MountPoint, Mounter};
use cattle_storage::reconciler::{GcSettings, GcTrigger, Reconciler};
use cattle_storage::store::{
    StoreIdentity, VolumeApi, VolumeQuery, VolumeRecord, VolumeState, VolumeStore, VolumeUpdate,
};
use cattle_storage::tracker::ContainerTracker;

pub const DRIVER: &str = "ebs";

/// In-memory control plane. Updating a record that is still being
/// provisioned moves it to `inactive`, as the real control plane would.
#[derive(Default)]
pub struct FakeVolumeApi {
    records: Mutex<Vec<VolumeRecord>>,
    updates: Mutex<Vec<VolumeUpdate>>,
}

impl FakeVolumeApi {
    pub fn with_records(records: Vec<VolumeRecord>) -> Self {
        Self { records: Mutex::new(records), ..Default::default() }
    }

    pub fn record(name: &str, state: &str) -> VolumeRecord {
        VolumeRecord { id: format!("1v-{name}"), ..VolumeRecord::new(name, state) }
    }

    pub fn updates(&self) -> Vec<VolumeUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn get(&self, name: &str) -> Option<VolumeRecord> {
        self.records.lock().unwrap().iter().find(|r| r.name == name).cloned()
    }
}

#[async_trait]
impl VolumeApi for FakeVolumeApi {
    async fn list_volumes(&self, query: &VolumeQuery) -> Result<Vec<VolumeRecord>, ApiError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| query.name.as_ref().is_none_or(|name| &r.name == name))
            .cloned()
            .collect())
    }

    async fn update_volume(&self, id: &str, update: &VolumeUpdate) -> Result<VolumeRecord, ApiError> {
        self.updates.lock().unwrap().push(update.clone());

        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ApiError::Status { status: 404, message: format!("no volume {id}") })?;
        record.driver_opts = update.driver_opts.clone();
        record.host_id = Some(update.host_id.clone());
        record.storage_driver_id = Some(update.storage_driver_id.clone());
        if !record.state.is_good() {
            record.state = VolumeState::Inactive;
        }
        Ok(record.clone())
    }
}

/// Scripted external driver that records every invocation.
#[derive(Default)]
pub struct FakeBridge {
    outcomes: Mutex<HashMap<Verb, Outcome<CommandResult>>>,
    calls: Mutex<Vec<(Verb, Vec<String>)>>,
    delay: Option<Duration>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slows every invocation down, to widen race windows.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Default::default() }
    }

    pub fn on(self, verb: Verb, outcome: Outcome<CommandResult>) -> Self {
        self.outcomes.lock().unwrap().insert(verb, outcome);
        self
    }

    pub fn calls(&self) -> Vec<(Verb, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.calls.lock().unwrap().iter().filter(|(v, _)| *v == verb).count()
    }
}

#[async_trait]
impl DriverCommand for FakeBridge {
    async fn invoke(&self, verb: Verb, args: &[String]) -> Result<Outcome<CommandResult>, BridgeError> {
        self.calls.lock().unwrap().push((verb, args.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.outcomes.lock().unwrap().get(&verb).cloned();
        Ok(outcome.unwrap_or(Outcome::Ok(CommandResult::default())))
    }
}

pub fn device(device: &str) -> Outcome<CommandResult> {
    Outcome::Ok(CommandResult { device: device.to_string(), ..Default::default() })
}

/// Mount table kept in memory; nothing touches the host.
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<MountPoint>>,
    formatted: Mutex<Vec<(String, PathBuf, String)>>,
    fail_unmount: Mutex<Vec<PathBuf>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: &str, path: impl Into<PathBuf>) {
        self.mounts.lock().unwrap().push(MountPoint {
            device: device.to_string(),
            path: path.into(),
            fs_type: "ext4".to_string(),
            options: vec!["rw".to_string()],
        });
    }

    pub fn fail_unmount_of(&self, path: impl Into<PathBuf>) {
        self.fail_unmount.lock().unwrap().push(path.into());
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.mounts.lock().unwrap().iter().map(|m| m.path.clone()).collect()
    }

    pub fn formatted(&self) -> Vec<(String, PathBuf, String)> {
        self.formatted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn list(&self) -> Result<Vec<MountPoint>, MountError> {
        Ok(self.mounts.lock().unwrap().clone())
    }

    async fn format_and_mount(&self, device: &str, target: &Path, fs_type: &str) -> Result<(), MountError> {
        self.formatted.lock().unwrap().push((device.to_string(), target.to_path_buf(), fs_type.to_string()));
        self.add(device, target);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if self.fail_unmount.lock().unwrap().iter().any(|p| p == target) {
            return Err(MountError::Command {
                program: "umount".into(),
                status: "exit status: 32".into(),
                stderr: format!("umount: {}: target is busy", target.display()),
            });
        }
        self.mounts.lock().unwrap().retain(|m| m.path != target);
        Ok(())
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        Ok(!self.mounts.lock().unwrap().iter().any(|m| m.path == path))
    }
}

/// A fully wired plugin over fakes, rooted in a temporary base directory.
pub struct Harness {
    pub base: tempfile::TempDir,
    pub api: Arc<FakeVolumeApi>,
    pub bridge: Arc<FakeBridge>,
    pub mounter: Arc<FakeMounter>,
    pub driver: Arc<VolumeDriver>,
    pub tracker: Arc<ContainerTracker>,
    pub reconciler: Arc<Reconciler>,
    pub trigger: GcTrigger,
}

impl Harness {
    pub fn new(api: FakeVolumeApi, bridge: FakeBridge) -> Self {
        Self::with_mounter(api, bridge, FakeMounter::new())
    }

    pub fn with_mounter(api: FakeVolumeApi, bridge: FakeBridge, mounter: FakeMounter) -> Self {
        Self::build(api, bridge, mounter, Duration::ZERO)
    }

    /// Keeps mounts younger than `grace` away from GC.
    pub fn with_grace(api: FakeVolumeApi, bridge: FakeBridge, grace: Duration) -> Self {
        Self::build(api, bridge, FakeMounter::new(), grace)
    }

    fn build(api: FakeVolumeApi, bridge: FakeBridge, mounter: FakeMounter, grace: Duration) -> Self {
        let base = tempfile::tempdir().unwrap();
        let api = Arc::new(api);
        let bridge = Arc::new(bridge);
        let mounter = Arc::new(mounter);
        let trigger = GcTrigger::new();

        let identity = StoreIdentity {
            driver: DRIVER.to_string(),
            driver_id: "1sd1".to_string(),
            host_id: "1h1".to_string(),
        };
        let driver = Arc::new(VolumeDriver::new(
            DriverSettings::new(DRIVER, base.path()),
            bridge.clone(),
            VolumeStore::new(api.clone(), identity),
            mounter.clone(),
            trigger.clone(),
        ));

        let tracker = Arc::new(ContainerTracker::new(driver.mount_root()));
        let settings = GcSettings { mount_grace: grace, ..GcSettings::default() };
        let reconciler =
            Arc::new(Reconciler::new(driver.clone(), tracker.clone(), trigger.clone(), settings));

        Self { base, api, bridge, mounter, driver, tracker, reconciler, trigger }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.base.path().join(DRIVER).join(name)
    }
}
