// Mount lifecycle driver
//
// Volume state is never persisted locally; each call infers it from the
// remote record and the host mount table:
//
//   unregistered -> created -> attached -> mounted -> (unmounted == created) -> removed

pub mod locks;

pub use locks::NameLocks;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bridge::{CommandResult, DriverCommand, Verb, driver_args, fold_options};
use crate::error::{PluginError, PluginResult};
use crate::mount::{self, Mounter};
use crate::reconciler::GcTrigger;
use crate::store::{VolumeRecord, VolumeState, VolumeStore};

/// Per-volume option naming the filesystem for the generic format-and-mount fallback.
pub const FS_TYPE_OPTION: &str = "fs-type";
/// Filesystem hint set by orchestrators that speak the Kubernetes flex protocol.
pub const K8S_FS_TYPE_OPTION: &str = "kubernetes.io/fsType";

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub driver_name: String,
    pub base_dir: PathBuf,
    pub default_fs_type: String,
    pub scope: String,
    /// Whether the external driver is asked to `create` at all.
    pub create_supported: bool,
    /// Persist the device reported by `attach` into the record's options.
    pub save_on_attach: bool,
    /// Serialize `create` per volume name.
    pub serialize_create: bool,
}

impl DriverSettings {
    pub fn new(driver_name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            driver_name: driver_name.into(),
            base_dir: base_dir.into(),
            default_fs_type: "ext4".to_string(),
            scope: "flex".to_string(),
            create_supported: true,
            save_on_attach: false,
            serialize_create: true,
        }
    }
}

/// Implements the runtime-facing volume verbs on top of the external driver,
/// the remote volume store and the host mount table.
pub struct VolumeDriver {
    settings: DriverSettings,
    bridge: Arc<dyn DriverCommand>,
    store: VolumeStore,
    mounter: Arc<dyn Mounter>,
    name_locks: NameLocks,
    mount_lock: Mutex<()>,
    recent_mounts: StdMutex<HashMap<PathBuf, Instant>>,
    gc: GcTrigger,
}

impl VolumeDriver {
    pub fn new(
        settings: DriverSettings,
        bridge: Arc<dyn DriverCommand>,
        store: VolumeStore,
        mounter: Arc<dyn Mounter>,
        gc: GcTrigger,
    ) -> Self {
        Self {
            settings,
            bridge,
            store,
            mounter,
            name_locks: NameLocks::new(),
            mount_lock: Mutex::new(()),
            recent_mounts: StdMutex::new(HashMap::new()),
            gc,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn mounter(&self) -> &Arc<dyn Mounter> {
        &self.mounter
    }

    /// `<base>/<driver>`: every managed mount lives below it.
    pub fn mount_root(&self) -> PathBuf {
        self.settings.base_dir.join(&self.settings.driver_name)
    }

    /// `<root>/<name>`; the name must be a single plain path component.
    pub fn mount_path(&self, name: &str) -> PluginResult<PathBuf> {
        check_name(name)?;
        Ok(self.mount_root().join(name))
    }

    pub fn path(&self, name: &str) -> PluginResult<PathBuf> {
        self.mount_path(name)
    }

    pub fn capabilities(&self) -> &str {
        &self.settings.scope
    }

    pub async fn init(&self) -> PluginResult<()> {
        self.bridge.invoke(Verb::Init, &[]).await?.require(Verb::Init)?;
        Ok(())
    }

    pub async fn validate(&self) -> PluginResult<()> {
        self.bridge.invoke(Verb::Validate, &[]).await?.require(Verb::Validate)?;
        Ok(())
    }

    pub async fn create(&self, name: &str, options: HashMap<String, String>) -> PluginResult<()> {
        check_name(name)?;
        let _guard = if self.settings.serialize_create {
            Some(self.name_locks.lock(name).await)
        } else {
            None
        };

        if self.store.is_created(name).await? {
            tracing::debug!(name = %name, "Volume already created");
            return Ok(());
        }

        let mut merged = options;
        if self.settings.create_supported {
            let outcome = self.bridge.invoke(Verb::Create, &[driver_args(name, &merged)]).await?;
            match outcome.require(Verb::Create)? {
                Some(result) => merged = fold_options(merged, result.options),
                None => tracing::debug!(name = %name, "Create not supported, persisting options only"),
            }
        }

        if let Err(err) = self.store.save(name, &merged, 0).await {
            tracing::error!(name = %name, error = %err, "Save volume failed, deleting");
            match self.bridge.invoke(Verb::Delete, &[driver_args(name, &merged)]).await {
                Ok(outcome) => {
                    if let Err(cleanup) = outcome.require(Verb::Delete) {
                        tracing::warn!(name = %name, error = %cleanup, "Delete after failed save failed");
                    }
                }
                Err(cleanup) => {
                    tracing::warn!(name = %name, error = %cleanup, "Delete after failed save failed")
                }
            }
            return Err(err);
        }

        Ok(())
    }

    pub async fn get(&self, name: &str) -> PluginResult<VolumeRecord> {
        self.store.get(name).await
    }

    pub async fn list(&self) -> PluginResult<Vec<VolumeRecord>> {
        self.store.list().await
    }

    /// Removal belongs to the control plane; the runtime's remove only
    /// reaches the device once the record is already `removing`.
    pub async fn remove(&self, name: &str) -> PluginResult<()> {
        let record = match self.store.get(name).await {
            Ok(record) => record,
            Err(PluginError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if record.state != VolumeState::Removing {
            tracing::debug!(name = %name, state = %record.state, "Skipping delete, volume not removing");
            return Ok(());
        }

        let args = [driver_args(name, &record.driver_opts)];
        self.bridge.invoke(Verb::Delete, &args).await?.require(Verb::Delete)?;
        Ok(())
    }

    async fn attach_device(
        &self,
        name: &str,
        record: &VolumeRecord,
    ) -> PluginResult<Option<CommandResult>> {
        let args = [driver_args(name, &record.driver_opts)];
        let outcome = self.bridge.invoke(Verb::Attach, &args).await?;
        outcome.require(Verb::Attach).inspect_err(|err| {
            tracing::error!(name = %name, error = %err, "Failed to attach");
        })
    }

    /// Attaches the device without mounting it; returns the reported device.
    pub async fn attach(&self, name: &str) -> PluginResult<Option<String>> {
        let _lock = self.mount_lock.lock().await;

        let record = self.store.get(name).await?;
        let Some(result) = self.attach_device(name, &record).await? else {
            return Ok(None);
        };

        if self.settings.save_on_attach && !result.device.is_empty() {
            let mut options = record.driver_opts.clone();
            options.insert("device".to_string(), result.device.clone());
            self.store.save(name, &options, 0).await?;
        }

        Ok(Some(result.device))
    }

    fn fs_type(&self, record: &VolumeRecord) -> String {
        [FS_TYPE_OPTION, K8S_FS_TYPE_OPTION]
            .iter()
            .filter_map(|key| record.driver_opts.get(*key))
            .find(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| self.settings.default_fs_type.clone())
    }

    pub async fn mount(&self, name: &str) -> PluginResult<PathBuf> {
        let _lock = self.mount_lock.lock().await;

        let target = self.mount_path(name)?;
        let record = self.store.get(name).await?;
        if mount::is_mounted(self.mounter.as_ref(), &target).await? {
            tracing::info!(name = %name, mountpoint = %target.display(), "Already mounted");
            // The requesting container is not tracked yet.
            self.remember_mount(target.clone());
            return Ok(target);
        }

        let device = self.attach_device(name, &record).await?.map(|r| r.device).unwrap_or_default();

        tokio::fs::DirBuilder::new().recursive(true).mode(0o750).create(&target).await?;

        let args = [
            target.to_string_lossy().into_owned(),
            device.clone(),
            driver_args(name, &record.driver_opts),
        ];
        let outcome = self.bridge.invoke(Verb::Mount, &args).await?;
        if outcome.require(Verb::Mount)?.is_none() {
            if device.is_empty() {
                return Err(PluginError::NoDevice(name.to_string()));
            }
            let fs_type = self.fs_type(&record);
            tracing::info!(name = %name, device = %device, fs_type = %fs_type, "Mount not supported by driver, formatting and mounting");
            self.mounter.format_and_mount(&device, &target, &fs_type).await?;
        }

        self.remember_mount(target.clone());
        Ok(target)
    }

    pub(crate) fn remember_mount(&self, target: PathBuf) {
        self.recent_mounts.lock().unwrap_or_else(|e| e.into_inner()).insert(target, Instant::now());
    }

    /// Only a release signal: one runtime unmount says nothing about other
    /// containers still using the volume, so the reconciler decides.
    pub fn unmount(&self, name: &str) {
        tracing::debug!(name = %name, "Unmount requested, kicking GC");
        self.gc.kick();
    }

    /// Whether `path` was mounted by this process less than `within` ago.
    pub fn mounted_within(&self, path: &Path, within: Duration) -> bool {
        let mut recent = self.recent_mounts.lock().unwrap_or_else(|e| e.into_inner());
        recent.retain(|_, at| at.elapsed() < within);
        recent.contains_key(path)
    }

    /// Unmounts `target` and, when it was the device's last mount, detaches
    /// the device and removes the empty mount directory.
    pub async fn detach_path(&self, target: &Path) -> PluginResult<()> {
        let _lock = self.mount_lock.lock().await;

        tracing::info!(mountpoint = %target.display(), "Unmounting");
        let (device, refs) = mount::device_from_mount(self.mounter.as_ref(), target).await?;

        let args = [target.to_string_lossy().into_owned()];
        let outcome = self.bridge.invoke(Verb::Unmount, &args).await?;
        if outcome.require(Verb::Unmount)?.is_none() {
            self.mounter.unmount(target).await?;
        }
        self.recent_mounts.lock().unwrap_or_else(|e| e.into_inner()).remove(target);

        if refs != 1 {
            return Ok(());
        }

        tracing::info!(device = %device, "Detaching");
        self.bridge.invoke(Verb::Detach, &[device.clone()]).await?.require(Verb::Detach)?;

        if tokio::fs::try_exists(target).await? && self.mounter.is_likely_not_mount_point(target).await? {
            tokio::fs::remove_dir(target).await?;
        }
        tracing::info!(mountpoint = %target.display(), "Unmount done");
        Ok(())
    }
}

fn check_name(name: &str) -> PluginResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(()),
        _ => Err(PluginError::InvalidName(name.to_string())),
    }
}
