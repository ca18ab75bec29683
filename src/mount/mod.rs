pub mod host;

pub use host::HostMounter;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::error::MountError;

/// One line of the host mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn list(&self) -> Result<Vec<MountPoint>, MountError>;

    /// Formats `device` with `fs_type` unless it already carries a filesystem, then mounts it.
    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
    ) -> Result<(), MountError>;

    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Cheap check: `true` when `path` is on the same device as its parent.
    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError>;
}

pub async fn is_mounted(mounter: &dyn Mounter, path: &Path) -> Result<bool, MountError> {
    Ok(mounter.list().await?.iter().any(|m| m.path == path))
}

/// Device mounted at `path` and how many mount points share that device.
///
/// Returns an empty device and a zero count when `path` is not mounted.
pub async fn device_from_mount(
    mounter: &dyn Mounter,
    path: &Path,
) -> Result<(String, usize), MountError> {
    let mounts = mounter.list().await?;
    let Some(device) = mounts.iter().find(|m| m.path == path).map(|m| m.device.clone()) else {
        return Ok((String::new(), 0));
    };
    let refs = mounts.iter().filter(|m| m.device == device).count();
    Ok((device, refs))
}
