use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use super::models::{VolumeQuery, VolumeRecord, VolumeUpdate};
use crate::error::ApiError;

/// The remote API holding volume records.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn list_volumes(&self, query: &VolumeQuery) -> Result<Vec<VolumeRecord>, ApiError>;

    /// Fails with `ApiError::Conflict` on an optimistic-concurrency clash.
    async fn update_volume(&self, id: &str, update: &VolumeUpdate)
    -> Result<VolumeRecord, ApiError>;
}
