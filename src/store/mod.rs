pub mod cattle;
pub mod models;
pub mod traits;

pub use cattle::CattleClient;
pub use models::{StoreIdentity, VolumeQuery, VolumeRecord, VolumeState, VolumeUpdate};
pub use traits::VolumeApi;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ApiError, PluginError, PluginResult};

/// Bounds for waiting on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Lookups before giving up on a record becoming visible.
    pub visibility_attempts: u32,
    pub visibility_interval: Duration,
    /// Retries of a whole save after a 409 conflict.
    pub conflict_retries: u32,
    /// Backoff grows by this much per conflict retry.
    pub conflict_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            visibility_attempts: 30,
            visibility_interval: Duration::from_secs(1),
            conflict_retries: 5,
            conflict_backoff: Duration::from_secs(2),
        }
    }
}

/// Volume records scoped to one storage driver on one host.
///
/// Nothing is cached: every call goes to the remote API, which is the only
/// source of truth for whether a volume exists.
#[derive(Clone)]
pub struct VolumeStore {
    api: Arc<dyn VolumeApi>,
    identity: StoreIdentity,
    policy: RetryPolicy,
}

impl VolumeStore {
    pub fn new(api: Arc<dyn VolumeApi>, identity: StoreIdentity) -> Self {
        Self::with_policy(api, identity, RetryPolicy::default())
    }

    pub fn with_policy(api: Arc<dyn VolumeApi>, identity: StoreIdentity, policy: RetryPolicy) -> Self {
        Self { api, identity, policy }
    }

    pub fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    fn by_name(&self, name: &str) -> VolumeQuery {
        VolumeQuery {
            name: Some(name.to_string()),
            storage_driver_id: self.identity.driver_id.clone(),
        }
    }

    pub async fn is_created(&self, name: &str) -> PluginResult<bool> {
        match self.get(name).await {
            Ok(_) => Ok(true),
            Err(PluginError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the first record in a good state; records in any other state are invisible.
    pub async fn get(&self, name: &str) -> PluginResult<VolumeRecord> {
        let records = self.api.list_volumes(&self.by_name(name)).await?;
        if records.len() > 1 {
            tracing::warn!(name = %name, count = records.len(), "Multiple volumes with the same name found");
        }

        records
            .into_iter()
            .find(|record| record.state.is_good())
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> PluginResult<Vec<VolumeRecord>> {
        let query = VolumeQuery { name: None, storage_driver_id: self.identity.driver_id.clone() };
        let records = self.api.list_volumes(&query).await?;
        Ok(records.into_iter().filter(|record| record.state.is_good()).collect())
    }

    // Any non-removed record, whatever its state; the control plane may still be creating it.
    async fn get_any(&self, name: &str) -> PluginResult<VolumeRecord> {
        self.api
            .list_volumes(&self.by_name(name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    async fn wait_visible(&self, name: &str) -> PluginResult<VolumeRecord> {
        let mut last = PluginError::NotFound(name.to_string());
        for attempt in 1..=self.policy.visibility_attempts {
            match self.get_any(name).await {
                Ok(record) => return Ok(record),
                Err(err @ PluginError::NotFound(_)) => {
                    last = err;
                    if attempt < self.policy.visibility_attempts {
                        tokio::time::sleep(self.policy.visibility_interval).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(PluginError::MaxTries { name: name.to_string(), source: Box::new(last) })
    }

    /// Writes options, host and driver onto the record named `name`.
    ///
    /// Waits for the record to be materialized by the control plane, then
    /// updates it. A 409 restarts the whole save with linear backoff
    /// (`attempt * conflict_backoff`) until `conflict_retries` is exhausted.
    pub async fn save(
        &self,
        name: &str,
        options: &HashMap<String, String>,
        attempt: u32,
    ) -> PluginResult<()> {
        let mut attempt = attempt;
        loop {
            let record = self.wait_visible(name).await?;
            let update = VolumeUpdate {
                name: name.to_string(),
                driver: self.identity.driver.clone(),
                storage_driver_id: self.identity.driver_id.clone(),
                driver_opts: options.clone(),
                host_id: self.identity.host_id.clone(),
            };

            match self.api.update_volume(&record.id, &update).await {
                Ok(_) => {
                    tracing::debug!(name = %name, id = %record.id, "Saved volume");
                    return Ok(());
                }
                Err(ApiError::Conflict(_)) if attempt < self.policy.conflict_retries => {
                    attempt += 1;
                    let wait = self.policy.conflict_backoff * attempt;
                    tracing::warn!(
                        id = %record.id,
                        wait_secs = wait.as_secs(),
                        "409 Conflict while updating volume, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(ApiError::Conflict(_)) => return Err(PluginError::Conflict(name.to_string())),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
