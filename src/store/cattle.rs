// Cattle v2 REST client
//
// Volumes, storage drivers and hosts are collections under the API base URL,
// filtered with query parameters and returned as `{"data": [...]}`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::models::{StoreIdentity, VolumeQuery, VolumeRecord, VolumeUpdate};
use super::traits::VolumeApi;
use crate::config::CattleConfig;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct Resource {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataHost {
    uuid: String,
}

#[derive(Clone)]
pub struct CattleClient {
    http: Client,
    base_url: String,
    access_key: String,
    secret_key: String,
}

impl CattleClient {
    pub fn new(config: &CattleConfig) -> Result<Self, ApiError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(reqwest::header::ACCEPT, "application/json");
        if self.access_key.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.access_key, Some(&self.secret_key))
        }
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            return Err(ApiError::Conflict(message));
        }
        Err(ApiError::Status { status: status.as_u16(), message })
    }

    async fn collection<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.request(self.http.get(&url)).query(query).send().await?;
        let collection: Collection<T> = Self::check(response).await?.json().await?;
        Ok(collection.data)
    }

    /// Resolves the storage driver id and the id of the host we run on.
    ///
    /// The host id is taken from configuration when set; otherwise the host
    /// UUID is read from the metadata service and looked up in the API.
    pub async fn resolve_identity(&self, driver: &str, config: &CattleConfig) -> Result<StoreIdentity, ApiError> {
        let drivers: Vec<Resource> = self
            .collection(
                "storagedrivers",
                &[("name", driver.to_string()), ("removed_null", "true".to_string())],
            )
            .await?;
        let driver_id = match drivers.as_slice() {
            [only] => only.id.clone(),
            _ => {
                return Err(ApiError::Lookup(format!(
                    "{driver} is not a driver registered with the current environment"
                )));
            }
        };

        let host_id = match &config.host_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.lookup_host(&config.metadata_url).await?,
        };

        tracing::info!(host_id = %host_id, driver = %driver, driver_id = %driver_id, "Resolved plugin identity");
        Ok(StoreIdentity { driver: driver.to_string(), driver_id, host_id })
    }

    async fn lookup_host(&self, metadata_url: &str) -> Result<String, ApiError> {
        let url = format!("{}/self/host", metadata_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let host: MetadataHost = Self::check(response).await?.json().await?;

        let hosts: Vec<Resource> =
            self.collection("hosts", &[("uuid", host.uuid.clone())]).await?;
        match hosts.as_slice() {
            [only] => {
                tracing::debug!(
                    host = only.hostname.as_deref().or(only.name.as_deref()).unwrap_or_default(),
                    "Found current host"
                );
                Ok(only.id.clone())
            }
            _ => Err(ApiError::Lookup(format!(
                "Failed to find current host {}, got {} host(s)",
                host.uuid,
                hosts.len()
            ))),
        }
    }
}

pub(crate) fn volume_query_params(query: &VolumeQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("removed_null", "true".to_string()),
        ("storageDriverId", query.storage_driver_id.clone()),
    ];
    match &query.name {
        Some(name) => params.push(("name", name.clone())),
        None => params.push(("limit", "-1".to_string())),
    }
    params
}

#[async_trait]
impl VolumeApi for CattleClient {
    async fn list_volumes(&self, query: &VolumeQuery) -> Result<Vec<VolumeRecord>, ApiError> {
        self.collection("volumes", &volume_query_params(query)).await
    }

    async fn update_volume(
        &self,
        id: &str,
        update: &VolumeUpdate,
    ) -> Result<VolumeRecord, ApiError> {
        let url = format!("{}/volumes/{}", self.base_url, id);
        let response = self.request(self.http.put(&url)).json(update).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
