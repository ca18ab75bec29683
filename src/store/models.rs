use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle state of a volume record as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VolumeState {
    Inactive,
    Active,
    Activating,
    Deactivating,
    Detached,
    Removing,
    Other(String),
}

impl VolumeState {
    /// States in which a volume exists and is usable by this plugin.
    pub fn is_good(&self) -> bool {
        !matches!(self, VolumeState::Other(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            VolumeState::Inactive => "inactive",
            VolumeState::Active => "active",
            VolumeState::Activating => "activating",
            VolumeState::Deactivating => "deactivating",
            VolumeState::Detached => "detached",
            VolumeState::Removing => "removing",
            VolumeState::Other(s) => s,
        }
    }
}

impl Default for VolumeState {
    fn default() -> Self {
        VolumeState::Other(String::new())
    }
}

impl From<String> for VolumeState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "inactive" => VolumeState::Inactive,
            "active" => VolumeState::Active,
            "activating" => VolumeState::Activating,
            "deactivating" => VolumeState::Deactivating,
            "detached" => VolumeState::Detached,
            "removing" => VolumeState::Removing,
            _ => VolumeState::Other(s),
        }
    }
}

impl From<&str> for VolumeState {
    fn from(s: &str) -> Self {
        VolumeState::from(s.to_string())
    }
}

impl From<VolumeState> for String {
    fn from(state: VolumeState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A volume record held by the remote API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: VolumeState,
    #[serde(default, deserialize_with = "stringify_opts")]
    pub driver_opts: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

impl VolumeRecord {
    pub fn new(name: impl Into<String>, state: impl Into<VolumeState>) -> Self {
        Self { name: name.into(), state: state.into(), ..Default::default() }
    }
}

// Driver options come back as arbitrary JSON values; the driver protocol only speaks strings.
fn stringify_opts<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

/// Filter for volume lookups; removed records are always excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeQuery {
    pub name: Option<String>,
    pub storage_driver_id: String,
}

/// Body of a volume update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeUpdate {
    pub name: String,
    pub driver: String,
    pub storage_driver_id: String,
    pub driver_opts: HashMap<String, String>,
    pub host_id: String,
}

/// Who this plugin instance is, as known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreIdentity {
    pub driver: String,
    pub driver_id: String,
    pub host_id: String,
}
