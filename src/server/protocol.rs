// Docker volume-plugin wire types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::VolumeRecord;

pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

/// Every volume request body; verbs ignore the fields they do not use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeRequest {
    pub name: String,
    pub opts: Option<HashMap<String, String>>,
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

impl Volume {
    /// Protocol view of a record; the whole record is exposed as `Status`.
    pub fn from_record(record: &VolumeRecord, mountpoint: String) -> Self {
        Self {
            name: record.name.clone(),
            mountpoint,
            status: serde_json::to_value(record).ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capability {
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capability>,
}

impl PluginResponse {
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self { err: err.to_string(), ..Default::default() }
    }

    pub fn mountpoint(path: impl Into<String>) -> Self {
        Self { mountpoint: path.into(), ..Default::default() }
    }

    pub fn is_err(&self) -> bool {
        !self.err.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Handshake {
    pub implements: Vec<String>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self { implements: vec!["VolumeDriver".to_string()] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parsing() {
        let request: VolumeRequest =
            serde_json::from_str(r#"{"Name": "vol1", "Opts": {"size": "10"}}"#).unwrap();
        assert_eq!(request.name, "vol1");
        assert_eq!(request.opts.unwrap()["size"], "10");

        let request: VolumeRequest =
            serde_json::from_str(r#"{"Name": "vol1", "ID": "abc123"}"#).unwrap();
        assert_eq!(request.id, "abc123");
        assert!(request.opts.is_none());
    }

    #[test]
    fn test_request_null_opts() {
        let request: VolumeRequest = serde_json::from_str(r#"{"Name": "v", "Opts": null}"#).unwrap();
        assert!(request.opts.is_none());
    }

    #[test]
    fn test_empty_response_is_empty_object() {
        assert_eq!(serde_json::to_value(PluginResponse::default()).unwrap(), json!({}));
    }

    #[test]
    fn test_error_and_mountpoint_shape() {
        assert_eq!(
            serde_json::to_value(PluginResponse::error("No such volume: vol1")).unwrap(),
            json!({"Err": "No such volume: vol1"})
        );
        assert_eq!(
            serde_json::to_value(PluginResponse::mountpoint("/var/lib/rancher/volumes/ebs/vol1"))
                .unwrap(),
            json!({"Mountpoint": "/var/lib/rancher/volumes/ebs/vol1"})
        );
    }

    #[test]
    fn test_volume_status_carries_record() {
        let mut record = VolumeRecord::new("vol1", "active");
        record.id = "1v1".into();
        record.driver_opts.insert("size".into(), "10".into());

        let volume = Volume::from_record(&record, "/mnt/vol1".into());
        let value = serde_json::to_value(&volume).unwrap();
        assert_eq!(value["Name"], "vol1");
        assert_eq!(value["Mountpoint"], "/mnt/vol1");
        assert_eq!(value["Status"]["state"], "active");
        assert_eq!(value["Status"]["driverOpts"]["size"], "10");
    }

    #[test]
    fn test_capabilities_and_handshake() {
        let response = PluginResponse {
            capabilities: Some(Capability { scope: "flex".into() }),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(response).unwrap(), json!({"Capabilities": {"Scope": "flex"}}));
        assert_eq!(
            serde_json::to_value(Handshake::default()).unwrap(),
            json!({"Implements": ["VolumeDriver"]})
        );
    }
}
