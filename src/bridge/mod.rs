// External driver bridge
//
// Every device operation is delegated to an external executable invoked as
// `<driver> <verb> [args...]`, which answers with a single JSON object.

pub mod exec;

pub use exec::ExecBridge;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BridgeError, PluginError, PluginResult};

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILURE: &str = "Failure";
pub const STATUS_NOT_SUPPORTED: &str = "Not supported";

/// Key added to every option payload so driver scripts know they run under orchestration.
pub const ORCHESTRATED_KEY: &str = "rancher";

/// Verbs understood by the external driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Init,
    Validate,
    Create,
    Delete,
    Attach,
    Detach,
    Mount,
    Unmount,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Init => "init",
            Verb::Validate => "validate",
            Verb::Create => "create",
            Verb::Delete => "delete",
            Verb::Attach => "attach",
            Verb::Detach => "detach",
            Verb::Mount => "mount",
            Verb::Unmount => "unmount",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON object a driver prints on stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default, alias = "Status")]
    pub status: String,
    #[serde(default, alias = "Message")]
    pub message: String,
    #[serde(default, alias = "Options", deserialize_with = "nullable_map")]
    pub options: HashMap<String, String>,
    #[serde(default, alias = "Device")]
    pub device: String,
}

fn nullable_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Normalized result of one driver invocation.
///
/// `Unsupported` is not an error: the driver negotiates capabilities per
/// backend, and every caller decides whether to fall back or to tolerate it.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    Unsupported,
    Failed(String),
}

impl<T> Outcome<T> {
    /// Turns `Failed` into an error; `Ok(None)` means the verb is unsupported.
    pub fn require(self, verb: Verb) -> PluginResult<Option<T>> {
        match self {
            Outcome::Ok(value) => Ok(Some(value)),
            Outcome::Unsupported => Ok(None),
            Outcome::Failed(message) => {
                Err(PluginError::Command { verb: verb.to_string(), message })
            }
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Outcome::Unsupported)
    }
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait DriverCommand: Send + Sync {
    async fn invoke(
        &self,
        verb: Verb,
        args: &[String],
    ) -> Result<Outcome<CommandResult>, BridgeError>;
}

/// Builds the JSON options argument passed to `create`, `attach`, `mount` and `delete`.
pub fn driver_args(name: &str, options: &HashMap<String, String>) -> String {
    let mut payload: BTreeMap<&str, &str> =
        options.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    payload.insert("name", name);
    payload.insert(ORCHESTRATED_KEY, "true");

    let object: serde_json::Map<String, serde_json::Value> = payload
        .into_iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    serde_json::Value::Object(object).to_string()
}

/// Overlays driver-reported options on the requested ones; the driver wins on collisions.
pub fn fold_options(
    requested: HashMap<String, String>,
    reported: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = requested;
    merged.extend(reported);
    merged
}
