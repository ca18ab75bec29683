pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod mount;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod tracker;

pub use error::{PluginError, PluginResult};
