use std::process::ExitStatus;

use thiserror::Error;

pub type PluginResult<T> = Result<T, PluginError>;

/// Errors surfaced to the container runtime as a response `Err` string.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("No such volume: {0}")]
    NotFound(String),

    #[error("{message}")]
    Command { verb: String, message: String },

    #[error("Conflict while updating volume {0}")]
    Conflict(String),

    #[error("Max tries reached waiting for volume {name}: {source}")]
    MaxTries {
        name: String,
        #[source]
        source: Box<PluginError>,
    },

    #[error("No device reported for volume {0}")]
    NoDevice(String),

    #[error("Invalid volume name: {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PluginError::NotFound(_))
    }
}

/// Failures to run the external driver at all, as opposed to a reported `Failure`.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} {verb} exited with {status}")]
    Exit { command: String, verb: String, status: ExitStatus },

    #[error("Invalid output from {command} {verb}: {source}")]
    Parse {
        command: String,
        verb: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the remote volume-record API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("409 Conflict: {0}")]
    Conflict(String),

    #[error("API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Lookup(String),
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("{program} failed ({status}): {stderr}")]
    Command { program: String, status: String, stderr: String },

    #[error("Mount table I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stat failed: {0}")]
    Stat(#[from] nix::Error),
}
