use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    CommandResult, DriverCommand, Outcome, STATUS_FAILURE, STATUS_NOT_SUPPORTED, Verb,
};
use crate::error::BridgeError;

/// Runs the configured driver executable once per operation.
#[derive(Debug, Clone)]
pub struct ExecBridge {
    command: PathBuf,
}

impl ExecBridge {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self { command: command.into() }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    fn normalize(
        &self,
        verb: Verb,
        status: ExitStatus,
        stdout: &[u8],
    ) -> Result<Outcome<CommandResult>, BridgeError> {
        let command = self.command.display().to_string();

        if !status.success() {
            return match serde_json::from_slice::<CommandResult>(stdout) {
                Ok(result) if !result.message.is_empty() => Ok(Outcome::Failed(result.message)),
                _ => Err(BridgeError::Exit { command, verb: verb.to_string(), status }),
            };
        }

        let result: CommandResult = serde_json::from_slice(stdout).map_err(|source| {
            BridgeError::Parse { command, verb: verb.to_string(), source }
        })?;

        Ok(match result.status.as_str() {
            STATUS_FAILURE => Outcome::Failed(result.message),
            STATUS_NOT_SUPPORTED => Outcome::Unsupported,
            _ => Outcome::Ok(result),
        })
    }
}

#[async_trait]
impl DriverCommand for ExecBridge {
    async fn invoke(
        &self,
        verb: Verb,
        args: &[String],
    ) -> Result<Outcome<CommandResult>, BridgeError> {
        tracing::debug!(command = %self.command.display(), verb = %verb, args = ?args, "exec driver");

        let output = Command::new(&self.command)
            .arg(verb.as_str())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|source| BridgeError::Spawn {
                command: self.command.display().to_string(),
                source,
            })?;

        let outcome = self.normalize(verb, output.status, &output.stdout)?;
        if outcome.is_unsupported() {
            tracing::debug!(verb = %verb, "driver reports verb not supported");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exit(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn bridge() -> ExecBridge {
        ExecBridge::new("/opt/driver")
    }

    #[test]
    fn test_success_is_returned() {
        let out = br#"{"status":"Success","device":"/dev/x"}"#;
        match bridge().normalize(Verb::Attach, exit(0), out).unwrap() {
            Outcome::Ok(result) => assert_eq!(result.device, "/dev/x"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_empty_status_is_success() {
        let outcome = bridge().normalize(Verb::Mount, exit(0), b"{}").unwrap();
        assert_eq!(outcome, Outcome::Ok(CommandResult::default()));
    }

    #[test]
    fn test_failure_status_carries_message() {
        let out = br#"{"status":"Failure","message":"volume busy"}"#;
        let outcome = bridge().normalize(Verb::Detach, exit(0), out).unwrap();
        assert_eq!(outcome, Outcome::Failed("volume busy".into()));
    }

    #[test]
    fn test_not_supported_status() {
        let out = br#"{"status":"Not supported"}"#;
        let outcome = bridge().normalize(Verb::Attach, exit(0), out).unwrap();
        assert!(outcome.is_unsupported());
    }

    #[test]
    fn test_unparseable_success_output() {
        let err = bridge().normalize(Verb::Init, exit(0), b"hello").unwrap_err();
        assert!(matches!(err, BridgeError::Parse { .. }));
    }

    #[test]
    fn test_nonzero_exit_with_message() {
        let out = br#"{"status":"Failure","message":"not found"}"#;
        let outcome = bridge().normalize(Verb::Delete, exit(1), out).unwrap();
        assert_eq!(outcome, Outcome::Failed("not found".into()));
    }

    #[test]
    fn test_nonzero_exit_without_payload() {
        let err = bridge().normalize(Verb::Delete, exit(2), b"").unwrap_err();
        match err {
            BridgeError::Exit { verb, status, .. } => {
                assert_eq!(verb, "delete");
                assert_eq!(status.code(), Some(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_nonzero_exit_with_empty_message() {
        let out = br#"{"status":"Failure","message":""}"#;
        let err = bridge().normalize(Verb::Delete, exit(1), out).unwrap_err();
        assert!(matches!(err, BridgeError::Exit { .. }));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let bridge = ExecBridge::new("/nonexistent/driver-binary");
        let err = bridge.invoke(Verb::Init, &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }
}
