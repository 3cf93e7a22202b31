//! Engine-level error taxonomy.

use std::time::Duration;

use wd_config::{ConfigError, PortExhaustedError};
use wd_substrate::SubstrateError;
use wd_workspace::Stage;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad user input; exits 2.
    #[error("validation: {0}")]
    Validation(String),

    #[error("registry: {0}")]
    Storage(wd_workspace::Error),

    /// An external process on the substrate failed; carries the stage and
    /// the captured stderr tail.
    #[error("stage {stage} failed: {source}")]
    Substrate {
        stage: Stage,
        #[source]
        source: SubstrateError,
    },

    #[error("network: {0}")]
    Network(String),

    #[error(transparent)]
    PortExhausted(PortExhaustedError),

    #[error("config: {0}")]
    Config(ConfigError),

    #[error("IDE endpoint not healthy within {timeout:?} (stage {stage})")]
    HealthTimeout { stage: Stage, timeout: Duration },

    /// Another operation holds this workspace's lock.
    #[error("workspace {0} is locked by another operation")]
    Busy(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Process exit code the CLI contract prescribes.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Validation(_) | EngineError::Config(_) => 2,
            EngineError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Attach the failing stage to a substrate error, promoting the
    /// cross-cutting variants.
    pub fn at_stage(stage: Stage, source: SubstrateError) -> Self {
        match source {
            SubstrateError::Cancelled => EngineError::Cancelled,
            SubstrateError::HealthTimeout(timeout) => EngineError::HealthTimeout { stage, timeout },
            source => EngineError::Substrate { stage, source },
        }
    }
}

impl From<wd_workspace::Error> for EngineError {
    fn from(err: wd_workspace::Error) -> Self {
        match err {
            wd_workspace::Error::Validation(msg) => EngineError::Validation(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::PortExhausted(e) => EngineError::PortExhausted(e),
            other => EngineError::Config(other),
        }
    }
}

impl From<PortExhaustedError> for EngineError {
    fn from(err: PortExhaustedError) -> Self {
        EngineError::PortExhausted(err)
    }
}

impl From<wd_ssh::SshError> for EngineError {
    fn from(err: wd_ssh::SshError) -> Self {
        EngineError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(EngineError::Validation("x".into()).exit_code(), 2);
        assert_eq!(EngineError::Cancelled.exit_code(), 130);
        assert_eq!(
            EngineError::Busy("7".into()).exit_code(),
            1
        );
        assert_eq!(
            EngineError::Config(ConfigError::Validation("x".into())).exit_code(),
            2
        );
    }

    #[test]
    fn substrate_cancel_promotes_to_cancelled() {
        let err = EngineError::at_stage(Stage::Launching, SubstrateError::Cancelled);
        assert!(matches!(err, EngineError::Cancelled));

        let err = EngineError::at_stage(
            Stage::Tunneling,
            SubstrateError::HealthTimeout(Duration::from_secs(300)),
        );
        assert!(matches!(
            err,
            EngineError::HealthTimeout {
                stage: Stage::Tunneling,
                ..
            }
        ));
    }
}
