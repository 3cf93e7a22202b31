//! Error types for config parsing and resolution.

use crate::ports::PortExhaustedError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The declarative YAML failed to parse; line is 1-based when the
    /// parser reported a location, 0 otherwise.
    #[error("config parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("duplicate service name {0:?}")]
    DuplicateService(String),

    #[error("no dev container: {0}")]
    NoDevContainer(String),

    #[error(transparent)]
    PortExhausted(#[from] PortExhaustedError),

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("yaml serialization: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Wrap a serde_yaml deserialization failure, keeping the line number.
    pub fn parse(err: serde_yaml::Error) -> Self {
        let line = err.location().map(|l| l.line()).unwrap_or(0);
        Self::Parse {
            line,
            message: err.to_string(),
        }
    }
}
