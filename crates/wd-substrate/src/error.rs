//! Error types for substrate drivers.

use std::time::Duration;

/// How much captured stderr travels with a command failure.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("substrate is missing a prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("command failed (exit {exit_code}): {command}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Ssh(#[from] wd_ssh::SshError),

    #[error("health endpoint did not answer 200 within {0:?}")]
    HealthTimeout(Duration),

    #[error("invalid substrate input: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl SubstrateError {
    /// Build a command failure keeping only the stderr tail.
    pub fn command(command: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        let stderr = stderr.trim();
        let tail = if stderr.len() > STDERR_TAIL {
            // keep the end; that is where the actual failure usually is
            let cut = stderr.len() - STDERR_TAIL;
            let cut = stderr
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= cut)
                .unwrap_or(0);
            format!("...{}", &stderr[cut..])
        } else {
            stderr.to_string()
        };
        Self::Command {
            command: command.into(),
            exit_code,
            stderr: tail,
        }
    }
}
