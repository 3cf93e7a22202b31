//! Command execution abstraction shared by all drivers.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wd_ssh::SshTransport;

use crate::{Result, SubstrateError};

/// Captured result of one command.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Error out unless the command succeeded.
    pub fn ensure_success(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SubstrateError::command(command, self.exit_code, &self.stderr))
        }
    }
}

/// Runs shell commands and moves files on a substrate. Drivers depend on
/// this instead of on `std::process` or SSH directly, so tests can supply
/// canned output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a `sh -c` command, capturing output. A nonzero exit is not an
    /// error at this layer; callers decide.
    async fn run(&self, command: &str) -> Result<RunOutput>;

    /// Run a command, surfacing stdout lines as they arrive.
    async fn run_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<RunOutput>;

    /// Write a file, creating parent directories. `mode` is an octal unix
    /// permission set when given.
    async fn write_file(&self, path: &str, content: &[u8], mode: Option<u32>) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn file_exists(&self, path: &str) -> Result<bool>;
}

/// Runner for the local host.
pub struct LocalRunner {
    cancel: CancellationToken,
}

impl LocalRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &str) -> Result<RunOutput> {
        debug!(command, "local run");
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SubstrateError::Cancelled),
            output = child.wait_with_output() => output?,
        };
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<RunOutput> {
        debug!(command, "local run (streaming)");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_buf = String::new();
        let mut out_buf = String::new();

        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(SubstrateError::Cancelled);
                }
                line = out_lines.next_line() => line?,
            };
            match line {
                Some(line) => {
                    on_line(&line);
                    out_buf.push_str(&line);
                    out_buf.push('\n');
                }
                None => break,
            }
        }

        let status = child.wait().await?;
        if let Ok(collected) = stderr_task.await {
            err_buf = collected;
        }
        Ok(RunOutput {
            stdout: out_buf,
            stderr: err_buf,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: Option<u32>) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

/// Runner that shells every command through a shared SSH transport.
pub struct SshRunner {
    transport: Arc<SshTransport>,
    cancel: CancellationToken,
}

impl SshRunner {
    pub fn new(transport: Arc<SshTransport>, cancel: CancellationToken) -> Self {
        Self { transport, cancel }
    }

    pub fn transport(&self) -> Arc<SshTransport> {
        Arc::clone(&self.transport)
    }

    fn from_ssh(output: wd_ssh::SshOutput) -> RunOutput {
        RunOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code as i32,
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, command: &str) -> Result<RunOutput> {
        debug!(command, "ssh run");
        let output = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SubstrateError::Cancelled),
            output = self.transport.exec(command) => output?,
        };
        Ok(Self::from_ssh(output))
    }

    async fn run_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<RunOutput> {
        debug!(command, "ssh run (streaming)");
        let output = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SubstrateError::Cancelled),
            output = self.transport.exec_streaming(command, |line| on_line(line)) => output?,
        };
        Ok(Self::from_ssh(output))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: Option<u32>) -> Result<()> {
        let quoted = shell_quote(path);
        let mut command = format!("mkdir -p $(dirname {q}) && cat > {q}", q = quoted);
        if let Some(mode) = mode {
            command.push_str(&format!(" && chmod {:o} {}", mode, quoted));
        }
        let output = self.transport.exec_with_stdin(&command, content).await?;
        Self::from_ssh(output).ensure_success(&command)?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let command = format!("cat {}", shell_quote(path));
        let output = self.run(&command).await?.ensure_success(&command)?;
        Ok(output.stdout)
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self
            .run(&format!("[ -e {} ]", shell_quote(path)))
            .await?;
        Ok(output.success())
    }
}

/// POSIX single-quote escaping.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_runner_captures_output_and_exit_code() {
        let runner = LocalRunner::new(CancellationToken::new());
        let output = runner.run("echo out; echo err >&2; exit 3").await.unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn local_runner_streams_lines() {
        let runner = LocalRunner::new(CancellationToken::new());
        let mut lines = Vec::new();
        let output = runner
            .run_streaming("printf 'a\\nb\\n'", &mut |line: &str| {
                lines.push(line.to_string())
            })
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_run() {
        let token = CancellationToken::new();
        let runner = LocalRunner::new(token.clone());
        token.cancel();
        assert!(matches!(
            runner.run("sleep 30").await,
            Err(SubstrateError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn local_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.txt");
        let path = path.to_str().unwrap();
        let runner = LocalRunner::new(CancellationToken::new());

        runner.write_file(path, b"payload", Some(0o600)).await.unwrap();
        assert!(runner.file_exists(path).await.unwrap());
        assert_eq!(runner.read_file(path).await.unwrap(), "payload");
    }

    #[test]
    fn shell_quote_handles_embedded_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
