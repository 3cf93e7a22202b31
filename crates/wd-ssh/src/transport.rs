//! Multiplexed SSH client session. One transport is opened per workspace
//! operation; every substrate command and tunnel channel shares it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::time::timeout;
use tracing::debug;

use crate::{Result, SshError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Stderr stream id in the SSH protocol.
const EXT_STDERR: u32 = 1;

/// Credential used to authenticate the SSH session.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    /// PEM-encoded private key blob.
    Key(String),
}

/// Captured output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Remote dev hosts are addressed by IP the user typed in; there is no
    // known_hosts story here.
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A connected, authenticated SSH session.
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    address: String,
}

impl SshTransport {
    /// Connect and authenticate.
    pub async fn connect(
        address: &str,
        ssh_port: u16,
        user_name: &str,
        auth: &SshAuth,
    ) -> Result<Self> {
        let config = Arc::new(Config::default());
        let addr = format!("{}:{}", address, ssh_port);

        debug!(address = %addr, user = %user_name, "connecting ssh transport");
        let mut handle = timeout(CONNECT_TIMEOUT, client::connect(config, &addr, ClientHandler))
            .await
            .map_err(|_| SshError::Connect {
                address: addr.clone(),
                message: "connection timed out".into(),
            })?
            .map_err(|e| SshError::Connect {
                address: addr.clone(),
                message: e.to_string(),
            })?;

        let authenticated = match auth {
            SshAuth::Password(password) => {
                handle.authenticate_password(user_name, password).await?
            }
            SshAuth::Key(blob) => {
                let pair = russh_keys::decode_secret_key(blob, None)
                    .map_err(|e| SshError::BadKey(e.to_string()))?;
                handle
                    .authenticate_publickey(user_name, Arc::new(pair))
                    .await?
            }
        };
        if !authenticated {
            return Err(SshError::AuthRejected {
                user: user_name.to_string(),
            });
        }

        Ok(Self {
            handle,
            address: addr,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run a command and capture its output.
    pub async fn exec(&self, command: &str) -> Result<SshOutput> {
        self.exec_inner(command, None, |_| {}).await
    }

    /// Run a command, invoking `on_line` for every stdout line as it
    /// arrives. Long `docker-compose up` runs report progress this way.
    pub async fn exec_streaming(
        &self,
        command: &str,
        on_line: impl FnMut(&str),
    ) -> Result<SshOutput> {
        self.exec_inner(command, None, on_line).await
    }

    /// Run a command with bytes fed to its stdin. Used to place files on
    /// the host without scp.
    pub async fn exec_with_stdin(&self, command: &str, stdin: &[u8]) -> Result<SshOutput> {
        self.exec_inner(command, Some(stdin), |_| {}).await
    }

    async fn exec_inner(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        mut on_line: impl FnMut(&str),
    ) -> Result<SshOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        if let Some(data) = stdin {
            channel.data(data).await?;
            channel.eof().await?;
        }

        let mut output = SshOutput::default();
        let mut line_buf = String::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    let chunk = String::from_utf8_lossy(&data);
                    output.stdout.push_str(&chunk);
                    line_buf.push_str(&chunk);
                    while let Some(pos) = line_buf.find('\n') {
                        let line: String = line_buf.drain(..=pos).collect();
                        on_line(line.trim_end_matches('\n'));
                    }
                }
                ChannelMsg::ExtendedData { data, ext } if ext == EXT_STDERR => {
                    output.stderr.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    output.exit_code = exit_status;
                }
                _ => {}
            }
        }
        if !line_buf.is_empty() {
            on_line(&line_buf);
        }
        Ok(output)
    }

    /// Open a direct-tcpip channel to an address on the substrate side.
    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        Ok(self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?)
    }

    /// Close the session.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
