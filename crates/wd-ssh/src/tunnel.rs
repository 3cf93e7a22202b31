//! Concurrent TCP forwards over an established transport.
//!
//! One listener per forward pair; each accepted connection gets its own
//! channel through the transport and a full-duplex byte copy until either
//! side closes. A failing tunnel never takes its siblings down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::SshTransport;
use crate::{Result, SshError};

/// Per-listener cap on concurrent forwarded connections.
const MAX_CONNS_PER_LISTENER: usize = 32;

/// Grace period for draining in-flight connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One `client address -> substrate address` pair.
#[derive(Debug, Clone)]
pub struct Forward {
    pub client_addr: SocketAddr,
    pub substrate_host: String,
    pub substrate_port: u16,
}

/// Byte stream with both directions, boxed for fakes in tests.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Opens a stream to a substrate address. The SSH transport is the real
/// implementation; tests substitute plain TCP.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn TunnelStream>>;
}

#[async_trait]
impl ChannelOpener for SshTransport {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn TunnelStream>> {
        let channel = self.open_direct_tcpip(host, port).await?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Supervises one listener task per forward pair.
#[derive(Debug)]
pub struct TunnelSupervisor {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl TunnelSupervisor {
    /// Bind every listener and start accepting. Bind failures surface
    /// immediately; nothing is left half-started.
    pub async fn start(
        opener: Arc<dyn ChannelOpener>,
        forwards: Vec<Forward>,
    ) -> Result<Self> {
        let token = CancellationToken::new();
        let mut listeners = Vec::with_capacity(forwards.len());
        for forward in &forwards {
            let listener =
                TcpListener::bind(forward.client_addr)
                    .await
                    .map_err(|e| SshError::Listener {
                        addr: forward.client_addr.to_string(),
                        message: e.to_string(),
                    })?;
            listeners.push(listener);
        }

        let mut tasks = Vec::with_capacity(forwards.len());
        let mut local_addrs = Vec::with_capacity(forwards.len());
        for (listener, forward) in listeners.into_iter().zip(forwards) {
            let local_addr = listener.local_addr()?;
            info!(
                local = %local_addr,
                substrate = %format!("{}:{}", forward.substrate_host, forward.substrate_port),
                "tunnel up"
            );
            local_addrs.push(local_addr);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                forward,
                Arc::clone(&opener),
                token.clone(),
            )));
        }

        Ok(Self {
            token,
            tasks,
            local_addrs,
        })
    }

    /// Client-side addresses actually bound, in forward order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting, then drain in-flight connections within the grace
    /// period.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("tunnel listener did not drain within grace period");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    forward: Forward,
    opener: Arc<dyn ChannelOpener>,
    token: CancellationToken,
) {
    // Bounded pool: each permit is one in-flight forwarded connection.
    let permits = Arc::new(Semaphore::new(MAX_CONNS_PER_LISTENER));
    let mut conns = tokio::task::JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "tunnel connection accepted");
                let opener = Arc::clone(&opener);
                let forward = forward.clone();
                conns.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = pipe(stream, &opener, &forward).await {
                        warn!(error = %e, "tunnel connection ended with error");
                    }
                });
            }
            Err(e) => {
                // transient accept failure; the listener itself stays up
                warn!(error = %e, "tunnel accept failed");
            }
        }
    }

    drop(listener);
    while conns.join_next().await.is_some() {}
}

async fn pipe(
    mut client: TcpStream,
    opener: &Arc<dyn ChannelOpener>,
    forward: &Forward,
) -> Result<()> {
    let mut substrate = opener
        .open(&forward.substrate_host, forward.substrate_port)
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut substrate).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Fake opener: plain TCP to a test server stands in for direct-tcpip.
    struct TcpOpener;

    #[async_trait]
    impl ChannelOpener for TcpOpener {
        async fn open(&self, host: &str, port: u16) -> Result<Box<dyn TunnelStream>> {
            let stream = TcpStream::connect((host, port)).await?;
            Ok(Box::new(stream))
        }
    }

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn forward_to(addr: SocketAddr) -> Forward {
        Forward {
            client_addr: "127.0.0.1:0".parse().unwrap(),
            substrate_host: addr.ip().to_string(),
            substrate_port: addr.port(),
        }
    }

    #[tokio::test]
    async fn bytes_round_trip_through_tunnel() {
        let echo = spawn_echo_server().await;
        let supervisor = TunnelSupervisor::start(Arc::new(TcpOpener), vec![forward_to(echo)])
            .await
            .unwrap();

        let local = supervisor.local_addrs()[0];
        let mut conn = TcpStream::connect(local).await.unwrap();
        conn.write_all(b"ping through the tunnel").await.unwrap();

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping through the tunnel");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn tunnels_are_isolated_from_each_other() {
        let echo = spawn_echo_server().await;
        // second forward points at a closed port; its connections fail
        let dead = Forward {
            client_addr: "127.0.0.1:0".parse().unwrap(),
            substrate_host: "127.0.0.1".to_string(),
            substrate_port: 1,
        };
        let supervisor =
            TunnelSupervisor::start(Arc::new(TcpOpener), vec![forward_to(echo), dead])
                .await
                .unwrap();

        // the dead tunnel accepts and drops; the live one still echoes
        let dead_local = supervisor.local_addrs()[1];
        let _ = TcpStream::connect(dead_local).await;

        let live_local = supervisor.local_addrs()[0];
        let mut conn = TcpStream::connect(live_local).await.unwrap();
        conn.write_all(b"still alive").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still alive");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_listeners() {
        let echo = spawn_echo_server().await;
        let supervisor = TunnelSupervisor::start(Arc::new(TcpOpener), vec![forward_to(echo)])
            .await
            .unwrap();
        let local = supervisor.local_addrs()[0];
        supervisor.shutdown().await;

        assert!(TcpStream::connect(local).await.is_err());
    }
}
