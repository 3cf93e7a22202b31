//! IDE endpoint health polling.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Result, SubstrateError};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll `http://{host}:{port}/` until it answers 200 or the deadline
/// passes. Cancellation is observed between polls.
pub async fn wait_http_ok(
    host: &str,
    port: u16,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let url = format!("http://{}:{}/", host, port);
    let client = reqwest::Client::builder()
        .timeout(POLL_INTERVAL)
        .build()
        .expect("reqwest client construction cannot fail with static options");
    let started = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(SubstrateError::Cancelled);
        }
        match client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                debug!(%url, "endpoint healthy");
                return Ok(());
            }
            Ok(response) => {
                debug!(%url, status = %response.status(), "endpoint not ready");
            }
            Err(e) => {
                debug!(%url, error = %e, "endpoint unreachable");
            }
        }
        if started.elapsed() >= deadline {
            return Err(SubstrateError::HealthTimeout(deadline));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(SubstrateError::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_http_server(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = format!("{}\r\ncontent-length: 0\r\n\r\n", status_line);
                let _ = stream.write_all(body.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn healthy_endpoint_returns_ok() {
        let port = spawn_http_server("HTTP/1.1 200 OK").await;
        let cancel = CancellationToken::new();
        wait_http_ok("127.0.0.1", port, Duration::from_secs(10), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_200_times_out() {
        let port = spawn_http_server("HTTP/1.1 503 Service Unavailable").await;
        let cancel = CancellationToken::new();
        let err = wait_http_ok("127.0.0.1", port, Duration::from_millis(100), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SubstrateError::HealthTimeout(_)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_polling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_http_ok("127.0.0.1", 1, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SubstrateError::Cancelled));
    }
}
