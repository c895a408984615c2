//! Failure alerting through a health check ping service.
//!
//! When a render ends in 404 or 500 the server pings
//! `<base_url>/<key>/fail` so an external monitor can flag the outage.
//! Callers fire the ping on a detached task and ignore its outcome.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

/// Default request timeout for alert pings.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the alert notifier.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// Ping endpoint answered with an error status.
    #[error("HTTP error: {status}")]
    HttpError { status: u16 },

    /// Request timeout.
    #[error("request timeout")]
    Timeout,

    /// Network error.
    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),
}

impl From<reqwest::Error> for AlertError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { AlertError::Timeout } else { AlertError::Network(Arc::new(err)) }
    }
}

/// Receives notifications about failed renders.
#[async_trait::async_trait]
pub trait FailureNotifier: Send + Sync {
    /// Report that rendering `url` failed with `status`.
    async fn notify_failure(&self, url: &str, status: u16) -> Result<(), AlertError>;
}

/// Pings a healthchecks.io compatible endpoint on failure.
#[derive(Debug, Clone)]
pub struct HealthCheckNotifier {
    http: Client,
    endpoint: String,
}

impl HealthCheckNotifier {
    /// Create a notifier for `key` on the ping service at `base_url`.
    pub fn new(base_url: &str, key: &str) -> Result<Self, AlertError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .use_rustls_tls()
            .build()
            .map_err(|e| AlertError::Client(e.to_string()))?;

        let endpoint = format!("{}/{}/fail", base_url.trim_end_matches('/'), key);

        Ok(Self { http, endpoint })
    }

    /// URL pinged on failure.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl FailureNotifier for HealthCheckNotifier {
    async fn notify_failure(&self, url: &str, status: u16) -> Result<(), AlertError> {
        tracing::debug!(endpoint = %self.endpoint, url, status, "sending failure ping");

        let response = self.http.get(&self.endpoint).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::HttpError { status: response.status().as_u16() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response and hand back the request line received.
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&request).into_owned();
            text.lines().next().unwrap_or_default().to_string()
        });

        (base, handle)
    }

    #[test]
    fn test_endpoint_format() {
        let notifier = HealthCheckNotifier::new("https://hc-ping.com/", "abc-123").unwrap();
        assert_eq!(notifier.endpoint(), "https://hc-ping.com/abc-123/fail");
    }

    #[tokio::test]
    async fn test_notify_failure_pings_fail_endpoint() {
        let (base, handle) = serve_once("HTTP/1.1 200 OK").await;
        let notifier = HealthCheckNotifier::new(&base, "abc-123").unwrap();

        notifier.notify_failure("https://example.com/", 500).await.unwrap();

        let request_line = handle.await.unwrap();
        assert!(request_line.starts_with("GET /abc-123/fail "), "unexpected request: {request_line}");
    }

    #[tokio::test]
    async fn test_notify_failure_reports_error_status() {
        let (base, handle) = serve_once("HTTP/1.1 404 Not Found").await;
        let notifier = HealthCheckNotifier::new(&base, "missing").unwrap();

        let result = notifier.notify_failure("https://example.com/", 404).await;

        assert!(matches!(result, Err(AlertError::HttpError { status: 404 })));
        handle.await.unwrap();
    }
}
