//! Minimal hyper-based HTTP client used by the Consul and etcd backends.
//!
//! One connection per request: the backends are polled on multi-second
//! intervals, so connection reuse buys nothing worth the pooling state.
//! Every request carries an explicit timeout; a timeout is a soft failure
//! for that cycle only.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::debug;

use streamfleet_types::RegistryError;

/// Response status and body from [`request`].
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issue a single HTTP/1.1 request to `address` (host:port).
///
/// `path` must start with `/`. A connection error or timeout maps to
/// [`RegistryError::Backend`].
pub async fn request(
    method: &str,
    address: &str,
    path: &str,
    body: Option<Bytes>,
    timeout: Duration,
) -> Result<HttpResponse, RegistryError> {
    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| RegistryError::Backend(format!("connect {address}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RegistryError::Backend(format!("handshake {address}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "streamfleet-registry/0.1")
            .body(http_body_util::Full::new(body.unwrap_or_default()))
            .map_err(|e| RegistryError::Backend(format!("build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RegistryError::Backend(format!("request {address}{path}: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RegistryError::Backend(format!("read body: {e}")))?
            .to_bytes();

        Ok(HttpResponse { status, body })
    })
    .await;

    match result {
        Ok(r) => r,
        Err(_) => {
            debug!(%address, %path, "backend request timed out");
            Err(RegistryError::Backend(format!(
                "timeout after {}s: {address}{path}",
                timeout.as_secs()
            )))
        }
    }
}
