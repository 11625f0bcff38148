//! Instance health probing.
//!
//! A probe is a plain HTTP GET with a short timeout: 2xx means healthy,
//! anything else (non-2xx, connection error, timeout) means not. There is
//! no inline retry — the next health-check sweep retries naturally.

use std::time::Duration;

use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    /// Whether this result should mark the instance healthy.
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Perform an HTTP health probe against `address` (host:port) at `path`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "streamfleet-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return ProbeResult::Failed,
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Split a health-check URL into (address, path).
///
/// Accepts a bare path probed against `default_address`, or a full
/// `http://host:port/path` URL.
pub fn probe_target(health_check_url: &str, default_address: &str) -> (String, String) {
    if let Some(rest) = health_check_url.strip_prefix("http://") {
        match rest.split_once('/') {
            Some((addr, path)) => (addr.to_string(), format!("/{path}")),
            None => (rest.to_string(), "/".to_string()),
        }
    } else if health_check_url.starts_with('/') {
        (default_address.to_string(), health_check_url.to_string())
    } else {
        (default_address.to_string(), format!("/{health_check_url}"))
    }
}
