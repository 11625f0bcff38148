//! Consul-style HTTP discovery backend.
//!
//! Speaks the agent API: service registration documents with a TTL check,
//! a passing-only health query for discovery, and `check/pass` for lease
//! renewal. Only the handful of fields the registry needs are modeled.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use streamfleet_types::{InstanceStatus, RegistryError, ServiceInstance, epoch_secs};

use crate::http;

/// Consul agent backend addressed as `host:port`.
pub struct ConsulBackend {
    address: String,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterDoc<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
    check: CheckDoc,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckDoc {
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: HealthService,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    address: String,
    port: u16,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    meta: HashMap<String, String>,
}

impl ConsulBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        // TTL check when the instance has no probe URL; the heartbeat loop
        // keeps it passing. Otherwise let the agent probe the URL itself.
        let check = match &instance.health_check_url {
            Some(url) if url.starts_with("http") => CheckDoc {
                ttl: None,
                http: Some(url.clone()),
                interval: Some("10s".to_string()),
            },
            _ => CheckDoc {
                ttl: Some(format!("{}s", instance.ttl_secs)),
                http: None,
                interval: None,
            },
        };

        let doc = RegisterDoc {
            id: &instance.id,
            name: &instance.service_name,
            address: &instance.host,
            port: instance.port,
            tags: &instance.tags,
            meta: &instance.metadata,
            check,
        };
        let body = serde_json::to_vec(&doc)
            .map_err(|e| RegistryError::Registration(format!("encode register doc: {e}")))?;

        let resp = http::request(
            "PUT",
            &self.address,
            "/v1/agent/service/register",
            Some(Bytes::from(body)),
            self.timeout,
        )
        .await?;

        if !resp.is_success() {
            return Err(RegistryError::Registration(format!(
                "consul register returned {}",
                resp.status
            )));
        }
        debug!(id = %instance.id, "registered with consul");
        Ok(())
    }

    pub async fn deregister(&self, id: &str) -> Result<bool, RegistryError> {
        let resp = http::request(
            "PUT",
            &self.address,
            &format!("/v1/agent/service/deregister/{id}"),
            None,
            self.timeout,
        )
        .await?;

        match resp.status {
            404 => Ok(false),
            s if (200..300).contains(&s) => Ok(true),
            s => Err(RegistryError::Backend(format!(
                "consul deregister returned {s}"
            ))),
        }
    }

    pub async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let resp = http::request(
            "GET",
            &self.address,
            &format!("/v1/health/service/{service_name}?passing=true"),
            None,
            self.timeout,
        )
        .await?;

        if !resp.is_success() {
            return Err(RegistryError::Backend(format!(
                "consul health query returned {}",
                resp.status
            )));
        }

        let entries: Vec<HealthEntry> = serde_json::from_slice(&resp.body)
            .map_err(|e| RegistryError::Backend(format!("decode health response: {e}")))?;

        let now = epoch_secs();
        let mut out: Vec<ServiceInstance> = entries
            .into_iter()
            .map(|e| ServiceInstance {
                id: e.service.id,
                service_name: e.service.service,
                host: e.service.address,
                port: e.service.port,
                tags: e.service.tags,
                health_check_url: e.service.meta.get("health_check_url").cloned(),
                metadata: e.service.meta,
                // Passing-only query: everything returned is healthy.
                status: InstanceStatus::Healthy,
                registered_at: now,
                last_heartbeat: now,
                ttl_secs: 0,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub async fn renew(&self, id: &str) -> Result<(), RegistryError> {
        let resp = http::request(
            "PUT",
            &self.address,
            &format!("/v1/agent/check/pass/service:{id}"),
            None,
            self.timeout,
        )
        .await?;

        if !resp.is_success() {
            return Err(RegistryError::Backend(format!(
                "consul check pass returned {}",
                resp.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_doc_serializes_ttl_check() {
        let doc = RegisterDoc {
            id: "svc-1",
            name: "stream",
            address: "10.0.0.1",
            port: 9000,
            tags: &["edge".to_string()],
            meta: &HashMap::new(),
            check: CheckDoc {
                ttl: Some("30s".to_string()),
                http: None,
                interval: None,
            },
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"ID\":\"svc-1\""));
        assert!(json.contains("\"TTL\":\"30s\""));
        assert!(!json.contains("HTTP"));
    }

    #[test]
    fn health_response_parses() {
        let body = r#"[
            {"Service": {"ID": "svc-1", "Service": "stream",
                         "Address": "10.0.0.1", "Port": 9000,
                         "Tags": ["edge"], "Meta": {"zone": "a"}}},
            {"Service": {"ID": "svc-2", "Service": "stream",
                         "Address": "10.0.0.2", "Port": 9000}}
        ]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].service.id, "svc-1");
        assert_eq!(entries[0].service.meta.get("zone").unwrap(), "a");
        assert!(entries[1].service.tags.is_empty());
    }

    #[tokio::test]
    async fn unreachable_agent_is_backend_error() {
        let b = ConsulBackend::new("127.0.0.1:1").with_timeout(Duration::from_secs(1));
        assert!(matches!(
            b.discover("stream").await,
            Err(RegistryError::Backend(_))
        ));
    }
}
