//! etcd-style discovery backend over the v3 JSON gateway.
//!
//! Instances are stored as JSON documents under
//! `/streamfleet/services/{service}/{id}`; the gateway requires base64 for
//! both keys and values. Renewal re-puts the document with a fresh
//! heartbeat timestamp, and reads filter lapsed TTLs client-side.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use streamfleet_types::{RegistryError, ServiceInstance, epoch_secs};

use crate::http;

/// etcd backend addressed as `host:port` (the gRPC-gateway listener).
pub struct EtcdBackend {
    address: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    value: String,
}

fn instance_key(service_name: &str, id: &str) -> String {
    format!("/streamfleet/services/{service_name}/{id}")
}

fn service_prefix(service_name: &str) -> String {
    format!("/streamfleet/services/{service_name}/")
}

/// End-of-range key for a prefix scan (prefix with its last byte + 1).
fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    end
}

impl EtcdBackend {
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

    async fn kv_call(&self, path: &str, body: serde_json::Value) -> Result<Bytes, RegistryError> {
        let resp = http::request(
            "POST",
            &self.address,
            path,
            Some(Bytes::from(body.to_string())),
            self.timeout,
        )
        .await?;

        if !resp.is_success() {
            return Err(RegistryError::Backend(format!(
                "etcd {path} returned {}",
                resp.status
            )));
        }
        Ok(resp.body)
    }

    pub async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let key = instance_key(&instance.service_name, &instance.id);
        let value = serde_json::to_vec(instance)
            .map_err(|e| RegistryError::Registration(format!("encode instance: {e}")))?;

        self.kv_call(
            "/v3/kv/put",
            json!({
                "key": B64.encode(key),
                "value": B64.encode(value),
            }),
        )
        .await?;
        debug!(id = %instance.id, "registered with etcd");
        Ok(())
    }

    pub async fn deregister(&self, service_name: &str, id: &str) -> Result<bool, RegistryError> {
        let key = instance_key(service_name, id);
        let body = self
            .kv_call("/v3/kv/deleterange", json!({ "key": B64.encode(key) }))
            .await?;

        #[derive(Deserialize)]
        struct DeleteResponse {
            #[serde(default)]
            deleted: String,
        }
        let resp: DeleteResponse = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Backend(format!("decode delete response: {e}")))?;
        Ok(resp.deleted.parse::<u64>().unwrap_or(0) > 0)
    }

    pub async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let prefix = service_prefix(service_name);
        let body = self
            .kv_call(
                "/v3/kv/range",
                json!({
                    "key": B64.encode(&prefix),
                    "range_end": B64.encode(prefix_end(&prefix)),
                }),
            )
            .await?;

        let range: RangeResponse = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Backend(format!("decode range response: {e}")))?;

        let now = epoch_secs();
        let mut out = Vec::new();
        for kv in range.kvs {
            let raw = B64
                .decode(&kv.value)
                .map_err(|e| RegistryError::Backend(format!("decode value: {e}")))?;
            let inst: ServiceInstance = serde_json::from_slice(&raw)
                .map_err(|e| RegistryError::Backend(format!("decode instance: {e}")))?;
            if inst.status.is_serving() && !inst.is_expired(now) {
                out.push(inst);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub async fn renew(&self, service_name: &str, id: &str) -> Result<(), RegistryError> {
        let key = instance_key(service_name, id);
        let body = self
            .kv_call("/v3/kv/range", json!({ "key": B64.encode(&key) }))
            .await?;

        let range: RangeResponse = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Backend(format!("decode range response: {e}")))?;
        let kv = range
            .kvs
            .first()
            .ok_or_else(|| RegistryError::Backend(format!("unknown instance: {id}")))?;

        let raw = B64
            .decode(&kv.value)
            .map_err(|e| RegistryError::Backend(format!("decode value: {e}")))?;
        let mut inst: ServiceInstance = serde_json::from_slice(&raw)
            .map_err(|e| RegistryError::Backend(format!("decode instance: {e}")))?;
        inst.last_heartbeat = epoch_secs();
        self.register(&inst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_service() {
        assert_eq!(
            instance_key("stream", "svc-1"),
            "/streamfleet/services/stream/svc-1"
        );
        assert_eq!(service_prefix("stream"), "/streamfleet/services/stream/");
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        let end = prefix_end("/streamfleet/services/stream/");
        assert_eq!(*end.last().unwrap(), b'/' + 1);
        assert_eq!(&end[..end.len() - 1], "/streamfleet/services/stream".as_bytes());
    }

    #[test]
    fn range_response_parses_empty_and_full() {
        let empty: RangeResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.kvs.is_empty());

        let full: RangeResponse =
            serde_json::from_str(r#"{"kvs": [{"value": "aGVsbG8="}]}"#).unwrap();
        assert_eq!(full.kvs.len(), 1);
        assert_eq!(B64.decode(&full.kvs[0].value).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_backend_error() {
        let b = EtcdBackend::new("127.0.0.1:1").with_timeout(Duration::from_secs(1));
        assert!(matches!(
            b.discover("stream").await,
            Err(RegistryError::Backend(_))
        ));
    }
}
