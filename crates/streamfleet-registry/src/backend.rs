//! Discovery backend dispatch and the in-memory backend.
//!
//! Backends are a closed set modeled as an enum rather than a trait
//! object: the registry matches on the variant, and each variant owns its
//! transport details. All operations carry explicit timeouts inside the
//! HTTP variants.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use streamfleet_types::{InstanceStatus, RegistryError, ServiceInstance, epoch_secs};

use crate::consul::ConsulBackend;
use crate::etcd::EtcdBackend;

/// A pluggable discovery backend.
pub enum DiscoveryBackend {
    /// In-process map; the default for tests and single-node setups.
    Memory(MemoryBackend),
    /// Consul-style HTTP agent API.
    Consul(ConsulBackend),
    /// etcd-style v3 JSON gateway.
    Etcd(EtcdBackend),
}

impl DiscoveryBackend {
    /// Write a service document keyed by instance id.
    pub async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        match self {
            DiscoveryBackend::Memory(b) => b.register(instance).await,
            DiscoveryBackend::Consul(b) => b.register(instance).await,
            DiscoveryBackend::Etcd(b) => b.register(instance).await,
        }
    }

    /// Remove a service document. Returns whether it existed; deregistering
    /// an unknown id is not an error.
    pub async fn deregister(&self, service_name: &str, id: &str) -> Result<bool, RegistryError> {
        match self {
            DiscoveryBackend::Memory(b) => b.deregister(id).await,
            DiscoveryBackend::Consul(b) => b.deregister(id).await,
            DiscoveryBackend::Etcd(b) => b.deregister(service_name, id).await,
        }
    }

    /// Fetch the health-filtered instance list for `service_name`.
    pub async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        match self {
            DiscoveryBackend::Memory(b) => b.discover(service_name).await,
            DiscoveryBackend::Consul(b) => b.discover(service_name).await,
            DiscoveryBackend::Etcd(b) => b.discover(service_name).await,
        }
    }

    /// Renew the TTL/lease for a registered instance.
    pub async fn renew(&self, service_name: &str, id: &str) -> Result<(), RegistryError> {
        match self {
            DiscoveryBackend::Memory(b) => b.renew(id).await,
            DiscoveryBackend::Consul(b) => b.renew(id).await,
            DiscoveryBackend::Etcd(b) => b.renew(service_name, id).await,
        }
    }
}

/// In-memory discovery backend.
///
/// Holds registrations in a shared map and honors instance TTLs on reads.
/// `set_unavailable(true)` makes every operation fail, which is how tests
/// exercise the registry's cached-snapshot degradation.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    registrations: Arc<RwLock<HashMap<String, ServiceInstance>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage; all operations return errors while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(RegistryError::Backend(
                "memory backend unavailable".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut map = self.registrations.write().await;
        map.insert(instance.id.clone(), instance.clone());
        debug!(id = %instance.id, service = %instance.service_name, "registered in memory backend");
        Ok(())
    }

    pub async fn deregister(&self, id: &str) -> Result<bool, RegistryError> {
        self.check_available()?;
        let mut map = self.registrations.write().await;
        Ok(map.remove(id).is_some())
    }

    pub async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.check_available()?;
        let now = epoch_secs();
        let map = self.registrations.read().await;
        let mut out: Vec<ServiceInstance> = map
            .values()
            .filter(|i| {
                i.service_name == service_name && i.status.is_serving() && !i.is_expired(now)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub async fn renew(&self, id: &str) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut map = self.registrations.write().await;
        match map.get_mut(id) {
            Some(inst) => {
                inst.last_heartbeat = epoch_secs();
                Ok(())
            }
            None => Err(RegistryError::Backend(format!("unknown instance: {id}"))),
        }
    }

    /// Directly set an instance's status, bypassing transition checks.
    /// Test helper standing in for an external health system.
    pub async fn set_status(&self, id: &str, status: InstanceStatus) {
        let mut map = self.registrations.write().await;
        if let Some(inst) = map.get_mut(id) {
            inst.status = status;
        }
    }

    /// Number of live registrations, ignoring TTLs.
    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instance(id: &str, service: &str, port: u16) -> ServiceInstance {
        let now = epoch_secs();
        ServiceInstance {
            id: id.to_string(),
            service_name: service.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            tags: vec![],
            metadata: HashMap::new(),
            health_check_url: None,
            status: InstanceStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
            ttl_secs: 30,
        }
    }

    #[tokio::test]
    async fn register_and_discover() {
        let b = MemoryBackend::new();
        b.register(&instance("a", "stream", 9000)).await.unwrap();
        b.register(&instance("b", "stream", 9001)).await.unwrap();
        b.register(&instance("c", "other", 9002)).await.unwrap();

        let found = b.discover("stream").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|i| i.service_name == "stream"));
    }

    #[tokio::test]
    async fn discover_filters_non_serving() {
        let b = MemoryBackend::new();
        b.register(&instance("a", "stream", 9000)).await.unwrap();
        b.register(&instance("b", "stream", 9001)).await.unwrap();
        b.set_status("b", InstanceStatus::Unhealthy).await;

        let found = b.discover("stream").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn discover_drops_expired_leases() {
        let b = MemoryBackend::new();
        let mut stale = instance("a", "stream", 9000);
        stale.last_heartbeat = 1000; // long past TTL
        b.register(&stale).await.unwrap();

        assert!(b.discover("stream").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renew_refreshes_lease() {
        let b = MemoryBackend::new();
        let mut stale = instance("a", "stream", 9000);
        stale.last_heartbeat = 1000;
        b.register(&stale).await.unwrap();

        b.renew("a").await.unwrap();
        assert_eq!(b.discover("stream").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let b = MemoryBackend::new();
        b.register(&instance("a", "stream", 9000)).await.unwrap();

        assert!(b.deregister("a").await.unwrap());
        assert!(!b.deregister("a").await.unwrap());
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let b = MemoryBackend::new();
        b.register(&instance("a", "stream", 9000)).await.unwrap();

        b.set_unavailable(true);
        assert!(b.discover("stream").await.is_err());
        assert!(b.register(&instance("b", "stream", 9001)).await.is_err());
        assert!(b.renew("a").await.is_err());

        b.set_unavailable(false);
        assert_eq!(b.discover("stream").await.unwrap().len(), 1);
    }
}
