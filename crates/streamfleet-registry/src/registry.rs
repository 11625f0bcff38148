//! The service registry — registration, discovery, and background loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use streamfleet_types::{
    InstanceStatus, RegistryConfig, RegistryError, ServiceInstance, epoch_secs,
};

use crate::backend::DiscoveryBackend;
use crate::probe::{http_probe, probe_target};

/// Listener invoked with the full current instance list on every detected
/// membership change.
pub type ServiceListener = Arc<dyn Fn(&[ServiceInstance]) + Send + Sync>;

/// Compact membership signature used to detect discovery diffs.
type Signature = Vec<(String, InstanceStatus)>;

/// Registers the local instance and discovers remote instances through a
/// pluggable backend; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct ServiceRegistry {
    backend: Arc<DiscoveryBackend>,
    cfg: RegistryConfig,
    shared: Arc<Shared>,
}

struct Shared {
    /// The instance this process registered, if any.
    local: Mutex<Option<ServiceInstance>>,
    /// Last good discovery snapshot; served when the backend is down.
    cache: RwLock<Vec<ServiceInstance>>,
    /// Probe-derived status overrides, keyed by instance id.
    probe_status: RwLock<HashMap<String, InstanceStatus>>,
    listeners: Mutex<Vec<ServiceListener>>,
    last_signature: Mutex<Option<Signature>>,
}

impl ServiceRegistry {
    pub fn new(backend: DiscoveryBackend, cfg: RegistryConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            cfg,
            shared: Arc::new(Shared {
                local: Mutex::new(None),
                cache: RwLock::new(Vec::new()),
                probe_status: RwLock::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                last_signature: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.cfg
    }

    /// Register this process as an instance of the configured service.
    ///
    /// A deterministic id is derived from service name, host, and port,
    /// so re-registration after a restart reuses the same identity.
    /// Backend rejection surfaces as `RegistryError::Registration` and is
    /// not retried internally.
    pub async fn register_service(
        &self,
        host: &str,
        port: u16,
        tags: Vec<String>,
        metadata: HashMap<String, String>,
        health_check_url: Option<String>,
    ) -> Result<ServiceInstance, RegistryError> {
        let now = epoch_secs();
        let instance = ServiceInstance {
            id: generate_instance_id(&self.cfg.service_name, host, port),
            service_name: self.cfg.service_name.clone(),
            host: host.to_string(),
            port,
            tags,
            metadata,
            health_check_url,
            status: InstanceStatus::Starting,
            registered_at: now,
            last_heartbeat: now,
            ttl_secs: self.cfg.instance_ttl_secs,
        };

        self.backend
            .register(&instance)
            .await
            .map_err(|e| RegistryError::Registration(e.to_string()))?;

        info!(
            id = %instance.id,
            address = %instance.address(),
            service = %instance.service_name,
            "service instance registered"
        );

        *self.shared.local.lock().await = Some(instance.clone());
        Ok(instance)
    }

    /// Deregister an instance. Idempotent: an unknown id is a no-op.
    pub async fn deregister_service(&self, id: &str) -> Result<(), RegistryError> {
        let existed = self
            .backend
            .deregister(&self.cfg.service_name, id)
            .await?;
        if existed {
            info!(%id, "service instance deregistered");
        } else {
            debug!(%id, "deregister: instance not found, ignoring");
        }

        let mut local = self.shared.local.lock().await;
        if local.as_ref().is_some_and(|l| l.id == id) {
            *local = None;
        }
        Ok(())
    }

    /// Discover current instances of the configured service.
    ///
    /// On backend failure this degrades to the last good cached snapshot
    /// rather than raising or returning empty — the read path never fails
    /// hard on a discovery outage.
    pub async fn discover_services(&self) -> Vec<ServiceInstance> {
        match self.backend.discover(&self.cfg.service_name).await {
            Ok(mut instances) => {
                self.apply_probe_overrides(&mut instances).await;
                *self.shared.cache.write().await = instances.clone();
                instances
            }
            Err(e) => {
                let cached = self.shared.cache.read().await.clone();
                warn!(
                    error = %e,
                    cached = cached.len(),
                    "discovery backend unavailable, serving cached snapshot"
                );
                cached
            }
        }
    }

    /// Discover, then filter to instances that can serve traffic.
    pub async fn get_healthy_instances(&self) -> Vec<ServiceInstance> {
        self.discover_services()
            .await
            .into_iter()
            .filter(|i| i.status.is_serving())
            .collect()
    }

    /// Number of instances currently able to serve traffic.
    pub async fn healthy_count(&self) -> usize {
        self.get_healthy_instances().await.len()
    }

    /// The last good discovery snapshot, without touching the backend.
    pub async fn cached_snapshot(&self) -> Vec<ServiceInstance> {
        self.shared.cache.read().await.clone()
    }

    /// The locally registered instance, if any.
    pub async fn local_instance(&self) -> Option<ServiceInstance> {
        self.shared.local.lock().await.clone()
    }

    /// Subscribe to membership changes.
    ///
    /// Listeners run synchronously inside the discovery loop with the full
    /// current instance list; a slow listener stalls the next discovery
    /// cycle. Keep callbacks fast and non-blocking.
    pub async fn add_service_listener(&self, listener: ServiceListener) {
        self.shared.listeners.lock().await.push(listener);
    }

    async fn apply_probe_overrides(&self, instances: &mut [ServiceInstance]) {
        let overrides = self.shared.probe_status.read().await;
        for inst in instances.iter_mut() {
            if let Some(status) = overrides.get(&inst.id) {
                inst.status = *status;
            }
        }
    }

    /// Heartbeat loop: renew the local TTL/lease every
    /// `heartbeat_interval`. A failed renewal is a soft failure for that
    /// cycle; the next tick retries.
    pub async fn run_heartbeat(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.heartbeat_interval_secs);
        info!(interval_secs = interval.as_secs(), "heartbeat loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let local = self.shared.local.lock().await.clone();
                    if let Some(inst) = local
                        && let Err(e) = self
                            .backend
                            .renew(&inst.service_name, &inst.id)
                            .await
                    {
                        warn!(id = %inst.id, error = %e, "heartbeat renewal failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    /// Discovery loop: re-query the backend every `discovery_interval`,
    /// diff against the previous snapshot, and notify listeners only when
    /// the set actually changed.
    pub async fn run_discovery(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.discovery_interval_secs);
        info!(interval_secs = interval.as_secs(), "discovery loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.discovery_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("discovery loop shutting down");
                    break;
                }
            }
        }
    }

    /// One discovery pass: query, diff, notify. Public so the daemon can
    /// prime membership before the loop's first tick.
    pub async fn discovery_cycle(&self) {
        let instances = self.discover_services().await;

        let mut signature: Signature = instances
            .iter()
            .map(|i| (i.id.clone(), i.status))
            .collect();
        signature.sort();

        // Drop probe overrides for instances that disappeared.
        {
            let mut overrides = self.shared.probe_status.write().await;
            overrides.retain(|id, _| instances.iter().any(|i| &i.id == id));
        }

        let mut last = self.shared.last_signature.lock().await;
        if last.as_ref() == Some(&signature) {
            return;
        }
        // An empty first observation is not a change from "nothing known".
        let changed = last.is_some() || !signature.is_empty();
        *last = Some(signature);
        drop(last);

        if !changed {
            return;
        }

        info!(instances = instances.len(), "service membership changed");
        let listeners = self.shared.listeners.lock().await.clone();
        for listener in listeners {
            listener(&instances);
        }
    }

    /// Health-check loop: probe each known instance's health URL every
    /// `health_check_interval` with a short timeout, flipping status and
    /// logging transitions.
    pub async fn run_health_checks(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.health_check_interval_secs);
        let timeout = Duration::from_secs(self.cfg.probe_timeout_secs);
        info!(interval_secs = interval.as_secs(), "health-check loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.health_check_cycle(timeout).await;
                }
                _ = shutdown.changed() => {
                    info!("health-check loop shutting down");
                    break;
                }
            }
        }
    }

    async fn health_check_cycle(&self, timeout: Duration) {
        let snapshot = self.shared.cache.read().await.clone();

        for inst in snapshot {
            let Some(url) = &inst.health_check_url else {
                continue;
            };
            let (address, path) = probe_target(url, &inst.address());
            let result = http_probe(&address, &path, timeout).await;

            let new_status = if result.is_healthy() {
                InstanceStatus::Healthy
            } else {
                InstanceStatus::Unhealthy
            };

            let mut overrides = self.shared.probe_status.write().await;
            let old_status = overrides.get(&inst.id).copied().unwrap_or(inst.status);
            if old_status != new_status {
                if old_status.can_transition(new_status) {
                    match new_status {
                        InstanceStatus::Healthy => {
                            info!(id = %inst.id, "instance recovered to healthy")
                        }
                        _ => warn!(id = %inst.id, ?result, "instance marked unhealthy"),
                    }
                    overrides.insert(inst.id.clone(), new_status);
                } else {
                    debug!(
                        id = %inst.id,
                        from = ?old_status,
                        to = ?new_status,
                        "ignoring invalid status transition"
                    );
                }
            }
            drop(overrides);
        }

        // Reflect overrides into the cached snapshot so reads between
        // discovery cycles see probe results.
        let mut cache = self.shared.cache.write().await;
        let overrides = self.shared.probe_status.read().await;
        for inst in cache.iter_mut() {
            if let Some(status) = overrides.get(&inst.id) {
                inst.status = *status;
            }
        }
    }
}

/// Deterministic instance id: `svc-` plus the first 8 hex bytes of
/// sha256(service|host|port).
fn generate_instance_id(service_name: &str, host: &str, port: u16) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service_name.as_bytes());
    hasher.update(b"|");
    hasher.update(host.as_bytes());
    hasher.update(b"|");
    hasher.update(port.to_be_bytes());
    let digest = hasher.finalize();
    format!("svc-{}", hex::encode(&digest[..4]))
}
