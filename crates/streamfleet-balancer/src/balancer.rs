//! The load balancer — node set, strategies, and the routing hot path.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use streamfleet_types::{
    BalancerConfig, ClientId, ClientPriority, ConfigError, NodeId, RouteRejection,
    ServiceInstance, epoch_secs,
};

use crate::limiter::{self, ClientInfo};
use crate::node::Node;
use crate::ring::HashRing;

/// Clients idle this long are reclaimed by the revalidation loop.
const CLIENT_IDLE_REAP_SECS: u64 = 3600;

/// Node-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    ConsistentHash,
    ResourceBased,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            "consistent_hash" => Ok(Strategy::ConsistentHash),
            "resource_based" => Ok(Strategy::ResourceBased),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Per-node stats exposed through [`LoadBalancer::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub address: String,
    pub healthy: bool,
    pub weight: u32,
    pub current_connections: u32,
    pub max_connections: u32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Aggregate balancer stats.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub strategy: Strategy,
    pub nodes: Vec<NodeStats>,
    pub total_clients: usize,
    pub total_requests: u64,
    pub rate_limited_total: u64,
    pub rejected_total: u64,
}

struct Inner {
    nodes: HashMap<NodeId, Node>,
    clients: HashMap<ClientId, ClientInfo>,
    ring: HashRing,
    rr_cursor: usize,
    wrr_cursor: usize,
    total_requests: u64,
    rate_limited_total: u64,
    rejected_total: u64,
}

/// Routes clients to healthy nodes; cheap to clone, all clones share
/// state. The hot path (`get_node_for_client`, `release_client`) touches
/// only in-memory maps under one coarse lock.
#[derive(Clone)]
pub struct LoadBalancer {
    cfg: Arc<BalancerConfig>,
    strategy: Strategy,
    inner: Arc<Mutex<Inner>>,
}

impl LoadBalancer {
    pub fn new(cfg: BalancerConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let strategy = Strategy::from_str(&cfg.strategy)?;
        let ring = HashRing::new(cfg.virtual_nodes);
        Ok(Self {
            cfg: Arc::new(cfg),
            strategy,
            inner: Arc::new(Mutex::new(Inner {
                nodes: HashMap::new(),
                clients: HashMap::new(),
                ring,
                rr_cursor: 0,
                wrr_cursor: 0,
                total_requests: 0,
                rate_limited_total: 0,
                rejected_total: 0,
            })),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Add or replace a node and rebuild the hash ring.
    pub fn add_node(&self, mut node: Node) {
        let now = epoch_secs();
        node.refresh_health(now, &self.cfg);
        let mut inner = self.lock();
        info!(node_id = %node.node_id, address = %node.address(), "node added");
        inner.nodes.insert(node.node_id.clone(), node);
        Self::rebuild_ring(&mut inner);
    }

    /// Remove a node, clearing any client assignments pointing at it.
    pub fn remove_node(&self, node_id: &str) {
        let mut inner = self.lock();
        if inner.nodes.remove(node_id).is_none() {
            return;
        }
        info!(%node_id, "node removed");
        for client in inner.clients.values_mut() {
            if client.assigned_node.as_deref() == Some(node_id) {
                client.assigned_node = None;
                client.connection_count = 0;
            }
        }
        Self::rebuild_ring(&mut inner);
    }

    /// Refresh a node's resource telemetry and heartbeat; health is
    /// recomputed immediately.
    pub fn update_node_telemetry(&self, node_id: &str, cpu_usage: f64, memory_usage: f64) {
        let now = epoch_secs();
        let cfg = self.cfg.clone();
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.cpu_usage = cpu_usage;
            node.memory_usage = memory_usage;
            node.last_heartbeat = now;
            let was = node.is_healthy;
            let is = node.refresh_health(now, &cfg);
            if was != is {
                info!(%node_id, healthy = is, "node health changed on telemetry");
                Self::rebuild_ring(&mut inner);
            }
        }
    }

    /// Membership bridge: reconcile the node set against a discovered
    /// instance list. Serving instances are upserted (weight and
    /// max_connections read from instance metadata), everything else is
    /// dropped. Intended as the registry's service listener.
    pub fn sync_instances(&self, instances: &[ServiceInstance]) {
        let now = epoch_secs();
        let cfg = self.cfg.clone();
        let mut inner = self.lock();
        let mut changed = false;

        for inst in instances.iter().filter(|i| i.status.is_serving()) {
            match inner.nodes.get_mut(&inst.id) {
                Some(node) => {
                    node.last_heartbeat = now;
                    node.refresh_health(now, &cfg);
                }
                None => {
                    let mut node = Node::new(inst.id.clone(), inst.host.clone(), inst.port, now);
                    if let Some(w) = inst.metadata.get("weight").and_then(|v| v.parse().ok()) {
                        node = node.with_weight(w);
                    }
                    if let Some(m) = inst
                        .metadata
                        .get("max_connections")
                        .and_then(|v| v.parse().ok())
                    {
                        node = node.with_max_connections(m);
                    }
                    node.refresh_health(now, &cfg);
                    debug!(node_id = %node.node_id, "node joined from discovery");
                    inner.nodes.insert(inst.id.clone(), node);
                    changed = true;
                }
            }
        }

        let keep: Vec<NodeId> = instances
            .iter()
            .filter(|i| i.status.is_serving())
            .map(|i| i.id.clone())
            .collect();
        let stale: Vec<NodeId> = inner
            .nodes
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for id in &stale {
            inner.nodes.remove(id);
            for client in inner.clients.values_mut() {
                if client.assigned_node.as_deref() == Some(id.as_str()) {
                    client.assigned_node = None;
                    client.connection_count = 0;
                }
            }
            debug!(node_id = %id, "node left via discovery");
            changed = true;
        }

        if changed {
            Self::rebuild_ring(&mut inner);
            info!(nodes = inner.nodes.len(), "membership synced");
        }
    }

    /// Route one client request to a node.
    ///
    /// Never blocks on I/O; rejections are explicit values counted in the
    /// stats, not errors or panics.
    pub fn get_node_for_client(&self, client_id: &str) -> Result<Node, RouteRejection> {
        let now = epoch_secs();
        let rpm = self.cfg.requests_per_minute;
        let mut inner = self.lock();
        inner.total_requests += 1;

        let allowed = {
            let client = inner
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientInfo::new(client_id, rpm, now));
            client.last_activity = now;
            client.try_acquire(now, rpm)
        };
        if !allowed {
            inner.rate_limited_total += 1;
            debug!(%client_id, "rate limit exhausted");
            return Err(RouteRejection::RateLimited);
        }

        // Sticky: reuse an existing assignment while the node stays usable.
        let assigned = inner
            .clients
            .get(client_id)
            .and_then(|c| c.assigned_node.clone());
        if let Some(node_id) = assigned {
            let usable = inner
                .nodes
                .get(&node_id)
                .is_some_and(|n| n.is_healthy && !n.at_capacity());
            if usable {
                return Ok(Self::assign(&mut inner, client_id, &node_id));
            }
        }

        let healthy = Self::healthy_ids(&inner);
        if healthy.is_empty() {
            inner.rejected_total += 1;
            debug!(%client_id, "no healthy node");
            return Err(RouteRejection::NoHealthyNode);
        }

        let mut pick = self.pick(&mut inner, &healthy, client_id);

        // A stale health flag can hand us a node already at capacity;
        // retry once by least-connections among the remainder.
        let at_capacity = inner
            .nodes
            .get(&pick)
            .is_none_or(|n| n.at_capacity());
        if at_capacity {
            let remainder: Vec<NodeId> =
                healthy.iter().filter(|id| **id != pick).cloned().collect();
            match Self::least_connections(&inner, &remainder) {
                Some(fallback) => pick = fallback,
                None => {
                    inner.rejected_total += 1;
                    debug!(%client_id, "all healthy nodes at capacity");
                    return Err(RouteRejection::NoHealthyNode);
                }
            }
        }

        Ok(Self::assign(&mut inner, client_id, &pick))
    }

    /// Release one connection held by `client_id`.
    ///
    /// The assignment is cleared once the client's connection count hits
    /// zero, so the next request re-routes — this is what lets the fleet
    /// rebalance after membership or load changes.
    pub fn release_client(&self, client_id: &str) {
        let now = epoch_secs();
        let cfg = self.cfg.clone();
        let mut inner = self.lock();

        let Some(client) = inner.clients.get_mut(client_id) else {
            return;
        };
        client.last_activity = now;
        client.connection_count = client.connection_count.saturating_sub(1);
        let node_id = client.assigned_node.clone();
        if client.connection_count == 0 {
            client.assigned_node = None;
        }

        if let Some(node_id) = node_id
            && let Some(node) = inner.nodes.get_mut(&node_id)
        {
            node.current_connections = node.current_connections.saturating_sub(1);
            node.refresh_health(now, &cfg);
        }
    }

    /// Change a client's priority tier. The bucket is reset to the new
    /// tier's capacity; safe under concurrent routing calls.
    pub fn set_client_priority(&self, client_id: &str, priority: ClientPriority) {
        let now = epoch_secs();
        let rpm = self.cfg.requests_per_minute;
        let mut inner = self.lock();
        let client = inner
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientInfo::new(client_id, rpm, now));
        client.priority = priority;
        client.tokens = limiter::capacity(rpm, priority);
        client.window_started = now;
    }

    pub fn get_stats(&self) -> BalancerStats {
        let inner = self.lock();
        let mut nodes: Vec<NodeStats> = inner
            .nodes
            .values()
            .map(|n| NodeStats {
                node_id: n.node_id.clone(),
                address: n.address(),
                healthy: n.is_healthy,
                weight: n.weight,
                current_connections: n.current_connections,
                max_connections: n.max_connections,
                cpu_usage: n.cpu_usage,
                memory_usage: n.memory_usage,
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        BalancerStats {
            strategy: self.strategy,
            nodes,
            total_clients: inner.clients.len(),
            total_requests: inner.total_requests,
            rate_limited_total: inner.rate_limited_total,
            rejected_total: inner.rejected_total,
        }
    }

    /// Revalidation loop: every `revalidate_interval`, recompute node
    /// health from heartbeat age and telemetry, rebuild the ring when the
    /// healthy set changed, and reap long-idle clients.
    pub async fn run_revalidate(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.revalidate_interval_secs);
        info!(interval_secs = interval.as_secs(), "revalidation loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.revalidate_cycle();
                }
                _ = shutdown.changed() => {
                    info!("revalidation loop shutting down");
                    break;
                }
            }
        }
    }

    /// One revalidation pass; public so tests can drive it directly.
    pub fn revalidate_cycle(&self) {
        let now = epoch_secs();
        let cfg = self.cfg.clone();
        let mut inner = self.lock();

        let mut healthy_changed = false;
        for node in inner.nodes.values_mut() {
            let was = node.is_healthy;
            let is = node.refresh_health(now, &cfg);
            if was != is {
                healthy_changed = true;
                if is {
                    info!(node_id = %node.node_id, "node revalidated healthy");
                } else {
                    warn!(node_id = %node.node_id, "node revalidated unhealthy");
                }
            }
        }
        if healthy_changed {
            Self::rebuild_ring(&mut inner);
        }

        let before = inner.clients.len();
        inner.clients.retain(|_, c| {
            c.connection_count > 0 || now.saturating_sub(c.last_activity) < CLIENT_IDLE_REAP_SECS
        });
        let reaped = before - inner.clients.len();
        if reaped > 0 {
            debug!(reaped, "idle clients reclaimed");
        }
    }

    // ── Selection internals ────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("balancer lock poisoned")
    }

    /// Healthy node ids, sorted for deterministic cursor behavior.
    fn healthy_ids(inner: &Inner) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = inner
            .nodes
            .values()
            .filter(|n| n.is_healthy)
            .map(|n| n.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn pick(&self, inner: &mut Inner, healthy: &[NodeId], client_id: &str) -> NodeId {
        match self.strategy {
            Strategy::RoundRobin => {
                let idx = inner.rr_cursor % healthy.len();
                inner.rr_cursor = inner.rr_cursor.wrapping_add(1);
                healthy[idx].clone()
            }
            Strategy::LeastConnections => {
                Self::least_connections(inner, healthy).expect("healthy set is non-empty")
            }
            Strategy::WeightedRoundRobin => {
                // Virtual rotation with each node repeated `weight` times.
                let rotation: Vec<&NodeId> = healthy
                    .iter()
                    .flat_map(|id| {
                        let weight = inner.nodes.get(id).map(|n| n.weight).unwrap_or(1);
                        std::iter::repeat_n(id, weight.max(1) as usize)
                    })
                    .collect();
                let idx = inner.wrr_cursor % rotation.len();
                inner.wrr_cursor = inner.wrr_cursor.wrapping_add(1);
                rotation[idx].clone()
            }
            Strategy::ConsistentHash => {
                match inner.ring.get(client_id) {
                    // The ring is rebuilt on health changes, but a flip
                    // between rebuilds can leave a stale owner.
                    Some(id) if healthy.contains(id) => id.clone(),
                    _ => Self::least_connections(inner, healthy)
                        .expect("healthy set is non-empty"),
                }
            }
            Strategy::ResourceBased => healthy
                .iter()
                .min_by(|a, b| {
                    let sa = inner.nodes[a.as_str()].resource_score();
                    let sb = inner.nodes[b.as_str()].resource_score();
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("healthy set is non-empty")
                .clone(),
        }
    }

    fn least_connections(inner: &Inner, candidates: &[NodeId]) -> Option<NodeId> {
        candidates
            .iter()
            .filter(|id| inner.nodes.get(id.as_str()).is_some_and(|n| !n.at_capacity()))
            .min_by_key(|id| {
                (
                    inner.nodes[id.as_str()].current_connections,
                    (*id).clone(),
                )
            })
            .cloned()
    }

    fn assign(inner: &mut Inner, client_id: &str, node_id: &NodeId) -> Node {
        if let Some(client) = inner.clients.get_mut(client_id) {
            client.assigned_node = Some(node_id.clone());
            client.connection_count += 1;
        }
        let node = inner
            .nodes
            .get_mut(node_id)
            .expect("assignment target exists");
        node.current_connections += 1;
        if node.at_capacity() {
            node.is_healthy = false;
        }
        node.clone()
    }

    fn rebuild_ring(inner: &mut Inner) {
        let healthy = Self::healthy_ids(inner);
        inner.ring.rebuild(&healthy);
        debug!(
            nodes = healthy.len(),
            positions = inner.ring.len(),
            "hash ring rebuilt"
        );
    }
}
