//! The balancer's live view of one backend node.

use serde::Serialize;

use streamfleet_types::{BalancerConfig, NodeId};

/// One backend server as the balancer sees it: connection load, resource
/// telemetry, and a derived health flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    /// Relative share in the weighted-round-robin rotation.
    pub weight: u32,
    pub max_connections: u32,
    pub current_connections: u32,
    /// CPU usage percentage, 0..100.
    pub cpu_usage: f64,
    /// Memory usage percentage, 0..100.
    pub memory_usage: f64,
    /// Unix timestamp (seconds) of the last telemetry update.
    pub last_heartbeat: u64,
    /// Derived: recomputed on every telemetry update and by the
    /// revalidation loop.
    pub is_healthy: bool,
}

impl Node {
    pub fn new(node_id: impl Into<NodeId>, host: impl Into<String>, port: u16, now: u64) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            last_heartbeat: now,
            is_healthy: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn at_capacity(&self) -> bool {
        self.current_connections >= self.max_connections
    }

    /// Health rule: fresh heartbeat, cpu and memory under thresholds, and
    /// room for at least one more connection.
    pub fn compute_health(&self, now: u64, cfg: &BalancerConfig) -> bool {
        now.saturating_sub(self.last_heartbeat) < cfg.max_heartbeat_age_secs
            && self.cpu_usage < cfg.cpu_threshold
            && self.memory_usage < cfg.memory_threshold
            && !self.at_capacity()
    }

    /// Refresh the derived health flag; returns the new value.
    pub fn refresh_health(&mut self, now: u64, cfg: &BalancerConfig) -> bool {
        self.is_healthy = self.compute_health(now, cfg);
        self.is_healthy
    }

    /// Composite load score used by the resource-based strategy; lower is
    /// better. 0.4·cpu + 0.3·mem + 0.3·(connections/max·100).
    pub fn resource_score(&self) -> f64 {
        let conn_pct = if self.max_connections == 0 {
            100.0
        } else {
            self.current_connections as f64 / self.max_connections as f64 * 100.0
        };
        0.4 * self.cpu_usage + 0.3 * self.memory_usage + 0.3 * conn_pct
    }
}
