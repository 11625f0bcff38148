//! Domain types shared across the StreamFleet control plane.
//!
//! These types describe registered service processes, the balancer's live
//! view of backend nodes, per-client routing state, and the autoscaler's
//! rules and audit events. All types serialize to JSON for the discovery
//! backends and the daemon's stats endpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a registered service instance.
pub type InstanceId = String;

/// Unique identifier for a balancer node.
pub type NodeId = String;

/// Unique identifier for a routed client.
pub type ClientId = String;

/// Current Unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix timestamp in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Service instances ──────────────────────────────────────────────

/// Lifecycle status of a registered service instance.
///
/// Ordered so that `(id, status)` pairs can serve as a sortable
/// membership signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
}

impl InstanceStatus {
    /// Whether a transition to `next` is allowed.
    ///
    /// Instances move starting→healthy→{unhealthy,stopping}→stopped;
    /// healthy↔unhealthy flips freely via the health probe.
    pub fn can_transition(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Starting, Healthy)
                | (Starting, Stopping)
                | (Healthy, Unhealthy)
                | (Healthy, Stopping)
                | (Unhealthy, Healthy)
                | (Unhealthy, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether the instance can serve routed traffic.
    pub fn is_serving(self) -> bool {
        matches!(self, InstanceStatus::Healthy | InstanceStatus::Starting)
    }
}

/// A registered backend server process, as seen by the service registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub id: InstanceId,
    /// Logical service this instance belongs to.
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// HTTP path probed by the health-check loop, if any.
    pub health_check_url: Option<String>,
    pub status: InstanceStatus,
    /// Unix timestamp (seconds) when the instance registered.
    pub registered_at: u64,
    /// Unix timestamp (seconds) of the last heartbeat renewal.
    pub last_heartbeat: u64,
    /// Registration lease; instances past this age without a heartbeat
    /// are dropped by the backend.
    pub ttl_secs: u64,
}

impl ServiceInstance {
    /// The instance's `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the TTL lease has lapsed as of `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) > self.ttl_secs
    }
}

// ── Routing clients ────────────────────────────────────────────────

/// Client priority tier; scales the per-minute rate-limit budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ClientPriority {
    /// Multiplier applied to the base requests-per-minute budget.
    pub fn multiplier(self) -> f64 {
        match self {
            ClientPriority::Critical => 2.0,
            ClientPriority::High => 1.5,
            ClientPriority::Medium => 1.0,
            ClientPriority::Low => 0.5,
        }
    }
}

// ── Scaling ────────────────────────────────────────────────────────

/// Outcome of one autoscaler evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

/// A single metric-driven scaling rule.
///
/// Each enabled rule votes independently during evaluation; thresholds
/// compare against the trailing-window average of `metric`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingRule {
    pub name: String,
    /// Metric name sampled into the collector (e.g. "cpu_usage").
    pub metric: String,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Instances added on a scale-up triggered by this rule.
    pub scale_up_adjustment: u32,
    /// Instances removed on a scale-down triggered by this rule.
    pub scale_down_adjustment: u32,
    pub cooldown_secs: u64,
    pub enabled: bool,
}

impl ScalingRule {
    /// Validate thresholds and adjustments; invalid rules are a
    /// programmer error and fail fast at construction.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.name.is_empty() {
            return Err(crate::error::ConfigError::EmptyRuleName);
        }
        if self.scale_up_threshold <= self.scale_down_threshold {
            return Err(crate::error::ConfigError::ThresholdOrder {
                rule: self.name.clone(),
                up: self.scale_up_threshold,
                down: self.scale_down_threshold,
            });
        }
        if self.scale_up_adjustment == 0 || self.scale_down_adjustment == 0 {
            return Err(crate::error::ConfigError::ZeroAdjustment {
                rule: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// One entry in the autoscaler's bounded audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    /// Unix timestamp (seconds) when the action ran.
    pub timestamp: u64,
    pub action: ScalingAction,
    /// Rule name or "manual" for operator-initiated actions.
    pub trigger: String,
    pub reason: String,
    pub old_count: u32,
    pub new_count: u32,
    pub success: bool,
    pub error: Option<String>,
}

// ── Metrics ────────────────────────────────────────────────────────

/// A single time-stamped metric observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub value: f64,
    /// Origin of the sample (node id, "aggregate", ...).
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use InstanceStatus::*;
        assert!(Starting.can_transition(Healthy));
        assert!(Healthy.can_transition(Unhealthy));
        assert!(Unhealthy.can_transition(Healthy));
        assert!(Healthy.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));

        // No resurrection, no skipping ahead.
        assert!(!Stopped.can_transition(Healthy));
        assert!(!Starting.can_transition(Stopped));
        assert!(!Stopping.can_transition(Healthy));
    }

    #[test]
    fn status_pairs_sort_as_membership_signature() {
        use InstanceStatus::*;
        let mut signature = vec![
            ("b".to_string(), Healthy),
            ("a".to_string(), Unhealthy),
            ("a".to_string(), Healthy),
        ];
        signature.sort();
        assert_eq!(
            signature,
            vec![
                ("a".to_string(), Healthy),
                ("a".to_string(), Unhealthy),
                ("b".to_string(), Healthy),
            ]
        );
    }

    #[test]
    fn serving_statuses() {
        assert!(InstanceStatus::Healthy.is_serving());
        assert!(InstanceStatus::Starting.is_serving());
        assert!(!InstanceStatus::Unhealthy.is_serving());
        assert!(!InstanceStatus::Stopped.is_serving());
    }

    #[test]
    fn priority_multipliers() {
        assert_eq!(ClientPriority::Critical.multiplier(), 2.0);
        assert_eq!(ClientPriority::High.multiplier(), 1.5);
        assert_eq!(ClientPriority::Medium.multiplier(), 1.0);
        assert_eq!(ClientPriority::Low.multiplier(), 0.5);
    }

    #[test]
    fn instance_address_and_expiry() {
        let inst = ServiceInstance {
            id: "svc-1".into(),
            service_name: "stream".into(),
            host: "10.0.0.1".into(),
            port: 9000,
            tags: vec![],
            metadata: HashMap::new(),
            health_check_url: None,
            status: InstanceStatus::Healthy,
            registered_at: 1000,
            last_heartbeat: 1000,
            ttl_secs: 30,
        };
        assert_eq!(inst.address(), "10.0.0.1:9000");
        assert!(!inst.is_expired(1030));
        assert!(inst.is_expired(1031));
    }

    #[test]
    fn rule_validation_rejects_inverted_thresholds() {
        let rule = ScalingRule {
            name: "cpu".into(),
            metric: "cpu_usage".into(),
            scale_up_threshold: 30.0,
            scale_down_threshold: 70.0,
            scale_up_adjustment: 1,
            scale_down_adjustment: 1,
            cooldown_secs: 60,
            enabled: true,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rule_validation_rejects_zero_adjustment() {
        let rule = ScalingRule {
            name: "cpu".into(),
            metric: "cpu_usage".into(),
            scale_up_threshold: 70.0,
            scale_down_threshold: 30.0,
            scale_up_adjustment: 0,
            scale_down_adjustment: 1,
            cooldown_secs: 60,
            enabled: true,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn instance_roundtrips_through_json() {
        let inst = ServiceInstance {
            id: "svc-abc".into(),
            service_name: "stream".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            tags: vec!["edge".into()],
            metadata: HashMap::from([("zone".to_string(), "a".to_string())]),
            health_check_url: Some("/healthz".into()),
            status: InstanceStatus::Starting,
            registered_at: 1,
            last_heartbeat: 2,
            ttl_secs: 30,
        };
        let json = serde_json::to_string(&inst).unwrap();
        let back: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(inst, back);
    }
}
