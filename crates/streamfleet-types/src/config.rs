//! Configuration structs for the StreamFleet components.
//!
//! Every field carries a serde default so a partial TOML file (or none at
//! all) yields a working configuration. `validate()` rejects impossible
//! combinations up front.

use serde::Deserialize;

use crate::error::ConfigError;

const fn default_heartbeat_interval_secs() -> u64 {
    10
}

const fn default_discovery_interval_secs() -> u64 {
    15
}

const fn default_health_check_interval_secs() -> u64 {
    10
}

const fn default_probe_timeout_secs() -> u64 {
    5
}

const fn default_instance_ttl_secs() -> u64 {
    30
}

fn default_service_name() -> String {
    "streamfleet".to_string()
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

const fn default_virtual_nodes() -> u32 {
    150
}

const fn default_requests_per_minute() -> u32 {
    60
}

const fn default_max_heartbeat_age_secs() -> u64 {
    30
}

fn default_resource_threshold() -> f64 {
    90.0
}

const fn default_revalidate_interval_secs() -> u64 {
    10
}

const fn default_min_instances() -> u32 {
    1
}

const fn default_max_instances() -> u32 {
    10
}

const fn default_evaluation_interval_secs() -> u64 {
    60
}

const fn default_sample_interval_secs() -> u64 {
    30
}

const fn default_scale_up_cooldown_secs() -> u64 {
    60
}

const fn default_scale_down_cooldown_secs() -> u64 {
    300
}

const fn default_event_log_capacity() -> usize {
    100
}

/// Service registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Logical service name instances register under.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Interval between local TTL/lease renewals.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Interval between discovery re-queries.
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Interval between health-probe sweeps.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Timeout for each outbound health probe.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Registration lease granted to instances.
    #[serde(default = "default_instance_ttl_secs")]
    pub instance_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            instance_ttl_secs: default_instance_ttl_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "heartbeat_interval_secs",
            });
        }
        if self.discovery_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "discovery_interval_secs",
            });
        }
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "health_check_interval_secs",
            });
        }
        Ok(())
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    /// Routing strategy name (parsed by the balancer).
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Hashed positions per physical node on the consistent-hash ring.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    /// Base per-client request budget, scaled by priority.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Heartbeat age beyond which a node is unhealthy.
    #[serde(default = "default_max_heartbeat_age_secs")]
    pub max_heartbeat_age_secs: u64,
    /// CPU percentage at or above which a node is unhealthy.
    #[serde(default = "default_resource_threshold")]
    pub cpu_threshold: f64,
    /// Memory percentage at or above which a node is unhealthy.
    #[serde(default = "default_resource_threshold")]
    pub memory_threshold: f64,
    /// Interval of the background health-revalidation loop.
    #[serde(default = "default_revalidate_interval_secs")]
    pub revalidate_interval_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            virtual_nodes: default_virtual_nodes(),
            requests_per_minute: default_requests_per_minute(),
            max_heartbeat_age_secs: default_max_heartbeat_age_secs(),
            cpu_threshold: default_resource_threshold(),
            memory_threshold: default_resource_threshold(),
            revalidate_interval_secs: default_revalidate_interval_secs(),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_nodes == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "virtual_nodes",
            });
        }
        if self.revalidate_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "revalidate_interval_secs",
            });
        }
        Ok(())
    }
}

/// Autoscaler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScalingConfig {
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Interval between rule evaluations; also the trailing metric window.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    /// Interval of the independent metrics sampler.
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_scale_up_cooldown_secs")]
    pub scale_up_cooldown_secs: u64,
    #[serde(default = "default_scale_down_cooldown_secs")]
    pub scale_down_cooldown_secs: u64,
    /// Number of scaling events kept in the in-memory audit log.
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            scale_up_cooldown_secs: default_scale_up_cooldown_secs(),
            scale_down_cooldown_secs: default_scale_down_cooldown_secs(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_instances > self.max_instances {
            return Err(ConfigError::InstanceBounds {
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        if self.evaluation_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "evaluation_interval_secs",
            });
        }
        if self.sample_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "sample_interval_secs",
            });
        }
        Ok(())
    }
}

/// Top-level daemon configuration, deserialized from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        self.balancer.validate()?;
        self.scaling.validate()?;
        Ok(())
    }
}
