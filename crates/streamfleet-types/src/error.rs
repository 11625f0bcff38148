//! Error types for the StreamFleet control plane.

use thiserror::Error;

/// Errors raised by the service registry.
///
/// Backend unavailability on the read path is absorbed by the registry's
/// snapshot cache and never surfaces through routing.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("discovery backend error: {0}")]
    Backend(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::types::InstanceStatus,
        to: crate::types::InstanceStatus,
    },
}

/// Explicit routing rejection returned by the load balancer.
///
/// These are fast, countable values — never panics, never I/O errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteRejection {
    #[error("no healthy node available")]
    NoHealthyNode,

    #[error("client rate limit exhausted")]
    RateLimited,
}

/// Invalid configuration detected at construction — a programmer error,
/// raised immediately rather than tolerated at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("scaling rule has an empty name")]
    EmptyRuleName,

    #[error("rule {rule}: scale_up_threshold {up} must exceed scale_down_threshold {down}")]
    ThresholdOrder { rule: String, up: f64, down: f64 },

    #[error("rule {rule}: adjustments must be nonzero")]
    ZeroAdjustment { rule: String },

    #[error("min_instances {min} exceeds max_instances {max}")]
    InstanceBounds { min: u32, max: u32 },

    #[error("{field} must be nonzero")]
    ZeroInterval { field: &'static str },

    #[error("unknown routing strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown discovery backend: {0}")]
    UnknownBackend(String),
}
