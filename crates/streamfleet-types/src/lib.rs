//! streamfleet-types — shared domain types for the StreamFleet control plane.
//!
//! Everything the registry, balancer, and autoscaler exchange lives here:
//! service instances, node telemetry, client routing state, scaling rules
//! and events, plus the configuration structs and typed errors. All state
//! is process-memory resident; the discovery backend is the durable source
//! of truth for membership.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BalancerConfig, FleetConfig, RegistryConfig, ScalingConfig};
pub use error::{ConfigError, RegistryError, RouteRejection};
pub use types::*;
