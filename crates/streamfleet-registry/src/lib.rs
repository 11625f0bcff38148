//! streamfleet-registry — service registration and discovery.
//!
//! The registry registers the local instance with a pluggable discovery
//! backend, discovers remote instances, and runs three independent
//! background loops:
//!
//! - **heartbeat**: renews the local TTL/lease every `heartbeat_interval`
//! - **discovery**: re-queries the backend, diffs against the previous
//!   snapshot, and notifies listeners only when the set actually changed
//! - **health-check**: probes each instance's health URL with a short
//!   timeout, flipping status on transitions
//!
//! Backend unavailability on the read path is absorbed: `discover_services`
//! serves the last good cached snapshot instead of failing, so routing
//! never sees a discovery outage.
//!
//! # Architecture
//!
//! ```text
//! ServiceRegistry
//!   ├── DiscoveryBackend (enum)
//!   │   ├── Memory  — in-process map, outage-simulable for tests
//!   │   ├── Consul  — agent-style HTTP API
//!   │   └── Etcd    — v3 JSON gateway, base64 keys/values
//!   ├── heartbeat loop   → backend.renew(local)
//!   ├── discovery loop   → diff + synchronous listener callbacks
//!   └── health-check loop → http_probe per instance
//! ```

pub mod backend;
pub mod consul;
pub mod etcd;
pub mod http;
pub mod probe;
pub mod registry;

pub use backend::{DiscoveryBackend, MemoryBackend};
pub use consul::ConsulBackend;
pub use etcd::EtcdBackend;
pub use probe::{ProbeResult, http_probe};
pub use registry::ServiceRegistry;
