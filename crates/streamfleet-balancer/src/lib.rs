//! streamfleet-balancer — routes client work to healthy backend nodes.
//!
//! The balancer holds the live node set (kept in sync with registry
//! membership), selects a node per routing request under one of five
//! strategies, enforces a per-client priority-weighted rate limit, tracks
//! client→node assignments, and maintains a consistent-hash ring.
//!
//! The selection hot path performs no I/O and never suspends: one coarse
//! lock guards the node map, client map, and ring, with sub-millisecond
//! hold times. Absence of a usable node is an explicit, countable
//! rejection, never a panic or an error type that implies failure.
//!
//! # Strategies
//!
//! ```text
//! round_robin          cyclic index over healthy nodes
//! least_connections    arg-min current_connections
//! weighted_round_robin node repeated `weight` times in a virtual rotation
//! consistent_hash      hash(client_id) → smallest ring position ≥ hash
//! resource_based       arg-min 0.4·cpu + 0.3·mem + 0.3·(conns/max·100)
//! ```

pub mod balancer;
pub mod limiter;
pub mod node;
pub mod ring;

pub use balancer::{BalancerStats, LoadBalancer, NodeStats, Strategy};
pub use limiter::ClientInfo;
pub use node::Node;
pub use ring::HashRing;
