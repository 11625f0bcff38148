//! streamfleet-autoscale — metrics-driven fleet scaling.
//!
//! The scaling manager samples the balancer's live node stats into the
//! metrics collector, evaluates every enabled rule as an independent
//! vote, and decides scale-up / scale-down / no-action subject to
//! instance bounds and per-direction cooldowns. The actual instance
//! lifecycle is owned by externally supplied hooks; every action lands
//! in a bounded audit log whether or not the hooks succeeded.

pub mod manager;
pub mod rules;

pub use manager::{ScaleDownHook, ScaleUpHook, ScalingManager, ScalingStats};
pub use rules::default_rules;
