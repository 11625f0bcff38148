//! streamfleet-metrics — rolling time-windowed metric storage.
//!
//! `MetricsCollector` keeps a bounded, time-pruned sample buffer per metric
//! name and answers trailing-window average/max queries. The autoscaler's
//! sampler feeds it; the rule engine reads it. Samples are append-only and
//! pruned to the retention window on every write.

pub mod collector;

pub use collector::MetricsCollector;
