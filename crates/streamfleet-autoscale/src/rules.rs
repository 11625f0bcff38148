//! Built-in scaling rules and the metric names they evaluate.

use streamfleet_types::ScalingRule;

/// Aggregate CPU usage across healthy nodes, percent.
pub const METRIC_CPU: &str = "cpu_usage";
/// Aggregate memory usage across healthy nodes, percent.
pub const METRIC_MEMORY: &str = "memory_usage";
/// Active connections divided by healthy instance count.
pub const METRIC_CONNS_PER_INSTANCE: &str = "connections_per_instance";

/// The default rule set installed at construction.
pub fn default_rules() -> Vec<ScalingRule> {
    vec![
        ScalingRule {
            name: "cpu".to_string(),
            metric: METRIC_CPU.to_string(),
            scale_up_threshold: 70.0,
            scale_down_threshold: 30.0,
            scale_up_adjustment: 1,
            scale_down_adjustment: 1,
            cooldown_secs: 60,
            enabled: true,
        },
        ScalingRule {
            name: "memory".to_string(),
            metric: METRIC_MEMORY.to_string(),
            scale_up_threshold: 80.0,
            scale_down_threshold: 40.0,
            scale_up_adjustment: 1,
            scale_down_adjustment: 1,
            cooldown_secs: 60,
            enabled: true,
        },
        ScalingRule {
            name: "connections".to_string(),
            metric: METRIC_CONNS_PER_INSTANCE.to_string(),
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
            scale_up_adjustment: 2,
            scale_down_adjustment: 1,
            cooldown_secs: 60,
            enabled: true,
        },
    ]
}
