//! The scaling manager — rule evaluation, cooldowns, and scale hooks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use streamfleet_balancer::LoadBalancer;
use streamfleet_metrics::MetricsCollector;
use streamfleet_registry::ServiceRegistry;
use streamfleet_types::{
    ConfigError, InstanceId, ScalingAction, ScalingConfig, ScalingEvent, ScalingRule, epoch_secs,
};

use crate::rules::{self, default_rules};

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// Hook invoked with the number of instances to add.
pub type ScaleUpHook = Arc<dyn Fn(u32) -> BoxFuture + Send + Sync>;

/// Hook invoked with the ids of the instances selected for removal.
pub type ScaleDownHook = Arc<dyn Fn(Vec<InstanceId>) -> BoxFuture + Send + Sync>;

/// Snapshot returned by [`ScalingManager::get_scaling_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ScalingStats {
    pub current_instances: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Unix timestamp (seconds) of the last applied scale-up, 0 if none.
    pub last_scale_up: u64,
    /// Unix timestamp (seconds) of the last applied scale-down, 0 if none.
    pub last_scale_down: u64,
    pub rules: Vec<ScalingRule>,
    pub recent_events: Vec<ScalingEvent>,
}

/// Per-direction cooldown tracking.
struct ScaleState {
    last_scale_up: u64,
    last_scale_down: u64,
}

/// Outcome of one rule-engine pass, carrying enough context to apply
/// and audit the action.
struct Decision {
    action: ScalingAction,
    trigger: String,
    reason: String,
    adjustment: u32,
}

/// Drives the fleet size from observed load; cheap to clone, all clones
/// share state.
///
/// The manager never creates or destroys instances itself. It decides,
/// calls the registered hooks, and records what happened; the external
/// orchestrator owns the instance lifecycle, and the registry's next
/// discovery cycle observes the result.
#[derive(Clone)]
pub struct ScalingManager {
    registry: ServiceRegistry,
    balancer: LoadBalancer,
    metrics: MetricsCollector,
    cfg: Arc<ScalingConfig>,
    state: Arc<Mutex<ScaleState>>,
    rules: Arc<Mutex<Vec<ScalingRule>>>,
    events: Arc<Mutex<VecDeque<ScalingEvent>>>,
    up_hooks: Arc<Mutex<Vec<ScaleUpHook>>>,
    down_hooks: Arc<Mutex<Vec<ScaleDownHook>>>,
}

impl ScalingManager {
    /// Create a manager with the default rule set installed.
    pub fn new(
        registry: ServiceRegistry,
        balancer: LoadBalancer,
        metrics: MetricsCollector,
        cfg: ScalingConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            registry,
            balancer,
            metrics,
            cfg: Arc::new(cfg),
            state: Arc::new(Mutex::new(ScaleState {
                last_scale_up: 0,
                last_scale_down: 0,
            })),
            rules: Arc::new(Mutex::new(default_rules())),
            events: Arc::new(Mutex::new(VecDeque::new())),
            up_hooks: Arc::new(Mutex::new(Vec::new())),
            down_hooks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    // ── Rule management ────────────────────────────────────────────

    /// Add a rule, replacing any existing rule with the same name.
    pub fn add_rule(&self, rule: ScalingRule) -> Result<(), ConfigError> {
        rule.validate()?;
        let mut rules = self.lock_rules();
        rules.retain(|r| r.name != rule.name);
        info!(rule = %rule.name, metric = %rule.metric, "scaling rule added");
        rules.push(rule);
        Ok(())
    }

    /// Remove a rule by name; returns whether it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.lock_rules();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        let removed = rules.len() != before;
        if removed {
            info!(rule = %name, "scaling rule removed");
        }
        removed
    }

    /// Enable or disable a rule in place; returns whether it exists.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.lock_rules();
        match rules.iter_mut().find(|r| r.name == name) {
            Some(rule) => {
                rule.enabled = enabled;
                info!(rule = %name, enabled, "scaling rule toggled");
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<ScalingRule> {
        self.lock_rules().clone()
    }

    /// Replace the whole rule set, validating each rule first.
    pub fn set_rules(&self, new_rules: Vec<ScalingRule>) -> Result<(), ConfigError> {
        for rule in &new_rules {
            rule.validate()?;
        }
        *self.lock_rules() = new_rules;
        Ok(())
    }

    // ── Hooks ──────────────────────────────────────────────────────

    pub fn add_scale_up_hook(&self, hook: ScaleUpHook) {
        self.up_hooks.lock().expect("hook lock poisoned").push(hook);
    }

    pub fn add_scale_down_hook(&self, hook: ScaleDownHook) {
        self.down_hooks
            .lock()
            .expect("hook lock poisoned")
            .push(hook);
    }

    // ── Sampling ───────────────────────────────────────────────────

    /// Sample the balancer's aggregate load into the metrics collector:
    /// mean cpu, mean memory, and connections per healthy instance.
    pub async fn sample_cycle(&self) {
        let stats = self.balancer.get_stats();
        let healthy = self.registry.healthy_count().await as u32;

        // Unhealthy nodes are excluded from the means: a node pinned at
        // 100% cpu and already out of rotation must not keep voting the
        // fleet upward.
        let serving: Vec<_> = stats.nodes.iter().filter(|s| s.healthy).collect();
        if !serving.is_empty() {
            let n = serving.len() as f64;
            let cpu = serving.iter().map(|s| s.cpu_usage).sum::<f64>() / n;
            let mem = serving.iter().map(|s| s.memory_usage).sum::<f64>() / n;
            self.metrics.record(rules::METRIC_CPU, cpu, "aggregate");
            self.metrics.record(rules::METRIC_MEMORY, mem, "aggregate");
        }

        let total_conns: u32 = stats.nodes.iter().map(|s| s.current_connections).sum();
        self.metrics
            .record("total_connections", total_conns as f64, "aggregate");
        if healthy > 0 {
            self.metrics.record(
                rules::METRIC_CONNS_PER_INSTANCE,
                total_conns as f64 / healthy as f64,
                "aggregate",
            );
        }
        debug!(healthy, nodes = stats.nodes.len(), "load sampled");
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Evaluate the rule set and return the decided action without
    /// applying it.
    pub async fn evaluate_scaling(&self) -> ScalingAction {
        let Some(healthy) = self.observed_fleet().await else {
            return ScalingAction::NoAction;
        };
        self.sample_cycle().await;
        self.decide(healthy, epoch_secs()).action
    }

    /// Evaluate and, if the decision is actionable, apply it through the
    /// registered hooks. Used by the evaluation loop.
    pub async fn evaluate_and_apply(&self) -> ScalingAction {
        let Some(healthy) = self.observed_fleet().await else {
            return ScalingAction::NoAction;
        };
        self.sample_cycle().await;

        let decision = self.decide(healthy, epoch_secs());
        match decision.action {
            ScalingAction::ScaleUp => {
                self.apply_scale_up(decision.adjustment, &decision.trigger, &decision.reason)
                    .await;
            }
            ScalingAction::ScaleDown => {
                self.apply_scale_down(decision.adjustment, &decision.trigger, &decision.reason)
                    .await;
            }
            ScalingAction::NoAction => {}
        }
        decision.action
    }

    /// Healthy instance count, or `None` when the fleet is dead — a dead
    /// fleet is never scaled through this path.
    async fn observed_fleet(&self) -> Option<u32> {
        let healthy = self.registry.healthy_count().await as u32;
        if healthy == 0 {
            warn!("no healthy instances, skipping scaling evaluation");
            return None;
        }
        Some(healthy)
    }

    /// Run the rule engine: every enabled rule votes independently on
    /// its metric's trailing average. Scale-up is checked first, biasing
    /// toward availability when votes conflict.
    fn decide(&self, healthy: u32, now: u64) -> Decision {
        let window = Duration::from_secs(self.cfg.evaluation_interval_secs);
        let (last_up, last_down) = {
            let state = self.lock_state();
            (state.last_scale_up, state.last_scale_down)
        };

        let mut up_votes: Vec<(ScalingRule, f64)> = Vec::new();
        let mut down_votes: Vec<(ScalingRule, f64)> = Vec::new();
        for rule in self.lock_rules().iter().filter(|r| r.enabled) {
            let Some(avg) = self.metrics.average(&rule.metric, window) else {
                continue;
            };
            // A rule inside its own same-direction cooldown abstains.
            if avg >= rule.scale_up_threshold {
                if now.saturating_sub(last_up) >= rule.cooldown_secs {
                    debug!(rule = %rule.name, avg, "rule votes scale-up");
                    up_votes.push((rule.clone(), avg));
                }
            } else if avg <= rule.scale_down_threshold
                && now.saturating_sub(last_down) >= rule.cooldown_secs
            {
                debug!(rule = %rule.name, avg, "rule votes scale-down");
                down_votes.push((rule.clone(), avg));
            }
        }

        if let Some((rule, avg)) = up_votes.first()
            && healthy < self.cfg.max_instances
            && now.saturating_sub(last_up) >= self.cfg.scale_up_cooldown_secs
        {
            return Decision {
                action: ScalingAction::ScaleUp,
                trigger: rule.name.clone(),
                reason: format!(
                    "{} avg {avg:.1} >= {:.1}",
                    rule.metric, rule.scale_up_threshold
                ),
                adjustment: rule.scale_up_adjustment,
            };
        }

        if down_votes.len() > up_votes.len()
            && let Some((rule, avg)) = down_votes.first()
            && healthy > self.cfg.min_instances
            && now.saturating_sub(last_down) >= self.cfg.scale_down_cooldown_secs
        {
            return Decision {
                action: ScalingAction::ScaleDown,
                trigger: rule.name.clone(),
                reason: format!(
                    "{} avg {avg:.1} <= {:.1}",
                    rule.metric, rule.scale_down_threshold
                ),
                adjustment: rule.scale_down_adjustment,
            };
        }

        Decision {
            action: ScalingAction::NoAction,
            trigger: String::new(),
            reason: String::new(),
            adjustment: 0,
        }
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Manually add up to `count` instances, clamped to `max_instances`.
    /// Returns the number actually requested from the hooks.
    pub async fn scale_up(&self, count: u32) -> u32 {
        self.apply_scale_up(count, "manual", "operator request")
            .await
    }

    /// Manually remove up to `count` instances, clamped to
    /// `min_instances`. Returns the number actually requested.
    pub async fn scale_down(&self, count: u32) -> u32 {
        self.apply_scale_down(count, "manual", "operator request")
            .await
    }

    async fn apply_scale_up(&self, count: u32, trigger: &str, reason: &str) -> u32 {
        let now = epoch_secs();
        // Check and reserve the cooldown in one critical section so a
        // concurrent same-direction action cannot slip in while this one
        // awaits the registry or the hooks.
        let reserved = {
            let mut state = self.lock_state();
            let elapsed = now.saturating_sub(state.last_scale_up);
            if elapsed < self.cfg.scale_up_cooldown_secs {
                warn!(trigger, elapsed, "scale-up suppressed by cooldown");
                return 0;
            }
            let prev = state.last_scale_up;
            state.last_scale_up = now;
            prev
        };

        let current = self.registry.healthy_count().await as u32;
        let target = current.saturating_add(count).min(self.cfg.max_instances);
        let added = target.saturating_sub(current);
        if added == 0 {
            // A clamped request does not burn the cooldown.
            let mut state = self.lock_state();
            if state.last_scale_up == now {
                state.last_scale_up = reserved;
            }
            warn!(current, max = self.cfg.max_instances, "scale-up clamped to zero");
            return 0;
        }

        info!(trigger, current, target, reason, "scaling up");
        let (success, error) = self.invoke_up_hooks(added).await;

        self.push_event(ScalingEvent {
            timestamp: now,
            action: ScalingAction::ScaleUp,
            trigger: trigger.to_string(),
            reason: reason.to_string(),
            old_count: current,
            new_count: target,
            success,
            error,
        });
        added
    }

    async fn apply_scale_down(&self, count: u32, trigger: &str, reason: &str) -> u32 {
        let now = epoch_secs();
        let reserved = {
            let mut state = self.lock_state();
            let elapsed = now.saturating_sub(state.last_scale_down);
            if elapsed < self.cfg.scale_down_cooldown_secs {
                warn!(trigger, elapsed, "scale-down suppressed by cooldown");
                return 0;
            }
            let prev = state.last_scale_down;
            state.last_scale_down = now;
            prev
        };

        let instances = self.registry.get_healthy_instances().await;
        let current = instances.len() as u32;
        let target = current.saturating_sub(count).max(self.cfg.min_instances);
        let removed = current.saturating_sub(target);
        if removed == 0 {
            let mut state = self.lock_state();
            if state.last_scale_down == now {
                state.last_scale_down = reserved;
            }
            warn!(current, min = self.cfg.min_instances, "scale-down clamped to zero");
            return 0;
        }

        let victims = self.pick_victims(&instances, removed as usize);
        info!(trigger, current, target, reason, victims = ?victims, "scaling down");
        let (success, error) = self.invoke_down_hooks(victims).await;

        self.push_event(ScalingEvent {
            timestamp: now,
            action: ScalingAction::ScaleDown,
            trigger: trigger.to_string(),
            reason: reason.to_string(),
            old_count: current,
            new_count: target,
            success,
            error,
        });
        removed
    }

    /// Victim selection: lowest current connections first, per the
    /// balancer's live view; instances the balancer has never seen count
    /// as idle.
    fn pick_victims(&self, instances: &[streamfleet_types::ServiceInstance], n: usize) -> Vec<InstanceId> {
        let stats = self.balancer.get_stats();
        let mut candidates: Vec<(u32, InstanceId)> = instances
            .iter()
            .map(|inst| {
                let conns = stats
                    .nodes
                    .iter()
                    .find(|node| node.node_id == inst.id)
                    .map(|node| node.current_connections)
                    .unwrap_or(0);
                (conns, inst.id.clone())
            })
            .collect();
        candidates.sort();
        candidates.into_iter().take(n).map(|(_, id)| id).collect()
    }

    async fn invoke_up_hooks(&self, added: u32) -> (bool, Option<String>) {
        let hooks = self.up_hooks.lock().expect("hook lock poisoned").clone();
        let mut errors = Vec::new();
        for hook in hooks {
            if let Err(e) = hook(added).await {
                warn!(error = %e, "scale-up hook failed");
                errors.push(e.to_string());
            }
        }
        Self::hook_outcome(errors)
    }

    async fn invoke_down_hooks(&self, victims: Vec<InstanceId>) -> (bool, Option<String>) {
        let hooks = self.down_hooks.lock().expect("hook lock poisoned").clone();
        let mut errors = Vec::new();
        for hook in hooks {
            if let Err(e) = hook(victims.clone()).await {
                warn!(error = %e, "scale-down hook failed");
                errors.push(e.to_string());
            }
        }
        Self::hook_outcome(errors)
    }

    fn hook_outcome(errors: Vec<String>) -> (bool, Option<String>) {
        if errors.is_empty() {
            (true, None)
        } else {
            (false, Some(errors.join("; ")))
        }
    }

    // ── Audit log and stats ────────────────────────────────────────

    fn push_event(&self, event: ScalingEvent) {
        let mut events = self.events.lock().expect("event lock poisoned");
        events.push_back(event);
        while events.len() > self.cfg.event_log_capacity {
            events.pop_front();
        }
    }

    /// Scaling events, oldest first, bounded to the configured capacity.
    pub fn events(&self) -> Vec<ScalingEvent> {
        self.events
            .lock()
            .expect("event lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub async fn get_scaling_stats(&self) -> ScalingStats {
        let current = self.registry.healthy_count().await as u32;
        let (last_up, last_down) = {
            let state = self.lock_state();
            (state.last_scale_up, state.last_scale_down)
        };
        ScalingStats {
            current_instances: current,
            min_instances: self.cfg.min_instances,
            max_instances: self.cfg.max_instances,
            last_scale_up: last_up,
            last_scale_down: last_down,
            rules: self.rules(),
            recent_events: self.events(),
        }
    }

    // ── Background loops ───────────────────────────────────────────

    /// Evaluation loop: evaluate and apply every `evaluation_interval`.
    pub async fn run_evaluation(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.evaluation_interval_secs);
        info!(interval_secs = interval.as_secs(), "scaling evaluation loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let action = self.evaluate_and_apply().await;
                    debug!(?action, "scaling evaluation completed");
                }
                _ = shutdown.changed() => {
                    info!("scaling evaluation loop shutting down");
                    break;
                }
            }
        }
    }

    /// Independent sampler loop so trend data exists between evaluations.
    pub async fn run_sampler(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.sample_interval_secs);
        info!(interval_secs = interval.as_secs(), "metrics sampler loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sample_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("metrics sampler loop shutting down");
                    break;
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ScaleState> {
        self.state.lock().expect("scale state lock poisoned")
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<ScalingRule>> {
        self.rules.lock().expect("rules lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use streamfleet_registry::{DiscoveryBackend, MemoryBackend};
    use streamfleet_types::{
        BalancerConfig, InstanceStatus, RegistryConfig, ServiceInstance,
    };

    struct Harness {
        manager: ScalingManager,
        mem: MemoryBackend,
        balancer: LoadBalancer,
        metrics: MetricsCollector,
    }

    fn harness(cfg: ScalingConfig) -> Harness {
        let mem = MemoryBackend::new();
        let registry = ServiceRegistry::new(
            DiscoveryBackend::Memory(mem.clone()),
            RegistryConfig {
                service_name: "stream".to_string(),
                ..RegistryConfig::default()
            },
        );
        let balancer = LoadBalancer::new(BalancerConfig::default()).unwrap();
        let metrics = MetricsCollector::new(Duration::from_secs(300));
        let manager =
            ScalingManager::new(registry, balancer.clone(), metrics.clone(), cfg).unwrap();
        Harness {
            manager,
            mem,
            balancer,
            metrics,
        }
    }

    fn zero_cooldowns() -> ScalingConfig {
        ScalingConfig {
            scale_up_cooldown_secs: 0,
            scale_down_cooldown_secs: 0,
            ..ScalingConfig::default()
        }
    }

    fn instance(id: &str, port: u16) -> ServiceInstance {
        let now = epoch_secs();
        ServiceInstance {
            id: id.to_string(),
            service_name: "stream".to_string(),
            host: "10.0.0.1".to_string(),
            port,
            tags: vec![],
            metadata: HashMap::new(),
            health_check_url: None,
            status: InstanceStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
            ttl_secs: 30,
        }
    }

    async fn seed_fleet(h: &Harness, n: u32) {
        for i in 0..n {
            h.mem.register(&instance(&format!("svc-{i}"), 9000 + i as u16))
                .await
                .unwrap();
        }
    }

    /// Install a cpu rule with 0 cooldown so the vote is never
    /// suppressed by rule-level cooldowns in tests.
    fn cpu_rule() -> ScalingRule {
        ScalingRule {
            name: "cpu".to_string(),
            metric: "cpu_usage".to_string(),
            scale_up_threshold: 70.0,
            scale_down_threshold: 35.0,
            scale_up_adjustment: 1,
            scale_down_adjustment: 1,
            cooldown_secs: 0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn dead_fleet_is_never_scaled() {
        let h = harness(zero_cooldowns());
        h.metrics.record("cpu_usage", 99.0, "aggregate");
        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::NoAction);
    }

    #[tokio::test]
    async fn high_cpu_votes_scale_up() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;
        h.manager.set_rules(vec![cpu_rule()]).unwrap();
        h.metrics.record("cpu_usage", 80.0, "aggregate");

        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::ScaleUp);
    }

    #[tokio::test]
    async fn low_cpu_votes_scale_down() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;
        h.manager.set_rules(vec![cpu_rule()]).unwrap();
        h.metrics.record("cpu_usage", 20.0, "aggregate");

        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::ScaleDown);
    }

    #[tokio::test]
    async fn at_max_instances_returns_no_action() {
        let cfg = ScalingConfig {
            min_instances: 1,
            max_instances: 5,
            ..zero_cooldowns()
        };
        let h = harness(cfg);
        seed_fleet(&h, 5).await;
        h.manager.set_rules(vec![cpu_rule()]).unwrap();
        h.metrics.record("cpu_usage", 95.0, "aggregate");

        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::NoAction);
    }

    #[tokio::test]
    async fn at_min_instances_returns_no_action() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 1).await;
        h.manager.set_rules(vec![cpu_rule()]).unwrap();
        h.metrics.record("cpu_usage", 5.0, "aggregate");

        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::NoAction);
    }

    #[tokio::test]
    async fn up_wins_when_votes_conflict() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;
        let mut mem_rule = cpu_rule();
        mem_rule.name = "memory".to_string();
        mem_rule.metric = "memory_usage".to_string();
        h.manager.set_rules(vec![cpu_rule(), mem_rule]).unwrap();

        // cpu votes up, memory votes down: availability bias wins.
        h.metrics.record("cpu_usage", 90.0, "aggregate");
        h.metrics.record("memory_usage", 10.0, "aggregate");

        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::ScaleUp);
    }

    #[tokio::test]
    async fn scale_up_invokes_hooks_and_records_event() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        h.manager.add_scale_up_hook(Arc::new(move |n| {
            let calls = calls_ref.clone();
            Box::pin(async move {
                calls.fetch_add(n, Ordering::SeqCst);
                Ok(())
            })
        }));

        assert_eq!(h.manager.scale_up(2).await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let events = h.manager.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ScalingAction::ScaleUp);
        assert_eq!(events[0].trigger, "manual");
        assert_eq!(events[0].old_count, 2);
        assert_eq!(events[0].new_count, 4);
        assert!(events[0].success);
    }

    #[tokio::test]
    async fn scale_up_clamps_to_max() {
        let cfg = ScalingConfig {
            max_instances: 3,
            ..zero_cooldowns()
        };
        let h = harness(cfg);
        seed_fleet(&h, 2).await;

        assert_eq!(h.manager.scale_up(10).await, 1);
        // The orchestrator delivered the instance; now at max, nothing to
        // do and no further event.
        h.mem.register(&instance("svc-2", 9002)).await.unwrap();
        assert_eq!(h.manager.scale_up(1).await, 0);
        assert_eq!(h.manager.events().len(), 1);
    }

    #[tokio::test]
    async fn scale_down_picks_least_connected_victims() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 3).await;

        // Mirror the fleet in the balancer with uneven load.
        let now = epoch_secs();
        for (id, conns) in [("svc-0", 5u32), ("svc-1", 1), ("svc-2", 3)] {
            let mut node = streamfleet_balancer::Node::new(id, "10.0.0.1", 9000, now);
            node.current_connections = conns;
            h.balancer.add_node(node);
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = seen.clone();
        h.manager.add_scale_down_hook(Arc::new(move |ids| {
            let seen = seen_ref.clone();
            Box::pin(async move {
                *seen.lock().unwrap() = ids;
                Ok(())
            })
        }));

        assert_eq!(h.manager.scale_down(1).await, 1);
        assert_eq!(seen.lock().unwrap().clone(), vec!["svc-1".to_string()]);
    }

    #[tokio::test]
    async fn scale_down_clamps_to_min() {
        let cfg = ScalingConfig {
            min_instances: 2,
            ..zero_cooldowns()
        };
        let h = harness(cfg);
        seed_fleet(&h, 3).await;

        assert_eq!(h.manager.scale_down(10).await, 1);
        // Orchestrator removed the victim; now at min, clamp to zero.
        h.mem.deregister("svc-0").await.unwrap();
        assert_eq!(h.manager.scale_down(1).await, 0);
    }

    #[tokio::test]
    async fn cooldown_blocks_second_same_direction_action() {
        let cfg = ScalingConfig {
            scale_up_cooldown_secs: 3600,
            scale_down_cooldown_secs: 0,
            ..ScalingConfig::default()
        };
        let h = harness(cfg);
        seed_fleet(&h, 2).await;

        assert_eq!(h.manager.scale_up(1).await, 1);
        assert_eq!(h.manager.scale_up(1).await, 0);
        assert_eq!(h.manager.events().len(), 1);

        // The opposite direction is gated independently.
        assert_eq!(h.manager.scale_down(1).await, 1);
    }

    #[tokio::test]
    async fn concurrent_scale_ups_share_one_cooldown_window() {
        let cfg = ScalingConfig {
            scale_up_cooldown_secs: 3600,
            scale_down_cooldown_secs: 0,
            ..ScalingConfig::default()
        };
        let h = harness(cfg);
        seed_fleet(&h, 2).await;

        // A slow hook keeps the first action in flight while the second
        // one arrives, like an orchestrator API call would.
        h.manager.add_scale_up_hook(Arc::new(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
        }));

        let (a, b) = tokio::join!(h.manager.scale_up(1), h.manager.scale_up(1));
        assert_eq!(a + b, 1, "only one scale-up may land per cooldown window");
        assert_eq!(h.manager.events().len(), 1);
    }

    #[tokio::test]
    async fn clamped_scale_up_does_not_burn_the_cooldown() {
        let cfg = ScalingConfig {
            max_instances: 2,
            scale_up_cooldown_secs: 3600,
            scale_down_cooldown_secs: 0,
            ..ScalingConfig::default()
        };
        let h = harness(cfg);
        seed_fleet(&h, 2).await;

        // Already at max: nothing moves, no event, no cooldown started.
        assert_eq!(h.manager.scale_up(1).await, 0);
        assert!(h.manager.events().is_empty());

        h.mem.deregister("svc-1").await.unwrap();
        assert_eq!(h.manager.scale_up(1).await, 1);
    }

    #[tokio::test]
    async fn hook_failure_marks_event_but_runs_remaining_hooks() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;

        h.manager.add_scale_up_hook(Arc::new(|_| {
            Box::pin(async { Err(anyhow::anyhow!("orchestrator unreachable")) })
        }));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        h.manager.add_scale_up_hook(Arc::new(move |_| {
            let calls = calls_ref.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        assert_eq!(h.manager.scale_up(1).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = h.manager.events();
        assert!(!events[0].success);
        assert!(events[0]
            .error
            .as_deref()
            .unwrap()
            .contains("orchestrator unreachable"));
    }

    #[tokio::test]
    async fn event_log_is_bounded() {
        let cfg = ScalingConfig {
            event_log_capacity: 3,
            max_instances: 100,
            ..zero_cooldowns()
        };
        let h = harness(cfg);
        seed_fleet(&h, 2).await;

        for _ in 0..6 {
            h.manager.scale_up(1).await;
        }
        let events = h.manager.events();
        assert_eq!(events.len(), 3);
        // Oldest entries were evicted.
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn rule_management_roundtrip() {
        let h = harness(zero_cooldowns());
        let initial = h.manager.rules().len();

        let mut rule = cpu_rule();
        rule.name = "latency".to_string();
        rule.metric = "latency_ms".to_string();
        h.manager.add_rule(rule.clone()).unwrap();
        assert_eq!(h.manager.rules().len(), initial + 1);

        // Same name replaces, never duplicates.
        rule.scale_up_threshold = 90.0;
        h.manager.add_rule(rule).unwrap();
        assert_eq!(h.manager.rules().len(), initial + 1);

        assert!(h.manager.remove_rule("latency"));
        assert!(!h.manager.remove_rule("latency"));
        assert_eq!(h.manager.rules().len(), initial);
    }

    #[tokio::test]
    async fn disabled_rule_does_not_vote() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;
        h.manager.set_rules(vec![cpu_rule()]).unwrap();
        h.metrics.record("cpu_usage", 95.0, "aggregate");

        assert!(h.manager.set_rule_enabled("cpu", false));
        assert_eq!(h.manager.evaluate_scaling().await, ScalingAction::NoAction);
        assert!(!h.manager.set_rule_enabled("no-such-rule", false));
    }

    #[tokio::test]
    async fn invalid_rule_is_rejected() {
        let h = harness(zero_cooldowns());
        let mut rule = cpu_rule();
        rule.scale_up_threshold = 10.0;
        rule.scale_down_threshold = 50.0;
        assert!(h.manager.add_rule(rule).is_err());
    }

    #[tokio::test]
    async fn sampler_derives_connections_per_instance() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;

        let now = epoch_secs();
        for (id, conns) in [("svc-0", 6u32), ("svc-1", 2)] {
            let mut node = streamfleet_balancer::Node::new(id, "10.0.0.1", 9000, now);
            node.current_connections = conns;
            node.cpu_usage = 50.0;
            node.memory_usage = 30.0;
            h.balancer.add_node(node);
        }

        h.manager.sample_cycle().await;
        assert_eq!(h.metrics.latest("cpu_usage"), Some(50.0));
        assert_eq!(h.metrics.latest("memory_usage"), Some(30.0));
        // 8 connections over 2 healthy instances.
        assert_eq!(h.metrics.latest("connections_per_instance"), Some(4.0));
    }

    #[tokio::test]
    async fn sampler_excludes_unhealthy_nodes_from_means() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;

        let now = epoch_secs();
        let mut good = streamfleet_balancer::Node::new("svc-0", "10.0.0.1", 9000, now);
        good.cpu_usage = 50.0;
        good.memory_usage = 30.0;
        h.balancer.add_node(good);
        // Over the 90% cpu threshold: out of rotation, must not vote.
        let mut bad = streamfleet_balancer::Node::new("svc-1", "10.0.0.1", 9001, now);
        bad.cpu_usage = 99.0;
        bad.memory_usage = 95.0;
        h.balancer.add_node(bad);

        h.manager.sample_cycle().await;
        assert_eq!(h.metrics.latest("cpu_usage"), Some(50.0));
        assert_eq!(h.metrics.latest("memory_usage"), Some(30.0));
    }

    #[tokio::test]
    async fn stats_snapshot_reflects_state() {
        let h = harness(zero_cooldowns());
        seed_fleet(&h, 2).await;
        h.manager.scale_up(1).await;

        let stats = h.manager.get_scaling_stats().await;
        assert_eq!(stats.current_instances, 2);
        assert_eq!(stats.recent_events.len(), 1);
        assert!(stats.last_scale_up > 0);
        assert_eq!(stats.last_scale_down, 0);
        assert!(!stats.rules.is_empty());
    }
}
