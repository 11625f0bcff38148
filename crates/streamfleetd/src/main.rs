//! streamfleetd — the StreamFleet daemon.
//!
//! Single binary that assembles the control plane:
//! - Service registry (memory / Consul / etcd discovery backend)
//! - Load balancer fed by registry membership events
//! - Metrics collector + autoscaler
//!
//! # Usage
//!
//! ```text
//! streamfleetd run --host 10.0.0.5 --port 9000
//! streamfleetd run --config fleet.toml --backend consul --backend-url 127.0.0.1:8500
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use streamfleet_autoscale::ScalingManager;
use streamfleet_balancer::LoadBalancer;
use streamfleet_metrics::MetricsCollector;
use streamfleet_registry::{ConsulBackend, DiscoveryBackend, EtcdBackend, MemoryBackend, ServiceRegistry};
use streamfleet_types::{ConfigError, FleetConfig};

#[derive(Parser)]
#[command(name = "streamfleetd", about = "StreamFleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet control plane.
    Run {
        /// Path to a TOML configuration file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Discovery backend: memory, consul, or etcd.
        #[arg(long, default_value = "memory")]
        backend: String,

        /// Backend address (host:port) for consul and etcd.
        #[arg(long, default_value = "127.0.0.1:8500")]
        backend_url: String,

        /// Advertised host of this instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Advertised port of this instance.
        #[arg(long, default_value = "9000")]
        port: u16,

        /// Health-check URL registered for this instance.
        #[arg(long)]
        health_url: Option<String>,

        /// Override the configured balancing strategy.
        #[arg(long)]
        strategy: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,streamfleetd=debug,streamfleet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            backend,
            backend_url,
            host,
            port,
            health_url,
            strategy,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(strategy) = strategy {
                cfg.balancer.strategy = strategy;
            }
            cfg.validate()?;

            let backend = build_backend(&backend, &backend_url)?;
            run(cfg, backend, host, port, health_url).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    let Some(path) = path else {
        return Ok(FleetConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg: FleetConfig =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(cfg)
}

fn build_backend(name: &str, url: &str) -> Result<DiscoveryBackend, ConfigError> {
    match name {
        "memory" => Ok(DiscoveryBackend::Memory(MemoryBackend::new())),
        "consul" => Ok(DiscoveryBackend::Consul(ConsulBackend::new(url))),
        "etcd" => Ok(DiscoveryBackend::Etcd(EtcdBackend::new(url))),
        other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
}

async fn run(
    cfg: FleetConfig,
    backend: DiscoveryBackend,
    host: String,
    port: u16,
    health_url: Option<String>,
) -> anyhow::Result<()> {
    info!("StreamFleet daemon starting");

    // ── Initialize components ──────────────────────────────────

    let registry = ServiceRegistry::new(backend, cfg.registry.clone());
    info!(service = %cfg.registry.service_name, "service registry initialized");

    let balancer = LoadBalancer::new(cfg.balancer.clone())?;
    info!(strategy = ?balancer.strategy(), "load balancer initialized");

    let metrics = MetricsCollector::new(std::time::Duration::from_secs(
        cfg.scaling.evaluation_interval_secs * 10,
    ));

    let manager = ScalingManager::new(
        registry.clone(),
        balancer.clone(),
        metrics.clone(),
        cfg.scaling.clone(),
    )?;
    info!(
        min = cfg.scaling.min_instances,
        max = cfg.scaling.max_instances,
        "scaling manager initialized"
    );

    // Log-only hooks by default; an orchestrator integration replaces
    // these with real instance lifecycle calls.
    manager.add_scale_up_hook(Arc::new(|count| {
        Box::pin(async move {
            info!(count, "scale-up requested (no orchestrator attached)");
            Ok(())
        })
    }));
    manager.add_scale_down_hook(Arc::new(|ids| {
        Box::pin(async move {
            info!(instances = ?ids, "scale-down requested (no orchestrator attached)");
            Ok(())
        })
    }));

    // Registry membership drives the balancer's node set.
    {
        let balancer = balancer.clone();
        registry
            .add_service_listener(Arc::new(move |instances| {
                balancer.sync_instances(instances);
            }))
            .await;
    }

    // ── Register and prime membership ──────────────────────────

    let local = registry
        .register_service(&host, port, Vec::new(), HashMap::new(), health_url)
        .await?;
    registry.discovery_cycle().await;

    // ── Start background loops ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    {
        let registry = registry.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { registry.run_heartbeat(rx).await }));
    }
    {
        let registry = registry.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { registry.run_discovery(rx).await }));
    }
    {
        let registry = registry.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(
            async move { registry.run_health_checks(rx).await },
        ));
    }
    {
        let balancer = balancer.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { balancer.run_revalidate(rx).await }));
    }
    {
        let manager = manager.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { manager.run_sampler(rx).await }));
    }
    {
        let manager = manager.clone();
        let rx = shutdown_rx;
        handles.push(tokio::spawn(async move { manager.run_evaluation(rx).await }));
    }

    info!(id = %local.id, address = %local.address(), "fleet control plane running");

    // ── Graceful shutdown on Ctrl-C ────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    registry.deregister_service(&local.id).await?;

    info!("StreamFleet daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(build_backend("zookeeper", "127.0.0.1:2181").is_err());
        assert!(build_backend("memory", "").is_ok());
        assert!(build_backend("consul", "127.0.0.1:8500").is_ok());
        assert!(build_backend("etcd", "127.0.0.1:2379").is_ok());
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.balancer.strategy, "round_robin");
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[balancer]\nstrategy = \"consistent_hash\"\n\n[scaling]\nmax_instances = 20"
        )
        .unwrap();

        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.balancer.strategy, "consistent_hash");
        assert_eq!(cfg.scaling.max_instances, 20);
        assert_eq!(cfg.scaling.min_instances, 1);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "balancer = \"not a table\"").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }
}
