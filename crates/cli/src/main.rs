use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ekspose_controller::build;
use ekspose_core::{ControllerConfig, PortPolicy};
use ekspose_kubehub::{ClusterApi, KubeClusterApi, MemoryCluster};
use kube::Client;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ekspose", version, about = "Keeps a Service in step with every Deployment")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Watch a single namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "EKSPOSE_NAMESPACE")]
    namespace: Option<String>,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Tuning {
    /// Concurrent reconcile workers
    #[arg(long, global = true, env = "EKSPOSE_WORKERS", default_value_t = 2)]
    workers: usize,
    /// First retry delay in milliseconds
    #[arg(long = "base-delay-ms", global = true, env = "EKSPOSE_BASE_DELAY_MS", default_value_t = 5)]
    base_delay_ms: u64,
    /// Retry delay ceiling in seconds
    #[arg(long = "max-delay-secs", global = true, env = "EKSPOSE_MAX_DELAY_SECS", default_value_t = 1000)]
    max_delay_secs: u64,
    /// Failed attempts before a key is dropped
    #[arg(long = "max-attempts", global = true, env = "EKSPOSE_MAX_ATTEMPTS", default_value_t = 15)]
    max_attempts: u32,
    /// Retries per second across all keys; 0 removes the cap
    #[arg(long = "retry-qps", global = true, env = "EKSPOSE_RETRY_QPS", default_value_t = 10)]
    retry_qps: u32,
    /// Retries allowed in a burst above --retry-qps
    #[arg(long = "retry-burst", global = true, env = "EKSPOSE_RETRY_BURST", default_value_t = 100)]
    retry_burst: u32,
    /// `all`, `first` or `named:<port-name>`
    #[arg(long = "port-policy", global = true, env = "EKSPOSE_PORT_POLICY", default_value = "all")]
    port_policy: String,
    /// Service port used when no container port qualifies
    #[arg(long = "fallback-port", global = true, env = "EKSPOSE_FALLBACK_PORT", default_value_t = 80)]
    fallback_port: i32,
    /// Periodic full re-enqueue in seconds; 0 disables it
    #[arg(long = "resync-secs", global = true, env = "EKSPOSE_RESYNC_SECS", default_value_t = 600)]
    resync_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Write Services to an in-memory cluster instead of the real one.
        /// Deployments are still watched, so a reachable cluster is required
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Print the effective configuration and exit
    Config,
}

fn init_tracing() {
    let env = std::env::var("EKSPOSE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EKSPOSE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EKSPOSE_METRICS_ADDR; expected host:port");
        }
    }
}

fn controller_config(namespace: Option<String>, t: &Tuning) -> Result<ControllerConfig> {
    let cfg = ControllerConfig {
        namespace,
        workers: t.workers,
        base_delay: Duration::from_millis(t.base_delay_ms),
        max_delay: Duration::from_secs(t.max_delay_secs),
        max_attempts: t.max_attempts,
        retry_qps: t.retry_qps,
        retry_burst: t.retry_burst,
        port_policy: PortPolicy::from_str(&t.port_policy)?,
        fallback_port: t.fallback_port,
        resync_period: (t.resync_secs > 0).then(|| Duration::from_secs(t.resync_secs)),
        ..ControllerConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

async fn run_controller<C: ClusterApi + 'static>(client: Client, cfg: ControllerConfig, cluster: Arc<C>) -> Result<()> {
    let namespace = cfg.namespace.clone();
    let (tx, controller) = build(cfg, cluster)?;
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    let controller = controller.with_failure_reports(fail_tx);

    let watcher = tokio::spawn(async move {
        if let Err(e) = ekspose_kubehub::start_watcher(client, namespace.as_deref(), tx).await {
            error!(error = %e, "watcher failed");
        }
    });
    let reports = tokio::spawn(async move {
        let mut dropped = 0u64;
        while let Some(f) = fail_rx.recv().await {
            dropped += 1;
            warn!(key = %f.key, attempts = f.attempts, total = dropped, "key needs attention: {}", f.reason);
        }
    });

    controller
        .run(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
        })
        .await;

    watcher.abort();
    reports.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = controller_config(cli.namespace.clone(), &cli.tuning).context("invalid controller configuration")?;

    match cli.command {
        Commands::Config => match cli.output {
            Output::Human => println!("{:#?}", cfg),
            Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
        },
        Commands::Run { dry_run } => {
            info!(ns = ?cfg.namespace, workers = cfg.workers, dry_run, "starting ekspose");
            let client = ekspose_kubehub::get_kube_client().await?;
            if dry_run {
                run_controller(client, cfg, Arc::new(MemoryCluster::new())).await?;
            } else {
                let api = KubeClusterApi::new(client.clone(), cfg.field_manager.clone());
                run_controller(client, cfg, Arc::new(api)).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ekspose").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_map_onto_controller_config() {
        let cli = parse(&[
            "run", "--ns", "shop", "--workers", "4", "--port-policy", "named:http", "--resync-secs", "0", "--retry-qps", "5",
        ]);
        let cfg = controller_config(cli.namespace.clone(), &cli.tuning).unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("shop"));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.port_policy, PortPolicy::Named("http".into()));
        assert_eq!(cfg.resync_period, None);
        assert_eq!((cfg.retry_qps, cfg.retry_burst), (5, 100));
        assert!(matches!(cli.command, Commands::Run { dry_run: false }));
    }

    #[test]
    fn rejects_bad_settings() {
        let cli = parse(&["config", "--port-policy", "some"]);
        assert!(controller_config(None, &cli.tuning).is_err());
        let cli = parse(&["config", "--workers", "0"]);
        assert!(controller_config(None, &cli.tuning).is_err());
    }

    #[test]
    fn dry_run_help_mentions_the_watched_cluster() {
        use clap::CommandFactory;
        let cmd = Cli::command();
        let run = cmd.find_subcommand("run").unwrap();
        let arg = run.get_arguments().find(|a| a.get_id() == "dry_run").unwrap();
        let help = arg.get_long_help().or(arg.get_help()).unwrap().to_string();
        assert!(help.contains("reachable cluster"));
    }
}
