//! Fleet - Kubernetes cluster lifecycle on plain virtual machines

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet::config::FleetConfig;
use fleet::etcd::{EtcdClientGenerator, EtcdMaintenance, EtcdTls, PortForwardDialer};
use fleet::machine::NodeMachine;
use fleet::platform::{sort_nodes_oldest_first, KubePlatform};
use fleet::rolling::{RollingEngine, RollingOptions, RollingReport, UpgradeTarget};
use fleet::session::{Credentials, SessionManager};
use fleet::taint::TaintRemover;

/// Fleet - Kubernetes cluster lifecycle on plain virtual machines
#[derive(Parser, Debug)]
#[command(name = "fleet", version, about, long_about = None)]
struct Cli {
    /// Path to the fleet configuration file
    #[arg(
        short = 'f',
        long = "config",
        env = fleet::CONFIG_ENV,
        default_value = fleet::DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Kubeconfig for the managed cluster; inferred when omitted
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and validate the configuration file
    Validate,

    /// etcd membership and leadership
    #[command(subcommand)]
    Etcd(EtcdCommand),

    /// Reboot every worker node, one at a time
    RollingRestart(RollingArgs),

    /// Upgrade nodes to the configured Kubernetes version, masters first
    RollingUpgrade(UpgradeArgs),

    /// Remove the startup taint from Ready nodes
    RemoveTaints {
        /// Sweep once and exit instead of running until interrupted
        #[arg(long)]
        once: bool,

        /// Seconds between sweeps
        #[arg(long, default_value_t = 15)]
        interval_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum EtcdCommand {
    /// Per-member status, leader, and alarms
    Status,

    /// Remove the member named after a master node
    RemoveMember {
        /// Member (master node) name
        name: String,
    },

    /// Transfer leadership to the member named after a master node
    MoveLeader {
        /// Member (master node) name
        name: String,
    },
}

#[derive(Parser, Debug)]
struct RollingArgs {
    /// Continue past drain and not-ready failures
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct UpgradeArgs {
    #[command(flatten)]
    rolling: RollingArgs,

    /// Only upgrade nodes at least this many hours old
    #[arg(long, default_value_t = 0)]
    min_age_hours: u64,

    /// Override the configured target version
    #[arg(long)]
    version: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = FleetConfig::load(&cli.config)?;
    if let Commands::Validate = cli.command {
        println!(
            "{}: {} masters, {} pools, {} discovery",
            config.name,
            config.masters.count,
            config.pools.len(),
            config.discovery.kind()
        );
        return Ok(());
    }

    let credentials = Credentials {
        kubeconfig: cli.kubeconfig,
        context: cli.context,
    };
    let sessions = SessionManager::default();
    let client = sessions.client(&credentials).await?;
    let platform = Arc::new(KubePlatform::new(client.clone()));

    match cli.command {
        Commands::Validate => Ok(()),
        Commands::Etcd(command) => {
            let maintenance = etcd_maintenance(&config, client, platform)?;
            match command {
                EtcdCommand::Status => print_json(&maintenance.status().await?),
                EtcdCommand::RemoveMember { name } => {
                    maintenance.remove_member(&name).await?;
                    println!("removed etcd member {name}");
                    Ok(())
                }
                EtcdCommand::MoveLeader { name } => {
                    maintenance.move_leader(&name).await?;
                    println!("etcd leader is now {name}");
                    Ok(())
                }
            }
        }
        Commands::RollingRestart(args) => {
            let mut options = RollingOptions::from_config(&config);
            options.force |= args.force;
            let engine = RollingEngine::new(platform.clone(), platform.clone(), options);
            let nodes = joined_nodes(platform.as_ref()).await?;
            report(engine.rolling_restart(&nodes).await?)
        }
        Commands::RollingUpgrade(args) => {
            let mut options = RollingOptions::from_config(&config);
            options.force |= args.rolling.force;
            let mut engine = RollingEngine::new(platform.clone(), platform.clone(), options);
            if config.etcd.is_some() {
                engine = engine.with_etcd(etcd_maintenance(&config, client, platform.clone())?);
            }

            let mut target = UpgradeTarget::from_config(
                &config,
                Duration::from_secs(args.min_age_hours * 3600),
            );
            if let Some(version) = args.version {
                target.version = version;
            }
            let nodes = joined_nodes(platform.as_ref()).await?;
            report(engine.rolling_upgrade(&nodes, &target).await?)
        }
        Commands::RemoveTaints {
            once,
            interval_secs,
        } => {
            let remover = TaintRemover::new(platform, config.rolling.startup_taint.clone())
                .with_interval(Duration::from_secs(interval_secs));
            if once {
                let removed = remover.sweep().await;
                println!("removed taint from {removed} nodes");
                return Ok(());
            }
            let handle = remover.spawn();
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupted, stopping taint remover");
            handle.stop().await;
            Ok(())
        }
    }
}

fn etcd_maintenance(
    config: &FleetConfig,
    client: kube::Client,
    platform: Arc<KubePlatform>,
) -> anyhow::Result<EtcdMaintenance> {
    let files = config.etcd.as_ref().ok_or_else(|| {
        anyhow::anyhow!("etcd TLS files are not configured (etcd.caFile, etcd.certFile, etcd.keyFile)")
    })?;
    let tls = EtcdTls::from_files(files)?;
    let dialer = PortForwardDialer::new(client, tls, config.timeouts.etcd_dial());
    Ok(EtcdMaintenance::new(
        platform,
        EtcdClientGenerator::new(Arc::new(dialer)),
    ))
}

/// Nodes known to the API server; no provider is consulted, so ages come
/// from node creation times.
async fn joined_nodes(platform: &KubePlatform) -> anyhow::Result<Vec<NodeMachine>> {
    use fleet::platform::PlatformApi;

    let mut nodes = platform.list_nodes().await?;
    sort_nodes_oldest_first(&mut nodes);
    let mut paired = Vec::with_capacity(nodes.len());
    for node in nodes {
        paired.push(NodeMachine::new(Some(node), None).await);
    }
    Ok(paired)
}

fn report(report: RollingReport) -> anyhow::Result<()> {
    for warning in &report.health_warnings {
        tracing::warn!(%warning, "health did not recover");
    }
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
