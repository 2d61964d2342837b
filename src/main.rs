//! Cluster Synchro Manager
//!
//! Keeps one synchronization worker running for every ClusterRegistration.
//!
//! ## Usage
//!
//! ```bash
//! # Run the manager (requires kubeconfig)
//! cluster-synchro-manager
//!
//! # Allow the all-resources wildcard, with debug logging
//! RUST_LOG=debug cluster-synchro-manager --allow-sync-all-resources
//! ```

use clap::{Parser, ValueEnum};
use cluster_synchro_manager::leader_election::{self, LeaderElector, LeaseSettings};
use cluster_synchro_manager::{
    ClusterSynchroManager, ManagerSettings, MemoryStorage, ProbeSynchroFactory,
};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Cluster Synchro Manager
#[derive(Parser, Debug)]
#[command(name = "cluster-synchro-manager")]
#[command(version, about = "Keeps one synchro running per registered cluster")]
struct Args {
    /// Maximum number of concurrent reconciles
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Allow the all-resources wildcard group in syncResources
    #[arg(long, default_value = "false")]
    allow_sync_all_resources: bool,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Seconds between remote cluster version probes
    #[arg(long, default_value_t = 30)]
    probe_interval_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting Cluster Synchro Manager");
    info!(
        workers = args.workers,
        allow_sync_all_resources = args.allow_sync_all_resources,
        leader_election = args.leader_election,
        "Manager settings"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal");
            stop.cancel();
        }
    });

    // Acquire the lease before starting the manager
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &ns,
            LeaseSettings::default(),
        ));
        if !elector.acquire(&stop).await {
            info!("Stopped before acquiring leader lease");
            return Ok(());
        }
        tokio::spawn({
            let elector = elector.clone();
            let stop = stop.clone();
            async move { elector.hold(stop).await }
        });
        Some(elector)
    } else {
        None
    };

    let settings = ManagerSettings {
        workers: args.workers,
        allow_sync_all_resources: args.allow_sync_all_resources,
        ..Default::default()
    };
    let storage = Arc::new(MemoryStorage::new());
    let factory = Arc::new(ProbeSynchroFactory::new(Duration::from_secs(
        args.probe_interval_secs,
    )));
    let manager = ClusterSynchroManager::new(client, storage, factory, settings.clone());

    let result = manager.run(settings.workers, stop.clone()).await;
    if let Err(e) = &result {
        error!("Cluster synchro manager failed: {}", e);
    }

    // Release the lease before exiting so a standby replica can take over immediately
    stop.cancel();
    if let Some(elector) = &elector {
        elector.release().await;
    }

    info!("Cluster Synchro Manager shut down");
    result.map_err(Into::into)
}
