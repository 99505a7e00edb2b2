use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ingress_status_sync::cluster::{discover_pod_info, KubeCluster, KubeLeaseStore};
use ingress_status_sync::{LeaseConfig, ObjectKey, StatusHooks, StatusSync, StatusSyncConfig};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base name of the leader election lease
    #[arg(long, env = "ELECTION_ID", default_value = "ingress-controller-leader")]
    election_id: String,

    /// Ingress class served by this controller
    #[arg(long, env = "INGRESS_CLASS", default_value = "haproxy")]
    ingress_class: String,

    /// Ignore ingresses that name no class
    #[arg(long, env = "IGNORE_INGRESS_WITHOUT_CLASS")]
    ignore_ingress_without_class: bool,

    /// Publish the load balancer addresses of this service (namespace/name)
    #[arg(long, env = "PUBLISH_SERVICE")]
    publish_service: Option<String>,

    /// Only update ingresses of this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Publish node internal IPs instead of external ones
    #[arg(long, env = "USE_NODE_INTERNAL_IP")]
    use_node_internal_ip: bool,

    /// Remove published addresses when the last replica stops
    #[arg(
        long,
        env = "UPDATE_STATUS_ON_SHUTDOWN",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    update_status_on_shutdown: bool,

    /// Seconds between two status updates
    #[arg(long, env = "UPDATE_INTERVAL", default_value_t = 60)]
    update_interval: u64,

    /// Leader lease duration in seconds
    #[arg(long, env = "LEASE_DURATION", default_value_t = 30)]
    lease_duration: u64,

    /// Ingresses updated concurrently
    #[arg(long, env = "UPDATE_CONCURRENCY", default_value_t = 10)]
    update_concurrency: usize,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn status_sync_config(&self, pod_namespace: &str) -> Result<StatusSyncConfig> {
        let publish_service = self
            .publish_service
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| ObjectKey::parse(s, pod_namespace))
            .transpose()
            .context("invalid --publish-service")?;

        Ok(StatusSyncConfig {
            election_id: self.election_id.clone(),
            ingress_class: self.ingress_class.clone(),
            watch_ingress_without_class: !self.ignore_ingress_without_class,
            publish_service,
            watch_namespace: self.watch_namespace.clone().filter(|ns| !ns.is_empty()),
            use_node_internal_ip: self.use_node_internal_ip,
            update_status_on_shutdown: self.update_status_on_shutdown,
            update_interval: Duration::from_secs(self.update_interval),
            lease: LeaseConfig::new(Duration::from_secs(self.lease_duration)),
            update_concurrency: self.update_concurrency,
        })
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Resolves on SIGTERM (pod termination) or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting ingress status sync v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let pod = discover_pod_info(&client)
        .await
        .context("cannot identify the controller pod")?;
    let config = args.status_sync_config(&pod.namespace)?;

    let lease_store = KubeLeaseStore::new(client.clone(), &pod.namespace, config.election_key());
    info!(
        "Leader election using lease {}/{} as {}",
        pod.namespace,
        config.election_key(),
        pod.name
    );

    let sync = StatusSync::new(
        Arc::new(KubeCluster::new(client)),
        Arc::new(lease_store),
        pod,
        &config,
        StatusHooks::default(),
    )?;

    sync.run(shutdown_signal()).await?;

    let outcome = sync.shutdown().await;
    info!("Shutdown finished: {:?}", outcome);

    #[cfg(feature = "metrics")]
    tracing::debug!("Final metrics:\n{}", ingress_status_sync::metrics::encode()?);

    Ok(())
}
