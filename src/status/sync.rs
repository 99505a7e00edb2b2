//! Lifecycle surface wiring the status components together

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::cluster::ClusterClient;
use crate::config::{PodInfo, StatusSyncConfig};
use crate::error::Result;

use super::lease::{LeaderLease, LeaderState, Leadership, LeaseStore};
use super::queue::SyncQueue;
use super::reconciler::{Reconciler, StatusHooks};
use super::resolver::{AddressResolver, ResolverMode};
use super::shutdown::{ShutdownCoordinator, ShutdownOutcome};

/// Keeps the load balancer status of managed ingresses in sync with the
/// addresses the controller fleet is running at
pub struct StatusSync {
    lease: Arc<LeaderLease>,
    queue: Arc<SyncQueue>,
    reconciler: Arc<Reconciler>,
    coordinator: ShutdownCoordinator,
    update_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StatusSync {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        lease_store: Arc<dyn LeaseStore>,
        pod: PodInfo,
        config: &StatusSyncConfig,
        hooks: StatusHooks,
    ) -> Result<Self> {
        config.validate()?;

        let lease = Arc::new(LeaderLease::new(lease_store, pod.name.clone(), config.lease));
        let leadership: Arc<dyn Leadership> = lease.clone();
        let queue = Arc::new(SyncQueue::new());
        let resolver = Arc::new(AddressResolver::new(
            Arc::clone(&client),
            pod,
            ResolverMode::from_config(config),
        ));
        let reconciler = Arc::new(Reconciler::new(
            client,
            Arc::clone(&leadership),
            Arc::clone(&queue),
            Arc::clone(&resolver),
            config,
            hooks,
        ));
        let coordinator = ShutdownCoordinator::new(
            Arc::clone(&queue),
            leadership,
            resolver,
            Arc::clone(&reconciler),
            config.update_status_on_shutdown,
        );

        Ok(Self {
            lease,
            queue,
            reconciler,
            coordinator,
            update_interval: config.update_interval,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.lease.is_leader()
    }

    pub fn leader_state(&self) -> LeaderState {
        self.lease.state()
    }

    /// Ask for a resync outside the periodic schedule
    pub fn trigger(&self) -> bool {
        self.queue.enqueue()
    }

    /// Start lease competition, the periodic trigger and the queue consumer,
    /// then block until `stop` resolves
    ///
    /// Fails only when the lease store is unreachable at startup.
    pub async fn run<S>(&self, stop: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.lease.start().await?;

        {
            let mut tasks = self.tasks.lock().await;

            let queue = Arc::clone(&self.queue);
            let period = self.update_interval;
            tasks.push(tokio::spawn(async move { queue.tick_every(period).await }));

            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            tasks.push(tokio::spawn(async move {
                queue
                    .run(move |_token| {
                        let reconciler = Arc::clone(&reconciler);
                        async move { reconciler.sync().await }
                    })
                    .await
            }));
        }

        info!(
            "Status sync running as {} (update interval {:?})",
            self.lease.identity(),
            self.update_interval
        );
        stop.await;
        info!("Stop signal received");
        Ok(())
    }

    /// Stop syncing, remove published addresses when this is the last
    /// replica, and leave the election
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let outcome = self.coordinator.shutdown().await;

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!("Status sync task ended abnormally: {:?}", e);
            }
        }
        self.lease.stop().await;

        info!("Status sync stopped: {:?}", outcome);
        outcome
    }
}
