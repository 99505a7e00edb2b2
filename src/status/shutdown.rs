//! Address removal when the last controller replica stops

use std::sync::Arc;

use tracing::{error, info, warn};

use super::endpoint::DesiredAddressSet;
use super::lease::Leadership;
use super::queue::SyncQueue;
use super::reconciler::Reconciler;
use super::resolver::AddressResolver;
use super::updater::{BatchReport, CancellationFlag};

/// What the shutdown sequence did about published status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    NotLeader,
    /// Status removal disabled by configuration
    SkippedByConfig,
    ResolutionFailed,
    /// The fleet is still reachable at other addresses; the next leader keeps publishing
    LeftToNextLeader(usize),
    /// Other replicas are running and one of them will be elected
    MultiplePodsRunning,
    /// Replica count could not be confirmed, status left untouched
    PodCheckFailed,
    Removed(BatchReport),
    RemovalFailed,
}

pub struct ShutdownCoordinator {
    queue: Arc<SyncQueue>,
    leadership: Arc<dyn Leadership>,
    resolver: Arc<AddressResolver>,
    reconciler: Arc<Reconciler>,
    update_status_on_shutdown: bool,
}

impl ShutdownCoordinator {
    pub fn new(
        queue: Arc<SyncQueue>,
        leadership: Arc<dyn Leadership>,
        resolver: Arc<AddressResolver>,
        reconciler: Arc<Reconciler>,
        update_status_on_shutdown: bool,
    ) -> Self {
        Self {
            queue,
            leadership,
            resolver,
            reconciler,
            update_status_on_shutdown,
        }
    }

    /// Stop periodic syncing, then clear published addresses if this is the last replica
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.reconciler.cancel_running();
        self.queue.shutdown().await;

        if !self.leadership.is_leader() {
            return ShutdownOutcome::NotLeader;
        }

        if !self.update_status_on_shutdown {
            warn!("Skipping update of status of ingress rules");
            return ShutdownOutcome::SkippedByConfig;
        }

        info!("Updating status of ingress rules (remove)");

        let addresses: DesiredAddressSet = match self.resolver.running_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                error!("Error obtaining running addresses: {}", e);
                return ShutdownOutcome::ResolutionFailed;
            }
        };

        if addresses.len() > 1 {
            info!("Leaving status update for next leader ({} addresses)", addresses.len());
            return ShutdownOutcome::LeftToNextLeader(addresses.len());
        }

        match self.resolver.is_running_multiple_pods().await {
            Ok(false) => {}
            Ok(true) => {
                info!(
                    "Skipping ingress status update \
                     (multiple pods running, another one will be elected as leader)"
                );
                return ShutdownOutcome::MultiplePodsRunning;
            }
            Err(e) => {
                warn!("Cannot count running controller pods, leaving status untouched: {}", e);
                return ShutdownOutcome::PodCheckFailed;
            }
        }

        info!("Removing address from ingress status ({:?})", addresses);
        match self
            .reconciler
            .update_status(&[], &CancellationFlag::new())
            .await
        {
            Ok(report) => ShutdownOutcome::Removed(report),
            Err(e) => {
                error!("Cannot update status due to an error: {}", e);
                ShutdownOutcome::RemovalFailed
            }
        }
    }
}
