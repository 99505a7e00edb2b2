//! Bounded-concurrency diff-and-write of ingress status

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::config::ObjectKey;
use crate::error::Result;

use super::endpoint::{
    describe, endpoints_equal, ingress_endpoints, set_ingress_endpoints, sort_endpoints,
    EndpointDescriptor,
};

/// Cooperative cancellation shared by the workers of a batch
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Desired endpoints for one ingress
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub key: ObjectKey,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// Published status already matched
    Unchanged,
    /// Not started because the batch was cancelled
    Skipped,
    Failed(String),
}

impl UpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Updated => "updated",
            UpdateOutcome::Unchanged => "unchanged",
            UpdateOutcome::Skipped => "skipped",
            UpdateOutcome::Failed(_) => "failed",
        }
    }
}

/// Per-ingress results of one batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub updated: Vec<ObjectKey>,
    pub unchanged: Vec<ObjectKey>,
    pub skipped: Vec<ObjectKey>,
    pub failed: Vec<(ObjectKey, String)>,
}

impl BatchReport {
    fn record(&mut self, key: ObjectKey, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Updated => self.updated.push(key),
            UpdateOutcome::Unchanged => self.unchanged.push(key),
            UpdateOutcome::Skipped => self.skipped.push(key),
            UpdateOutcome::Failed(reason) => self.failed.push((key, reason)),
        }
    }

    pub fn total(&self) -> usize {
        self.updated.len() + self.unchanged.len() + self.skipped.len() + self.failed.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub struct BatchUpdater {
    client: Arc<dyn ClusterClient>,
    concurrency: usize,
}

impl BatchUpdater {
    pub fn new(client: Arc<dyn ClusterClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    /// Apply every update with at most `concurrency` in flight, waiting for all of them
    ///
    /// Updates not yet started when `cancel` is set are skipped. Failures are
    /// logged and reported, never retried here.
    pub async fn run(&self, updates: Vec<StatusUpdate>, cancel: &CancellationFlag) -> BatchReport {
        let outcomes: Vec<(ObjectKey, UpdateOutcome)> = stream::iter(updates)
            .map(|update| self.apply(update, cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (key, outcome) in outcomes {
            #[cfg(feature = "metrics")]
            crate::metrics::record_status_update(outcome.as_str());
            report.record(key, outcome);
        }
        report
    }

    async fn apply(
        &self,
        update: StatusUpdate,
        cancel: &CancellationFlag,
    ) -> (ObjectKey, UpdateOutcome) {
        if cancel.is_cancelled() {
            debug!("Skipping status update of {} (cancelled)", update.key);
            return (update.key, UpdateOutcome::Skipped);
        }

        let outcome = match self.update_one(&update).await {
            Ok(true) => UpdateOutcome::Updated,
            Ok(false) => UpdateOutcome::Unchanged,
            Err(e) if e.is_conflict() => {
                warn!("Ingress {} changed during status update: {}", update.key, e);
                UpdateOutcome::Failed(e.to_string())
            }
            Err(e) if e.is_not_found() => {
                warn!("Ingress {} was deleted before its status update", update.key);
                UpdateOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!("Error updating status of ingress {}: {}", update.key, e);
                UpdateOutcome::Failed(e.to_string())
            }
        };
        (update.key, outcome)
    }

    /// Returns whether a write was issued
    #[instrument(skip(self, update), fields(ingress = %update.key))]
    async fn update_one(&self, update: &StatusUpdate) -> Result<bool> {
        let key = &update.key;
        let mut current = self.client.get_ingress(&key.namespace, &key.name).await?;

        let mut desired = update.endpoints.clone();
        sort_endpoints(&mut desired);
        let published = ingress_endpoints(&current);

        if endpoints_equal(&desired, &published) {
            debug!("Skipping update of ingress {} (no change)", key);
            return Ok(false);
        }

        info!(
            "Updating ingress {} status from {} to {}",
            key,
            describe(&published),
            describe(&desired)
        );
        set_ingress_endpoints(&mut current, &desired);
        self.client.update_ingress_status(&current).await?;
        Ok(true)
    }
}
