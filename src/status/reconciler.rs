//! One status reconciliation cycle
//!
//! Resolves the running addresses and hands the resulting endpoints for
//! every managed ingress to the [`BatchUpdater`].

use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::{ObjectKey, StatusSyncConfig};
use crate::error::Result;

use super::endpoint::{to_status, EndpointDescriptor};
use super::lease::Leadership;
use super::queue::SyncQueue;
use super::resolver::AddressResolver;
use super::updater::{BatchReport, BatchUpdater, CancellationFlag, StatusUpdate};

/// Legacy annotation naming the class of an ingress
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Decides whether an ingress belongs to this controller
pub trait IngressClassFilter: Send + Sync {
    fn is_managed(&self, ingress: &Ingress) -> bool;
}

/// Per-ingress replacement of the computed endpoints
pub trait StatusOverride: Send + Sync {
    /// Endpoints to publish for `ingress`; `None` or empty keeps the computed ones
    fn endpoints_for(&self, ingress: &Ingress) -> Option<Vec<EndpointDescriptor>>;
}

/// Matches the class annotation, or `spec.ingressClassName` when the annotation is absent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressClassMatcher {
    pub class: String,
    /// Manage ingresses that name no class at all
    pub accept_unclassified: bool,
}

impl IngressClassMatcher {
    pub fn from_config(config: &StatusSyncConfig) -> Self {
        Self {
            class: config.ingress_class.clone(),
            accept_unclassified: config.watch_ingress_without_class,
        }
    }
}

impl IngressClassFilter for IngressClassMatcher {
    fn is_managed(&self, ingress: &Ingress) -> bool {
        let annotation = ingress
            .annotations()
            .get(INGRESS_CLASS_ANNOTATION)
            .map(String::as_str);
        let class_name = ingress
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.as_deref());

        match annotation.or(class_name) {
            Some(class) => class == self.class,
            None => self.accept_unclassified,
        }
    }
}

/// Optional collaborators plugged into the reconciler
#[derive(Clone, Default)]
pub struct StatusHooks {
    /// Defaults to an [`IngressClassMatcher`] built from the configuration
    pub class_filter: Option<Arc<dyn IngressClassFilter>>,
    pub status_override: Option<Arc<dyn StatusOverride>>,
}

pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    leadership: Arc<dyn Leadership>,
    queue: Arc<SyncQueue>,
    resolver: Arc<AddressResolver>,
    updater: BatchUpdater,
    class_filter: Arc<dyn IngressClassFilter>,
    status_override: Option<Arc<dyn StatusOverride>>,
    watch_namespace: Option<String>,
    /// Set once on shutdown; aborts the remaining work of the running cycle
    cancel: CancellationFlag,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        leadership: Arc<dyn Leadership>,
        queue: Arc<SyncQueue>,
        resolver: Arc<AddressResolver>,
        config: &StatusSyncConfig,
        hooks: StatusHooks,
    ) -> Self {
        let class_filter = hooks
            .class_filter
            .unwrap_or_else(|| Arc::new(IngressClassMatcher::from_config(config)));
        Self {
            updater: BatchUpdater::new(Arc::clone(&client), config.update_concurrency),
            client,
            leadership,
            queue,
            resolver,
            class_filter,
            status_override: hooks.status_override,
            watch_namespace: config.watch_namespace.clone(),
            cancel: CancellationFlag::new(),
        }
    }

    /// Run one cycle for a dequeued token
    ///
    /// Shutdown and non-leadership are successful no-ops. A resolution failure
    /// ends the cycle before any write; per-ingress failures only get logged.
    pub async fn sync(&self) -> Result<()> {
        if self.queue.is_shutting_down() {
            debug!("Skipping ingress status update (shutting down in progress)");
            record_cycle("shutting_down");
            return Ok(());
        }

        if !self.leadership.is_leader() {
            debug!("Skipping ingress status update (not the current leader)");
            record_cycle("not_leader");
            return Ok(());
        }

        let addresses = match self.resolver.running_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                record_cycle("resolution_failed");
                return Err(e);
            }
        };
        let endpoints = to_status(&addresses);

        let result = self.update_status(&endpoints, &self.cancel).await;
        record_cycle(if result.is_ok() { "completed" } else { "failed" });
        result.map(|_| ())
    }

    /// Publish `endpoints` on every managed ingress
    pub async fn update_status(
        &self,
        endpoints: &[EndpointDescriptor],
        cancel: &CancellationFlag,
    ) -> Result<BatchReport> {
        let ingresses = self
            .client
            .list_ingresses(self.watch_namespace.as_deref())
            .await?;

        let updates: Vec<StatusUpdate> = ingresses
            .iter()
            .filter(|ingress| self.class_filter.is_managed(ingress))
            .map(|ingress| StatusUpdate {
                key: ObjectKey::new(
                    ingress.namespace().unwrap_or_else(|| "default".to_string()),
                    ingress.name_any(),
                ),
                endpoints: self.endpoints_for(ingress, endpoints),
            })
            .collect();

        let report = self.updater.run(updates, cancel).await;
        if report.has_failures() {
            for (key, reason) in &report.failed {
                warn!("Status of ingress {} not updated: {}", key, reason);
            }
        }
        info!(
            "Ingress status sync finished: {} updated, {} unchanged, {} skipped, {} failed",
            report.updated.len(),
            report.unchanged.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Abort the unstarted updates of the running cycle and of any later one
    pub fn cancel_running(&self) {
        self.cancel.cancel();
    }

    fn endpoints_for(
        &self,
        ingress: &Ingress,
        computed: &[EndpointDescriptor],
    ) -> Vec<EndpointDescriptor> {
        self.status_override
            .as_ref()
            .and_then(|hook| hook.endpoints_for(ingress))
            .filter(|custom| !custom.is_empty())
            .unwrap_or_else(|| computed.to_vec())
    }
}

#[cfg(feature = "metrics")]
fn record_cycle(outcome: &str) {
    crate::metrics::record_cycle(outcome);
}

#[cfg(not(feature = "metrics"))]
fn record_cycle(_outcome: &str) {}
