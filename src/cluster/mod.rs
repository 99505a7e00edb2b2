//! Control-plane access used by the status sync
//!
//! The core only talks to the cluster through [`ClusterClient`] and
//! [`LeaseStore`](crate::status::LeaseStore); the kube-rs backed
//! implementations live in [`kubernetes`].

pub mod kubernetes;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;

use crate::error::Result;

pub use kubernetes::{discover_pod_info, KubeCluster, KubeLeaseStore};

/// Typed list/get/update surface over the resources the status sync reads and writes
///
/// `update_ingress_status` must apply optimistic concurrency: the write fails with
/// [`Error::UpdateConflict`](crate::Error::UpdateConflict) when the object changed
/// since the version carried by `ingress` was read.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List ingresses in one namespace, or cluster-wide when `namespace` is `None`
    async fn list_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Ingress>>;

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress>;

    /// Replace the status subresource of `ingress`
    async fn update_ingress_status(&self, ingress: &Ingress) -> Result<Ingress>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// List pods in `namespace` carrying every label of `selector`
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    async fn get_node(&self, name: &str) -> Result<Node>;
}
