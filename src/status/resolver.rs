//! Discovery of the addresses the controller fleet is reachable at

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::cluster::ClusterClient;
use crate::config::{ObjectKey, PodInfo, StatusSyncConfig};
use crate::error::{Error, Result};

use super::endpoint::DesiredAddressSet;

const NODE_INTERNAL_IP: &str = "InternalIP";
const NODE_EXTERNAL_IP: &str = "ExternalIP";

/// Where running addresses come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolverMode {
    /// Addresses of a published service's load balancer and external IPs
    PublishService(ObjectKey),
    /// Node addresses of every replica pod
    SelfDiscovery { use_node_internal_ip: bool },
}

impl ResolverMode {
    /// A configured publish service always wins over self discovery
    pub fn from_config(config: &StatusSyncConfig) -> Self {
        match &config.publish_service {
            Some(service) => ResolverMode::PublishService(service.clone()),
            None => ResolverMode::SelfDiscovery {
                use_node_internal_ip: config.use_node_internal_ip,
            },
        }
    }
}

pub struct AddressResolver {
    client: Arc<dyn ClusterClient>,
    pod: PodInfo,
    mode: ResolverMode,
}

impl AddressResolver {
    pub fn new(client: Arc<dyn ClusterClient>, pod: PodInfo, mode: ResolverMode) -> Self {
        Self { client, pod, mode }
    }

    /// Addresses and/or hostnames where the controller is currently reachable
    ///
    /// Any read failure is reported as [`Error::ResolutionError`]; no partial
    /// set is ever returned.
    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn running_addresses(&self) -> Result<DesiredAddressSet> {
        let result = match &self.mode {
            ResolverMode::PublishService(key) => self.service_addresses(key).await,
            ResolverMode::SelfDiscovery {
                use_node_internal_ip,
            } => self.pod_node_addresses(*use_node_internal_ip).await,
        };
        result.map_err(|e| match e {
            Error::ResolutionError(_) => e,
            other => Error::ResolutionError(other.to_string()),
        })
    }

    /// True when another replica besides this pod is still running
    pub async fn is_running_multiple_pods(&self) -> Result<bool> {
        let pods = self.sibling_pods().await?;
        let running = pods.iter().filter(|pod| is_active(pod)).count();
        debug!("{} controller pods running", running);
        Ok(running > 1)
    }

    async fn service_addresses(&self, key: &ObjectKey) -> Result<DesiredAddressSet> {
        let service = self.client.get_service(&key.namespace, &key.name).await?;
        Ok(service_addresses(&service))
    }

    async fn pod_node_addresses(&self, use_node_internal_ip: bool) -> Result<DesiredAddressSet> {
        let pods = self.sibling_pods().await?;

        let mut addresses = DesiredAddressSet::new();
        for pod in pods.iter().filter(|pod| is_active(pod)) {
            let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
                debug!("Pod {} is not scheduled yet, skipping", pod.name_any());
                continue;
            };
            let node = self.client.get_node(node_name).await?;
            match node_address(&node, use_node_internal_ip) {
                Some(address) => {
                    addresses.insert(address);
                }
                None => debug!("Node {} has no usable address, skipping", node_name),
            }
        }
        Ok(addresses)
    }

    async fn sibling_pods(&self) -> Result<Vec<Pod>> {
        self.client
            .list_pods(&self.pod.namespace, &self.pod.labels)
            .await
    }
}

/// Load balancer hostnames (or IPs when no hostname) plus external IPs of `service`
pub fn service_addresses(service: &Service) -> DesiredAddressSet {
    let mut addresses = DesiredAddressSet::new();

    let lb_entries = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    for entry in lb_entries.into_iter().flatten() {
        let address = entry
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .or_else(|| entry.ip.as_deref().filter(|ip| !ip.is_empty()));
        if let Some(address) = address {
            addresses.insert(address.to_string());
        }
    }

    let external_ips = service.spec.as_ref().and_then(|s| s.external_ips.as_ref());
    addresses.extend(
        external_ips
            .into_iter()
            .flatten()
            .filter(|ip| !ip.is_empty())
            .cloned(),
    );

    addresses
}

/// Address of `node` to publish
///
/// With `use_internal_ip` the InternalIP is used; otherwise the ExternalIP,
/// falling back to the InternalIP for nodes without one.
pub fn node_address(node: &Node, use_internal_ip: bool) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    let find = |kind: &str| {
        addresses
            .iter()
            .find(|a| a.type_ == kind && !a.address.is_empty())
            .map(|a| a.address.clone())
    };

    if use_internal_ip {
        find(NODE_INTERNAL_IP)
    } else {
        find(NODE_EXTERNAL_IP).or_else(|| find(NODE_INTERNAL_IP))
    }
}

/// Pods that finished are not replicas anymore
fn is_active(pod: &Pod) -> bool {
    !matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}
