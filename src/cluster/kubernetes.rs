//! kube-rs implementations of the control-plane seams

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PodInfo;
use crate::error::{Error, Result};
use crate::status::{LeaseRecord, LeaseStore};

use super::ClusterClient;

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Ingress>> {
        let api: Api<Ingress> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, "Ingress", namespace, name))
    }

    async fn update_ingress_status(&self, ingress: &Ingress) -> Result<Ingress> {
        let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
        let name = ingress.name_any();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);

        // The carried resourceVersion makes the API server reject stale writes.
        let data = serde_json::to_vec(ingress)?;
        api.replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(e, "Ingress", &namespace, &name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, "Service", namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector(labels));
        let pods = api.list(&lp).await?;
        Ok(pods.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, "Node", "", name))
    }
}

/// [`LeaseStore`] over a `coordination.k8s.io/v1` Lease
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(lease_spec(record)),
        }
    }

    fn lease_error(&self, err: kube::Error) -> Error {
        match Error::from_kube(err, "Lease", &self.namespace, &self.name) {
            conflict @ Error::UpdateConflict { .. } => conflict,
            other => Error::LeaseError(other.to_string()),
        }
    }
}

pub(crate) fn lease_spec(record: &LeaseRecord) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(record.holder_identity.clone()),
        acquire_time: Some(MicroTime(record.acquire_time)),
        renew_time: Some(MicroTime(record.renew_time)),
        lease_duration_seconds: Some(
            i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
        ),
        lease_transitions: Some(record.lease_transitions),
        ..Default::default()
    }
}

/// Missing spec fields read as an unheld, already expired lease
pub(crate) fn lease_record(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    let renew_time = spec.renew_time.map(|t| t.0).unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity.unwrap_or_default(),
        acquire_time: spec.acquire_time.map(|t| t.0).unwrap_or(renew_time),
        renew_time,
        lease_duration: Duration::from_secs(
            spec.lease_duration_seconds.unwrap_or(0).max(0) as u64,
        ),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.resource_version(),
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<LeaseRecord>> {
        let lease = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| self.lease_error(e))?;
        Ok(lease.as_ref().map(lease_record))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let mut lease = self.to_lease(record);
        lease.metadata.resource_version = None;
        let created = self
            .api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| self.lease_error(e))?;
        Ok(lease_record(&created))
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        if record.resource_version.is_none() {
            return Err(Error::LeaseError(format!(
                "cannot replace lease {} without a resource version",
                self.describe()
            )));
        }
        let replaced = self
            .api
            .replace(&self.name, &PostParams::default(), &self.to_lease(record))
            .await
            .map_err(|e| self.lease_error(e))?;
        debug!("Renewed lease {} for {}", self.describe(), record.holder_identity);
        Ok(lease_record(&replaced))
    }
}

/// Identify the pod this process runs in
///
/// The name comes from `POD_NAME`, falling back to the hostname; the
/// namespace from `POD_NAMESPACE`, falling back to the client default.
pub async fn discover_pod_info(client: &Client) -> Result<PodInfo> {
    let name = match std::env::var("POD_NAME") {
        Ok(name) if !name.is_empty() => name,
        _ => hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .ok_or_else(|| {
                Error::ConfigError("POD_NAME is not set and the hostname is unreadable".to_string())
            })?,
    };
    let namespace = std::env::var("POD_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| client.default_namespace().to_string());

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pod = pods.get_opt(&name).await?.ok_or_else(|| {
        Error::ConfigError(format!(
            "pod {}/{} not found; set POD_NAME and POD_NAMESPACE",
            namespace, name
        ))
    })?;

    let labels = pod.labels().clone();
    if labels.is_empty() {
        warn!(
            "Pod {}/{} has no labels, every pod in the namespace counts as a sibling",
            namespace, name
        );
    }
    info!("Running as pod {}/{}", namespace, name);
    Ok(PodInfo {
        name,
        namespace,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record() -> LeaseRecord {
        let acquired = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        LeaseRecord {
            holder_identity: "haproxy-ingress-0".to_string(),
            acquire_time: acquired,
            renew_time: acquired + chrono::Duration::seconds(20),
            lease_duration: Duration::from_secs(30),
            lease_transitions: 3,
            resource_version: Some("42".to_string()),
        }
    }

    #[test]
    fn test_lease_spec_carries_record_fields() {
        let spec = lease_spec(&record());
        assert_eq!(spec.holder_identity.as_deref(), Some("haproxy-ingress-0"));
        assert_eq!(spec.lease_duration_seconds, Some(30));
        assert_eq!(spec.lease_transitions, Some(3));
        assert_eq!(
            spec.renew_time.unwrap().0,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 20).unwrap()
        );
    }

    #[test]
    fn test_lease_record_reads_back_spec_and_version() {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some("ingress-controller-leader-haproxy".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(lease_spec(&record())),
        };
        assert_eq!(lease_record(&lease), record());
    }

    #[test]
    fn test_empty_lease_reads_as_unheld() {
        let lease = Lease {
            metadata: ObjectMeta {
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: None,
        };
        let record = lease_record(&lease);
        assert!(record.holder_identity.is_empty());
        assert_eq!(record.lease_duration, Duration::ZERO);
        assert_eq!(record.lease_transitions, 0);
        assert_eq!(record.resource_version.as_deref(), Some("7"));
    }

    #[test]
    fn test_selector_joins_labels() {
        let labels: BTreeMap<String, String> = [
            ("app".to_string(), "ingress".to_string()),
            ("run".to_string(), "haproxy-ingress".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(selector(&labels), "app=ingress,run=haproxy-ingress");
        assert_eq!(selector(&BTreeMap::new()), "");
    }
}
