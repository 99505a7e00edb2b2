//! In-memory control plane used by the status tests

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Node, NodeAddress, NodeStatus, Pod, PodSpec,
    PodStatus, Service, ServiceSpec, ServiceStatus,
};
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::cluster::ClusterClient;
use crate::config::{ObjectKey, PodInfo};
use crate::error::{Error, Result};

use super::endpoint::{set_ingress_endpoints, EndpointDescriptor};
use super::lease::{LeaseRecord, LeaseStore, Leadership};

pub const CONTROLLER_NAMESPACE: &str = "ingress";

// -------------------------------------------------------------------------
// Object builders
// -------------------------------------------------------------------------

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

pub fn controller_labels() -> BTreeMap<String, String> {
    [("run".to_string(), "haproxy-ingress".to_string())]
        .into_iter()
        .collect()
}

pub fn this_pod() -> PodInfo {
    PodInfo {
        name: "haproxy-ingress-0".to_string(),
        namespace: CONTROLLER_NAMESPACE.to_string(),
        labels: controller_labels(),
    }
}

pub fn make_ingress(namespace: &str, name: &str, published: &[EndpointDescriptor]) -> Ingress {
    let mut ingress = Ingress {
        metadata: meta(namespace, name),
        ..Default::default()
    };
    if !published.is_empty() {
        set_ingress_endpoints(&mut ingress, published);
    }
    ingress
}

pub fn make_classed_ingress(namespace: &str, name: &str, class: &str) -> Ingress {
    Ingress {
        metadata: meta(namespace, name),
        spec: Some(IngressSpec {
            ingress_class_name: Some(class.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_pod(name: &str, node: Option<&str>, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            labels: Some(controller_labels()),
            ..meta(CONTROLLER_NAMESPACE, name)
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn make_node(name: &str, internal_ip: Option<&str>, external_ip: Option<&str>) -> Node {
    let mut addresses = Vec::new();
    if let Some(ip) = internal_ip {
        addresses.push(NodeAddress {
            address: ip.to_string(),
            type_: "InternalIP".to_string(),
        });
    }
    if let Some(ip) = external_ip {
        addresses.push(NodeAddress {
            address: ip.to_string(),
            type_: "ExternalIP".to_string(),
        });
    }
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(addresses),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `lb` entries are (ip, hostname) pairs
pub fn make_service(
    namespace: &str,
    name: &str,
    lb: &[(Option<&str>, Option<&str>)],
    external_ips: &[&str],
) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            external_ips: Some(external_ips.iter().map(|ip| ip.to_string()).collect()),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(
                    lb.iter()
                        .map(|(ip, hostname)| LoadBalancerIngress {
                            ip: ip.map(str::to_string),
                            hostname: hostname.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
            }),
            ..Default::default()
        }),
    }
}

fn key_of(namespace: Option<String>, name: String) -> ObjectKey {
    ObjectKey::new(namespace.unwrap_or_default(), name)
}

// -------------------------------------------------------------------------
// FakeCluster
// -------------------------------------------------------------------------

#[derive(Default)]
struct ClusterState {
    ingresses: BTreeMap<ObjectKey, Ingress>,
    services: BTreeMap<ObjectKey, Service>,
    pods: Vec<Pod>,
    nodes: BTreeMap<String, Node>,
    next_version: u64,
    conflict_on: HashSet<ObjectKey>,
    fail_services: bool,
    fail_pods: bool,
    fail_ingress_list: bool,
    written: Vec<ObjectKey>,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Control plane with resource-version conflicts and fault injection
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    ingress_reads: AtomicUsize,
    reads_total: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn add_ingress(&self, mut ingress: Ingress) {
        let mut state = self.lock();
        ingress.metadata.resource_version = Some(state.bump());
        let key = key_of(ingress.namespace(), ingress.name_any());
        state.ingresses.insert(key, ingress);
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Ingress {
        self.lock().ingresses[&ObjectKey::new(namespace, name)].clone()
    }

    /// Change an ingress the way another writer would
    pub fn edit_ingress(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut Ingress)) {
        let mut state = self.lock();
        let version = state.bump();
        let ingress = state
            .ingresses
            .get_mut(&ObjectKey::new(namespace, name))
            .unwrap();
        edit(ingress);
        ingress.metadata.resource_version = Some(version);
    }

    pub fn add_service(&self, service: Service) {
        let key = key_of(service.namespace(), service.name_any());
        self.lock().services.insert(key, service);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.push(pod);
    }

    pub fn remove_pod(&self, name: &str) {
        self.lock().pods.retain(|p| p.name_any() != name);
    }

    pub fn add_node(&self, node: Node) {
        self.lock().nodes.insert(node.name_any(), node);
    }

    /// Every status write to this ingress loses an optimistic-concurrency race
    pub fn conflict_on(&self, namespace: &str, name: &str) {
        self.lock().conflict_on.insert(ObjectKey::new(namespace, name));
    }

    pub fn fail_service_reads(&self, fail: bool) {
        self.lock().fail_services = fail;
    }

    pub fn fail_pod_lists(&self, fail: bool) {
        self.lock().fail_pods = fail;
    }

    pub fn fail_ingress_list(&self, fail: bool) {
        self.lock().fail_ingress_list = fail;
    }

    /// Successful status writes, in order
    pub fn written(&self) -> Vec<ObjectKey> {
        self.lock().written.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.lock().written.len()
    }

    pub fn ingress_reads(&self) -> usize {
        self.ingress_reads.load(Ordering::SeqCst)
    }

    /// Every read-type call: lists and gets of any kind
    pub fn reads_total(&self) -> usize {
        self.reads_total.load(Ordering::SeqCst)
    }

    fn count_read(&self) {
        self.reads_total.fetch_add(1, Ordering::SeqCst);
    }
}

fn unavailable(what: &str) -> Error {
    Error::ConfigError(format!("{} unavailable (injected)", what))
}

fn not_found(kind: &str, namespace: &str, name: &str) -> Error {
    Error::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Ingress>> {
        self.count_read();
        let state = self.lock();
        if state.fail_ingress_list {
            return Err(unavailable("ingress list"));
        }
        Ok(state
            .ingresses
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, ingress)| ingress.clone())
            .collect())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress> {
        self.count_read();
        self.ingress_reads.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .ingresses
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("Ingress", namespace, name))
    }

    async fn update_ingress_status(&self, ingress: &Ingress) -> Result<Ingress> {
        let key = key_of(ingress.namespace(), ingress.name_any());
        let mut state = self.lock();
        let conflict = || Error::UpdateConflict {
            kind: "Ingress".to_string(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        };

        if state.conflict_on.contains(&key) {
            return Err(conflict());
        }
        let stored_version = match state.ingresses.get(&key) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(not_found("Ingress", &key.namespace, &key.name)),
        };
        if stored_version != ingress.metadata.resource_version {
            return Err(conflict());
        }

        let version = state.bump();
        let stored = state.ingresses.get_mut(&key).unwrap();
        stored.status = ingress.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.written.push(key);
        Ok(updated)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.count_read();
        let state = self.lock();
        if state.fail_services {
            return Err(unavailable("service"));
        }
        state
            .services
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("Service", namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        self.count_read();
        let state = self.lock();
        if state.fail_pods {
            return Err(unavailable("pod list"));
        }
        Ok(state
            .pods
            .iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| {
                let labels = pod.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.count_read();
        self.lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("Node", "", name))
    }
}

// -------------------------------------------------------------------------
// FakeLeaseStore
// -------------------------------------------------------------------------

#[derive(Default)]
struct LeaseState {
    record: Option<LeaseRecord>,
    version: u64,
}

/// Lease store with resource-version conflicts and an outage switch
#[derive(Default)]
pub struct FakeLeaseStore {
    state: Mutex<LeaseState>,
    unavailable: AtomicBool,
}

impl FakeLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        self.state.lock().unwrap().record.clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::LeaseError("lease store unreachable (injected)".to_string()));
        }
        Ok(())
    }

    fn conflict() -> Error {
        Error::UpdateConflict {
            kind: "Lease".to_string(),
            name: "status-leader".to_string(),
            namespace: CONTROLLER_NAMESPACE.to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for FakeLeaseStore {
    fn describe(&self) -> String {
        format!("{}/status-leader", CONTROLLER_NAMESPACE)
    }

    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        if state.record.is_some() {
            return Err(Self::conflict());
        }
        state.version += 1;
        let stored = LeaseRecord {
            resource_version: Some(state.version.to_string()),
            ..record.clone()
        };
        state.record = Some(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let current_version = state
            .record
            .as_ref()
            .and_then(|r| r.resource_version.clone());
        if current_version.is_none() || current_version != record.resource_version {
            return Err(Self::conflict());
        }
        state.version += 1;
        let stored = LeaseRecord {
            resource_version: Some(state.version.to_string()),
            ..record.clone()
        };
        state.record = Some(stored.clone());
        Ok(stored)
    }
}

// -------------------------------------------------------------------------
// Leadership stub
// -------------------------------------------------------------------------

/// Leadership belief flipped directly by tests
#[derive(Default)]
pub struct StaticLeadership(AtomicBool);

impl StaticLeadership {
    pub fn new(leader: bool) -> Self {
        Self(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

impl Leadership for StaticLeadership {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
