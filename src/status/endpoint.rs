//! Published endpoint descriptors and their canonical ordering

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::networking::v1::{IngressLoadBalancerIngress, IngressLoadBalancerStatus};
use k8s_openapi::api::networking::v1::{Ingress, IngressStatus};

/// Deduplicated addresses or hostnames computed once per cycle
pub type DesiredAddressSet = BTreeSet<String>;

/// One published reachable address, either an IP literal or a hostname
///
/// Field order drives the derived ordering: hostname first, then IP, both
/// compared as plain strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointDescriptor {
    pub hostname: String,
    pub ip: String,
}

impl EndpointDescriptor {
    pub fn ip(ip: impl Into<String>) -> Self {
        Self {
            hostname: String::new(),
            ip: ip.into(),
        }
    }

    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip: String::new(),
        }
    }

    /// IP descriptor when `address` parses as an IP literal, hostname otherwise
    pub fn from_address(address: &str) -> Self {
        match address.parse::<IpAddr>() {
            Ok(_) => Self::ip(address),
            Err(_) => Self::hostname(address),
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.is_empty() {
            f.write_str(&self.ip)
        } else {
            f.write_str(&self.hostname)
        }
    }
}

impl From<&IngressLoadBalancerIngress> for EndpointDescriptor {
    fn from(lb: &IngressLoadBalancerIngress) -> Self {
        Self {
            hostname: lb.hostname.clone().unwrap_or_default(),
            ip: lb.ip.clone().unwrap_or_default(),
        }
    }
}

impl From<&EndpointDescriptor> for IngressLoadBalancerIngress {
    fn from(endpoint: &EndpointDescriptor) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        IngressLoadBalancerIngress {
            hostname: non_empty(&endpoint.hostname),
            ip: non_empty(&endpoint.ip),
            ports: None,
        }
    }
}

/// Sort into the canonical published order
pub fn sort_endpoints(endpoints: &mut [EndpointDescriptor]) {
    endpoints.sort();
}

/// Convert addresses into a sorted descriptor sequence
pub fn to_status(addresses: &DesiredAddressSet) -> Vec<EndpointDescriptor> {
    let mut endpoints: Vec<EndpointDescriptor> = addresses
        .iter()
        .map(|address| EndpointDescriptor::from_address(address))
        .collect();
    sort_endpoints(&mut endpoints);
    endpoints
}

/// Endpoints currently published on `ingress`, sorted
pub fn ingress_endpoints(ingress: &Ingress) -> Vec<EndpointDescriptor> {
    let mut endpoints: Vec<EndpointDescriptor> = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|entries| entries.iter().map(EndpointDescriptor::from).collect())
        .unwrap_or_default();
    sort_endpoints(&mut endpoints);
    endpoints
}

/// Replace the published endpoints of `ingress`, keeping every other status field
pub fn set_ingress_endpoints(ingress: &mut Ingress, endpoints: &[EndpointDescriptor]) {
    let status = ingress.status.get_or_insert_with(IngressStatus::default);
    let load_balancer = status
        .load_balancer
        .get_or_insert_with(IngressLoadBalancerStatus::default);
    load_balancer.ingress = Some(endpoints.iter().map(IngressLoadBalancerIngress::from).collect());
}

/// Element-wise comparison after sorting both sides
pub fn endpoints_equal(lhs: &[EndpointDescriptor], rhs: &[EndpointDescriptor]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut lhs = lhs.to_vec();
    let mut rhs = rhs.to_vec();
    sort_endpoints(&mut lhs);
    sort_endpoints(&mut rhs);
    lhs == rhs
}

/// Render endpoints for log lines
pub fn describe(endpoints: &[EndpointDescriptor]) -> String {
    let rendered: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}
