//! Runtime configuration for the status sync
//!
//! Values are normally filled in from CLI flags by the host binary; the
//! defaults match a single-class controller deployed with a 30s lease.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default period between two status reconciliation cycles
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Default lease time-to-live
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default number of ingresses updated concurrently
pub const DEFAULT_UPDATE_CONCURRENCY: usize = 10;

/// Namespace/name pair identifying a Kubernetes object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`, or a bare `name` living in `default_namespace`
    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split('/').collect();
        let (namespace, name) = match parts.as_slice() {
            [name] => (default_namespace, *name),
            [namespace, name] => (*namespace, *name),
            _ => {
                return Err(Error::ConfigError(format!(
                    "invalid object reference '{}': expected namespace/name",
                    value
                )))
            }
        };

        if namespace.is_empty() || name.is_empty() {
            return Err(Error::ConfigError(format!(
                "invalid object reference '{}': empty namespace or name",
                value
            )));
        }

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Timing parameters of the leader lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a record stays valid without renewal
    pub lease_duration: Duration,
}

impl LeaseConfig {
    pub fn new(lease_duration: Duration) -> Self {
        Self { lease_duration }
    }

    /// A leader that could not renew within this window stops believing it leads
    pub fn renew_deadline(&self) -> Duration {
        self.lease_duration / 2
    }

    /// Delay between two acquire/renew attempts
    pub fn retry_period(&self) -> Duration {
        self.lease_duration / 4
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DURATION)
    }
}

/// Identity of the pod running this controller replica
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

/// Configuration for the status sync
#[derive(Clone, Debug)]
pub struct StatusSyncConfig {
    /// Base name of the election lease
    pub election_id: String,

    /// Ingress class served by this controller
    pub ingress_class: String,

    /// Also manage ingresses that carry no class at all
    pub watch_ingress_without_class: bool,

    /// Service whose load balancer addresses are published, if any
    pub publish_service: Option<ObjectKey>,

    /// Restrict managed ingresses to one namespace
    pub watch_namespace: Option<String>,

    /// Publish node internal IPs in self-discovery mode
    pub use_node_internal_ip: bool,

    /// Remove published addresses when the last replica stops
    pub update_status_on_shutdown: bool,

    pub update_interval: Duration,

    pub lease: LeaseConfig,

    /// Upper bound of concurrent ingress status updates
    pub update_concurrency: usize,
}

impl StatusSyncConfig {
    /// Name of the lease shared by every replica of one ingress class
    pub fn election_key(&self) -> String {
        format!("{}-{}", self.election_id, self.ingress_class)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_id.is_empty() {
            return Err(Error::ConfigError("election id must not be empty".to_string()));
        }
        if self.update_concurrency == 0 {
            return Err(Error::ConfigError(
                "update concurrency must be at least 1".to_string(),
            ));
        }
        if self.update_interval.is_zero() {
            return Err(Error::ConfigError(
                "update interval must be greater than zero".to_string(),
            ));
        }
        if self.lease.retry_period().is_zero() {
            return Err(Error::ConfigError(format!(
                "lease duration {:?} is too short",
                self.lease.lease_duration
            )));
        }
        Ok(())
    }
}

impl Default for StatusSyncConfig {
    fn default() -> Self {
        Self {
            election_id: "ingress-controller-leader".to_string(),
            ingress_class: "haproxy".to_string(),
            watch_ingress_without_class: true,
            publish_service: None,
            watch_namespace: None,
            use_node_internal_ip: false,
            update_status_on_shutdown: true,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            lease: LeaseConfig::default(),
            update_concurrency: DEFAULT_UPDATE_CONCURRENCY,
        }
    }
}
