//! Ingress status sync: publishes the addresses an ingress controller fleet
//! is reachable at into the load balancer status of its ingresses.
//!
//! Every replica competes for a lease; only the leader writes. Address
//! discovery either reads a published service or resolves the nodes the
//! controller pods run on.

pub mod cluster;
pub mod config;
pub mod error;
pub mod status;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use crate::config::{LeaseConfig, ObjectKey, PodInfo, StatusSyncConfig};
pub use crate::error::{Error, Result};
pub use crate::status::{ShutdownOutcome, StatusHooks, StatusSync};
