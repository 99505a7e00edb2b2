//! Ingress status synchronization
//!
//! Publishes the addresses the controller fleet is reachable at into the
//! `status.loadBalancer` of every managed ingress. Only the elected leader
//! writes; cycles are serialized through a single-consumer queue and each
//! cycle diffs the freshly read status before writing.

pub mod endpoint;
pub mod lease;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod shutdown;
mod sync;
pub mod updater;

#[cfg(test)]
mod fake;

pub use endpoint::{DesiredAddressSet, EndpointDescriptor};
pub use lease::{LeaderEvent, LeaderLease, LeaderState, Leadership, LeaseRecord, LeaseStore};
pub use queue::{SyncQueue, SyncToken};
pub use reconciler::{
    IngressClassFilter, IngressClassMatcher, Reconciler, StatusHooks, StatusOverride,
};
pub use resolver::{AddressResolver, ResolverMode};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
pub use sync::StatusSync;
pub use updater::{BatchReport, BatchUpdater, CancellationFlag, StatusUpdate, UpdateOutcome};
