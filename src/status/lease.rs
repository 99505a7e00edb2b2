//! Leader election over a lease record with optimistic concurrency
//!
//! Every replica runs a [`LeaderLease`] against the same record. A replica
//! leads while it keeps renewing the record; followers take the record over
//! once they have watched it stay unchanged for a full lease duration. Expiry
//! is measured against the local clock at the moment a record version was
//! first observed, never against the timestamps written by other replicas.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::error::{Error, Result};

/// Snapshot of the election record as persisted in the lease store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder; empty once the holder released the lease
    pub holder_identity: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub lease_duration: Duration,
    pub lease_transitions: i32,
    /// Opaque store version used for optimistic concurrency, `None` before creation
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// A fresh record held by `identity`
    pub fn held_by(identity: &str, now: DateTime<Utc>, lease_duration: Duration) -> Self {
        Self {
            holder_identity: identity.to_string(),
            acquire_time: now,
            renew_time: now,
            lease_duration,
            lease_transitions: 0,
            resource_version: None,
        }
    }

    fn version_key(&self) -> String {
        match &self.resource_version {
            Some(version) => version.clone(),
            None => format!("{}@{}", self.holder_identity, self.renew_time.to_rfc3339()),
        }
    }
}

/// Remote lock backing the election
///
/// `create` fails with [`Error::UpdateConflict`] when the record already exists and
/// `update` fails with it when the record changed since `record.resource_version`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Human readable lock name, for logs
    fn describe(&self) -> String;

    async fn get(&self) -> Result<Option<LeaseRecord>>;

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord>;

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord>;
}

/// Synchronous view of the leadership belief, read at every point of use
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Election state of one replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// No holder observed yet
    Candidate,
    Leader,
    Follower { leader: String },
}

/// Diagnostics emitted on state transitions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderEvent {
    StartedLeading,
    StoppedLeading,
    NewLeader(String),
}

impl LeaderState {
    /// Events implied by moving from `self` to `next`
    pub fn transition_events(&self, next: &LeaderState) -> Vec<LeaderEvent> {
        let mut events = Vec::new();
        match (self, next) {
            (LeaderState::Leader, LeaderState::Leader) => {}
            (_, LeaderState::Leader) => events.push(LeaderEvent::StartedLeading),
            (LeaderState::Leader, _) => events.push(LeaderEvent::StoppedLeading),
            _ => {}
        }
        if let LeaderState::Follower { leader } = next {
            let known = match self {
                LeaderState::Follower { leader: previous } => previous == leader,
                _ => false,
            };
            if !known {
                events.push(LeaderEvent::NewLeader(leader.clone()));
            }
        }
        events
    }
}

#[derive(Clone, Debug)]
struct Belief {
    state: LeaderState,
    /// Local time of the last successful acquire or renew
    renewed_at: Option<Instant>,
}

struct Observed {
    version: String,
    at: Instant,
}

enum Attempt {
    Leading,
    HeldBy(String),
    Contended,
}

struct LeaseShared {
    store: Arc<dyn LeaseStore>,
    identity: String,
    config: LeaseConfig,
    belief: watch::Sender<Belief>,
    observed: Mutex<Option<Observed>>,
}

/// Background participant in the leader election
pub struct LeaderLease {
    shared: Arc<LeaseShared>,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderLease {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        identity: impl Into<String>,
        config: LeaseConfig,
    ) -> Self {
        let (belief, _) = watch::channel(Belief {
            state: LeaderState::Candidate,
            renewed_at: None,
        });
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(LeaseShared {
                store,
                identity: identity.into(),
                config,
                belief,
                observed: Mutex::new(None),
            }),
            stop_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Current election state; diagnostics only
    pub fn state(&self) -> LeaderState {
        self.shared.belief.borrow().state.clone()
    }

    /// Probe the store, then compete for the lease in the background
    ///
    /// Fails with [`Error::LeaseError`] when the store cannot be read at all.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        self.shared.store.get().await.map_err(|e| {
            Error::LeaseError(format!(
                "cannot read lease {}: {}",
                self.shared.store.describe(),
                e
            ))
        })?;

        info!(
            "Starting leader election for {} as {}",
            self.shared.store.describe(),
            self.shared.identity
        );
        let shared = Arc::clone(&self.shared);
        let stop = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(shared.run(stop)));
        Ok(())
    }

    /// Stop competing; a current leader releases the record on its way out
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Leader election task ended abnormally: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
impl LeaderLease {
    /// End the election task without releasing the record, as a killed process would
    pub(crate) async fn crash(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

impl Leadership for LeaderLease {
    fn is_leader(&self) -> bool {
        let belief = self.shared.belief.borrow();
        belief.state == LeaderState::Leader
            && belief
                .renewed_at
                .map(|at| at.elapsed() < self.shared.config.renew_deadline())
                .unwrap_or(false)
    }
}

impl LeaseShared {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }

            match self.try_acquire_or_renew().await {
                Ok(Attempt::Leading) => self.transition(LeaderState::Leader, true),
                Ok(Attempt::HeldBy(leader)) => {
                    self.transition(LeaderState::Follower { leader }, false)
                }
                Ok(Attempt::Contended) => {
                    debug!("Lease {} changed concurrently", self.store.describe());
                    self.expire_stale_leadership();
                }
                Err(e) => {
                    warn!("Leader election error on {}: {}", self.store.describe(), e);
                    self.expire_stale_leadership();
                }
            }

            tokio::select! {
                _ = sleep(self.config.retry_period()) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.release().await;
    }

    async fn try_acquire_or_renew(&self) -> Result<Attempt> {
        let now = Utc::now();

        let existing = match self.store.get().await? {
            Some(record) => record,
            None => {
                let record = LeaseRecord::held_by(&self.identity, now, self.config.lease_duration);
                return match self.store.create(&record).await {
                    Ok(created) => {
                        self.observe(&created);
                        info!(
                            "Created lease {} with holder {}",
                            self.store.describe(),
                            self.identity
                        );
                        Ok(Attempt::Leading)
                    }
                    Err(e) if e.is_conflict() => Ok(Attempt::Contended),
                    Err(e) => Err(e),
                };
            }
        };

        let observed_at = self.observe(&existing);
        let held_by_me = existing.holder_identity == self.identity;
        if !held_by_me
            && !existing.holder_identity.is_empty()
            && observed_at.elapsed() < existing.lease_duration
        {
            return Ok(Attempt::HeldBy(existing.holder_identity));
        }

        if !held_by_me {
            info!(
                "Lease {} held by {:?} is expired or released, taking over",
                self.store.describe(),
                existing.holder_identity
            );
        }

        let mut next = existing.clone();
        next.holder_identity = self.identity.clone();
        next.renew_time = now;
        next.lease_duration = self.config.lease_duration;
        if !held_by_me {
            next.acquire_time = now;
            next.lease_transitions += 1;
        }

        match self.store.update(&next).await {
            Ok(updated) => {
                self.observe(&updated);
                Ok(Attempt::Leading)
            }
            Err(e) if e.is_conflict() => Ok(Attempt::Contended),
            Err(e) => Err(e),
        }
    }

    /// Record `record` as observed and return when its version was first seen
    fn observe(&self, record: &LeaseRecord) -> Instant {
        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        let version = record.version_key();
        match observed.as_ref() {
            Some(current) if current.version == version => current.at,
            _ => {
                let at = Instant::now();
                *observed = Some(Observed { version, at });
                at
            }
        }
    }

    fn transition(&self, next: LeaderState, renewed: bool) {
        let mut events = Vec::new();
        self.belief.send_modify(|belief| {
            events = belief.state.transition_events(&next);
            belief.state = next;
            if renewed {
                belief.renewed_at = Some(Instant::now());
            } else if belief.state != LeaderState::Leader {
                belief.renewed_at = None;
            }
        });
        for event in events {
            self.log_event(&event);
        }
    }

    /// Step down once the renew deadline passed without a successful renewal
    fn expire_stale_leadership(&self) {
        let stale = {
            let belief = self.belief.borrow();
            belief.state == LeaderState::Leader
                && belief
                    .renewed_at
                    .map(|at| at.elapsed() >= self.config.renew_deadline())
                    .unwrap_or(true)
        };
        if stale {
            self.transition(LeaderState::Candidate, false);
        }
    }

    async fn release(&self) {
        let was_leader = self.belief.borrow().state == LeaderState::Leader;
        self.transition(LeaderState::Candidate, false);
        if !was_leader {
            return;
        }

        let record = match self.store.get().await {
            Ok(Some(record)) if record.holder_identity == self.identity => record,
            Ok(_) => return,
            Err(e) => {
                warn!("Cannot read lease {} for release: {}", self.store.describe(), e);
                return;
            }
        };

        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: String::new(),
            acquire_time: now,
            renew_time: now,
            lease_duration: Duration::from_secs(1),
            ..record
        };
        match self.store.update(&released).await {
            Ok(_) => info!("Released lease {}", self.store.describe()),
            Err(e) => warn!("Failed to release lease {}: {}", self.store.describe(), e),
        }
    }

    fn log_event(&self, event: &LeaderEvent) {
        match event {
            LeaderEvent::StartedLeading => {
                info!("{} is the new status update leader", self.identity)
            }
            LeaderEvent::StoppedLeading => {
                warn!("{} is not the status update leader anymore", self.identity)
            }
            LeaderEvent::NewLeader(leader) => info!("New leader elected: {}", leader),
        }
        #[cfg(feature = "metrics")]
        crate::metrics::set_leader(matches!(event, LeaderEvent::StartedLeading));
    }
}
