//! Single-consumer queue serializing status reconciliation cycles
//!
//! Tokens carry no payload: a pending token already guarantees a future
//! cycle, so triggers arriving while one is queued collapse into it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::Result;

/// Wake-up signal asking for one reconciliation cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncToken;

pub struct SyncQueue {
    tx: mpsc::Sender<SyncToken>,
    rx: Mutex<mpsc::Receiver<SyncToken>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Held by the consumer while a cycle runs
    in_flight: Mutex<()>,
}

impl SyncQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            in_flight: Mutex::new(()),
        }
    }

    /// Request a cycle; returns false once the queue is shutting down
    pub fn enqueue(&self) -> bool {
        if self.is_shutting_down() {
            debug!("Ignoring sync request, queue is shutting down");
            return false;
        }
        match self.tx.try_send(SyncToken) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Sync already pending, collapsing request");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Consume tokens one at a time until shutdown
    ///
    /// A second concurrent caller waits until the first one returns, so at
    /// most one `handler` future is ever running.
    pub async fn run<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(SyncToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut rx = self.rx.lock().await;
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let token = tokio::select! {
                token = rx.recv() => match token {
                    Some(token) => token,
                    None => break,
                },
                _ = shutdown.wait_for(|down| *down) => break,
            };

            let _cycle = self.in_flight.lock().await;
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = handler(token).await {
                error!("Status sync cycle failed: {}", e);
            }
        }

        debug!("Sync queue consumer stopped");
    }

    /// Enqueue a token every `period`, starting immediately, until shutdown
    pub async fn tick_every(&self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|down| *down) => break,
            }
            if !self.enqueue() {
                break;
            }
        }
    }

    /// Stop accepting tokens and wait for the in-flight cycle, if any
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down status sync queue");
        self.shutdown_tx.send_replace(true);
        let _idle = self.in_flight.lock().await;
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}
