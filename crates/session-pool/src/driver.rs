//! Reconciliation driver
//!
//! A single task owns the trigger side of the pool: the readiness signal,
//! explicit reconcile requests (API mutations) and an optional periodic
//! ticker. Requests that pile up while a pass is being dispatched are
//! coalesced into one pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::{EventBus, PoolEvent};
use crate::manager::PoolManager;

/// Commands accepted by the driver task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Process start: run the initial pass, then mark the pool ready.
    Ready,
    /// The desired set changed.
    Reconcile { reason: String },
}

/// Cloneable trigger side of a running driver.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl PoolHandle {
    /// Signal process readiness. Only the first call has an effect on pool state.
    pub fn ready(&self) {
        if self.tx.send(Command::Ready).is_err() {
            debug!("driver stopped, ready signal dropped");
        }
    }

    /// Ask for a reconciliation pass. Returns immediately.
    pub fn request_reconcile(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.events.publish(PoolEvent::ReconcileRequested {
            reason: reason.clone(),
        });
        if self.tx.send(Command::Reconcile { reason }).is_err() {
            debug!("driver stopped, reconcile request dropped");
        }
    }
}

/// Spawn the driver task for `pool`.
///
/// With `interval` set, a pass also runs every `interval`, starting one
/// interval after spawn. The task exits when every `PoolHandle` is dropped.
pub fn spawn_driver(
    pool: Arc<PoolManager>,
    interval: Option<Duration>,
) -> (PoolHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = PoolHandle {
        tx,
        events: pool.events().clone(),
    };

    let task = tokio::spawn(async move {
        let mut ticker = interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            let command = tokio::select! {
                received = rx.recv() => match received {
                    Some(command) => command,
                    None => break,
                },
                _ = tick(&mut ticker) => Command::Reconcile { reason: "interval".into() },
            };

            // One pass covers everything queued behind this command
            let mut startup = command == Command::Ready;
            let mut coalesced = 0usize;
            while let Ok(next) = rx.try_recv() {
                match next {
                    Command::Ready => startup = true,
                    Command::Reconcile { .. } => coalesced += 1,
                }
            }
            if coalesced > 0 {
                debug!(coalesced, startup, "coalesced reconcile requests");
            }

            if startup {
                run_pass(&pool, "startup").await;
                pool.mark_ready().await;
            } else if let Command::Reconcile { reason } = command {
                run_pass(&pool, &reason).await;
            }
        }
        info!("reconcile driver stopped");
    });

    (handle, task)
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Dispatch one pass; its attempts settle in the background.
async fn run_pass(pool: &Arc<PoolManager>, reason: &str) {
    match pool.reconcile().await {
        Ok(pass) => {
            let attempts = pass.attempts();
            debug!(reason, attempts, "reconcile pass dispatched");
            if attempts > 0 {
                tokio::spawn(async move {
                    let summary = pass.settle().await;
                    debug!(
                        online = summary.online,
                        failed = summary.failed,
                        superseded = summary.superseded,
                        "reconcile pass settled"
                    );
                });
            }
        }
        Err(Error::ShuttingDown) => debug!(reason, "reconcile skipped, pool shutting down"),
        Err(e) => {
            warn!(reason, error = %e, "reconcile pass failed");
            pool.events().log(format!("Reconcile failed: {e}"));
        }
    }
}
