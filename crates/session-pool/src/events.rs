//! Pool observability events
//!
//! The pool publishes lifecycle signals and human-readable log lines on a
//! broadcast channel. Nothing in the control path listens here: readiness,
//! reconcile requests and shutdown travel as explicit calls or driver
//! commands. Subscribers are sinks (tracing, tests, a future UI).
//!
//! Credentials inside events are always the masked projection.

use platform::Identity;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default channel capacity for the event bus
const DEFAULT_CAPACITY: usize = 256;

/// Lifecycle and diagnostic signals emitted by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// First reconciliation pass ran, the pool now hot-reloads.
    Ready,
    /// Someone asked for a reconciliation pass.
    ReconcileRequested { reason: String },
    /// Informational text for the log sink.
    Log(String),
    SessionOnline { credential: String, identity: Identity },
    SessionFailed { credential: String, reason: String },
    /// Termination signal received, sessions are being released.
    ShutdownRequested,
}

impl PoolEvent {
    /// Short name for structured logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            PoolEvent::Ready => "ready",
            PoolEvent::ReconcileRequested { .. } => "reconcile_requested",
            PoolEvent::Log(_) => "log",
            PoolEvent::SessionOnline { .. } => "session_online",
            PoolEvent::SessionFailed { .. } => "session_failed",
            PoolEvent::ShutdownRequested => "shutdown_requested",
        }
    }
}

/// Broadcast hub for `PoolEvent`s. Cheap to clone; every clone publishes to
/// the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that received it;
    /// zero subscribers is not an error.
    pub fn publish(&self, event: PoolEvent) -> usize {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                debug!(event_type = type_name, "no subscribers for pool event");
                0
            }
        }
    }

    /// Publish a `PoolEvent::Log` line.
    pub fn log(&self, message: impl Into<String>) -> usize {
        self.publish(PoolEvent::Log(message.into()))
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<PoolEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once every publisher is gone. A lagging receiver skips
    /// the dropped events and keeps going.
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped_events = skipped, "pool event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take an already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<PoolEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Forward every pool event to `tracing` until the bus closes.
pub fn spawn_log_sink(mut receiver: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match &event {
                PoolEvent::Log(message) => info!(target: "onliner::pool", "{message}"),
                PoolEvent::SessionOnline {
                    credential,
                    identity,
                } => info!(
                    target: "onliner::pool",
                    credential,
                    account = %identity,
                    "session online"
                ),
                PoolEvent::SessionFailed { credential, reason } => warn!(
                    target: "onliner::pool",
                    credential,
                    reason,
                    "session failed"
                ),
                PoolEvent::ReconcileRequested { reason } => {
                    debug!(target: "onliner::pool", reason, "reconcile requested")
                }
                PoolEvent::Ready | PoolEvent::ShutdownRequested => {
                    info!(target: "onliner::pool", event = event.type_name(), "pool lifecycle")
                }
            }
        }
        debug!("pool event bus closed, log sink exiting");
    })
}
