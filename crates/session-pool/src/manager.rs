//! Live-session pool and reconciliation
//!
//! The pool owns one slot per credential. A slot is either `Attempting` (a
//! connect task is in flight) or `Online` (a session handle is held); no slot
//! means idle. Reconciliation tags a credential `Attempting` under the map lock
//! before any await, so overlapping passes can never double-connect it.
//!
//! Connect attempts run as independent tasks. `reconcile` returns as soon as
//! they are spawned; the returned `Pass` can be settled to wait for all of
//! them. Each completion re-checks that its slot still carries the same
//! attempt id before touching the map or the store, which makes completions
//! that outlive a shutdown or a release harmless.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Credential;
use platform::{ConnectError, Connector, Identity, Presence, Session, SessionState};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, PoolEvent};
use crate::store::CredentialStore;

/// Upper bound on the best-effort presence change made before releasing a session.
const PRESENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-wide lifecycle of the pool.
///
/// - NotReady → Ready (first pass done, later passes are hot reloads)
/// - NotReady | Ready → ShuttingDown (terminal, reconcile is refused)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    NotReady,
    Ready,
    ShuttingDown,
}

/// Tunables for reconciliation and teardown.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Quiescence delay after sessions are released.
    pub shutdown_grace: Duration,
    /// Tear down and recreate every session on each hot reload.
    pub full_reload: bool,
    /// Also prune credentials whose attempt failed transiently (timeout,
    /// network). Rejected credentials are always pruned.
    pub prune_transient_failures: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(4),
            full_reload: false,
            prune_transient_failures: true,
        }
    }
}

enum Slot {
    Attempting { attempt: u64 },
    Online(Box<dyn Session>),
}

/// What a pass found for a desired credential already in the map.
enum Existing {
    Healthy,
    Stale,
    InFlight,
}

#[derive(Debug)]
enum AttemptOutcome {
    Online,
    Failed,
    Superseded,
}

/// Tally of a settled pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub online: usize,
    pub failed: usize,
    /// Attempts whose result arrived after their slot was cleared or replaced.
    pub superseded: usize,
}

/// The connect attempts started by one reconciliation pass.
///
/// Dropping a `Pass` detaches the attempts; they still complete and update
/// the pool on their own.
#[must_use = "settle the pass or drop it to detach its attempts"]
pub struct Pass {
    attempts: Vec<JoinHandle<AttemptOutcome>>,
}

impl Pass {
    fn empty() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    /// Number of connect attempts this pass started.
    pub fn attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Wait for every attempt of this pass to resolve.
    pub async fn settle(self) -> PassSummary {
        let mut summary = PassSummary::default();
        for handle in self.attempts {
            match handle.await {
                Ok(AttemptOutcome::Online) => summary.online += 1,
                Ok(AttemptOutcome::Failed) => summary.failed += 1,
                Ok(AttemptOutcome::Superseded) => summary.superseded += 1,
                Err(e) => {
                    warn!(error = %e, "connect attempt task did not complete");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

/// Keeps live sessions converged on the desired credential set.
pub struct PoolManager {
    connector: Arc<dyn Connector>,
    store: Arc<CredentialStore>,
    events: EventBus,
    policy: PoolPolicy,
    live: Mutex<HashMap<Credential, Slot>>,
    state: RwLock<PoolState>,
    next_attempt: AtomicU64,
}

impl PoolManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<CredentialStore>,
        events: EventBus,
        policy: PoolPolicy,
    ) -> Self {
        info!(
            connector = connector.id(),
            connect_timeout_secs = policy.connect_timeout.as_secs(),
            full_reload = policy.full_reload,
            "session pool initialized"
        );
        Self {
            connector,
            store,
            events,
            policy,
            live: Mutex::new(HashMap::new()),
            state: RwLock::new(PoolState::NotReady),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub async fn state(&self) -> PoolState {
        *self.state.read().await
    }

    /// Transition `NotReady → Ready`. Returns whether the transition happened.
    pub async fn mark_ready(&self) -> bool {
        let mut state = self.state.write().await;
        if *state != PoolState::NotReady {
            return false;
        }
        *state = PoolState::Ready;
        drop(state);
        info!("session pool ready");
        self.events.publish(PoolEvent::Ready);
        self.events.log("Ready!");
        true
    }

    /// Run one reconciliation pass.
    ///
    /// Loads and normalizes the desired set, releases sessions that are no
    /// longer desired or no longer online, and starts a connect attempt for
    /// every desired credential without a live or in-flight slot. Returns once
    /// the attempts are spawned. An empty desired set leaves existing sessions
    /// untouched.
    pub async fn reconcile(self: &Arc<Self>) -> Result<Pass> {
        let was_ready = match *self.state.read().await {
            PoolState::ShuttingDown => return Err(Error::ShuttingDown),
            PoolState::Ready => true,
            PoolState::NotReady => false,
        };
        metrics::counter!("onliner_reconcile_passes_total").increment(1);

        let desired = self.store.load_desired().await?;
        if desired.is_empty() {
            self.events.log("No tokens found");
            return Ok(Pass::empty());
        }

        if was_ready && self.policy.full_reload {
            self.events.log(format!("Reloading {} tokens", desired.len()));
            let released = self.teardown(Presence::Idle).await;
            debug!(released, "full reload released all sessions");
            tokio::time::sleep(self.policy.shutdown_grace).await;
        }

        let mut stale: Vec<Box<dyn Session>> = Vec::new();
        let mut pending: Vec<(Credential, u64)> = Vec::new();
        {
            let mut live = self.live.lock().await;
            // Shutdown flips the state under this lock, so no slot tagged
            // below can outlive its drain
            if *self.state.read().await == PoolState::ShuttingDown {
                debug!("shutdown began mid-pass, dispatching nothing");
                return Err(Error::ShuttingDown);
            }

            let wanted: HashSet<&str> = desired.iter().map(Credential::expose).collect();
            let undesired: Vec<Credential> = live
                .iter()
                .filter(|(c, slot)| {
                    matches!(slot, Slot::Online(_)) && !wanted.contains(c.expose())
                })
                .map(|(c, _)| c.clone())
                .collect();
            for credential in undesired {
                if let Some(Slot::Online(session)) = live.remove(&credential) {
                    self.events.log(format!(
                        "Token {credential} is no longer desired, disconnecting"
                    ));
                    stale.push(session);
                }
            }

            for credential in &desired {
                let existing = live.get(credential).map(|slot| match slot {
                    Slot::Online(session) if session.state() == SessionState::Online => {
                        Existing::Healthy
                    }
                    Slot::Online(_) => Existing::Stale,
                    Slot::Attempting { .. } => Existing::InFlight,
                });
                match existing {
                    Some(Existing::Healthy) => {
                        self.events.log(format!("Token {credential} is online, skipping"));
                        continue;
                    }
                    Some(Existing::InFlight) => {
                        debug!(credential = %credential, "connect attempt already in flight");
                        continue;
                    }
                    Some(Existing::Stale) => {
                        self.events.log(format!("Token {credential} is offline, renewing"));
                        if let Some(Slot::Online(session)) = live.remove(credential) {
                            stale.push(session);
                        }
                    }
                    None => {}
                }

                let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
                live.insert(credential.clone(), Slot::Attempting { attempt });
                pending.push((credential.clone(), attempt));
            }
            record_online(&live);
        }

        for session in stale {
            session.disconnect().await;
        }

        let mut attempts = Vec::with_capacity(pending.len());
        for (credential, attempt) in pending {
            self.events.log(format!("Logging in with token {credential}"));
            let pool = Arc::clone(self);
            attempts.push(tokio::spawn(async move {
                pool.run_attempt(credential, attempt).await
            }));
        }
        debug!(attempts = attempts.len(), "reconciliation pass dispatched");
        Ok(Pass { attempts })
    }

    async fn run_attempt(&self, credential: Credential, attempt: u64) -> AttemptOutcome {
        let timeout = self.policy.connect_timeout;
        let result =
            match tokio::time::timeout(timeout, self.connector.connect(credential.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(timeout)),
            };
        match result {
            Ok(session) => self.complete_online(credential, attempt, session).await,
            Err(error) => self.complete_failed(credential, attempt, error).await,
        }
    }

    async fn complete_online(
        &self,
        credential: Credential,
        attempt: u64,
        session: Box<dyn Session>,
    ) -> AttemptOutcome {
        let identity = session.identity().clone();
        {
            let mut live = self.live.lock().await;
            if is_current(&live, &credential, attempt) {
                live.insert(credential.clone(), Slot::Online(session));
                record_online(&live);
                drop(live);

                metrics::counter!("onliner_connect_attempts_total", "outcome" => "online")
                    .increment(1);
                info!(credential = %credential, account = %identity, "session online");
                self.events.log(format!(
                    "Logged in '{}' with token {credential}",
                    identity.display_name
                ));
                self.events.publish(PoolEvent::SessionOnline {
                    credential: credential.masked(),
                    identity,
                });
                return AttemptOutcome::Online;
            }
        }

        debug!(credential = %credential, attempt, "attempt superseded, releasing late session");
        session.disconnect().await;
        AttemptOutcome::Superseded
    }

    async fn complete_failed(
        &self,
        credential: Credential,
        attempt: u64,
        error: ConnectError,
    ) -> AttemptOutcome {
        let relevant = {
            let mut live = self.live.lock().await;
            let current = is_current(&live, &credential, attempt);
            if current {
                live.remove(&credential);
            }
            current
        };
        if !relevant {
            debug!(
                credential = %credential,
                attempt,
                error = %error,
                "attempt superseded, ignoring failure"
            );
            return AttemptOutcome::Superseded;
        }

        metrics::counter!("onliner_connect_attempts_total", "outcome" => error.label())
            .increment(1);
        warn!(credential = %credential, error = %error, "connect attempt failed");
        self.events.log(format!("Failed to login with token {credential}: {error}"));
        self.events.publish(PoolEvent::SessionFailed {
            credential: credential.masked(),
            reason: error.to_string(),
        });

        if error.is_permanent() || self.policy.prune_transient_failures {
            match self.store.remove(credential.expose()).await {
                Ok(true) => {
                    self.events.log(format!("Removed token {credential} from desired set"));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(credential = %credential, error = %e, "failed to prune credential");
                }
            }
        }
        AttemptOutcome::Failed
    }

    /// Drain every slot, set `presence` on the live sessions (best-effort,
    /// bounded) and release them. In-flight attempts are abandoned.
    async fn teardown(&self, presence: Presence) -> usize {
        let drained: Vec<(Credential, Slot)> = {
            let mut live = self.live.lock().await;
            let drained = live.drain().collect();
            record_online(&live);
            drained
        };

        let mut releases = JoinSet::new();
        for (credential, slot) in drained {
            match slot {
                Slot::Online(session) => {
                    releases.spawn(async move {
                        if tokio::time::timeout(PRESENCE_TIMEOUT, session.set_presence(presence))
                            .await
                            .is_err()
                        {
                            debug!(credential = %credential, "presence update timed out");
                        }
                        session.disconnect().await;
                    });
                }
                Slot::Attempting { attempt } => {
                    debug!(credential = %credential, attempt, "abandoning in-flight attempt");
                }
            }
        }

        let released = releases.len();
        while let Some(joined) = releases.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session release task failed");
            }
        }
        released
    }

    /// Release every session and wait the quiescence delay.
    ///
    /// Always sleeps `shutdown_grace` before returning, even when nothing was
    /// live: the platform gives no disconnect acknowledgement to wait on.
    /// Returns the number of sessions released. Later calls return 0 at once.
    pub async fn shutdown(&self) -> usize {
        {
            let _live = self.live.lock().await;
            let mut state = self.state.write().await;
            if *state == PoolState::ShuttingDown {
                return 0;
            }
            *state = PoolState::ShuttingDown;
        }
        self.events.publish(PoolEvent::ShutdownRequested);

        let released = self.teardown(Presence::Invisible).await;
        info!(
            released,
            grace_ms = self.policy.shutdown_grace.as_millis() as u64,
            "sessions released, waiting for disconnects to flush"
        );
        self.events.log(format!("Released {released} sessions"));
        tokio::time::sleep(self.policy.shutdown_grace).await;
        released
    }

    /// Explicitly drop one credential's slot. A live session goes invisible
    /// and is disconnected; an in-flight attempt is abandoned. Returns whether
    /// a slot existed.
    pub async fn release(&self, credential: &str) -> bool {
        let slot = {
            let mut live = self.live.lock().await;
            let slot = live.remove(credential);
            record_online(&live);
            slot
        };
        match slot {
            Some(Slot::Online(session)) => {
                let credential = Credential::new(credential);
                let invisible = session.set_presence(Presence::Invisible);
                if tokio::time::timeout(PRESENCE_TIMEOUT, invisible).await.is_err() {
                    debug!(credential = %credential, "presence update timed out");
                }
                session.disconnect().await;
                self.events.log(format!("Disconnected token {credential}"));
                true
            }
            Some(Slot::Attempting { attempt }) => {
                debug!(attempt, "released credential with attempt in flight");
                true
            }
            None => false,
        }
    }

    /// Whether the credential has a live session or an attempt in flight.
    pub async fn is_live(&self, credential: &str) -> bool {
        self.live.lock().await.contains_key(credential)
    }

    /// Identities of sessions currently online, sorted by display name.
    pub async fn online(&self) -> Vec<Identity> {
        let live = self.live.lock().await;
        let mut identities: Vec<Identity> = live
            .values()
            .filter_map(|slot| match slot {
                Slot::Online(session) if session.state() == SessionState::Online => {
                    Some(session.identity().clone())
                }
                _ => None,
            })
            .collect();
        identities.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        identities
    }

    /// Number of occupied slots (online or attempting).
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }
}

fn is_current(live: &HashMap<Credential, Slot>, credential: &Credential, attempt: u64) -> bool {
    matches!(live.get(credential), Some(Slot::Attempting { attempt: a }) if *a == attempt)
}

fn record_online(live: &HashMap<Credential, Slot>) {
    let online = live
        .values()
        .filter(|slot| matches!(slot, Slot::Online(_)))
        .count();
    metrics::gauge!("onliner_sessions_online").set(online as f64);
}
