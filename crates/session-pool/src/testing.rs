//! Scripted connector shared by the pool's unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Credential;
use platform::{BoxFuture, ConnectError, Connector, Identity, Presence, Session, SessionState};

use crate::manager::{PoolManager, PoolPolicy};
use crate::{CredentialStore, EventBus};

/// Everything the fake platform observed.
#[derive(Default)]
pub struct PlatformLog {
    connects: Mutex<Vec<String>>,
    presences: Mutex<Vec<(String, Presence)>>,
    disconnects: AtomicUsize,
}

struct FakeSession {
    credential: String,
    identity: Identity,
    state: Arc<Mutex<SessionState>>,
    log: Arc<PlatformLog>,
    stall_presence: bool,
}

impl Session for FakeSession {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_presence(&self, presence: Presence) -> BoxFuture<'_, ()> {
        self.log
            .presences
            .lock()
            .unwrap()
            .push((self.credential.clone(), presence));
        if self.stall_presence {
            return Box::pin(std::future::pending());
        }
        Box::pin(async {})
    }

    fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()> {
        *self.state.lock().unwrap() = SessionState::Offline;
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

/// Connector whose outcome per credential is scripted up front.
#[derive(Default)]
pub struct FakeConnector {
    log: Arc<PlatformLog>,
    rejected: HashSet<String>,
    transient: HashSet<String>,
    delay: Duration,
    stall_presence: bool,
    states: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(mut self, credential: &str) -> Self {
        self.rejected.insert(credential.to_string());
        self
    }

    pub fn transient(mut self, credential: &str) -> Self {
        self.transient.insert(credential.to_string());
        self
    }

    /// Every connect suspends for `delay` before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Presence updates on every session never complete.
    pub fn with_stalled_presence(mut self) -> Self {
        self.stall_presence = true;
        self
    }

    pub fn connects_for(&self, credential: &str) -> usize {
        self.log
            .connects
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == credential)
            .count()
    }

    pub fn total_connects(&self) -> usize {
        self.log.connects.lock().unwrap().len()
    }

    pub fn disconnects(&self) -> usize {
        self.log.disconnects.load(Ordering::SeqCst)
    }

    pub fn presences_for(&self, credential: &str) -> Vec<Presence> {
        self.log
            .presences
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == credential)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Simulate the platform dropping the latest session for `credential`.
    pub fn fail_session(&self, credential: &str) {
        if let Some(state) = self.states.lock().unwrap().get(credential) {
            *state.lock().unwrap() = SessionState::Failed;
        }
    }
}

impl Connector for FakeConnector {
    fn id(&self) -> &str {
        "fake"
    }

    fn connect(
        &self,
        credential: Credential,
    ) -> BoxFuture<'_, Result<Box<dyn Session>, ConnectError>> {
        Box::pin(async move {
            let raw = credential.expose().to_string();
            self.log.connects.lock().unwrap().push(raw.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.rejected.contains(&raw) {
                return Err(ConnectError::Rejected("platform returned 401".into()));
            }
            if self.transient.contains(&raw) {
                return Err(ConnectError::Transient("connection reset".into()));
            }

            let name = raw.split('.').next().unwrap_or_default().to_string();
            let state = Arc::new(Mutex::new(SessionState::Online));
            self.states
                .lock()
                .unwrap()
                .insert(raw.clone(), state.clone());
            Ok(Box::new(FakeSession {
                credential: raw,
                identity: Identity {
                    id: format!("id-{name}"),
                    display_name: name,
                },
                state,
                log: self.log.clone(),
                stall_presence: self.stall_presence,
            }) as Box<dyn Session>)
        })
    }
}

/// Policy with short delays suited to tests.
pub fn fast_policy() -> PoolPolicy {
    PoolPolicy {
        connect_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(10),
        full_reload: false,
        prune_transient_failures: true,
    }
}

/// Build a pool over a fresh store seeded with `tokens`.
pub async fn test_pool(
    dir: &tempfile::TempDir,
    connector: Arc<FakeConnector>,
    policy: PoolPolicy,
    tokens: &[&str],
) -> Arc<PoolManager> {
    let store = CredentialStore::open(dir.path().join("tokens.json"))
        .await
        .unwrap();
    let seeded: Vec<Credential> = tokens.iter().map(|t| Credential::new(*t)).collect();
    store.set_all(&seeded).await.unwrap();
    Arc::new(PoolManager::new(
        connector,
        Arc::new(store),
        EventBus::new(),
        policy,
    ))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
