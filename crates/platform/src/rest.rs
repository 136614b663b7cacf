//! REST-backed connector
//!
//! Resolves the account behind a credential through the platform's
//! `/users/@me` endpoint and keeps presence through the settings endpoint.
//! Each session runs a liveness probe that flips it to `Failed` once the
//! platform stops accepting the credential, so the next reconciliation pass
//! replaces it.

use std::sync::Arc;
use std::time::Duration;

use common::Credential;
use rand::RngExt;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{BoxFuture, ConnectError, Connector, Identity, Presence, Session, SessionState};

/// Client profile advertised to the platform. One is picked at random per
/// session so the pool does not present a single uniform fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClientProfile {
    name: &'static str,
    user_agent: &'static str,
}

const MOBILE: ClientProfile = ClientProfile {
    name: "mobile",
    user_agent: "Discord-iOS/230.0 (iPhone; iOS 17.4; Scale/3.00)",
};

const DESKTOP: ClientProfile = ClientProfile {
    name: "desktop",
    user_agent: concat!(
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 ",
        "(KHTML, like Gecko) Chrome/124.0 Safari/537.36"
    ),
};

impl ClientProfile {
    fn pick() -> Self {
        if rand::rng().random_bool(0.5) {
            MOBILE
        } else {
            DESKTOP
        }
    }
}

/// Settings for the REST connector.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the platform API, without trailing slash.
    pub api_base: String,
    /// Interval between liveness probes of an online session.
    pub heartbeat: Duration,
    /// Per-request timeout for every platform call.
    pub request_timeout: Duration,
}

/// `/users/@me` response, reduced to what identity resolution needs.
#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    username: String,
    #[serde(default)]
    discriminator: Option<String>,
    #[serde(default)]
    global_name: Option<String>,
}

impl UserResponse {
    fn into_identity(self) -> Identity {
        let display_name = match self.discriminator.as_deref() {
            Some(d) if !d.is_empty() && d != "0" => format!("{}#{d}", self.username),
            _ => match self.global_name {
                Some(name) if !name.trim().is_empty() => name,
                _ => self.username,
            },
        };
        Identity {
            id: self.id,
            display_name,
        }
    }
}

/// Endpoints and HTTP client shared between a connector and its sessions.
#[derive(Debug)]
struct Endpoints {
    client: reqwest::Client,
    me: String,
    settings: String,
    timeout: Duration,
}

impl Endpoints {
    async fn fetch_identity(
        &self,
        credential: &Credential,
        profile: ClientProfile,
    ) -> Result<Identity, ConnectError> {
        let response = self
            .client
            .get(&self.me)
            .header(AUTHORIZATION, credential.expose())
            .header(USER_AGENT, profile.user_agent)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ConnectError::Transient(format!("identity request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                let user: UserResponse = response.json().await.map_err(|e| {
                    ConnectError::Transient(format!("unreadable identity response: {e}"))
                })?;
                Ok(user.into_identity())
            }
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => Err(
                ConnectError::Rejected(format!("platform returned {}", status.as_u16())),
            ),
            status => Err(ConnectError::Transient(format!(
                "platform returned {}",
                status.as_u16()
            ))),
        }
    }

    async fn patch_presence(
        &self,
        credential: &Credential,
        profile: ClientProfile,
        presence: Presence,
    ) -> Result<(), String> {
        let response = self
            .client
            .patch(&self.settings)
            .header(AUTHORIZATION, credential.expose())
            .header(USER_AGENT, profile.user_agent)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "status": presence.as_str() }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("platform returned {}", response.status().as_u16()))
        }
    }
}

/// Production connector talking to the platform REST API.
pub struct RestConnector {
    endpoints: Arc<Endpoints>,
    heartbeat: Duration,
}

impl RestConnector {
    pub fn new(client: reqwest::Client, config: RestConfig) -> Self {
        let base = config.api_base.trim_end_matches('/');
        info!(
            api_base = base,
            heartbeat_secs = config.heartbeat.as_secs(),
            "rest connector initialized"
        );
        Self {
            endpoints: Arc::new(Endpoints {
                client,
                me: format!("{base}/users/@me"),
                settings: format!("{base}/users/@me/settings"),
                timeout: config.request_timeout,
            }),
            heartbeat: config.heartbeat,
        }
    }
}

impl Connector for RestConnector {
    fn id(&self) -> &str {
        "rest"
    }

    fn connect(
        &self,
        credential: Credential,
    ) -> BoxFuture<'_, Result<Box<dyn Session>, ConnectError>> {
        Box::pin(async move {
            let profile = ClientProfile::pick();
            debug!(credential = %credential, profile = profile.name, "resolving identity");
            let identity = self.endpoints.fetch_identity(&credential, profile).await?;

            let (state, _) = watch::channel(SessionState::Online);
            let state = Arc::new(state);
            let probe = tokio::spawn(liveness_probe(
                self.endpoints.clone(),
                credential.clone(),
                profile,
                self.heartbeat,
                state.clone(),
            ));

            let session = RestSession {
                identity,
                credential,
                profile,
                endpoints: self.endpoints.clone(),
                state,
                probe,
            };
            session.set_presence(Presence::Online).await;
            Ok(Box::new(session) as Box<dyn Session>)
        })
    }
}

/// Periodically re-resolve identity; a rejection marks the session failed.
async fn liveness_probe(
    endpoints: Arc<Endpoints>,
    credential: Credential,
    profile: ClientProfile,
    interval: Duration,
    state: Arc<watch::Sender<SessionState>>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick, identity was just resolved
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match endpoints.fetch_identity(&credential, profile).await {
            Ok(_) => {}
            Err(ConnectError::Rejected(reason)) => {
                warn!(
                    credential = %credential,
                    reason,
                    "platform rejected live session, marking failed"
                );
                state.send_replace(SessionState::Failed);
                return;
            }
            Err(e) => {
                debug!(
                    credential = %credential,
                    error = %e,
                    "liveness probe failed (transient), will retry"
                );
            }
        }
    }
}

struct RestSession {
    identity: Identity,
    credential: Credential,
    profile: ClientProfile,
    endpoints: Arc<Endpoints>,
    state: Arc<watch::Sender<SessionState>>,
    probe: JoinHandle<()>,
}

impl Session for RestSession {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_presence(&self, presence: Presence) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self
                .endpoints
                .patch_presence(&self.credential, self.profile, presence)
                .await
            {
                debug!(
                    credential = %self.credential,
                    presence = presence.as_str(),
                    error = %e,
                    "presence update failed"
                );
            }
        })
    }

    fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.probe.abort();
        self.state.send_replace(SessionState::Offline);
        debug!(credential = %self.credential, "session released");
        Box::pin(async {})
    }
}

impl Drop for RestSession {
    fn drop(&mut self) {
        self.probe.abort();
    }
}
