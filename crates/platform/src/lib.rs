//! Chat-platform client seam
//!
//! The pool never speaks the platform protocol itself. It only needs to open a
//! session for a credential, ask whether that session is still online, change
//! its presence, and release it. `Connector` and `Session` capture exactly
//! that; `RestConnector` is the production implementation and tests plug in
//! scripted connectors.
//!
//! Session lifecycle:
//! 1. `Connector::connect` resolves → `Session` in `Online`
//! 2. Platform later rejects the credential → session reports `Failed`
//! 3. `Session::disconnect` → `Offline`, handle released

pub mod rest;

pub use rest::{RestConfig, RestConnector};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Credential;
use serde::Serialize;

/// Boxed future used by the dyn-compatible traits below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection state reported by a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Online,
    Offline,
    Failed,
}

impl SessionState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Online => "online",
            SessionState::Offline => "offline",
            SessionState::Failed => "failed",
        }
    }
}

/// Presence shown to other platform users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Idle,
    Invisible,
}

impl Presence {
    /// Wire value understood by the platform settings endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Idle => "idle",
            Presence::Invisible => "invisible",
        }
    }
}

/// Account identity resolved when a session comes online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Why a connect attempt did not produce a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The platform refused the credential (bad or revoked token).
    #[error("credential rejected: {0}")]
    Rejected(String),

    /// Network trouble or an unexpected platform response.
    #[error("transient connect failure: {0}")]
    Transient(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Whether retrying the same credential is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ConnectError::Rejected(_))
    }

    /// Short label for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectError::Rejected(_) => "rejected",
            ConnectError::Transient(_) => "transient",
            ConnectError::Timeout(_) => "timeout",
        }
    }
}

/// One live platform connection.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Box<dyn Session>`).
pub trait Session: Send + Sync {
    /// Identity resolved at connect time.
    fn identity(&self) -> &Identity;

    /// Current connection state. Anything other than `Online` means the
    /// session should be replaced.
    fn state(&self) -> SessionState;

    /// Change presence. Best-effort: failures are logged by the implementation.
    fn set_presence(&self, presence: Presence) -> BoxFuture<'_, ()>;

    /// Release the underlying handle.
    fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Opens sessions for credentials.
pub trait Connector: Send + Sync {
    /// Identifier for logging (e.g. "rest").
    fn id(&self) -> &str;

    /// Open a session for `credential`. Resolves once the account is online
    /// or the platform has refused it.
    fn connect(
        &self,
        credential: Credential,
    ) -> BoxFuture<'_, Result<Box<dyn Session>, ConnectError>>;
}
