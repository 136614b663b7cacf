//! HTTP façade
//!
//! Endpoints:
//! - GET    /        : status, uptime, online identities
//! - GET    /tokens  : list the desired set (bearer-protected)
//! - POST   /tokens  : add a credential and trigger a reconcile (bearer-protected)
//! - DELETE /tokens  : remove a credential, release its session (bearer-protected)
//! - GET    /metrics : Prometheus text exposition

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use common::Credential;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use session_pool::{PoolHandle, PoolManager};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::error::ApiError;

/// Shared state for façade handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
    pub handle: PoolHandle,
    pub auth_token: Arc<Credential>,
    pub started_at: Instant,
    pub prometheus: PrometheusHandle,
}

/// Build the façade router.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route(
            "/tokens",
            get(list_tokens).post(add_token).delete(remove_token),
        )
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[derive(Deserialize)]
struct TokenRequest {
    #[serde(default)]
    token: Option<String>,
}

fn json_ok(body: serde_json::Value) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Check `Authorization: Bearer <secret>` in constant time.
fn authorize(headers: &HeaderMap, secret: &Credential) -> Result<(), ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(ApiError::MissingAuthorization)?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::InvalidAuthorization)?;
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return Err(ApiError::InvalidAuthorization);
    };
    if bool::from(presented.as_bytes().ct_eq(secret.expose().as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::InvalidAuthorization)
    }
}

/// Missing, blank, non-string or unparsable bodies all count as a missing token.
fn parse_token(body: &[u8]) -> Result<Credential, ApiError> {
    serde_json::from_slice::<TokenRequest>(body)
        .ok()
        .and_then(|request| request.token)
        .and_then(|token| Credential::parse(&token))
        .ok_or(ApiError::MissingToken)
}

/// GET /: service status.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let online: Vec<String> = state
        .pool
        .online()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();

    json_ok(serde_json::json!({
        "status": "online",
        "uptime": format_uptime(state.started_at.elapsed()),
        "online": online,
    }))
}

/// GET /tokens: the desired set, unmasked.
async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&headers, &state.auth_token)?;
    let tokens = state.pool.store().get_all().await?;
    let data: Vec<&str> = tokens.iter().map(Credential::expose).collect();
    Ok(json_ok(serde_json::json!({ "success": true, "data": data })))
}

/// POST /tokens: add a credential.
async fn add_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&headers, &state.auth_token)?;
    let credential = parse_token(&body)?;

    if state.pool.is_live(credential.expose()).await {
        return Err(ApiError::TokenInUse);
    }
    if !state.pool.store().insert(credential.clone()).await? {
        return Err(ApiError::TokenInUse);
    }

    info!(credential = %credential, "token added");
    state.pool.events().log(format!("Added token {credential}"));
    state.handle.request_reconcile("token added");
    Ok(json_ok(serde_json::json!({ "success": true })))
}

/// DELETE /tokens: remove a credential and release its session.
async fn remove_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&headers, &state.auth_token)?;
    let credential = parse_token(&body)?;

    let removed = state.pool.store().remove(credential.expose()).await?;
    let released = state.pool.release(credential.expose()).await;
    if !removed && !released {
        return Err(ApiError::TokenNotInUse);
    }

    info!(credential = %credential, released, "token removed");
    state.pool.events().log(format!("Removed token {credential}"));
    state.handle.request_reconcile("token removed");
    Ok(json_ok(serde_json::json!({ "success": true })))
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("rendering metrics");
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Render an uptime as `"2 days, 1 hour, 0 minutes, 5 seconds"`.
///
/// Leading zero-valued units are omitted; seconds are always shown.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let units = [
        (total / 86_400, "day"),
        (total % 86_400 / 3_600, "hour"),
        (total % 3_600 / 60, "minute"),
        (total % 60, "second"),
    ];

    let first = units
        .iter()
        .position(|(value, _)| *value > 0)
        .unwrap_or(units.len() - 1);
    units[first..]
        .iter()
        .map(|(value, unit)| {
            if *value == 1 {
                format!("{value} {unit}")
            } else {
                format!("{value} {unit}s")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use platform::{
        BoxFuture, ConnectError, Connector, Identity, Presence, Session, SessionState,
    };
    use session_pool::{CredentialStore, EventBus, PoolPolicy, spawn_driver};
    use tower::ServiceExt;

    const SECRET: &str = "api-secret";

    struct StaticSession {
        identity: Identity,
    }

    impl Session for StaticSession {
        fn identity(&self) -> &Identity {
            &self.identity
        }

        fn state(&self) -> SessionState {
            SessionState::Online
        }

        fn set_presence(&self, _presence: Presence) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }

        fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    /// Accepts every credential except those starting with "bad".
    struct StaticConnector;

    impl Connector for StaticConnector {
        fn id(&self) -> &str {
            "static"
        }

        fn connect(
            &self,
            credential: Credential,
        ) -> BoxFuture<'_, Result<Box<dyn Session>, ConnectError>> {
            Box::pin(async move {
                let raw = credential.expose();
                if raw.starts_with("bad") {
                    return Err(ConnectError::Rejected("401 Unauthorized".into()));
                }
                let name = raw.split('.').next().unwrap_or_default().to_string();
                Ok(Box::new(StaticSession {
                    identity: Identity {
                        id: format!("id-{name}"),
                        display_name: name,
                    },
                }) as Box<dyn Session>)
            })
        }
    }

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    async fn test_state(dir: &tempfile::TempDir, tokens: &[&str]) -> AppState {
        let store = CredentialStore::open(dir.path().join("tokens.json"))
            .await
            .unwrap();
        let seeded: Vec<Credential> = tokens.iter().map(|t| Credential::new(*t)).collect();
        store.set_all(&seeded).await.unwrap();

        let policy = PoolPolicy {
            shutdown_grace: Duration::from_millis(10),
            ..PoolPolicy::default()
        };
        let pool = Arc::new(PoolManager::new(
            Arc::new(StaticConnector),
            Arc::new(store),
            EventBus::new(),
            policy,
        ));
        let (handle, _task) = spawn_driver(pool.clone(), None);

        AppState {
            pool,
            handle,
            auth_token: Arc::new(Credential::new(SECRET)),
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        }
    }

    fn tokens_request(method: &str, auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri("/tokens")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn bearer() -> Option<&'static str> {
        Some("Bearer api-secret")
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn wait_online(pool: &PoolManager, count: usize) -> bool {
        for _ in 0..200 {
            if pool.online().await.len() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn status_lists_online_identities() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, &["alice.1.x", "bob.2.y"]).await;
        state.pool.reconcile().await.unwrap().settle().await;
        let app = build_router(state, 16);

        let (status, json) = send(
            &app,
            Request::builder().uri("/").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "online");
        assert_eq!(
            json["online"],
            serde_json::json!(["alice (id-alice)", "bob (id-bob)"])
        );
        assert!(json["uptime"].as_str().unwrap().ends_with("seconds"));
    }

    #[tokio::test]
    async fn tokens_without_authorization_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &[]).await, 16);

        let (status, json) = send(&app, tokens_request("GET", None, "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Unauthorized");
        assert_eq!(json["message"], "You must provide an authorization header");
    }

    #[tokio::test]
    async fn tokens_with_wrong_authorization_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &[]).await, 16);

        for auth in ["Bearer wrong", "Basic api-secret", "api-secret", "Bearer api-secret2"] {
            let (status, json) =
                send(&app, tokens_request("POST", Some(auth), r#"{"token":"a.b.c"}"#)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "auth: {auth}");
            assert_eq!(
                json["message"],
                "You must provide a valid authorization header"
            );
        }
    }

    #[tokio::test]
    async fn list_tokens_returns_desired_set() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &["a.1.x", "b.2.y"]).await, 16);

        let (status, json) = send(&app, tokens_request("GET", bearer(), "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!(["a.1.x", "b.2.y"]));
    }

    #[tokio::test]
    async fn add_token_persists_and_brings_session_online() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, &[]).await;
        let pool = state.pool.clone();
        let app = build_router(state, 16);

        let (status, json) =
            send(&app, tokens_request("POST", bearer(), r#"{"token":" carol.3.z "}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({ "success": true }));

        assert!(pool.store().contains("carol.3.z").await.unwrap());
        assert!(wait_online(&pool, 1).await);
    }

    #[tokio::test]
    async fn add_same_token_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &[]).await, 16);
        let body = r#"{"token":"dave.4.w"}"#;

        let (first, _) = send(&app, tokens_request("POST", bearer(), body)).await;
        let (second, json) = send(&app, tokens_request("POST", bearer(), body)).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Token is already in use");
    }

    #[tokio::test]
    async fn add_token_missing_or_blank_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &[]).await, 16);

        let bodies = [
            "",
            "{}",
            r#"{"token":""}"#,
            r#"{"token":"   "}"#,
            r#"{"token":42}"#,
            "not json",
        ];
        for body in bodies {
            let (status, json) = send(&app, tokens_request("POST", bearer(), body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(json["error"], "Missing token");
        }
    }

    #[tokio::test]
    async fn remove_unknown_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &["a.1.x"]).await, 16);

        let (status, json) =
            send(&app, tokens_request("DELETE", bearer(), r#"{"token":"zzz.9.q"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Token is not in use");

        let (status, json) = send(&app, tokens_request("DELETE", bearer(), "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing token");
    }

    #[tokio::test]
    async fn remove_token_releases_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, &["erin.5.v"]).await;
        state.pool.reconcile().await.unwrap().settle().await;
        let pool = state.pool.clone();
        let app = build_router(state, 16);

        let (status, json) =
            send(&app, tokens_request("DELETE", bearer(), r#"{"token":"erin.5.v"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        assert!(!pool.is_live("erin.5.v").await);
        assert!(pool.store().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, &[]).await;
        tokio::fs::write(state.pool.store().path(), "{broken")
            .await
            .unwrap();
        let app = build_router(state, 16);

        let (status, json) =
            send(&app, tokens_request("POST", bearer(), r#"{"token":"f.6.u"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, serde_json::json!({ "error": "Storage unavailable" }));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, &[]).await, 16);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[test]
    fn uptime_omits_leading_zero_units() {
        assert_eq!(format_uptime(Duration::ZERO), "0 seconds");
        assert_eq!(format_uptime(Duration::from_secs(1)), "1 second");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1 minute, 5 seconds");
        assert_eq!(
            format_uptime(Duration::from_secs(3_605)),
            "1 hour, 0 minutes, 5 seconds"
        );
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86_400 + 3_600 + 1)),
            "2 days, 1 hour, 0 minutes, 1 second"
        );
    }

    #[test]
    fn authorize_accepts_only_exact_bearer() {
        let secret = Credential::new(SECRET);
        let mut headers = HeaderMap::new();
        assert!(matches!(
            authorize(&headers, &secret),
            Err(ApiError::MissingAuthorization)
        ));

        headers.insert(header::AUTHORIZATION, "Bearer api-secret".parse().unwrap());
        assert!(authorize(&headers, &secret).is_ok());

        headers.insert(header::AUTHORIZATION, "Bearer api-secre".parse().unwrap());
        assert!(matches!(
            authorize(&headers, &secret),
            Err(ApiError::InvalidAuthorization)
        ));
    }
}
