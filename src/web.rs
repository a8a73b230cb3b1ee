//! HTTP surface of the provisioner.
//!
//! Handlers only translate between JSON and the service types. Device and user
//! identities arrive in `X-Device-ID` / `X-User-ID`, set by the gateway in front
//! of this service after it has authenticated the caller.
use crate::activation::ActivationCodeIssuer;
use crate::claim::ClaimCoordinator;
use crate::clock::{Clock, SystemClock};
use crate::errors::ProvisionError;
use crate::jwks::JwksManager;
use crate::registration::{CredentialIssuer, Registration};
use crate::settings::Settings;
use crate::storage::DeviceStore;
use crate::token::{AccessToken, AccessTokenIssuer};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwks: JwksManager,
    pub registration: CredentialIssuer,
    pub activation: ActivationCodeIssuer,
    pub claims: ClaimCoordinator,
    pub tokens: AccessTokenIssuer,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn DeviceStore>,
        jwks: JwksManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registration = CredentialIssuer::new(store.clone(), clock.clone());
        let activation =
            ActivationCodeIssuer::new(store.clone(), clock.clone(), &settings.provisioning);
        let claims = ClaimCoordinator::new(store.clone(), clock.clone(), &settings.provisioning);
        let tokens = AccessTokenIssuer::new(store, clock, jwks.clone(), &settings);

        Self {
            settings: Arc::new(settings),
            jwks,
            registration,
            activation,
            claims,
            tokens,
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    // Secrets, codes and tokens must never sit in a shared cache
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/register", post(register))
        .route("/activate", post(activate))
        .route("/claim", post(claim))
        .route("/auth/token", post(token));

    Router::new()
        .nest("/api/v1", api)
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/health", get(health))
        .layer(middleware::from_fn(security_headers))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
        .with_state(state)
}

// Service spans nest under this one, so every event carries the request id
fn request_span(request: &Request<Body>) -> tracing::Span {
    let request_id = header_value(request.headers(), REQUEST_ID_HEADER).unwrap_or("-");
    tracing::info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
    )
}

pub async fn serve(
    settings: Settings,
    store: Arc<dyn DeviceStore>,
    jwks: JwksManager,
) -> miette::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let state = AppState::new(settings, store, jwks, Arc::new(SystemClock));
    let router = router(state);

    tracing::info!(%addr, "Provisioning API listening");
    tracing::warn!("Rate limiting should be configured at the reverse proxy level for production");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;
    tracing::info!("Provisioning API stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested, draining connections"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn device_id(headers: &HeaderMap) -> Result<&str, ProvisionError> {
    header_value(headers, DEVICE_ID_HEADER)
        .ok_or_else(|| ProvisionError::Validation("missing X-Device-ID header".to_string()))
}

fn user_id(headers: &HeaderMap) -> Result<&str, ProvisionError> {
    header_value(headers, USER_ID_HEADER)
        .ok_or_else(|| ProvisionError::Unauthenticated("missing X-User-ID header".to_string()))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ProvisionError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ProvisionError::Validation(rejection.body_text()))
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Registration>, ProvisionError> {
    let device_id = device_id(&headers)?;
    let registration = state.registration.register(device_id).await?;
    Ok(Json(registration))
}

async fn activate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProvisionError> {
    let device_id = device_id(&headers)?;
    let grant = state.activation.issue(device_id).await?;
    Ok(Json(json!({
        "status": "activation code generated",
        "activation_code": grant.activation_code,
        "validity_seconds": grant.validity_seconds,
    })))
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    activation_code: String,
}

async fn claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<Value>, ProvisionError> {
    let user_id = user_id(&headers)?;
    let req = json_body(body)?;

    let outcome = state.claims.claim(&req.activation_code, user_id).await?;
    if outcome.already_claimed_by_same_user {
        return Ok(Json(json!({
            "status": "already-claimed",
            "message": "device already belongs to you",
        })));
    }
    Ok(Json(json!({ "status": "claimed" })))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    timestamp: i64,
    signature: String,
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<AccessToken>, ProvisionError> {
    let device_id = device_id(&headers)?;
    let req = json_body(body)?;
    let token = state
        .tokens
        .issue(device_id, req.timestamp, &req.signature)
        .await?;
    Ok(Json(token))
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwks.jwks_json())
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::DeviceSecret;
    use crate::jwks::test_keys;
    use crate::storage::MemoryDeviceStore;
    use crate::token::compute_signature;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    const NOW: i64 = 1_700_000_000;

    fn test_app() -> Router {
        let state = AppState::new(
            Settings::default(),
            Arc::new(MemoryDeviceStore::new()),
            test_keys::manager(),
            Arc::new(ManualClock::new(NOW)),
        );
        router(state)
    }

    fn post_json(uri: &str, headers: &[(&str, &str)], body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_register_requires_device_header() {
        let app = test_app();
        let (status, body) = send(&app, post_json("/api/v1/register", &[], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing X-Device-ID header");
    }

    #[tokio::test]
    async fn test_register_returns_secret() {
        let app = test_app();
        let (status, body) = send(
            &app,
            post_json("/api/v1/register", &[("X-Device-ID", "dev-1")], None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "dev-1");
        assert_eq!(body["hmac_secret"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_activate_unregistered_device_is_not_found() {
        let app = test_app();
        let (status, body) = send(
            &app,
            post_json("/api/v1/activate", &[("X-Device-ID", "ghost")], None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "device not registered - call /register first");
    }

    #[tokio::test]
    async fn test_claim_requires_user_header() {
        let app = test_app();
        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/claim",
                &[],
                Some(json!({ "activation_code": "ABCDEFGHJ" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_claim_rejects_malformed_body() {
        let app = test_app();
        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/claim",
                &[("X-User-ID", "user-1")],
                Some(json!({ "code": 42 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_claim_unknown_code_is_not_found() {
        let app = test_app();
        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/claim",
                &[("X-User-ID", "user-1")],
                Some(json!({ "activation_code": "ZZZZZZZZZ" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "invalid activation code");
    }

    #[tokio::test]
    async fn test_full_device_lifecycle() {
        let app = test_app();
        let device = [("X-Device-ID", "dev-1")];

        let (_, reg) = send(&app, post_json("/api/v1/register", &device, None)).await;
        let secret = DeviceSecret::from_hex(reg["hmac_secret"].as_str().unwrap()).unwrap();

        let (status, act) = send(&app, post_json("/api/v1/activate", &device, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(act["status"], "activation code generated");
        assert_eq!(act["validity_seconds"], 1800);
        let code = act["activation_code"].as_str().unwrap().to_string();

        let claim_body = json!({ "activation_code": code });
        let (status, body) = send(
            &app,
            post_json("/api/v1/claim", &[("X-User-ID", "user-1")], Some(claim_body.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "claimed");

        // The code was consumed by the claim
        let (status, _) = send(
            &app,
            post_json("/api/v1/claim", &[("X-User-ID", "user-2")], Some(claim_body)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let signature = compute_signature(&secret, "dev-1", NOW).unwrap();
        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/auth/token",
                &device,
                Some(json!({ "timestamp": NOW, "signature": signature })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tokenType"], "Bearer");
        assert_eq!(body["expiresIn"], 86_400);
        assert!(body["token"].as_str().unwrap().split('.').count() == 3);
    }

    #[tokio::test]
    async fn test_reclaim_reports_already_claimed() {
        let app = test_app();
        let device = [("X-Device-ID", "dev-1")];
        send(&app, post_json("/api/v1/register", &device, None)).await;

        for expected in ["claimed", "already-claimed"] {
            let (_, act) = send(&app, post_json("/api/v1/activate", &device, None)).await;
            let (status, body) = send(
                &app,
                post_json(
                    "/api/v1/claim",
                    &[("X-User-ID", "user-1")],
                    Some(json!({ "activation_code": act["activation_code"] })),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], expected);
        }

        let (_, act) = send(&app, post_json("/api/v1/activate", &device, None)).await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/claim",
                &[("X-User-ID", "user-2")],
                Some(json!({ "activation_code": act["activation_code"] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "device already claimed by another user");
    }

    #[tokio::test]
    async fn test_token_with_bad_signature_is_unauthorized() {
        let app = test_app();
        let device = [("X-Device-ID", "dev-1")];
        send(&app, post_json("/api/v1/register", &device, None)).await;

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/auth/token",
                &device,
                Some(json!({ "timestamp": NOW, "signature": "00".repeat(32) })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid signature");
    }

    #[tokio::test]
    async fn test_token_with_stale_timestamp_is_unauthorized() {
        let app = test_app();
        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/auth/token",
                &[("X-Device-ID", "dev-1")],
                Some(json!({ "timestamp": NOW - 301, "signature": "00" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "timestamp expired or invalid");
    }

    #[tokio::test]
    async fn test_jwks_and_health() {
        let app = test_app();

        let req = Request::builder()
            .uri("/.well-known/jwks.json")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keys"][0]["kid"], "device-access-token");

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_responses_carry_security_headers() {
        let app = test_app();
        let resp = app
            .oneshot(post_json("/api/v1/register", &[("X-Device-ID", "dev-1")], None))
            .await
            .unwrap();
        let headers = resp.headers();
        assert_eq!(headers["cache-control"], "no-store");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_requests_get_an_id() {
        let app = test_app();

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(generated).is_ok());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(REQUEST_ID_HEADER, "gw-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "gw-123");
    }
}
