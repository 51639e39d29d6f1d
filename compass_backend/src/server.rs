use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ServiceConfig;
use crate::context::{ContextAggregator, Identity, SqliteContextSource};
use crate::database::Database;
use crate::error::ChatError;
use crate::orchestrator::{ChatOrchestrator, ChatReply, ChatRequest};
use crate::persistence::PersistenceManager;
use crate::providers::ProviderSet;

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub auth: BackendAuthConfig,
    pub identity_header: HeaderName,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct SuccessEnvelope<T> {
    success: bool,
    data: T,
}

/// JSON error reply: `{success: false, error}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        match error {
            ChatError::MissingMessage => ApiError::new(StatusCode::BAD_REQUEST, error.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

/// Open the store, wire the providers and serve until the listener fails.
pub async fn serve_backend(config: ServiceConfig) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}' (expected host:port)", config.bind_addr))?;

    let auth = load_auth_config()?;
    let identity_header = HeaderName::try_from(config.identity_header.as_str())
        .with_context(|| format!("Invalid identity header '{}'", config.identity_header))?;

    let db = Arc::new(Database::open(&config.database_path, config.pool_size)?);
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .context("Failed to build HTTP client")?;
    let providers = ProviderSet::from_config(&config, http);
    let aggregator = ContextAggregator::new(
        Arc::new(SqliteContextSource::new(db.clone())),
        config.context.clone(),
    );
    let store = Arc::new(PersistenceManager::new(db));
    let orchestrator = ChatOrchestrator::new(Arc::new(config), providers, aggregator, store);

    let state = Arc::new(ServerState {
        orchestrator: Arc::new(orchestrator),
        auth,
        identity_header,
    });

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Compass backend listening on http://{}", bind_addr);
    axum::serve(listener, build_router(state))
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().route("/health", get(health)).merge(protected)
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("COMPASS_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("COMPASS_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "COMPASS_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; chat routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid COMPASS_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(&headers, &state.auth)
        .map_err(|status| ApiError::new(status, "missing or invalid bearer token"))?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

/// Caller identity from the gateway header. Absent or malformed values mean
/// an anonymous caller.
fn resolve_identity(headers: &HeaderMap, header_name: &HeaderName) -> Option<Identity> {
    let raw = headers.get(header_name)?.to_str().ok()?.trim();
    match raw.parse::<i64>() {
        Ok(user_id) if user_id > 0 => Some(Identity::new(user_id)),
        _ => {
            if !raw.is_empty() {
                tracing::warn!("Ignoring malformed identity header value '{}'", raw);
            }
            None
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let identity = resolve_identity(&headers, &state.identity_header);
    if request.stream {
        return stream_reply(&state, identity, request).await;
    }

    let reply: ChatReply = state.orchestrator.respond(identity, request).await?;
    Ok(Json(SuccessEnvelope {
        success: true,
        data: reply,
    })
    .into_response())
}

async fn chat_stream(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let identity = resolve_identity(&headers, &state.identity_header);
    stream_reply(&state, identity, request).await
}

async fn stream_reply(
    state: &ServerState,
    identity: Option<Identity>,
    request: ChatRequest,
) -> Result<Response, ApiError> {
    let (responder, frames) = state.orchestrator.respond_stream(identity, request).await?;
    let body = Body::from_stream(
        ReceiverStream::new(frames).map(|frame| Ok::<_, Infallible>(frame.to_wire())),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-compass-provider", responder.to_string())
        .body(body)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextLimits;
    use crate::database::test_support::{exec, temp_db, TestDb};
    use crate::orchestrator::test_support::RecordingStore;
    use crate::streaming::Frame;
    use axum::http::HeaderValue;

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let headers = HeaderMap::new();
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        let headers = HeaderMap::new();
        assert!(authorize(&headers, &BackendAuthConfig::disabled()).is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn identity_header_parses_positive_ids_only() {
        let name = HeaderName::from_static("x-user-id");
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_identity(&headers, &name), None);

        headers.insert(name.clone(), HeaderValue::from_static(" 42 "));
        assert_eq!(resolve_identity(&headers, &name), Some(Identity::new(42)));

        headers.insert(name.clone(), HeaderValue::from_static("abc"));
        assert_eq!(resolve_identity(&headers, &name), None);

        headers.insert(name.clone(), HeaderValue::from_static("-3"));
        assert_eq!(resolve_identity(&headers, &name), None);
    }

    async fn spawn_server(test: &TestDb, auth: BackendAuthConfig) -> (String, Arc<RecordingStore>) {
        exec(
            &test.db,
            "INSERT INTO users (id, name, email, role) VALUES (5, 'Ada', NULL, 'student');",
        )
        .await;
        let store = Arc::new(RecordingStore::default());
        let aggregator = ContextAggregator::new(
            Arc::new(SqliteContextSource::new(test.db.clone())),
            ContextLimits::default(),
        );
        let orchestrator = ChatOrchestrator::new(
            Arc::new(ServiceConfig::default()),
            ProviderSet::default(),
            aggregator,
            store.clone(),
        );
        let state = Arc::new(ServerState {
            orchestrator: Arc::new(orchestrator),
            auth,
            identity_header: HeaderName::from_static("x-user-id"),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, build_router(state)).await;
        });
        (format!("http://{}", addr), store)
    }

    #[tokio::test]
    async fn chat_returns_success_envelope_and_persists_for_known_user() {
        let test = temp_db(2);
        let (base, store) = spawn_server(&test, BackendAuthConfig::disabled()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .header("x-user-id", "5")
            .json(&serde_json::json!({ "message": "Any interview tips?" }))
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["success"], true);
        assert!(body["data"]["response"]
            .as_str()
            .expect("response text")
            .contains("interview"));
        assert_eq!(body["data"]["provider"], "fallback");
        assert_eq!(body["data"]["conversationId"], "conv-1");
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn blank_message_is_a_bad_request() {
        let test = temp_db(1);
        let (base, store) = spawn_server(&test, BackendAuthConfig::disabled()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({ "message": "" }))
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "message is required");
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn chat_routes_require_token_but_health_does_not() {
        let test = temp_db(1);
        let (base, _) = spawn_server(&test, BackendAuthConfig::bearer("secret")).await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/health")).send().await.expect("health");
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let denied = client
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({ "message": "hi" }))
            .send()
            .await
            .expect("send");
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client
            .post(format!("{base}/chat"))
            .bearer_auth("secret")
            .json(&serde_json::json!({ "message": "hi" }))
            .send()
            .await
            .expect("send");
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_endpoint_sends_sse_frames_ending_in_done() {
        let test = temp_db(2);
        let (base, _) = spawn_server(&test, BackendAuthConfig::disabled()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({ "message": "hello", "stream": true }))
            .send()
            .await
            .expect("send");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE.as_str()],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL.as_str()], "no-cache");

        let text = response.text().await.expect("body");
        let frames: Vec<Frame> = text
            .split("\n\n")
            .filter_map(|block| block.strip_prefix("data: "))
            .filter_map(Frame::from_data)
            .collect();
        assert!(matches!(frames.first(), Some(Frame::Delta(reply)) if reply.starts_with("Hello")));
        assert_eq!(frames.last(), Some(&Frame::Done));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }
}
