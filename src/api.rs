//! HTTP surface for ragdesk.
//!
//! - `POST /upload` – multipart `file`; requires a signed-in (non-guest) session. Returns
//!   `{filename, message, collection_name}` where `collection_name` is the short name.
//! - `GET /status/:short_name` – `{status}` for one of the caller's documents.
//! - `POST /chat` – `{message, collection_name?, history}` → `{answer}`.
//! - `POST /logout`, `POST /session/end` – delete the tenant's collections, then end the session.
//! - `POST /session` – identity provider opens a session (requires `x-session-secret`).
//! - `POST /session/guest` – open a guest session.
//! - `GET /user_info` – `{name, email, picture}` or `{error: "Not logged in"}`.
//! - `GET /health`, `GET /metrics` – store reachability and pipeline counters.

use crate::chat::{ChatError, ChatRequest, ConversationalRag};
use crate::dispatcher::{JobDispatcher, SubmitError};
use crate::metrics::PipelineMetrics;
use crate::namespace::NamespaceManager;
use crate::session::{Identity, SESSION_COOKIE, SessionStore, end_session, token_from_headers};
use crate::status::JobStatus;
use crate::store::VectorStore;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Header the identity provider uses to authenticate `POST /session`.
pub const SESSION_SECRET_HEADER: &str = "x-session-secret";

const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared handler state.
pub struct AppState {
    /// Upload admission and scheduling.
    pub dispatcher: JobDispatcher,
    /// Conversational retrieval.
    pub chat: ConversationalRag,
    /// Session registry.
    pub sessions: Arc<SessionStore>,
    /// Tenant collection cleanup.
    pub namespace: NamespaceManager,
    /// Store used for health checks.
    pub store: Arc<dyn VectorStore>,
    /// Pipeline counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Secret required to open signed-in sessions; `None` disables `POST /session`.
    pub session_issuer_secret: Option<String>,
}

impl AppState {
    fn identity(&self, headers: &HeaderMap) -> Option<Identity> {
        token_from_headers(headers).and_then(|token| self.sessions.resolve(&token))
    }
}

/// Build the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.dispatcher.policy().max_bytes + MULTIPART_OVERHEAD_BYTES;
    Router::new()
        .route(
            "/upload",
            post(upload_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/status/:short_name", get(get_status))
        .route("/chat", post(chat))
        .route("/logout", post(logout))
        .route("/session/end", post(logout))
        .route("/session", post(open_session))
        .route("/session/guest", post(open_guest_session))
        .route("/user_info", get(user_info))
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Success response for `POST /upload`.
#[derive(Serialize)]
struct UploadResponse {
    filename: String,
    message: String,
    /// Short name the client uses for status polling and chat.
    collection_name: String,
}

/// Accept a document upload and queue it for ingestion.
///
/// Type is checked before the body is read and the size ceiling is enforced while streaming,
/// so rejected uploads never reach the staging area.
async fn upload_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let identity = state.identity(&headers).ok_or(AppError::Unauthorized)?;
    if identity.guest {
        return Err(AppError::Forbidden("Guests cannot upload documents"));
    }

    let policy = state.dispatcher.policy();
    while let Some(mut field) = multipart.next_field().await.map_err(AppError::multipart)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("Missing filename".into()))?;
        policy.check_type(&filename)?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(AppError::multipart)? {
            policy.check_size(bytes.len() + chunk.len()).or_else(|error| match error {
                SubmitError::EmptyFile => Ok(()),
                other => Err(other),
            })?;
            bytes.extend_from_slice(&chunk);
        }

        let handle = state
            .dispatcher
            .submit(&filename, &bytes, &identity.tenant_id)
            .await?;
        return Ok(Json(UploadResponse {
            filename: handle.filename,
            message: "File uploaded. Processing has started.".into(),
            collection_name: handle.short_name,
        }));
    }

    Err(AppError::BadRequest("Missing 'file' field".into()))
}

#[derive(Serialize)]
struct StatusResponse {
    status: JobStatus,
}

/// Report the pipeline status of one of the caller's documents.
async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(short_name): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let identity = state.identity(&headers).ok_or(AppError::Unauthorized)?;
    let status = state
        .dispatcher
        .get_status(&identity.tenant_id, &short_name);
    Ok(Json(StatusResponse { status }))
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
}

/// Answer a chat message against the global knowledge base and the caller's document.
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let identity = state.identity(&headers);
    let outcome = state
        .chat
        .answer(
            identity.as_ref().map(|identity| identity.tenant_id.as_str()),
            &request,
        )
        .await?;
    Ok(Json(ChatResponse {
        answer: outcome.answer_text().to_string(),
    }))
}

/// End the caller's session, removing their collections first.
async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = token_from_headers(&headers) {
        end_session(&state.sessions, &state.namespace, &token).await;
    }
    (
        [(header::SET_COOKIE, clear_session_cookie())],
        Json(json!({ "message": "Logged out" })),
    )
        .into_response()
}

/// Body of `POST /session`.
#[derive(Deserialize)]
struct OpenSessionRequest {
    name: String,
    email: String,
    #[serde(default)]
    picture: Option<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    token: String,
}

/// Open a signed-in session on behalf of the identity provider.
async fn open_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<OpenSessionRequest>,
) -> Result<Response, AppError> {
    let Some(expected) = state.session_issuer_secret.as_deref() else {
        return Err(AppError::Forbidden("Session issuing is disabled"));
    };
    let presented = headers
        .get(SESSION_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if !presented.is_some_and(|presented| secrets_match(presented, expected)) {
        return Err(AppError::Forbidden("Invalid session issuer secret"));
    }
    if request.email.trim().is_empty() {
        return Err(AppError::BadRequest("email is required".into()));
    }

    let identity = Identity::user(request.name, request.email.trim(), request.picture);
    Ok(session_response(state.sessions.open(identity)))
}

/// Open a guest session.
async fn open_guest_session(State(state): State<Arc<AppState>>) -> Response {
    session_response(state.sessions.open(Identity::guest()))
}

/// Compare secrets in time independent of where they differ.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

fn session_response(token: String) -> Response {
    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
    (
        [(header::SET_COOKIE, cookie)],
        Json(SessionResponse { token }),
    )
        .into_response()
}

fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}

/// Profile of the signed-in user.
async fn user_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<serde_json::Value> {
    match state.identity(&headers) {
        Some(identity) => Json(json!({
            "name": identity.name,
            "email": identity.email,
            "picture": identity.picture,
        })),
        None => Json(json!({ "error": "Not logged in" })),
    }
}

/// Report whether the vector store answers.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_collections().await {
        Ok(collections) => Json(json!({
            "status": "ok",
            "collections": collections.len(),
        }))
        .into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": error.to_string() })),
            )
                .into_response()
        }
    }
}

/// Return pipeline counters.
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

enum AppError {
    Unauthorized,
    Forbidden(&'static str),
    BadRequest(String),
    Submit(SubmitError),
    Chat(ChatError),
}

impl AppError {
    fn multipart(error: axum::extract::multipart::MultipartError) -> Self {
        Self::BadRequest(format!("Invalid multipart body: {}", error.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Not logged in".to_string()),
            Self::Forbidden(reason) => (StatusCode::FORBIDDEN, reason.to_string()),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            Self::Submit(error) => {
                let status = match &error {
                    SubmitError::UnsupportedType(_)
                    | SubmitError::TooLarge { .. }
                    | SubmitError::EmptyFile => StatusCode::BAD_REQUEST,
                    SubmitError::JobInFlight(_) => StatusCode::CONFLICT,
                    SubmitError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                    SubmitError::Staging(_) => {
                        tracing::error!(error = %error, "Upload staging failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, error.to_string())
            }
            Self::Chat(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<SubmitError> for AppError {
    fn from(inner: SubmitError) -> Self {
        Self::Submit(inner)
    }
}

impl From<ChatError> for AppError {
    fn from(inner: ChatError) -> Self {
        Self::Chat(inner)
    }
}
