//! HTTP API with a streaming analyze endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/analyze` | Analyze a transcript; responds with `text/event-stream` |
//! | `GET`  | `/api/analyses/{id}` | Fetch a stored analysis |
//! | `GET`  | `/api/usage` | Token ledger for today (or `?date=YYYY-MM-DD`) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /api/analyze` accepts either a JSON body
//! `{ "client_id", "text", "method": "text", "participants"?, "profile"? }`
//! or `multipart/form-data` with a `file` part plus `client_id`,
//! `participants` (JSON array or comma list) and `profile` (JSON object)
//! fields. Each analysis event is sent as one `data: <json>` frame. The
//! stream ends with one `complete` frame or one fatal `error` frame.
//! Closing the connection cancels the run.
//!
//! # Error Contract
//!
//! Failures before the stream starts use the JSON envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "text must be a string" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `llm_disabled` (503), `internal` (500).

use std::sync::Arc;

use axum::{
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use parley_core::models::{AnalysisRequest, ProfileContext, StoredAnalysis};

use crate::budget::UsageSnapshot;
use crate::config::Config;
use crate::extract;
use crate::llm;
use crate::services::Services;
use crate::stream;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    services: Arc<Services>,
    /// Cancelled on server shutdown; every run gets a child token.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Arc<Config>, services: Arc<Services>) -> Self {
        Self {
            config,
            services,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/analyze", post(handle_analyze))
        .route("/api/analyses/{id}", get(handle_get_analysis))
        .route("/api/usage", get(handle_usage))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Services::open_store(config).await?;
    let llm = llm::create_client(&config.llm)?;
    if llm.is_none() {
        tracing::warn!("llm provider is disabled, /api/analyze will answer 503");
    }
    let services = Arc::new(Services::new(config, store, llm));
    let state = AppState::new(Arc::new(config.clone()), services);
    let shutdown = state.shutdown_token();

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Parley server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested, cancelling in-flight analyses");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn llm_disabled() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "llm_disabled",
        message: "analysis requires an llm provider; set [llm].provider".to_string(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/analyze ============

/// `participants` arrives as a list in JSON bodies and sometimes as a
/// comma-separated string from form clients.
#[derive(Deserialize)]
#[serde(untagged)]
enum Participants {
    List(Vec<String>),
    Text(String),
}

impl Participants {
    fn into_vec(self) -> Vec<String> {
        match self {
            Participants::List(names) => names,
            Participants::Text(raw) => split_participants(&raw),
        }
    }
}

#[derive(Deserialize)]
struct AnalyzeBody {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    participants: Option<Participants>,
    #[serde(default)]
    profile: Option<serde_json::Value>,
}

async fn handle_analyze(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let orchestrator = state
        .services
        .orchestrator
        .clone()
        .ok_or_else(llm_disabled)?;

    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let analysis = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        read_multipart(multipart, state.config.analysis.max_text_chars).await?
    } else {
        let Json(body) = Json::<AnalyzeBody>::from_request(request, &state)
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        from_json_body(body)?
    };

    tracing::info!(
        client_id = %analysis.client_id,
        chars = analysis.text.len(),
        "analysis requested"
    );

    let (emitter, events) = stream::event_stream(stream::DEFAULT_CAPACITY);
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        orchestrator.run(analysis, emitter, cancel).await;
    });

    let frames = events.map(|event| Event::default().json_data(&event));
    Ok(Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn from_json_body(body: AnalyzeBody) -> Result<AnalysisRequest, AppError> {
    if let Some(method) = body.method.as_deref() {
        if method != "text" {
            return Err(bad_request(format!(
                "unsupported method '{}' for JSON bodies; upload files as multipart",
                method
            )));
        }
    }
    Ok(AnalysisRequest {
        client_id: body.client_id,
        text: body.text,
        participants: body.participants.map(Participants::into_vec),
        profile: body.profile.as_ref().map(ProfileContext::from_json),
    })
}

async fn read_multipart(
    mut multipart: Multipart,
    max_text_chars: usize,
) -> Result<AnalysisRequest, AppError> {
    let mut client_id = String::new();
    let mut text: Option<String> = None;
    let mut participants = None;
    let mut profile = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
                // Extracted text is bounded by the raw upload; reject obvious overflows early.
                if bytes.len() > max_text_chars.saturating_mul(8) {
                    return Err(bad_request("uploaded file is too large"));
                }
                let extracted =
                    extract::extract_text(&bytes, filename.as_deref(), content_type.as_deref())
                        .map_err(|e| bad_request(e.to_string()))?;
                text = Some(extracted);
            }
            "text" => {
                text = Some(field.text().await.map_err(|e| bad_request(e.body_text()))?);
            }
            "client_id" => {
                client_id = field.text().await.map_err(|e| bad_request(e.body_text()))?;
            }
            "participants" => {
                let raw = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                participants = Some(parse_participants_field(&raw));
            }
            "profile" => {
                let raw = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                if !raw.trim().is_empty() {
                    let value: serde_json::Value = serde_json::from_str(&raw)
                        .map_err(|e| bad_request(format!("profile must be JSON: {}", e)))?;
                    profile = Some(ProfileContext::from_json(&value));
                }
            }
            other => tracing::debug!(field = other, "ignoring multipart field"),
        }
    }

    let text = text.ok_or_else(|| bad_request("multipart body needs a file or text field"))?;
    Ok(AnalysisRequest {
        client_id,
        text,
        participants,
        profile,
    })
}

fn parse_participants_field(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(names) => names,
        Err(_) => split_participants(raw),
    }
}

fn split_participants(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

// ============ GET /api/analyses/{id} ============

async fn handle_get_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredAnalysis>, AppError> {
    state
        .services
        .store
        .get_analysis(&id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("analysis not found: {}", id)))
}

// ============ GET /api/usage ============

#[derive(Deserialize)]
struct UsageQuery {
    date: Option<NaiveDate>,
}

async fn handle_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageSnapshot>, AppError> {
    let ledger = &state.services.ledger;
    let snapshot = match query.date {
        Some(day) => ledger.usage_for(day).await,
        None => ledger.usage_today().await,
    };
    snapshot.map(Json).map_err(internal)
}
