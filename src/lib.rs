pub mod aggregator;
pub mod analysis;
pub mod console;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod multiplexer;
pub mod playback;
pub mod registry;
pub mod store;
pub mod stream_url;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use analysis::AnalysisClient;
use console::{Console, ConsoleOptions};
use error::ConsoleError;
use lifecycle::LifecycleManager;
use model::{HazardCounters, Source};
use playback::{PlaybackManager, PlayerFactory};
use store::DocumentStore;
use stream_url::derive_playback_url_with_port;

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub operator_id: String,
    pub recent_log_limit: usize,
    pub analysis_url: String,
    pub analysis_timeout: Duration,
    pub hls_port: u16,
    pub metrics_enabled: bool,
}

impl AppOptions {
    pub fn new(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: operator_id.into(),
            recent_log_limit: 5,
            analysis_url: "http://localhost:5000".to_string(),
            analysis_timeout: analysis::DEFAULT_TIMEOUT,
            hls_port: stream_url::DEFAULT_HLS_PORT,
            metrics_enabled: true,
        }
    }
}

pub struct AppState {
    pub console: Console,
    pub lifecycle: LifecycleManager,
    pub playback: PlaybackManager,
    pub analysis: AnalysisClient,
    pub hls_port: u16,
    pub metrics_enabled: bool,
}

/// Starts the console for one operator and wires the managers around it.
///
/// Fails if the operator's camera registry cannot be subscribed.
pub async fn build_state(
    store: Arc<dyn DocumentStore>,
    options: AppOptions,
    players: Arc<dyn PlayerFactory>,
) -> anyhow::Result<Arc<AppState>> {
    let playback = PlaybackManager::new(players, options.hls_port);
    let console = Console::start(
        store.clone(),
        ConsoleOptions {
            operator_id: options.operator_id.clone(),
            recent_log_limit: options.recent_log_limit,
        },
        playback.clone(),
    )
    .await?;
    let lifecycle = LifecycleManager::new(store.clone(), options.operator_id.clone(), playback.clone());
    let analysis = AnalysisClient::new(
        options.analysis_url.clone(),
        options.analysis_timeout,
        store,
        options.operator_id.clone(),
    )?;

    Ok(Arc::new(AppState {
        console,
        lifecycle,
        playback,
        analysis,
        hls_port: options.hls_port,
        metrics_enabled: options.metrics_enabled,
    }))
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/api/cameras", get(cameras_api_handler).post(register_handler))
        .route("/api/cameras/{id}", delete(remove_handler))
        .route("/api/cameras/{id}/logs", get(logs_handler))
        .route("/api/cameras/{id}/analysis/start", post(start_analysis_handler))
        .route("/api/cameras/{id}/analysis/stop", post(stop_analysis_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/playback", get(playback_state_handler).delete(detach_handler))
        .route("/api/playback/{id}", post(attach_handler));
    if state.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }
    router.fallback(fallback_handler).with_state(state)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraView {
    pub id: String,
    pub name: String,
    pub ingest_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub playback_url: Option<String>,
    pub analyzing: bool,
}

impl CameraView {
    fn new(source: &Source, analyzing: bool, hls_port: u16) -> Self {
        Self {
            id: source.id.clone(),
            name: source.name.clone(),
            ingest_url: source.ingest_url.clone(),
            latitude: source.latitude,
            longitude: source.longitude,
            playback_url: derive_playback_url_with_port(&source.ingest_url, hls_port).ok(),
            analyzing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCounts {
    pub counters: HazardCounters,
    pub tallies: HazardCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsView {
    pub totals: HazardCounters,
    pub sources: BTreeMap<String, SourceCounts>,
    pub live_subscriptions: usize,
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    latitude: Value,
    #[serde(default)]
    longitude: Value,
}

// Form inputs arrive as strings, API clients tend to send numbers.
fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn error_response(err: &ConsoleError) -> Response {
    let status = match err {
        ConsoleError::InvalidInput(_) | ConsoleError::InvalidStreamUrl(_) => StatusCode::BAD_REQUEST,
        ConsoleError::DuplicateSource(_) => StatusCode::CONFLICT,
        ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
        ConsoleError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ConsoleError::ControlEndpointFailure(_) | ConsoleError::PlayerFailure(_) => StatusCode::BAD_GATEWAY,
        ConsoleError::PartialCascadeFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": err.as_label(), "message": err.to_string() })),
    )
        .into_response()
}

fn lookup(state: &AppState, id: &str) -> Result<Source, Response> {
    state
        .console
        .snapshot()
        .source(id)
        .cloned()
        .ok_or_else(|| error_response(&ConsoleError::NotFound(id.to_string())))
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    (StatusCode::NOT_FOUND, "Not found")
}

async fn cameras_api_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CameraView>> {
    let snapshot = state.console.snapshot();
    Json(
        snapshot
            .sources
            .values()
            .map(|s| CameraView::new(s, snapshot.is_analyzing(&s.id), state.hls_port))
            .collect(),
    )
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Response {
    let result = state
        .lifecycle
        .register(
            &payload.name,
            &payload.url,
            &field_text(&payload.latitude),
            &field_text(&payload.longitude),
        )
        .await;
    match result {
        Ok(source) => (
            StatusCode::CREATED,
            Json(CameraView::new(&source, false, state.hls_port)),
        )
            .into_response(),
        Err(e) => {
            warn!("Camera registration rejected: name={:?} err={}", payload.name, e);
            error_response(&e)
        }
    }
}

async fn remove_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    if let Err(resp) = lookup(&state, &id) {
        return resp;
    }
    let report = state.lifecycle.remove(&id).await;
    let status = if report.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(report)).into_response()
}

async fn logs_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.console.snapshot();
    match snapshot.stats.get(&id) {
        Some(stats) => Json(stats).into_response(),
        None => error_response(&ConsoleError::NotFound(id)),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsView> {
    let snapshot = state.console.snapshot();
    let sources = snapshot
        .stats
        .iter()
        .map(|(id, stats)| {
            (
                id.clone(),
                SourceCounts {
                    counters: stats.counters,
                    tallies: stats.tallies,
                },
            )
        })
        .collect();
    Json(StatsView {
        totals: snapshot.totals,
        sources,
        live_subscriptions: snapshot.live_subscriptions,
    })
}

async fn start_analysis_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let source = match lookup(&state, &id) {
        Ok(source) => source,
        Err(resp) => return resp,
    };
    match state.analysis.start(&source).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn stop_analysis_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let source = match lookup(&state, &id) {
        Ok(source) => source,
        Err(resp) => return resp,
    };
    match state.analysis.stop(&source).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn attach_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let source = match lookup(&state, &id) {
        Ok(source) => source,
        Err(resp) => return resp,
    };
    let info = match state.playback.attach(&source) {
        Ok(info) => info,
        Err(e) => return error_response(&e),
    };
    // The camera may have been removed while the session was being set up.
    if !state.console.is_registered(&id) {
        state.playback.detach_source(&id);
        return error_response(&ConsoleError::NotFound(id));
    }
    Json(info).into_response()
}

async fn detach_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.playback.detach();
    StatusCode::NO_CONTENT
}

async fn playback_state_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.playback.current()).into_response()
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

