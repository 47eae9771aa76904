//! HTTP API over the GreenGauge session pipeline.
//!
//! Exposes users, devices, monitoring sessions, emission records, the
//! correlated series, the manufacturing leaderboard and the forecast proxy as
//! JSON endpoints. Failures share one body shape:
//! `{"success": false, "kind": "<kind>", "message": "..."}`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use greengauge_core::{
    Device, DeviceId, EmissionFactor, EmissionRecord, Forecast, ForecastClient,
    HttpTelemetrySource, LeaderboardEntry, ManufacturingEmissionProfile, NewAggregate, NewDevice,
    OpenSession, PipelineError, Readings, ReferenceData, Sample, SeriesPoint, SessionAggregate,
    SessionId, SessionKey, SessionPipeline, SessionSummary, StoreError, UsageEstimate, User,
    UserId, correlated_series, estimate_usage, forecast_for, latest_session, leaderboard,
};

/// Shared server state.
pub struct AppState {
    pipeline: SessionPipeline,
    reference: ReferenceData,
    forecast: ForecastClient,
}

impl AppState {
    pub fn new(pipeline: SessionPipeline, reference: ReferenceData) -> Result<Self, PipelineError> {
        let config = pipeline.config();
        let forecast = ForecastClient::new(config.forecast_url.clone(), config.request_timeout())?;
        Ok(Self {
            pipeline,
            reference,
            forecast,
        })
    }

    pub fn pipeline(&self) -> &SessionPipeline {
        &self.pipeline
    }

    fn resolve_factor(&self, body: &FactorBody) -> Result<EmissionFactor, PipelineError> {
        match (body.emission_factor, body.country.as_deref()) {
            (Some(value), _) => EmissionFactor::new(value),
            (None, Some(country)) => self.reference.require_factor(country),
            (None, None) => Err(PipelineError::validation(
                "emission_factor",
                "provide emission_factor or country",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub session_id: Option<SessionId>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    kind: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
}

impl ApiError {
    fn not_found(what: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: format!("{what} not found"),
            session_id: None,
        }
    }
}

/// HTTP status for a [`PipelineError::kind`].
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "validation" => StatusCode::BAD_REQUEST,
        "not_open" => StatusCode::NOT_FOUND,
        "conflict" | "correlation" => StatusCode::CONFLICT,
        "no_data" => StatusCode::UNPROCESSABLE_ENTITY,
        "upstream" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let kind = e.kind();
        let session_id = match &e {
            PipelineError::Incomplete { session_id, .. } => Some(*session_id),
            _ => None,
        };
        Self {
            status: status_for_kind(kind),
            kind,
            message: e.to_string(),
            session_id,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        PipelineError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("{} request failed: {}", self.kind, self.message);
        }
        let body = ErrorBody {
            success: false,
            kind: self.kind,
            message: &self.message,
            session_id: self.session_id,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_key(raw: &str) -> Result<SessionKey, ApiError> {
    raw.parse()
        .map_err(|_| PipelineError::validation("session_key", format!("'{raw}' is not a session key")).into())
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct NewUserBody {
    username: String,
}

#[derive(Serialize)]
struct UserCreated {
    user_id: UserId,
    username: String,
}

#[derive(Deserialize)]
struct ManufacturingBody {
    lifetime_years: f64,
    gwp_total: f64,
}

#[derive(Deserialize)]
struct OpenSessionBody {
    device_id: DeviceId,
    user_id: UserId,
    /// Status page to poll. Without it, samples must be posted.
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Serialize, Debug)]
struct SessionOpened {
    session_key: SessionKey,
    device_id: DeviceId,
    user_id: UserId,
    polled: bool,
}

#[derive(Deserialize, Default)]
struct FactorBody {
    #[serde(default)]
    emission_factor: Option<f64>,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Serialize)]
struct Cleared {
    cleared: usize,
}

#[derive(Deserialize)]
struct ClearParams {
    device_id: Option<DeviceId>,
}

#[derive(Serialize)]
struct SessionIdBody {
    session_id: Option<SessionId>,
}

#[derive(Serialize, Debug)]
struct Ack {
    success: bool,
}

#[derive(Deserialize)]
struct SeriesParams {
    user_id: UserId,
    device_id: DeviceId,
}

#[derive(Deserialize)]
struct EstimateBody {
    device_id: DeviceId,
    user_id: UserId,
    power_kw: f64,
    #[serde(default)]
    hours: f64,
    #[serde(default)]
    minutes: f64,
    #[serde(flatten)]
    factor: FactorBody,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    open_sessions: usize,
    pending_sessions: usize,
}

// ---------------------------------------------------------------------------
// Handlers: users and devices
// ---------------------------------------------------------------------------

async fn handle_create_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewUserBody>,
) -> Result<(StatusCode, Json<UserCreated>), ApiError> {
    let username = body.username.trim().to_string();
    if username.is_empty() {
        return Err(PipelineError::validation("username", "must not be empty").into());
    }
    let user_id = state.pipeline.store().insert_user(&username)?;
    log::info!("registered {user_id} as '{username}'");
    Ok((StatusCode::CREATED, Json(UserCreated { user_id, username })))
}

async fn handle_users(State(state): State<Arc<AppState>>) -> ApiResult<Vec<User>> {
    Ok(Json(state.pipeline.store().users()?))
}

async fn handle_create_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewDevice>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let store = state.pipeline.store();
    if !store.users()?.iter().any(|u| u.user_id == body.user_id) {
        return Err(PipelineError::validation("user_id", format!("unknown {}", body.user_id)).into());
    }
    let entry = state
        .reference
        .require_entry(&body.kind, &body.manufacturer, &body.model)?;
    let device_id = store.insert_device(body)?;
    let profile =
        ManufacturingEmissionProfile::compute(device_id, entry.lifetime_years, entry.gwp_total)?;
    store.set_manufacturing(profile)?;
    let device = store
        .device(device_id)?
        .ok_or_else(|| ApiError::not_found(device_id))?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn handle_user_devices(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<u64>,
) -> ApiResult<Vec<Device>> {
    Ok(Json(state.pipeline.store().devices_for_user(UserId(user_id))?))
}

async fn handle_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<u64>,
) -> ApiResult<Device> {
    let id = DeviceId(device_id);
    state
        .pipeline
        .store()
        .device(id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(id))
}

async fn handle_set_manufacturing(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<u64>,
    Json(body): Json<ManufacturingBody>,
) -> ApiResult<ManufacturingEmissionProfile> {
    let id = DeviceId(device_id);
    let store = state.pipeline.store();
    if store.device(id)?.is_none() {
        return Err(ApiError::not_found(id));
    }
    let profile = ManufacturingEmissionProfile::compute(id, body.lifetime_years, body.gwp_total)?;
    store.set_manufacturing(profile)?;
    Ok(Json(profile))
}

// ---------------------------------------------------------------------------
// Handlers: sessions and samples
// ---------------------------------------------------------------------------

async fn handle_open_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenSessionBody>,
) -> Result<(StatusCode, Json<SessionOpened>), ApiError> {
    let device = state
        .pipeline
        .store()
        .device(body.device_id)?
        .ok_or_else(|| PipelineError::validation("device_id", format!("unknown {}", body.device_id)))?;
    if device.user_id != body.user_id {
        return Err(PipelineError::validation(
            "user_id",
            format!("{} does not belong to {}", body.device_id, body.user_id),
        )
        .into());
    }

    let (session_key, polled) = match body.endpoint {
        Some(endpoint) => {
            let timeout = state.pipeline.config().request_timeout();
            let source = HttpTelemetrySource::new(body.device_id, endpoint, timeout)?;
            (state.pipeline.open_polled_session(source, body.user_id)?, true)
        }
        None => (state.pipeline.open_session(body.device_id, body.user_id)?, false),
    };
    Ok((
        StatusCode::CREATED,
        Json(SessionOpened {
            session_key,
            device_id: body.device_id,
            user_id: body.user_id,
            polled,
        }),
    ))
}

async fn handle_open_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<OpenSession>> {
    Json(state.pipeline.open_sessions())
}

async fn handle_record_sample(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(readings): Json<Readings>,
) -> Result<(StatusCode, Json<Sample>), ApiError> {
    let key = parse_key(&key)?;
    let sample = state.pipeline.record_sample(key, readings)?;
    Ok((StatusCode::CREATED, Json(sample)))
}

async fn handle_samples(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Vec<Sample>> {
    let key = parse_key(&key)?;
    Ok(Json(state.pipeline.buffered(key)?))
}

async fn handle_clear_session_samples(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Cleared> {
    let key = parse_key(&key)?;
    let cleared = state.pipeline.discard_samples(key)?;
    Ok(Json(Cleared { cleared }))
}

async fn handle_clear_samples(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClearParams>,
) -> Json<Cleared> {
    let cleared = state.pipeline.discard_all_samples(params.device_id);
    Json(Cleared { cleared })
}

async fn handle_close_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<FactorBody>,
) -> ApiResult<SessionSummary> {
    let key = parse_key(&key)?;
    let factor = state.resolve_factor(&body)?;
    Ok(Json(state.pipeline.close_session(key, factor).await?))
}

async fn handle_abort_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Cleared> {
    let key = parse_key(&key)?;
    let cleared = state.pipeline.abort_session(key).await?;
    Ok(Json(Cleared { cleared }))
}

// ---------------------------------------------------------------------------
// Handlers: aggregates and emissions
// ---------------------------------------------------------------------------

async fn handle_submit_aggregate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewAggregate>,
) -> Result<(StatusCode, Json<SessionIdBody>), ApiError> {
    let session_id = state.pipeline.submit_aggregate(body)?;
    Ok((
        StatusCode::CREATED,
        Json(SessionIdBody {
            session_id: Some(session_id),
        }),
    ))
}

async fn handle_latest_aggregate(State(state): State<Arc<AppState>>) -> ApiResult<SessionIdBody> {
    let session_id = latest_session(state.pipeline.store().as_ref())?;
    Ok(Json(SessionIdBody { session_id }))
}

async fn handle_pending(State(state): State<Arc<AppState>>) -> ApiResult<Vec<SessionAggregate>> {
    Ok(Json(state.pipeline.pending_sessions()?))
}

async fn handle_resume(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<u64>,
    Json(body): Json<FactorBody>,
) -> ApiResult<SessionSummary> {
    let factor = state.resolve_factor(&body)?;
    Ok(Json(state.pipeline.resume_session(SessionId(session_id), factor)?))
}

async fn handle_record_emission(
    State(state): State<Arc<AppState>>,
    Json(record): Json<EmissionRecord>,
) -> Result<(StatusCode, Json<Ack>), ApiError> {
    state.pipeline.record_emission(record)?;
    Ok((StatusCode::CREATED, Json(Ack { success: true })))
}

async fn handle_series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> ApiResult<Vec<SeriesPoint>> {
    Ok(Json(correlated_series(
        state.pipeline.store().as_ref(),
        params.user_id,
        params.device_id,
    )?))
}

async fn handle_usage_estimate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EstimateBody>,
) -> Result<(StatusCode, Json<UsageEstimate>), ApiError> {
    let factor = state.resolve_factor(&body.factor)?;
    let estimate = estimate_usage(
        body.device_id,
        body.user_id,
        body.power_kw,
        body.hours,
        body.minutes,
        factor,
    )?;
    state
        .pipeline
        .store()
        .insert_usage_estimate(estimate.clone())?;
    Ok((StatusCode::CREATED, Json(estimate)))
}

async fn handle_leaderboard(State(state): State<Arc<AppState>>) -> ApiResult<Vec<LeaderboardEntry>> {
    Ok(Json(leaderboard(state.pipeline.store().as_ref())?))
}

async fn handle_forecast(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> ApiResult<Forecast> {
    let forecast = forecast_for(
        state.pipeline.store().as_ref(),
        &state.forecast,
        params.user_id,
        params.device_id,
    )
    .await?;
    Ok(Json(forecast))
}

// ---------------------------------------------------------------------------
// Index and health
// ---------------------------------------------------------------------------

async fn handle_health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    Ok(Json(HealthResponse {
        status: "ok",
        open_sessions: state.pipeline.open_sessions().len(),
        pending_sessions: state.pipeline.pending_sessions()?.len(),
    }))
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let countries: Vec<&String> = state.reference.emission_factors.keys().collect();
    Json(serde_json::json!({
        "name": "GreenGauge Server",
        "version": greengauge_core::VERSION,
        "countries": countries,
        "catalog_entries": state.reference.catalog.len(),
        "forecast_url": state.forecast.base_url(),
        "endpoints": {
            "/": "This API index",
            "/health": "Liveness and session counts",
            "/users": "GET list, POST {username}",
            "/users/{id}/devices": "Devices of a user",
            "/devices": "POST {user_id, kind, manufacturer, model}",
            "/devices/{id}": "Device detail",
            "/devices/{id}/manufacturing": "POST {lifetime_years, gwp_total}",
            "/sessions": "GET open sessions, POST {device_id, user_id, endpoint?}",
            "/sessions/{key}/samples": "GET buffered, POST readings, DELETE clear",
            "/sessions/{key}/close": "POST {emission_factor} or {country}",
            "/sessions/{key}": "DELETE abort",
            "/samples": "DELETE ?device_id= clear buffered samples",
            "/aggregates": "POST externally computed aggregate",
            "/aggregates/latest": "Most recent session id (global)",
            "/aggregates/pending": "Sessions awaiting their emission record",
            "/aggregates/{id}/resume": "POST {emission_factor} or {country}",
            "/emissions": "POST {session_id, device_id, user_id, emission_value}",
            "/series": "GET ?user_id=&device_id= correlated sessions",
            "/usage-estimates": "POST {device_id, user_id, power_kw, hours, minutes, emission_factor|country}",
            "/leaderboard": "Users ranked by manufacturing emission",
            "/forecast": "GET ?user_id=&device_id= forecast from session history",
        },
    }))
}

/// Build the axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/users", get(handle_users).post(handle_create_user))
        .route("/users/{id}/devices", get(handle_user_devices))
        .route("/devices", post(handle_create_device))
        .route("/devices/{id}", get(handle_device))
        .route("/devices/{id}/manufacturing", post(handle_set_manufacturing))
        .route("/sessions", get(handle_open_sessions).post(handle_open_session))
        .route(
            "/sessions/{key}/samples",
            get(handle_samples)
                .post(handle_record_sample)
                .delete(handle_clear_session_samples),
        )
        .route("/sessions/{key}/close", post(handle_close_session))
        .route("/sessions/{key}", delete(handle_abort_session))
        .route("/samples", delete(handle_clear_samples))
        .route("/aggregates", post(handle_submit_aggregate))
        .route("/aggregates/latest", get(handle_latest_aggregate))
        .route("/aggregates/pending", get(handle_pending))
        .route("/aggregates/{id}/resume", post(handle_resume))
        .route("/emissions", post(handle_record_emission))
        .route("/series", get(handle_series))
        .route("/usage-estimates", post(handle_usage_estimate))
        .route("/leaderboard", get(handle_leaderboard))
        .route("/forecast", get(handle_forecast))
        .with_state(Arc::new(state))
}

/// Run the HTTP server until the process is stopped.
pub async fn run_server(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await
}
