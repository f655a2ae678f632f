//! HTTP query/control surface.
//!
//! Only bad input and unknown identities are reported as request failures;
//! loop-internal problems surface through `/api/status`. Error bodies carry a
//! short message and never internal detail.

use crate::engine::{EngineError, LoopController, LoopState};
use crate::ledger::{AttendanceLedger, AttendanceRecord, LedgerError};
use crate::status::{Stats, Status, StatusAggregator};
use crate::store::{EncodingStore, StoreError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{DayClock, Encoding, Identity, IdentityId};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_STATS_DAYS: usize = 7;
const MAX_STATS_DAYS: usize = 366;
const MAX_CAPTURE_SAMPLES: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EncodingStore>,
    pub ledger: Arc<dyn AttendanceLedger>,
    pub controller: LoopController,
    pub status: StatusAggregator,
    pub clock: DayClock,
    /// Sample count used when a capture request does not name one.
    pub enroll_samples: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/stats", get(stats))
        .route("/api/identities", get(list_identities).post(create_identity))
        .route("/api/identities/{id}", get(get_identity))
        .route("/api/identities/{id}/encoding", put(reenroll_identity))
        .route("/api/attendance", get(attendance))
        .route("/api/attendance/all", get(attendance_all))
        .route("/api/attendance.csv", get(attendance_csv))
        .route("/api/control/start", post(control_start))
        .route("/api/control/stop", post(control_stop))
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(&'static str),
    Internal,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.to_string()),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidInput(m) => ApiError::BadRequest(m),
            StoreError::NotFound(id) => ApiError::NotFound(format!("identity {id} not found")),
            StoreError::DuplicateRollNumber(_) => ApiError::Conflict(err.to_string()),
            StoreError::Persistence(e) => {
                tracing::error!(error = %e, "identity store error");
                ApiError::Unavailable("identity store unavailable")
            }
            StoreError::Corrupt(id, e) => {
                tracing::error!(identity = id, error = %e, "corrupt identity row");
                ApiError::Internal
            }
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        tracing::error!(error = %err, "attendance ledger error");
        ApiError::Unavailable("attendance store unavailable")
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotEnoughSamples { .. } => ApiError::BadRequest(err.to_string()),
            EngineError::Camera(e) => {
                tracing::warn!(error = %e, "capture failed");
                ApiError::Unavailable("camera unavailable")
            }
            EngineError::Encoder(e) => {
                tracing::warn!(error = %e, "capture failed");
                ApiError::Unavailable("encoder unavailable")
            }
            EngineError::ChannelClosed => ApiError::Unavailable("recognition loop unavailable"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Public view of an identity; the encoding never leaves the daemon.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub name: String,
    pub roll_number: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            name: identity.name.clone(),
            roll_number: identity.roll_number.clone(),
            enrolled_at: identity.enrolled_at,
        }
    }
}

/// Where a reference encoding comes from.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EncodingSource {
    /// Precomputed by an external tool.
    Vector { encoding: Vec<f32> },
    /// Captured live from the camera and averaged.
    Capture { samples: Option<usize> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub name: String,
    pub roll_number: Option<String>,
    pub encoding_source: EncodingSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReenrollRequest {
    pub encoding_source: EncodingSource,
}

#[derive(Debug, Deserialize)]
pub struct AttendanceQuery {
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub days: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    pub identity_id: IdentityId,
    /// `None` if the identity no longer exists.
    pub name: Option<String>,
    pub roll_number: Option<String>,
    pub date: NaiveDate,
    pub first_seen_at: DateTime<Utc>,
}

/// Attach names and roll numbers to ledger records.
fn join_identities(records: Vec<AttendanceRecord>, identities: &[Identity]) -> Vec<AttendanceEntry> {
    let by_id: HashMap<IdentityId, &Identity> = identities.iter().map(|i| (i.id, i)).collect();
    records
        .into_iter()
        .map(|r| {
            let identity = by_id.get(&r.identity_id);
            AttendanceEntry {
                identity_id: r.identity_id,
                name: identity.map(|i| i.name.clone()),
                roll_number: identity.and_then(|i| i.roll_number.clone()),
                date: r.date,
                first_seen_at: r.first_seen_at,
            }
        })
        .collect()
}

const CSV_HEADER: &str = "Name,Roll Number,Identity,First Seen At";

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// RFC 4180 text, CRLF line endings, header first.
fn render_csv(entries: &[AttendanceEntry]) -> String {
    let mut out = String::with_capacity(64 * (entries.len() + 1));
    out.push_str(CSV_HEADER);
    out.push_str("\r\n");
    for e in entries {
        out.push_str(&csv_field(e.name.as_deref().unwrap_or("")));
        out.push(',');
        out.push_str(&csv_field(e.roll_number.as_deref().unwrap_or("")));
        out.push(',');
        out.push_str(&e.identity_id.to_string());
        out.push(',');
        out.push_str(&crate::db::format_timestamp(e.first_seen_at));
        out.push_str("\r\n");
    }
    out
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Store and ledger calls take SQLite locks and can wait out the busy
/// timeout, so they run on the blocking pool rather than an async worker.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        tracing::error!(error = %e, "request task failed");
        ApiError::Internal
    })?
}

async fn status(State(state): State<AppState>) -> Result<Json<Status>, ApiError> {
    let aggregator = state.status.clone();
    blocking(move || Ok(Json(aggregator.current_status()))).await
}

async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Stats>, ApiError> {
    let days = query.days.unwrap_or(DEFAULT_STATS_DAYS);
    if days == 0 || days > MAX_STATS_DAYS {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {MAX_STATS_DAYS}"
        )));
    }
    let aggregator = state.status.clone();
    let stats = blocking(move || Ok(aggregator.stats(days)?)).await?;
    Ok(Json(stats))
}

async fn list_identities(State(state): State<AppState>) -> Json<Vec<IdentitySummary>> {
    Json(state.store.all().iter().map(IdentitySummary::from).collect())
}

async fn get_identity(
    State(state): State<AppState>,
    Path(id): Path<IdentityId>,
) -> Result<Json<IdentitySummary>, ApiError> {
    let identity = state.store.find_by_id(id)?;
    Ok(Json(IdentitySummary::from(&identity)))
}

async fn create_identity(
    State(state): State<AppState>,
    payload: Result<Json<EnrollRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IdentitySummary>), ApiError> {
    let Json(request) = payload?;
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    // Refuse a taken roll number before spending a capture on it.
    if let Some(roll) = request.roll_number.as_deref().map(str::trim) {
        if state.store.all().iter().any(|i| i.roll_number.as_deref() == Some(roll)) {
            return Err(StoreError::DuplicateRollNumber(roll.to_string()).into());
        }
    }
    let encoding = resolve_encoding(&state, request.encoding_source).await?;
    let store = Arc::clone(&state.store);
    let (name, roll_number) = (request.name, request.roll_number);
    let identity = blocking(move || {
        Ok(store.enroll_with_roll_number(&name, roll_number.as_deref(), encoding)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(IdentitySummary::from(&identity))))
}

async fn reenroll_identity(
    State(state): State<AppState>,
    Path(id): Path<IdentityId>,
    payload: Result<Json<ReenrollRequest>, JsonRejection>,
) -> Result<Json<IdentitySummary>, ApiError> {
    let Json(request) = payload?;
    // Fail fast before a capture on an unknown id.
    state.store.find_by_id(id)?;
    let encoding = resolve_encoding(&state, request.encoding_source).await?;
    let store = Arc::clone(&state.store);
    let identity = blocking(move || Ok(store.reenroll(id, encoding)?)).await?;
    Ok(Json(IdentitySummary::from(&identity)))
}

fn requested_date(state: &AppState, raw: Option<&str>) -> Result<NaiveDate, ApiError> {
    match raw {
        None | Some("") => Ok(state.clock.today()),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("invalid date {raw:?}, expected YYYY-MM-DD"))),
    }
}

async fn entries_for_date(state: &AppState, date: NaiveDate) -> Result<Vec<AttendanceEntry>, ApiError> {
    let ledger = Arc::clone(&state.ledger);
    let store = Arc::clone(&state.store);
    blocking(move || Ok(join_identities(ledger.list_for_date(date)?, &store.all()))).await
}

async fn attendance(
    State(state): State<AppState>,
    Query(query): Query<AttendanceQuery>,
) -> Result<Json<Vec<AttendanceEntry>>, ApiError> {
    let date = requested_date(&state, query.date.as_deref())?;
    Ok(Json(entries_for_date(&state, date).await?))
}

async fn attendance_all(State(state): State<AppState>) -> Result<Json<Vec<AttendanceEntry>>, ApiError> {
    let ledger = Arc::clone(&state.ledger);
    let store = Arc::clone(&state.store);
    let entries = blocking(move || Ok(join_identities(ledger.list_all()?, &store.all()))).await?;
    Ok(Json(entries))
}

async fn attendance_csv(
    State(state): State<AppState>,
    Query(query): Query<AttendanceQuery>,
) -> Result<Response, ApiError> {
    let date = requested_date(&state, query.date.as_deref())?;
    let entries = entries_for_date(&state, date).await?;
    let disposition = format!("attachment; filename=\"attendance-{date}.csv\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        render_csv(&entries),
    )
        .into_response())
}

async fn control_start(State(state): State<AppState>) -> Result<Json<LoopState>, ApiError> {
    Ok(Json(state.controller.start().await?))
}

async fn control_stop(State(state): State<AppState>) -> Result<Json<LoopState>, ApiError> {
    Ok(Json(state.controller.stop().await?))
}

async fn resolve_encoding(state: &AppState, source: EncodingSource) -> Result<Encoding, ApiError> {
    match source {
        EncodingSource::Vector { encoding } => Ok(Encoding::new(encoding)),
        EncodingSource::Capture { samples } => {
            let samples = samples.unwrap_or(state.enroll_samples);
            if samples == 0 || samples > MAX_CAPTURE_SAMPLES {
                return Err(ApiError::BadRequest(format!(
                    "samples must be between 1 and {MAX_CAPTURE_SAMPLES}"
                )));
            }
            Ok(state.controller.capture_encoding(samples).await?)
        }
    }
}
