//! Handlers for a subject's raw data.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST`   | `/subjects/:key/readings` | Body: `{"readings":[...]}`; itemised result |
//! | `POST`   | `/subjects/:key/import/apple-health` | Body: the app's JSON export |
//! | `POST`   | `/subjects/:key/import/apple-health.xml` | Body: Apple's `export.xml` |
//! | `GET`    | `/subjects/:key/events` | `?hours=` (default 24) `&metric_type=`; consent-gated |
//! | `DELETE` | `/subjects/:key/events` | Erases every event and rollup |
//!
//! Everything but the event listing is restricted to the subject themselves.

use axum::{
  Json,
  body::Bytes,
  extract::{Path, Query, State},
};
use carebase_core::{
  consent::DataScope,
  identity::IdentityKey,
  ingest::{IngestResult, RawReading, ingest},
  metric::{EventQuery, MetricEvent, MetricType},
  store::HealthStore,
};
use chrono::TimeDelta;
use carebase_healthkit::{ImportReport, ParsedExport};
use serde::{Deserialize, Serialize};

use crate::{ApiState, Caller, error::ApiError, subject_key, summary::authorize};

const MAX_RECENT_HOURS: u32 = 24 * 30;
const MAX_RECENT_EVENTS: usize = 1000;

// ─── Submit ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitBody {
  pub readings: Vec<RawReading>,
}

/// `POST /subjects/:key/readings`
///
/// Per-reading failures come back in `rejected`; the request itself fails
/// only for an unknown subject or a caller who is not that subject.
pub async fn submit<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  Json(body): Json<SubmitBody>,
) -> Result<Json<IngestResult>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  caller.require_subject(&key)?;
  let result = ingest(state.store.as_ref(), &key, body.readings, &state.ingest, state.now())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(result))
}

// ─── Apple Health import ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ImportResponse {
  /// Sample types the importer does not map, and unusable samples.
  pub report: ImportReport,
  pub result: IngestResult,
}

/// `POST /subjects/:key/import/apple-health`
pub async fn import_json<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  body: Bytes,
) -> Result<Json<ImportResponse>, ApiError>
where
  S: HealthStore,
{
  let key = own_subject(&caller, &key)?;
  let parsed = carebase_healthkit::parse_json(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
  import(&state, &key, parsed).await
}

/// `POST /subjects/:key/import/apple-health.xml`
pub async fn import_xml<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  body: Bytes,
) -> Result<Json<ImportResponse>, ApiError>
where
  S: HealthStore,
{
  let key = own_subject(&caller, &key)?;
  let parsed = carebase_healthkit::parse_xml(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
  import(&state, &key, parsed).await
}

/// The subject named by `raw`, if the caller is that subject.
fn own_subject(caller: &Caller, raw: &str) -> Result<IdentityKey, ApiError> {
  let key = subject_key(raw)?;
  caller.require_subject(&key)?;
  Ok(key)
}

async fn import<S>(
  state: &ApiState<S>,
  key: &IdentityKey,
  parsed: ParsedExport,
) -> Result<Json<ImportResponse>, ApiError>
where
  S: HealthStore,
{
  let result = ingest(state.store.as_ref(), key, parsed.readings, &state.ingest, state.now())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(ImportResponse { report: parsed.report, result }))
}

// ─── Recent events ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecentParams {
  #[serde(default = "default_hours")]
  pub hours:       u32,
  pub metric_type: Option<MetricType>,
}

fn default_hours() -> u32 { 24 }

#[derive(Debug, Serialize, Deserialize)]
pub struct RecentEvents {
  pub subject_key: IdentityKey,
  pub hours:       u32,
  pub count:       usize,
  /// Newest first, at most 1000.
  pub events:      Vec<MetricEvent>,
}

/// `GET /subjects/:key/events[?hours=<n>][&metric_type=<type>]`
///
/// Gated on the metric type's scope when one is given, on `all` otherwise.
pub async fn recent<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  Query(params): Query<RecentParams>,
) -> Result<Json<RecentEvents>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  if !(1..=MAX_RECENT_HOURS).contains(&params.hours) {
    return Err(ApiError::BadRequest(format!("hours must be between 1 and {MAX_RECENT_HOURS}")));
  }
  let now = state.now();
  let scope = params.metric_type.map_or(DataScope::All, MetricType::scope);
  authorize(&state, &caller, &key, scope, now).await?;

  let since = TimeDelta::try_hours(i64::from(params.hours))
    .and_then(|window| now.checked_sub_signed(window));
  let query = EventQuery {
    metric_type: params.metric_type,
    since,
    limit: Some(MAX_RECENT_EVENTS),
  };
  let events = state.store.list_events(&key, &query).await.map_err(ApiError::store)?;
  Ok(Json(RecentEvents { subject_key: key, hours: params.hours, count: events.len(), events }))
}

// ─── Erase ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct EraseResponse {
  pub deleted: u64,
}

/// `DELETE /subjects/:key/events`
pub async fn erase<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
) -> Result<Json<EraseResponse>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  caller.require_subject(&key)?;
  let deleted = state.store.erase_events(&key).await.map_err(ApiError::store)?;
  tracing::info!(identity = key.prefix(), deleted, "erased subject events");
  Ok(Json(EraseResponse { deleted }))
}
