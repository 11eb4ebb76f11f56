//! Consent-gated reads of a subject's rollups.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET` | `/subjects/:key/summary` | `?days=` (default 7) `&scope=` (default `all`) |
//! | `GET` | `/subjects/:key/rollups` | `?metric_type&granularity&from&to` |
//!
//! The subject reads their own data freely. Anyone else needs an APPROVED
//! consent covering the scope; without one the request fails with 403 and
//! no data at all.

use axum::{
  Json,
  extract::{Path, Query, State},
};
use carebase_core::{
  consent::DataScope,
  identity::IdentityKey,
  metric::MetricType,
  rollup::{ComprehensiveSummary, Granularity, RollupPoint, RollupQuery},
  store::HealthStore,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{ApiState, Caller, error::ApiError, subject_key};

/// Let the subject through, and anyone else holding consent for `scope`.
pub(crate) async fn authorize<S: HealthStore>(
  state: &ApiState<S>,
  caller: &Caller,
  key: &IdentityKey,
  scope: DataScope,
  now: DateTime<Utc>,
) -> Result<(), ApiError> {
  if caller.is_subject(key) {
    return Ok(());
  }
  state
    .gate
    .authorize(state.store.as_ref(), key, &caller.party_id, scope, now)
    .await
    .map_err(ApiError::store)
}

// ─── Comprehensive ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
  #[serde(default = "default_days")]
  pub days:  u32,
  #[serde(default = "default_scope")]
  pub scope: DataScope,
}

fn default_days() -> u32 { 7 }

fn default_scope() -> DataScope { DataScope::All }

/// `GET /subjects/:key/summary[?days=<n>][&scope=<scope>]`
pub async fn comprehensive<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  Query(params): Query<SummaryParams>,
) -> Result<Json<ComprehensiveSummary>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  let now = state.now();
  authorize(&state, &caller, &key, params.scope, now).await?;
  let summary = state
    .store
    .read_comprehensive(&key, params.days, params.scope, now)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(summary))
}

// ─── Single series ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RollupParams {
  pub metric_type: MetricType,
  pub granularity: Granularity,
  pub from:        DateTime<Utc>,
  pub to:          DateTime<Utc>,
}

/// `GET /subjects/:key/rollups?metric_type=..&granularity=..&from=..&to=..`
///
/// Gated on the metric type's own scope.
pub async fn rollups<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  Query(params): Query<RollupParams>,
) -> Result<Json<Vec<RollupPoint>>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  authorize(&state, &caller, &key, params.metric_type.scope(), state.now()).await?;
  let query = RollupQuery {
    metric_type: params.metric_type,
    granularity: params.granularity,
    from:        params.from,
    to:          params.to,
  };
  let points = state.store.read_rollup(&key, &query).await.map_err(ApiError::store)?;
  Ok(Json(points))
}
