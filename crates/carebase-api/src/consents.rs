//! Handlers for the consent lifecycle.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/consents` | Requesting parties only; returns 201 + PENDING record |
//! | `GET`  | `/consents/:id` | Record + audit trail; subject or requesting party |
//! | `POST` | `/consents/:id/decision` | Body: `{"decision":"APPROVE"\|"DENY"}`; subject only |
//! | `POST` | `/consents/:id/revoke` | Subject only |
//! | `GET`  | `/subjects/:key/consents` | Optional `?status=`; subject only |
//! | `GET`  | `/parties/me/consents` | Optional `?status=`; records the caller filed |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use carebase_core::{
  consent::{ConsentFilter, ConsentHistory, ConsentRecord, ConsentStatus, DataScope, Decision, NewConsent},
  identity::IdentityKey,
  store::HealthStore,
};
use chrono::Duration;
use serde::Deserialize;
use uuid::Uuid;

use crate::{ApiState, Caller, error::ApiError, subject_key};

/// Expiry applied when a request does not name one.
pub const DEFAULT_EXPIRY_DAYS: u32 = 90;

// ─── Request ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RequestBody {
  pub subject_key:     IdentityKey,
  pub scope:           DataScope,
  pub expires_in_days: Option<u32>,
  pub description:     Option<String>,
}

/// `POST /consents`
pub async fn request<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Json(body): Json<RequestBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: HealthStore,
{
  caller.require_requesting_party()?;
  let days = body.expires_in_days.unwrap_or(DEFAULT_EXPIRY_DAYS);
  if days == 0 {
    return Err(ApiError::BadRequest("expires_in_days must be at least 1".into()));
  }
  let now = state.now();
  let input = NewConsent {
    subject_key:      body.subject_key,
    requesting_party: caller.party_id,
    scope:            body.scope,
    expires_at:       Some(now + Duration::days(i64::from(days))),
    description:      body.description,
  };
  let record = state
    .gate
    .request(state.store.as_ref(), input, now)
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(record)))
}

// ─── Get one ──────────────────────────────────────────────────────────────────

/// `GET /consents/:id`
///
/// Only the two parties to a record can see it; anyone else gets 404.
pub async fn get_one<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(id): Path<Uuid>,
) -> Result<Json<ConsentHistory>, ApiError>
where
  S: HealthStore,
{
  let history = state
    .store
    .get_consent(id)
    .await
    .map_err(ApiError::store)?
    .filter(|h| {
      caller.is_subject(&h.record.subject_key) || caller.party_id == h.record.requesting_party
    })
    .ok_or_else(|| ApiError::NotFound(format!("consent {id} not found")))?;
  Ok(Json(history))
}

// ─── Decide / revoke ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
  pub decision: Decision,
}

/// `POST /consents/:id/decision`
pub async fn decide<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(id): Path<Uuid>,
  Json(body): Json<DecisionBody>,
) -> Result<Json<ConsentRecord>, ApiError>
where
  S: HealthStore,
{
  let record = state
    .gate
    .decide(state.store.as_ref(), id, body.decision, &caller.party_id, state.now())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(record))
}

/// `POST /consents/:id/revoke`
pub async fn revoke<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(id): Path<Uuid>,
) -> Result<Json<ConsentRecord>, ApiError>
where
  S: HealthStore,
{
  let record = state
    .gate
    .revoke(state.store.as_ref(), id, &caller.party_id, state.now())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(record))
}

// ─── Listing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
  /// Case-insensitive status name, e.g. `approved`.
  pub status: Option<String>,
}

impl ListParams {
  fn status(&self) -> Result<Option<ConsentStatus>, ApiError> {
    self
      .status
      .as_deref()
      .map(|s| {
        s.parse()
          .map_err(|_| ApiError::BadRequest(format!("unknown consent status {s:?}")))
      })
      .transpose()
  }
}

/// `GET /subjects/:key/consents[?status=<status>]`
pub async fn list_for_subject<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<ConsentRecord>>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  caller.require_subject(&key)?;
  let filter = ConsentFilter {
    subject_key: Some(key),
    status: params.status()?,
    ..Default::default()
  };
  let records = state.store.list_consents(&filter).await.map_err(ApiError::store)?;
  Ok(Json(records))
}

/// `GET /parties/me/consents[?status=<status>]`
pub async fn list_for_party<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<ConsentRecord>>, ApiError>
where
  S: HealthStore,
{
  let filter = ConsentFilter {
    requesting_party: Some(caller.party_id),
    status: params.status()?,
    ..Default::default()
  };
  let records = state.store.list_consents(&filter).await.map_err(ApiError::store)?;
  Ok(Json(records))
}
