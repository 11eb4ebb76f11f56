//! A subject's registered wearables.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/subjects/:key/devices` | Body: `{"device_id","name","type"}`; 201, 400 or 409 |
//! | `GET`  | `/subjects/:key/devices` | Newest registration first, with `last_sync_at` |
//!
//! Both are restricted to the subject. Ingestion stamps a registered device
//! whenever a batch stores one of its readings.

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use carebase_core::{
  device::{Device, NewDevice},
  store::HealthStore,
};

use crate::{ApiState, Caller, error::ApiError, subject_key};

/// `POST /subjects/:key/devices`
pub async fn register<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
  Json(body): Json<NewDevice>,
) -> Result<impl IntoResponse, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  caller.require_subject(&key)?;
  let device = state
    .store
    .register_device(&key, body, state.now())
    .await
    .map_err(ApiError::store)?;
  tracing::info!(identity = key.prefix(), device_id = %device.device_id, "registered device");
  Ok((StatusCode::CREATED, Json(device)))
}

/// `GET /subjects/:key/devices`
pub async fn list<S>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(key): Path<String>,
) -> Result<Json<Vec<Device>>, ApiError>
where
  S: HealthStore,
{
  let key = subject_key(&key)?;
  caller.require_subject(&key)?;
  let devices = state.store.list_devices(&key).await.map_err(ApiError::store)?;
  Ok(Json(devices))
}
