//! Handlers for `/identities`.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/identities` | Body: `{"identity_number":"..."}`; 201, 400 or 409 |
//!
//! Registration is the one unauthenticated route: a subject has no party id
//! until they hold an identity key.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use carebase_core::store::HealthStore;
use serde::Deserialize;

use crate::{ApiState, error::ApiError};

#[derive(Deserialize)]
pub struct RegisterBody {
  #[serde(alias = "aadhaar")]
  pub identity_number: String,
}

/// `POST /identities`: returns 201 with `{identity_key, registered_at}`.
pub async fn register<S>(
  State(state): State<ApiState<S>>,
  Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: HealthStore,
{
  let subject = state
    .identity
    .register(state.store.as_ref(), &body.identity_number, state.now())
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(subject)))
}
