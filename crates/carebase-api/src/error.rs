//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Domain errors keep their meaning across the storage boundary: a backend
//! error that wraps a [`carebase_core::Error`] gets the same status as the
//! bare domain error would.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use carebase_core::store::StoreError;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("authentication required")]
  Unauthenticated,

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error(transparent)]
  Core(#[from] carebase_core::Error),

  #[error("{source}")]
  Store {
    status: StatusCode,
    code:   &'static str,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

impl ApiError {
  /// Wrap a backend error, keeping the status of any domain error inside it.
  pub fn store<E: StoreError>(e: E) -> Self {
    let (status, code) = e.domain().map_or((StatusCode::INTERNAL_SERVER_ERROR, "internal"), classify);
    Self::Store { status, code, source: Box::new(e) }
  }

  pub fn status(&self) -> StatusCode {
    match self {
      Self::Unauthenticated => StatusCode::UNAUTHORIZED,
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::NotFound(_) => StatusCode::NOT_FOUND,
      Self::Forbidden(_) => StatusCode::FORBIDDEN,
      Self::Core(e) => classify(e).0,
      Self::Store { status, .. } => *status,
    }
  }

  fn code(&self) -> &'static str {
    match self {
      Self::Unauthenticated => "unauthenticated",
      Self::BadRequest(_) => "validation",
      Self::NotFound(_) => "not_found",
      Self::Forbidden(_) => "forbidden",
      Self::Core(e) => classify(e).1,
      Self::Store { code, .. } => *code,
    }
  }
}

fn classify(e: &carebase_core::Error) -> (StatusCode, &'static str) {
  use carebase_core::Error::*;
  match e {
    Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
    DuplicateIdentity(_) => (StatusCode::CONFLICT, "duplicate_identity"),
    DuplicateDevice(_) => (StatusCode::CONFLICT, "duplicate_device"),
    DuplicatePending(_) => (StatusCode::CONFLICT, "duplicate_pending"),
    InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
    IdentityNotFound(_) | ConsentNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
    Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
    NotAuthorized { .. } => (StatusCode::FORBIDDEN, "consent_required"),
    KeyUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "key_unavailable"),
    Crypto(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      tracing::error!(error = %self, "request failed");
    }
    (status, Json(json!({ "error": self.to_string(), "code": self.code() }))).into_response()
  }
}
