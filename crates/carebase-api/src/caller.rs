//! The authenticated party behind a request.
//!
//! The API never authenticates anyone itself. Whatever sits in front of the
//! router (the server's Basic auth layer, a test harness) inserts a
//! [`Caller`] into the request extensions; handlers that need one extract it
//! and fail with 401 when it is missing.

use axum::{extract::FromRequestParts, http::request::Parts};
use carebase_core::identity::IdentityKey;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
  /// The data subject. Their party id is their identity key.
  Patient,
  Doctor,
  HospitalAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
  pub party_id: String,
  pub role:     Role,
}

impl Caller {
  pub fn new(party_id: impl Into<String>, role: Role) -> Self {
    Self { party_id: party_id.into(), role }
  }

  /// True if the caller is the subject `key` acting on their own record.
  pub fn is_subject(&self, key: &IdentityKey) -> bool {
    self.role == Role::Patient && self.party_id == key.as_str()
  }

  /// Fail with 403 unless the caller is the subject `key`.
  pub fn require_subject(&self, key: &IdentityKey) -> Result<(), ApiError> {
    if self.is_subject(key) {
      Ok(())
    } else {
      Err(ApiError::Forbidden("only the subject may do this".into()))
    }
  }

  /// Fail with 403 unless the caller may file consent requests.
  pub fn require_requesting_party(&self) -> Result<(), ApiError> {
    match self.role {
      Role::Doctor | Role::HospitalAdmin => Ok(()),
      Role::Patient => Err(ApiError::Forbidden("patients cannot request consent".into())),
    }
  }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
  type Rejection = ApiError;

  async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
    parts
      .extensions
      .get::<Caller>()
      .cloned()
      .ok_or(ApiError::Unauthenticated)
  }
}
