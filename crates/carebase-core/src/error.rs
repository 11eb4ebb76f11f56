//! Error types for `carebase-core`.

use thiserror::Error;
use uuid::Uuid;

use crate::consent::{ConsentStatus, DataScope};

#[derive(Debug, Error)]
pub enum Error {
  /// Malformed caller input. Recoverable by correcting the input.
  #[error("validation failed: {0}")]
  Validation(String),

  /// The derived identity key is already registered.
  #[error("identity {0} is already registered")]
  DuplicateIdentity(String),

  /// The subject already registered a device with this id.
  #[error("device {0} is already registered")]
  DuplicateDevice(String),

  #[error("identity not found: {0}")]
  IdentityNotFound(String),

  /// A PENDING or APPROVED record already exists for the triple.
  #[error("consent {0} is already pending or approved for this subject, party and scope")]
  DuplicatePending(Uuid),

  #[error("consent record not found: {0}")]
  ConsentNotFound(Uuid),

  #[error("invalid consent transition from {from} to {to}")]
  InvalidTransition {
    from: ConsentStatus,
    to:   ConsentStatus,
  },

  #[error("forbidden: {0}")]
  Forbidden(String),

  /// The consent gate refused a cross-party read.
  #[error("{party} holds no approved {scope} consent for this subject")]
  NotAuthorized { party: String, scope: DataScope },

  /// Identity or backup key material is missing or malformed. Fatal.
  #[error("key material unavailable: {0}")]
  KeyUnavailable(String),

  #[error("cryptographic failure: {0}")]
  Crypto(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
