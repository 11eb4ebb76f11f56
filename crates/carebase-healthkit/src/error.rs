//! Error types for the carebase-healthkit importer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("export has no device identifier")]
  MissingDevice,

  #[error("invalid date {value:?}")]
  InvalidDate { value: String },

  #[error("malformed XML: {0}")]
  Xml(String),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
