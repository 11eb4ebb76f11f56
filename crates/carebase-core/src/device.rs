//! The wearable devices a subject has registered.
//!
//! Registration is optional: ingestion accepts readings from any device id.
//! A registered device additionally tracks when it last synced and how many
//! readings it has contributed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, identity::IdentityKey};

const MAX_NAME_LEN: usize = 100;
const MAX_DEVICE_ID_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDevice {
  /// The id the device reports in its readings.
  pub device_id: String,
  pub name:      String,
  /// Free-form kind, e.g. `smart_watch` or `fitness_tracker`.
  #[serde(rename = "type")]
  pub kind:      String,
}

impl NewDevice {
  /// Trim every field and check lengths.
  pub fn normalize(self) -> Result<Self> {
    let device_id = self.device_id.trim().to_owned();
    let name = self.name.trim().to_owned();
    let kind = self.kind.trim().to_owned();

    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
      return Err(Error::Validation(format!(
        "device_id must be 1 to {MAX_DEVICE_ID_LEN} bytes"
      )));
    }
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
      return Err(Error::Validation(format!("name must be 1 to {MAX_NAME_LEN} characters")));
    }
    if kind.is_empty() {
      return Err(Error::Validation("type is required".into()));
    }
    Ok(Self { device_id, name, kind })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
  pub subject_key:     IdentityKey,
  pub device_id:       String,
  pub name:            String,
  #[serde(rename = "type")]
  pub kind:            String,
  pub registered_at:   DateTime<Utc>,
  pub last_sync_at:    Option<DateTime<Utc>>,
  /// Readings stored or corrected from this device since registration.
  pub readings_synced: u64,
}
