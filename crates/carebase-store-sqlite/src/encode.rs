//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings with microsecond precision and a
//! `Z` suffix. Enumerations are stored as their snake_case (metric types,
//! scopes) or SCREAMING_SNAKE (consent statuses) discriminants.

use carebase_core::{
  consent::{AuditEntry, ConsentRecord, ConsentStatus, DataScope, resolve_status},
  device::Device,
  identity::{EncryptedBackup, IdentityKey, SubjectIdentity},
  metric::{MetricEvent, MetricType},
  rollup::{Accumulator, Granularity, RollupPoint},
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_key(s: &str) -> Result<IdentityKey> { Ok(IdentityKey::parse(s)?) }

pub fn decode_metric(s: &str) -> Result<MetricType> {
  s.parse()
    .map_err(|_| Error::Decode(format!("unknown metric type: {s:?}")))
}

pub fn decode_scope(s: &str) -> Result<DataScope> {
  s.parse()
    .map_err(|_| Error::Decode(format!("unknown data scope: {s:?}")))
}

pub fn decode_status(s: &str) -> Result<ConsentStatus> {
  s.parse()
    .map_err(|_| Error::Decode(format!("unknown consent status: {s:?}")))
}

pub fn rollup_table(g: Granularity) -> &'static str {
  match g {
    Granularity::Hourly => "hourly_rollups",
    Granularity::Daily => "daily_rollups",
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from an `identities` row.
pub struct RawIdentity {
  pub identity_key:  String,
  pub registered_at: String,
}

impl RawIdentity {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self { identity_key: row.get(0)?, registered_at: row.get(1)? })
  }

  pub fn into_identity(self) -> Result<SubjectIdentity> {
    Ok(SubjectIdentity {
      identity_key:  decode_key(&self.identity_key)?,
      registered_at: decode_dt(&self.registered_at)?,
    })
  }
}

pub struct RawBackup {
  pub identity_key: String,
  pub key_id:       String,
  pub sealed:       String,
}

impl RawBackup {
  pub fn into_pair(self) -> Result<(IdentityKey, EncryptedBackup)> {
    Ok((
      decode_key(&self.identity_key)?,
      EncryptedBackup { key_id: self.key_id, sealed: self.sealed },
    ))
  }
}

/// Column list matching [`RawDevice::from_row`].
pub const DEVICE_COLUMNS: &str =
  "subject_key, device_id, name, kind, registered_at, last_sync_at, readings_synced";

pub struct RawDevice {
  pub subject_key:     String,
  pub device_id:       String,
  pub name:            String,
  pub kind:            String,
  pub registered_at:   String,
  pub last_sync_at:    Option<String>,
  pub readings_synced: i64,
}

impl RawDevice {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_key:     row.get(0)?,
      device_id:       row.get(1)?,
      name:            row.get(2)?,
      kind:            row.get(3)?,
      registered_at:   row.get(4)?,
      last_sync_at:    row.get(5)?,
      readings_synced: row.get(6)?,
    })
  }

  pub fn into_device(self) -> Result<Device> {
    Ok(Device {
      subject_key:     decode_key(&self.subject_key)?,
      device_id:       self.device_id,
      name:            self.name,
      kind:            self.kind,
      registered_at:   decode_dt(&self.registered_at)?,
      last_sync_at:    self.last_sync_at.as_deref().map(decode_dt).transpose()?,
      readings_synced: u64::try_from(self.readings_synced)
        .map_err(|_| Error::Decode(format!("negative readings_synced: {}", self.readings_synced)))?,
    })
  }
}

/// Column list matching [`RawEvent::from_row`].
pub const EVENT_COLUMNS: &str =
  "subject_key, device_id, metric_type, timestamp, value, ingested_at";

pub struct RawEvent {
  pub subject_key: String,
  pub device_id:   String,
  pub metric_type: String,
  pub timestamp:   String,
  pub value:       f64,
  pub ingested_at: String,
}

impl RawEvent {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_key: row.get(0)?,
      device_id:   row.get(1)?,
      metric_type: row.get(2)?,
      timestamp:   row.get(3)?,
      value:       row.get(4)?,
      ingested_at: row.get(5)?,
    })
  }

  pub fn into_event(self) -> Result<MetricEvent> {
    Ok(MetricEvent {
      subject_key: decode_key(&self.subject_key)?,
      device_id:   self.device_id,
      metric_type: decode_metric(&self.metric_type)?,
      timestamp:   decode_dt(&self.timestamp)?,
      value:       self.value,
      ingested_at: decode_dt(&self.ingested_at)?,
    })
  }
}

/// Column list matching [`RawRollup::from_row`].
pub const ROLLUP_COLUMNS: &str = "metric_type, period_start, count, sum, min, max";

pub struct RawRollup {
  pub metric_type:  String,
  pub period_start: String,
  pub count:        i64,
  pub sum:          f64,
  pub min:          f64,
  pub max:          f64,
}

impl RawRollup {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      metric_type:  row.get(0)?,
      period_start: row.get(1)?,
      count:        row.get(2)?,
      sum:          row.get(3)?,
      min:          row.get(4)?,
      max:          row.get(5)?,
    })
  }

  pub fn into_point(self, granularity: Granularity) -> Result<RollupPoint> {
    let count = u64::try_from(self.count)
      .map_err(|_| Error::Decode(format!("negative rollup count {}", self.count)))?;
    Ok(RollupPoint::new(
      decode_metric(&self.metric_type)?,
      granularity,
      decode_dt(&self.period_start)?,
      Accumulator { count, sum: self.sum, min: self.min, max: self.max },
    ))
  }
}

/// Columns of a consent record with its computed status, selected from
/// `consent_records r`.
pub const CONSENT_COLUMNS: &str = "
  r.record_id, r.subject_key, r.requesting_party, r.scope,
  r.requested_at, r.expires_at, r.description,
  (SELECT a.to_status FROM consent_audit a
     WHERE a.record_id = r.record_id ORDER BY a.seq DESC LIMIT 1),
  (SELECT a.recorded_at FROM consent_audit a
     WHERE a.record_id = r.record_id AND a.from_status = 'PENDING'
     ORDER BY a.seq LIMIT 1)";

pub struct RawConsent {
  pub record_id:        String,
  pub subject_key:      String,
  pub requesting_party: String,
  pub scope:            String,
  pub requested_at:     String,
  pub expires_at:       Option<String>,
  pub description:      Option<String>,
  pub status:           Option<String>,
  pub decided_at:       Option<String>,
}

impl RawConsent {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      record_id:        row.get(0)?,
      subject_key:      row.get(1)?,
      requesting_party: row.get(2)?,
      scope:            row.get(3)?,
      requested_at:     row.get(4)?,
      expires_at:       row.get(5)?,
      description:      row.get(6)?,
      status:           row.get(7)?,
      decided_at:       row.get(8)?,
    })
  }

  pub fn into_record(self) -> Result<ConsentRecord> {
    Ok(ConsentRecord {
      record_id:        decode_uuid(&self.record_id)?,
      subject_key:      decode_key(&self.subject_key)?,
      requesting_party: self.requesting_party,
      scope:            decode_scope(&self.scope)?,
      // A record without audit rows has only been filed.
      status:           self
        .status
        .as_deref()
        .map(decode_status)
        .transpose()?
        .unwrap_or(ConsentStatus::Pending),
      requested_at:     decode_dt(&self.requested_at)?,
      decided_at:       self.decided_at.as_deref().map(decode_dt).transpose()?,
      expires_at:       self.expires_at.as_deref().map(decode_dt).transpose()?,
      description:      self.description,
    })
  }
}

pub struct RawAudit {
  pub seq:         i64,
  pub record_id:   String,
  pub actor:       String,
  pub from_status: Option<String>,
  pub to_status:   String,
  pub recorded_at: String,
}

impl RawAudit {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:         row.get(0)?,
      record_id:   row.get(1)?,
      actor:       row.get(2)?,
      from_status: row.get(3)?,
      to_status:   row.get(4)?,
      recorded_at: row.get(5)?,
    })
  }

  pub fn into_entry(self) -> Result<AuditEntry> {
    Ok(AuditEntry {
      seq:       self.seq,
      record_id: decode_uuid(&self.record_id)?,
      actor:     self.actor,
      from:      self.from_status.as_deref().map(decode_status).transpose()?,
      to:        decode_status(&self.to_status)?,
      at:        decode_dt(&self.recorded_at)?,
    })
  }
}

/// Cross-check a record's computed status against its decoded trail.
pub fn check_trail(record: &ConsentRecord, audit: &[AuditEntry]) -> Result<()> {
  let (status, decided_at) = resolve_status(audit);
  if status != record.status || decided_at != record.decided_at {
    return Err(Error::Decode(format!(
      "consent {} status does not match its audit trail",
      record.record_id
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_as_text() {
    let a = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
    let b = a + chrono::Duration::microseconds(1);
    let c = Utc.with_ymd_and_hms(2026, 3, 9, 10, 0, 0).unwrap();
    assert!(encode_dt(a) < encode_dt(b));
    assert!(encode_dt(b) < encode_dt(c));
    assert_eq!(encode_dt(a), "2026-03-09T09:00:00.000000Z");
    assert_eq!(decode_dt(&encode_dt(b)).unwrap(), b);
  }
}
