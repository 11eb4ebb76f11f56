//! The metric taxonomy and the conflict-resolution rule for readings that
//! share a deduplication key.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{consent::DataScope, identity::IdentityKey};

// ─── Metric type ─────────────────────────────────────────────────────────────

/// Every kind of reading the record accepts. All variants aggregate the same
/// way (count/sum/min/max/avg); they differ only in unit, scope and the range
/// of plausible values.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricType {
  HeartRate,
  RestingHeartRate,
  Steps,
  /// Active energy, kcal.
  Calories,
  /// Metres.
  Distance,
  FlightsClimbed,
  #[serde(rename = "vo2_max")]
  #[strum(serialize = "vo2_max")]
  Vo2Max,
  /// Percent, 0–100.
  OxygenSaturation,
  BloodPressureSystolic,
  BloodPressureDiastolic,
  /// Stage code, see [`SleepStage`].
  SleepStage,
  /// Hours.
  SleepDuration,
}

impl MetricType {
  /// The discriminant string stored in the database and used on the wire.
  pub fn as_str(self) -> &'static str { self.into() }

  pub fn scope(self) -> DataScope {
    use MetricType::*;
    match self {
      Steps | Calories | Distance | FlightsClimbed => DataScope::Activity,
      HeartRate | RestingHeartRate | Vo2Max | OxygenSaturation
      | BloodPressureSystolic | BloodPressureDiastolic => DataScope::Vitals,
      SleepStage | SleepDuration => DataScope::Sleep,
    }
  }

  pub fn unit(self) -> &'static str {
    use MetricType::*;
    match self {
      HeartRate | RestingHeartRate => "bpm",
      Steps => "count",
      Calories => "kcal",
      Distance => "m",
      FlightsClimbed => "count",
      Vo2Max => "mL/kg/min",
      OxygenSaturation => "%",
      BloodPressureSystolic | BloodPressureDiastolic => "mmHg",
      SleepStage => "stage",
      SleepDuration => "h",
    }
  }

  /// Plausible values for this metric, inclusive.
  pub fn valid_range(self) -> RangeInclusive<f64> {
    use MetricType::*;
    match self {
      HeartRate | RestingHeartRate => 30.0..=250.0,
      Steps | Calories | Distance | FlightsClimbed => 0.0..=f64::MAX,
      Vo2Max | OxygenSaturation => 0.0..=100.0,
      BloodPressureSystolic => 60.0..=250.0,
      BloodPressureDiastolic => 40.0..=150.0,
      SleepStage => 0.0..=5.0,
      SleepDuration => 0.0..=24.0,
    }
  }

  /// Finite and inside [`valid_range`](Self::valid_range).
  pub fn accepts(self, value: f64) -> bool {
    value.is_finite() && self.valid_range().contains(&value)
  }
}

/// Sleep stage codes stored as [`MetricType::SleepStage`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SleepStage {
  InBed = 0,
  Asleep = 1,
  Awake = 2,
  Core = 3,
  Deep = 4,
  Rem = 5,
}

impl SleepStage {
  pub fn code(self) -> f64 { f64::from(self as u8) }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// The composite key under which at most one event may exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
  pub subject_key: IdentityKey,
  pub device_id:   String,
  pub metric_type: MetricType,
  pub timestamp:   DateTime<Utc>,
}

/// One stored wearable reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
  pub subject_key: IdentityKey,
  pub device_id:   String,
  pub metric_type: MetricType,
  /// Event time, not ingestion time.
  pub timestamp:   DateTime<Utc>,
  pub value:       f64,
  pub ingested_at: DateTime<Utc>,
}

/// Filters for [`crate::store::HealthStore::list_events`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
  pub metric_type: Option<MetricType>,
  /// Only events at or after this time.
  pub since:       Option<DateTime<Utc>>,
  /// Keep at most this many, newest first.
  pub limit:       Option<usize>,
}

/// A screened reading ready to be resolved against storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
  pub device_id:   String,
  pub metric_type: MetricType,
  pub timestamp:   DateTime<Utc>,
  pub value:       f64,
  pub ingested_at: DateTime<Utc>,
}

impl Reading {
  pub fn dedup_key(&self, subject_key: &IdentityKey) -> DedupKey {
    DedupKey {
      subject_key: subject_key.clone(),
      device_id:   self.device_id.clone(),
      metric_type: self.metric_type,
      timestamp:   self.timestamp,
    }
  }
}

// ─── Conflict resolution ─────────────────────────────────────────────────────

/// What to do with an incoming reading given the event already stored under
/// its dedup key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
  Insert,
  Deduplicate,
  /// Overwrite the stored value; rollups must reverse `previous`.
  Correct { previous: f64 },
  /// The stored event was ingested later than this reading.
  Stale,
}

/// Decide the fate of `incoming`.
///
/// A differing value wins when it was ingested no earlier than the stored
/// event. Equal `ingested_at` is won by the incoming reading, so within one
/// batch the later batch position wins.
pub fn resolve(existing: Option<&MetricEvent>, incoming: &Reading) -> Resolution {
  match existing {
    None => Resolution::Insert,
    Some(event) if event.value == incoming.value => Resolution::Deduplicate,
    Some(event) if incoming.ingested_at >= event.ingested_at => {
      Resolution::Correct { previous: event.value }
    }
    Some(_) => Resolution::Stale,
  }
}
