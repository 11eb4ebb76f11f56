//! Rollup arithmetic and read models.
//!
//! A rollup is a cache over metric events: `count`, `sum`, `min` and `max`
//! of the events whose timestamp falls in one period. It is maintained
//! incrementally by [`apply_delta`] and can always be recomputed with
//! [`Accumulator::fold`].

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{consent::DataScope, identity::IdentityKey, metric::MetricType};

/// Longest window a comprehensive read may cover.
pub const MAX_SUMMARY_DAYS: u32 = 366;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
  EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Granularity {
  Hourly,
  Daily,
}

impl Granularity {
  pub fn as_str(self) -> &'static str { self.into() }

  pub fn period(self) -> Duration {
    match self {
      Self::Hourly => Duration::hours(1),
      Self::Daily => Duration::days(1),
    }
  }

  /// Start of the period containing `ts`. Days are UTC days.
  pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
    // Truncation of an in-range UTC timestamp to an hour or day cannot fail.
    ts.duration_trunc(self.period()).unwrap_or(ts)
  }
}

// ─── Accumulator ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
  pub count: u64,
  pub sum:   f64,
  pub min:   f64,
  pub max:   f64,
}

impl Accumulator {
  pub fn single(value: f64) -> Self {
    Self { count: 1, sum: value, min: value, max: value }
  }

  pub fn push(&mut self, value: f64) {
    self.count += 1;
    self.sum += value;
    self.min = self.min.min(value);
    self.max = self.max.max(value);
  }

  /// Recompute from raw values. `None` for an empty period.
  pub fn fold(values: impl IntoIterator<Item = f64>) -> Option<Self> {
    values.into_iter().fold(None, |acc, v| match acc {
      None => Some(Self::single(v)),
      Some(mut a) => {
        a.push(v);
        Some(a)
      }
    })
  }

  pub fn avg(&self) -> f64 {
    if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }
  }
}

/// A change to one event's contribution: `old` is `None` for an insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta {
  pub old: Option<f64>,
  pub new: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Applied {
  Updated(Accumulator),
  /// The correction removed the current extreme, or cancelled too much of
  /// the sum to keep it exact; recompute the period from its events.
  NeedsRescan,
}

/// A correction whose removed value cancels more than this many leading
/// bits of the period sum forces a rescan.
const MAX_CANCELLED_BITS: i32 = 16;

/// Apply `delta` to the period's current accumulator in O(1).
pub fn apply_delta(current: Option<Accumulator>, delta: Delta) -> Applied {
  let Some(acc) = current else {
    // A correction against a missing rollup means the rollup was pruned or
    // is being rebuilt; the new value is all there is.
    return Applied::Updated(Accumulator::single(delta.new));
  };

  let Some(old) = delta.old else {
    let mut acc = acc;
    acc.push(delta.new);
    return Applied::Updated(acc);
  };

  let count = acc.count;
  if count <= 1 {
    return Applied::Updated(Accumulator::single(delta.new));
  }

  let remaining = acc.sum - old;
  if acc.sum.abs() > remaining.abs() * 2f64.powi(MAX_CANCELLED_BITS) {
    return Applied::NeedsRescan;
  }

  // Removing `old` only invalidates an extreme it might have been holding,
  // unless the replacement moves past it in the same direction.
  let min_ok = old > acc.min || delta.new <= old;
  let max_ok = old < acc.max || delta.new >= old;
  if min_ok && max_ok {
    Applied::Updated(Accumulator {
      count,
      sum: remaining + delta.new,
      min: acc.min.min(delta.new),
      max: acc.max.max(delta.new),
    })
  } else {
    Applied::NeedsRescan
  }
}

// ─── Read models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupPoint {
  pub metric_type:  MetricType,
  pub granularity:  Granularity,
  pub period_start: DateTime<Utc>,
  pub count:        u64,
  pub sum:          f64,
  pub min:          f64,
  pub max:          f64,
  pub avg:          f64,
}

impl RollupPoint {
  pub fn new(
    metric_type: MetricType,
    granularity: Granularity,
    period_start: DateTime<Utc>,
    acc: Accumulator,
  ) -> Self {
    Self {
      metric_type,
      granularity,
      period_start,
      count: acc.count,
      sum: acc.sum,
      min: acc.min,
      max: acc.max,
      avg: acc.avg(),
    }
  }
}

/// Parameters for [`crate::store::HealthStore::read_rollup`]. The range is
/// half-open on `period_start`.
#[derive(Debug, Clone)]
pub struct RollupQuery {
  pub metric_type: MetricType,
  pub granularity: Granularity,
  pub from:        DateTime<Utc>,
  pub to:          DateTime<Utc>,
}

/// Daily and hourly rollups computed against the same `as_of`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveSummary {
  pub subject_key: IdentityKey,
  pub as_of:       DateTime<Utc>,
  pub days:        u32,
  pub scope:       DataScope,
  pub daily:       Vec<RollupPoint>,
  pub hourly:      Vec<RollupPoint>,
}

/// The windows a comprehensive read covers at `as_of`: `days` whole UTC days
/// ending with today, and the 24 hourly periods ending with the current hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryWindow {
  pub daily_from:  DateTime<Utc>,
  pub hourly_from: DateTime<Utc>,
  pub until:       DateTime<Utc>,
}

impl SummaryWindow {
  pub fn new(as_of: DateTime<Utc>, days: u32) -> Self {
    let today = Granularity::Daily.truncate(as_of);
    let hour = Granularity::Hourly.truncate(as_of);
    Self {
      daily_from:  today - Duration::days(i64::from(days.max(1)) - 1),
      hourly_from: hour - Duration::hours(23),
      until:       hour + Duration::hours(1),
    }
  }
}
