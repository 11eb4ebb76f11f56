//! Batch ingestion of wearable readings.
//!
//! Readings are screened individually, then handed to the store in chunks.
//! The store resolves each reading against its dedup key and updates the
//! rollups in the same transaction; nothing in this module holds a lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::{
  Error,
  identity::IdentityKey,
  metric::{MetricType, Reading, Resolution},
  store::{ApplyOutcome, HealthStore},
};

/// A reading as submitted by a device, before screening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
  #[serde(alias = "source_device_id")]
  pub device_id:   String,
  pub metric_type: String,
  pub timestamp:   DateTime<Utc>,
  pub value:       f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
  /// Timestamp too far in the future or older than the retention boundary.
  OutOfRange,
  /// Non-finite, or outside the metric's plausible range.
  InvalidValue,
  UnknownMetricType,
  MissingDevice,
  /// A later-ingested value is already stored under the same key.
  Stale,
  StorageError,
}

/// Ingestion limits. Passed explicitly so tests can tighten them.
#[derive(Debug, Clone)]
pub struct IngestPolicy {
  pub max_future_skew: Duration,
  pub retention:       Duration,
  /// Readings per store round trip.
  pub chunk_size:      usize,
}

impl Default for IngestPolicy {
  fn default() -> Self {
    Self {
      max_future_skew: Duration::seconds(300),
      retention:       Duration::days(90),
      chunk_size:      500,
    }
  }
}

impl IngestPolicy {
  /// Validate one reading against the policy at `now`.
  ///
  /// Timestamps are truncated to microseconds, the precision the store keeps,
  /// so that resubmitting the same reading always hits the same key.
  pub fn screen(&self, raw: &RawReading, now: DateTime<Utc>) -> Result<Reading, RejectReason> {
    let device_id = raw.device_id.trim();
    if device_id.is_empty() {
      return Err(RejectReason::MissingDevice);
    }
    let metric_type: MetricType = raw
      .metric_type
      .trim()
      .parse()
      .map_err(|_| RejectReason::UnknownMetricType)?;

    let timestamp = raw.timestamp.trunc_subsecs(6);
    // A window reaching past the representable range has no bound on that side.
    let too_new = now
      .checked_add_signed(self.max_future_skew)
      .is_some_and(|latest| timestamp > latest);
    let too_old = now
      .checked_sub_signed(self.retention)
      .is_some_and(|earliest| timestamp < earliest);
    if too_new || too_old {
      return Err(RejectReason::OutOfRange);
    }
    if !metric_type.accepts(raw.value) {
      return Err(RejectReason::InvalidValue);
    }

    Ok(Reading {
      device_id: device_id.to_owned(),
      metric_type,
      timestamp,
      value: raw.value,
      ingested_at: now.trunc_subsecs(6),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
  /// Position in the submitted batch.
  pub index:   usize,
  pub reading: RawReading,
  pub reason:  RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
  pub accepted:  usize,
  pub duplicate: usize,
  pub corrected: usize,
  pub rejected:  Vec<Rejected>,
}

impl IngestResult {
  fn reject(&mut self, index: usize, reading: RawReading, reason: RejectReason) {
    tracing::debug!(index, reason = %reason, metric_type = reading.metric_type.as_str(), "reading rejected");
    self.rejected.push(Rejected { index, reading, reason });
  }

  /// Count each screened reading of `chunk` by its outcome. A reading the
  /// store returned no outcome for is a storage failure.
  ///
  /// Stored and corrected readings are also counted per device in `synced`;
  /// a device whose readings were all duplicates still gets an entry.
  fn tally(
    &mut self,
    chunk: &[(usize, RawReading, Reading)],
    outcomes: Vec<ApplyOutcome>,
    synced: &mut BTreeMap<String, u64>,
  ) {
    if outcomes.len() != chunk.len() {
      tracing::warn!(
        expected = chunk.len(),
        returned = outcomes.len(),
        "store returned the wrong number of outcomes"
      );
    }
    let outcomes = outcomes.into_iter().map(Some).chain(std::iter::repeat(None));
    for ((index, raw, reading), outcome) in chunk.iter().zip(outcomes) {
      let mut sync = |stored: u64| {
        *synced.entry(reading.device_id.clone()).or_default() += stored;
      };
      match outcome {
        Some(ApplyOutcome::Resolved(Resolution::Insert)) => {
          self.accepted += 1;
          sync(1);
        }
        Some(ApplyOutcome::Resolved(Resolution::Deduplicate)) => {
          self.duplicate += 1;
          sync(0);
        }
        Some(ApplyOutcome::Resolved(Resolution::Correct { .. })) => {
          self.corrected += 1;
          sync(1);
        }
        Some(ApplyOutcome::Resolved(Resolution::Stale)) => {
          self.reject(*index, raw.clone(), RejectReason::Stale)
        }
        Some(ApplyOutcome::Failed(message)) => {
          tracing::warn!(index, error = %message, "reading failed to persist");
          self.reject(*index, raw.clone(), RejectReason::StorageError)
        }
        None => self.reject(*index, raw.clone(), RejectReason::StorageError),
      }
    }
  }

  /// Total readings accounted for.
  pub fn total(&self) -> usize {
    self.accepted + self.duplicate + self.corrected + self.rejected.len()
  }
}

/// Ingest `batch` for `subject`.
///
/// Per-reading failures are reported in the result and never fail the batch.
/// The call itself fails only when the subject is not registered or the
/// existence check cannot reach the store.
pub async fn ingest<S: HealthStore>(
  store: &S,
  subject: &IdentityKey,
  batch: Vec<RawReading>,
  policy: &IngestPolicy,
  now: DateTime<Utc>,
) -> Result<IngestResult, S::Error> {
  if store.get_identity(subject).await?.is_none() {
    return Err(Error::IdentityNotFound(subject.prefix().to_owned()).into());
  }

  let mut result = IngestResult::default();
  let mut synced = BTreeMap::new();
  let mut screened = Vec::with_capacity(batch.len());
  for (index, raw) in batch.into_iter().enumerate() {
    match policy.screen(&raw, now) {
      Ok(reading) => screened.push((index, raw, reading)),
      Err(reason) => result.reject(index, raw, reason),
    }
  }

  for chunk in screened.chunks(policy.chunk_size.max(1)) {
    let readings = chunk.iter().map(|(_, _, r)| r.clone()).collect();
    let outcomes = match store.apply_readings(subject, readings).await {
      Ok(outcomes) => outcomes,
      Err(e) => {
        tracing::warn!(identity = subject.prefix(), error = %e, "chunk failed to apply");
        vec![ApplyOutcome::Failed(e.to_string()); chunk.len()]
      }
    };

    result.tally(chunk, outcomes, &mut synced);
  }

  if !synced.is_empty() {
    // Device bookkeeping never fails the batch.
    if let Err(e) = store.record_sync(subject, synced.into_iter().collect(), now).await {
      tracing::warn!(identity = subject.prefix(), error = %e, "device sync not recorded");
    }
  }

  result.rejected.sort_by_key(|r| r.index);
  tracing::info!(
    identity = subject.prefix(),
    accepted = result.accepted,
    duplicate = result.duplicate,
    corrected = result.corrected,
    rejected = result.rejected.len(),
    "ingested batch"
  );
  Ok(result)
}
