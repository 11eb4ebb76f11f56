//! The `HealthStore` trait and its error contract.
//!
//! The trait is implemented by storage backends (e.g. `carebase-store-sqlite`).
//! Higher layers (`carebase-api`, `carebase-server`) depend on this
//! abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error,
  consent::{ConsentFilter, ConsentHistory, ConsentRecord, DataScope, NewConsent, Transition},
  device::{Device, NewDevice},
  identity::{EncryptedBackup, IdentityKey, SubjectIdentity},
  metric::{EventQuery, MetricEvent, Reading, Resolution},
  rollup::{ComprehensiveSummary, RollupPoint, RollupQuery},
};

/// Errors a backend may return. Every backend wraps [`Error`] so that the
/// domain taxonomy survives the trip through storage and can be mapped to a
/// response without knowing the backend.
pub trait StoreError: std::error::Error + Send + Sync + From<Error> + 'static {
  /// The wrapped domain error, if this is one.
  fn domain(&self) -> Option<&Error>;
}

/// How one reading of a chunk fared.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
  Resolved(Resolution),
  /// The reading's own transaction failed; the rest of the chunk is
  /// unaffected.
  Failed(String),
}

/// Abstraction over a Carebase storage backend.
///
/// Identity rows and consent records are append-only. Metric events are
/// unique per [`DedupKey`](crate::metric::DedupKey); that uniqueness is the
/// sole correctness mechanism for concurrent ingestion. Rollups are a cache
/// that every event write keeps current in the same transaction.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait HealthStore: Send + Sync {
  type Error: StoreError;

  // ── Identities ────────────────────────────────────────────────────────

  /// Persist a derived identity. Fails with
  /// [`Error::DuplicateIdentity`] if the key is already registered.
  fn register_identity(
    &self,
    key: IdentityKey,
    backup: EncryptedBackup,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<SubjectIdentity, Self::Error>> + Send + '_;

  fn get_identity<'a>(
    &'a self,
    key: &'a IdentityKey,
  ) -> impl Future<Output = Result<Option<SubjectIdentity>, Self::Error>> + Send + 'a;

  /// Every stored backup, for recovery tooling and key rotation.
  fn list_backups(
    &self,
  ) -> impl Future<Output = Result<Vec<(IdentityKey, EncryptedBackup)>, Self::Error>> + Send + '_;

  /// Replace `key`'s backup only if it is still `expected`. Returns whether
  /// the swap happened.
  fn replace_backup(
    &self,
    key: IdentityKey,
    expected: EncryptedBackup,
    replacement: EncryptedBackup,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  // ── Events ────────────────────────────────────────────────────────────

  /// Resolve and persist each reading independently, in order, updating the
  /// hourly and daily rollups with the same transaction as the event.
  ///
  /// The returned vector is index-aligned with `readings`.
  fn apply_readings<'a>(
    &'a self,
    subject: &'a IdentityKey,
    readings: Vec<Reading>,
  ) -> impl Future<Output = Result<Vec<ApplyOutcome>, Self::Error>> + Send + 'a;

  /// Events for a subject matching `query`, newest first.
  fn list_events<'a>(
    &'a self,
    subject: &'a IdentityKey,
    query: &'a EventQuery,
  ) -> impl Future<Output = Result<Vec<MetricEvent>, Self::Error>> + Send + 'a;

  /// Delete every event of `subject` and every rollup derived from them.
  /// Returns the number of events removed.
  fn erase_events<'a>(
    &'a self,
    subject: &'a IdentityKey,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

  // ── Devices ───────────────────────────────────────────────────────────

  /// Register a device for `subject`. Fails with [`Error::DuplicateDevice`]
  /// if the subject already has one with the same id.
  fn register_device<'a>(
    &'a self,
    subject: &'a IdentityKey,
    device: NewDevice,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Device, Self::Error>> + Send + 'a;

  /// A subject's devices, most recently registered first.
  fn list_devices<'a>(
    &'a self,
    subject: &'a IdentityKey,
  ) -> impl Future<Output = Result<Vec<Device>, Self::Error>> + Send + 'a;

  /// Stamp each registered device in `synced` with `at` and add its count to
  /// `readings_synced`. Unregistered ids are ignored. Returns how many
  /// devices were updated.
  fn record_sync<'a>(
    &'a self,
    subject: &'a IdentityKey,
    synced: Vec<(String, u64)>,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

  // ── Rollups ───────────────────────────────────────────────────────────

  fn read_rollup<'a>(
    &'a self,
    subject: &'a IdentityKey,
    query: &'a RollupQuery,
  ) -> impl Future<Output = Result<Vec<RollupPoint>, Self::Error>> + Send + 'a;

  /// Daily rollups for `days` days and hourly rollups for the last 24 hours,
  /// restricted to metric types in `scope`, read in one snapshot.
  fn read_comprehensive<'a>(
    &'a self,
    subject: &'a IdentityKey,
    days: u32,
    scope: DataScope,
    as_of: DateTime<Utc>,
  ) -> impl Future<Output = Result<ComprehensiveSummary, Self::Error>> + Send + 'a;

  /// Discard and replay rollups from raw events, for one subject or all.
  /// Returns the number of events replayed.
  fn rebuild_rollups(
    &self,
    subject: Option<IdentityKey>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Delete rollups whose period starts before `before`. Returns the number
  /// of rows removed.
  fn prune_rollups(
    &self,
    before: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Consents ──────────────────────────────────────────────────────────

  /// File a new PENDING record. Any APPROVED record for the same triple that
  /// has passed its expiry is revoked first. Fails with
  /// [`Error::DuplicatePending`] if the triple still has an active record.
  fn create_consent(
    &self,
    input: NewConsent,
    actor: String,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<ConsentRecord, Self::Error>> + Send + '_;

  /// A record with its full audit trail. Returns `None` if not found.
  fn get_consent(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<ConsentHistory>, Self::Error>> + Send + '_;

  fn list_consents<'a>(
    &'a self,
    filter: &'a ConsentFilter,
  ) -> impl Future<Output = Result<Vec<ConsentRecord>, Self::Error>> + Send + 'a;

  /// Validate `change` with [`crate::consent::transition`] and append the
  /// resulting audit entry. A failed validation writes nothing.
  fn transition_consent(
    &self,
    id: Uuid,
    change: Transition,
    actor: String,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<ConsentRecord, Self::Error>> + Send + '_;

  /// The APPROVED record that authorizes `party` to read `scope` data of
  /// `subject` at `at`, if any.
  fn find_authorizing<'a>(
    &'a self,
    subject: &'a IdentityKey,
    party: &'a str,
    scope: DataScope,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<ConsentRecord>, Self::Error>> + Send + 'a;

  /// Revoke every APPROVED record whose expiry is at or before `now`,
  /// returning the records as they stand afterwards.
  fn expire_consents(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<ConsentRecord>, Self::Error>> + Send + '_;
}
