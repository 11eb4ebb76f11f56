//! Consent lifecycle, or who may read a subject's aggregated data.
//!
//! Consent records are immutable once filed. Every state change is an
//! append-only [`AuditEntry`]; a record's current status is computed from its
//! audit trail at query time, never stored in a mutable column.
//!
//! ```text
//! PENDING ──approve──▶ APPROVED ──revoke / expiry──▶ REVOKED
//!    └─────deny──────▶ DENIED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{Error, Result, identity::IdentityKey, metric::MetricType};

/// Actor recorded on transitions the system performs on its own (expiry).
pub const SYSTEM_ACTOR: &str = "system";

// ─── Scope ───────────────────────────────────────────────────────────────────

/// The data categories a consent covers.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
  EnumIter, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataScope {
  /// Steps, energy, distance, flights.
  Activity,
  /// Heart, oxygen, blood pressure, fitness.
  Vitals,
  Sleep,
  All,
}

impl DataScope {
  pub fn as_str(self) -> &'static str { self.into() }

  /// Whether a consent granted for `self` covers a request for `requested`.
  pub fn covers(self, requested: DataScope) -> bool {
    self == DataScope::All || self == requested
  }

  /// Whether readings of `metric` fall inside this scope.
  pub fn includes(self, metric: MetricType) -> bool { self.covers(metric.scope()) }
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
  EnumString, IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ConsentStatus {
  Pending,
  Approved,
  Denied,
  Revoked,
}

impl ConsentStatus {
  pub fn as_str(self) -> &'static str { self.into() }

  /// PENDING and APPROVED records occupy the triple's single active slot.
  pub fn is_active(self) -> bool { matches!(self, Self::Pending | Self::Approved) }

  pub fn is_terminal(self) -> bool { matches!(self, Self::Denied | Self::Revoked) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
  #[serde(alias = "approve")]
  Approve,
  #[serde(alias = "deny")]
  Deny,
}

/// A requested change to a record's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Decide(Decision),
  Revoke,
  /// System-driven revocation of an APPROVED record past `expires_at`.
  Expire,
}

impl Transition {
  fn target(self) -> ConsentStatus {
    match self {
      Self::Decide(Decision::Approve) => ConsentStatus::Approved,
      Self::Decide(Decision::Deny) => ConsentStatus::Denied,
      Self::Revoke | Self::Expire => ConsentStatus::Revoked,
    }
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// Input to [`crate::store::HealthStore::create_consent`].
#[derive(Debug, Clone)]
pub struct NewConsent {
  pub subject_key:      IdentityKey,
  pub requesting_party: String,
  pub scope:            DataScope,
  pub expires_at:       Option<DateTime<Utc>>,
  pub description:      Option<String>,
}

/// One grant attempt with its computed current status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
  pub record_id:        Uuid,
  pub subject_key:      IdentityKey,
  pub requesting_party: String,
  pub scope:            DataScope,
  pub status:           ConsentStatus,
  pub requested_at:     DateTime<Utc>,
  /// When the record left PENDING, if it has.
  pub decided_at:       Option<DateTime<Utc>>,
  pub expires_at:       Option<DateTime<Utc>>,
  pub description:      Option<String>,
}

impl ConsentRecord {
  /// True if this record, on its own, permits `scope` reads at `at`.
  pub fn authorizes(&self, scope: DataScope, at: DateTime<Utc>) -> bool {
    self.status == ConsentStatus::Approved
      && self.scope.covers(scope)
      && self.expires_at.is_none_or(|exp| exp > at)
  }

  /// APPROVED but past its expiry at `now`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.status == ConsentStatus::Approved
      && self.expires_at.is_some_and(|exp| exp <= now)
  }
}

/// An immutable line of a record's audit trail. `from` is `None` for the
/// entry that files the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
  pub seq:       i64,
  pub record_id: Uuid,
  pub actor:     String,
  pub from:      Option<ConsentStatus>,
  pub to:        ConsentStatus,
  pub at:        DateTime<Utc>,
}

/// A not-yet-persisted audit entry produced by [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
  pub record_id: Uuid,
  pub actor:     String,
  pub from:      ConsentStatus,
  pub to:        ConsentStatus,
  pub at:        DateTime<Utc>,
}

/// A record bundled with its full audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentHistory {
  pub record: ConsentRecord,
  pub audit:  Vec<AuditEntry>,
}

/// Filter for [`crate::store::HealthStore::list_consents`].
#[derive(Debug, Clone, Default)]
pub struct ConsentFilter {
  pub subject_key:      Option<IdentityKey>,
  pub requesting_party: Option<String>,
  pub status:           Option<ConsentStatus>,
}

impl ConsentFilter {
  pub fn matches(&self, record: &ConsentRecord) -> bool {
    self.subject_key.as_ref().is_none_or(|k| *k == record.subject_key)
      && self
        .requesting_party
        .as_deref()
        .is_none_or(|p| p == record.requesting_party)
      && self.status.is_none_or(|s| s == record.status)
  }
}

// ─── Computed view ───────────────────────────────────────────────────────────

/// Current status and decision time computed from an audit trail ordered by
/// `seq`. An empty trail is a record that has only been filed.
pub fn resolve_status(audit: &[AuditEntry]) -> (ConsentStatus, Option<DateTime<Utc>>) {
  let status = audit.last().map_or(ConsentStatus::Pending, |e| e.to);
  let decided_at = audit
    .iter()
    .find(|e| e.from == Some(ConsentStatus::Pending))
    .map(|e| e.at);
  (status, decided_at)
}

/// Validate `change` against `record` and produce the audit entry to append.
///
/// Subject-driven transitions require `actor` to be the record's subject;
/// [`Transition::Expire`] is only valid for an APPROVED record whose expiry
/// has passed.
pub fn transition(
  record: &ConsentRecord,
  change: Transition,
  actor: &str,
  now: DateTime<Utc>,
) -> Result<PendingEntry> {
  let to = change.target();
  let allowed_from = match change {
    Transition::Decide(_) => ConsentStatus::Pending,
    Transition::Revoke | Transition::Expire => ConsentStatus::Approved,
  };

  match change {
    Transition::Expire => {
      if !record.is_expired(now) {
        return Err(Error::InvalidTransition { from: record.status, to });
      }
    }
    _ => {
      if actor != record.subject_key.as_str() {
        return Err(Error::Forbidden(format!(
          "only the subject may change consent {}",
          record.record_id
        )));
      }
      if record.status != allowed_from {
        return Err(Error::InvalidTransition { from: record.status, to });
      }
    }
  }

  Ok(PendingEntry {
    record_id: record.record_id,
    actor: actor.to_owned(),
    from: record.status,
    to,
    at: now,
  })
}
