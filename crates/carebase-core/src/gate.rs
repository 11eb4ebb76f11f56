//! The consent gate: the one check every cross-party read goes through.
//!
//! Answers are cached for a few seconds per (subject, party, scope) in a
//! bounded LRU. Every decision or revocation made through the gate fences
//! off the (subject, party) pair at the current epoch, so a revoke is
//! visible on the very next check regardless of the TTL.

use std::{
  num::NonZeroUsize,
  sync::{Mutex, MutexGuard},
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use lru::LruCache;
use strum::IntoEnumIterator as _;
use uuid::Uuid;

use crate::{
  Error,
  consent::{ConsentRecord, ConsentStatus, DataScope, Decision, NewConsent, SYSTEM_ACTOR, Transition},
  identity::IdentityKey,
  store::HealthStore,
};

/// Cached answers kept when no capacity is configured.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

type Pair = (IdentityKey, String);
type Slot = (IdentityKey, String, DataScope);

#[derive(Debug, Clone)]
struct Cached {
  /// Epoch at which the read behind this answer started.
  epoch:     u64,
  cached_at: Instant,
  /// Expiry of the authorizing record, or `None` for a denial.
  grant:     Option<Option<DateTime<Utc>>>,
}

#[derive(Debug)]
struct GateState {
  epoch:   u64,
  entries: LruCache<Slot, Cached>,
  /// Epoch of each pair's latest invalidation.
  fences:  LruCache<Pair, u64>,
  /// Highest fence ever evicted; stands in for any pair not in `fences`.
  floor:   u64,
}

impl GateState {
  fn new(capacity: NonZeroUsize) -> Self {
    Self {
      epoch:   0,
      entries: LruCache::new(capacity),
      fences:  LruCache::new(capacity),
      floor:   0,
    }
  }

  fn fence(&self, pair: &Pair) -> u64 { self.fences.peek(pair).copied().unwrap_or(self.floor) }
}

#[derive(Debug)]
pub struct ConsentGate {
  ttl:   Duration,
  /// `None` when caching is disabled.
  state: Option<Mutex<GateState>>,
}

impl ConsentGate {
  /// A zero `ttl` disables caching.
  pub fn new(ttl: Duration) -> Self { Self::with_capacity(ttl, DEFAULT_CACHE_CAPACITY) }

  /// Keep at most `capacity` cached answers. A zero `ttl` or `capacity`
  /// disables caching.
  pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
    let state = NonZeroUsize::new(capacity)
      .filter(|_| !ttl.is_zero())
      .map(|capacity| Mutex::new(GateState::new(capacity)));
    Self { ttl, state }
  }

  fn lock(&self) -> Option<MutexGuard<'_, GateState>> {
    // The state is a cache; a panic mid-update cannot leave it unsafe.
    self
      .state
      .as_ref()
      .map(|state| state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
  }

  /// Number of answers currently cached.
  pub fn cached_entries(&self) -> usize { self.lock().map_or(0, |state| state.entries.len()) }

  /// Whether `party` may read `scope` data of `subject` at `at`.
  pub async fn is_authorized<S: HealthStore>(
    &self,
    store: &S,
    subject: &IdentityKey,
    party: &str,
    scope: DataScope,
    at: DateTime<Utc>,
  ) -> Result<bool, S::Error> {
    let pair = (subject.clone(), party.to_owned());
    let slot = (subject.clone(), party.to_owned(), scope);

    let started = match self.lock() {
      Some(mut state) => {
        let fence = state.fence(&pair);
        let hit = state
          .entries
          .get(&slot)
          .map(|c| (c.epoch >= fence && c.cached_at.elapsed() < self.ttl).then_some(c.grant));
        match hit {
          Some(Some(grant)) => {
            return Ok(match grant {
              Some(expires_at) => expires_at.is_none_or(|exp| exp > at),
              None => false,
            });
          }
          // Expired or fenced off.
          Some(None) => {
            state.entries.pop(&slot);
          }
          None => {}
        }
        Some(state.epoch)
      }
      None => None,
    };

    let record = store.find_authorizing(subject, party, scope, at).await?;
    let allowed = record.as_ref().is_some_and(|r| r.authorizes(scope, at));

    if let (Some(started), Some(mut state)) = (started, self.lock()) {
      // A decision landed while we were reading; our answer may be stale.
      if state.fence(&pair) <= started {
        let grant = record.filter(|_| allowed).map(|r| r.expires_at);
        state.entries.put(slot, Cached { epoch: started, cached_at: Instant::now(), grant });
      }
    }
    Ok(allowed)
  }

  /// Like [`is_authorized`](Self::is_authorized) but fails with
  /// [`Error::NotAuthorized`].
  pub async fn authorize<S: HealthStore>(
    &self,
    store: &S,
    subject: &IdentityKey,
    party: &str,
    scope: DataScope,
    at: DateTime<Utc>,
  ) -> Result<(), S::Error> {
    if self.is_authorized(store, subject, party, scope, at).await? {
      Ok(())
    } else {
      tracing::info!(identity = subject.prefix(), party, %scope, "consent gate refused read");
      Err(Error::NotAuthorized { party: party.to_owned(), scope }.into())
    }
  }

  /// Fence off cached answers and in-flight reads for the pair.
  pub fn invalidate(&self, subject: &IdentityKey, party: &str) {
    let Some(mut state) = self.lock() else { return };
    state.epoch += 1;
    let epoch = state.epoch;
    let pair = (subject.clone(), party.to_owned());
    if let Some((evicted, fence)) = state.fences.push(pair.clone(), epoch)
      && evicted != pair
    {
      state.floor = state.floor.max(fence);
    }
    for scope in DataScope::iter() {
      state.entries.pop(&(subject.clone(), party.to_owned(), scope));
    }
  }

  // ── Lifecycle operations ──────────────────────────────────────────────

  /// File a PENDING request. `actor` is the requesting party.
  pub async fn request<S: HealthStore>(
    &self,
    store: &S,
    input: NewConsent,
    now: DateTime<Utc>,
  ) -> Result<ConsentRecord, S::Error> {
    if store.get_identity(&input.subject_key).await?.is_none() {
      return Err(Error::IdentityNotFound(input.subject_key.prefix().to_owned()).into());
    }
    let actor = input.requesting_party.clone();
    let record = store.create_consent(input, actor, now).await?;
    tracing::info!(
      record = %record.record_id,
      identity = record.subject_key.prefix(),
      party = %record.requesting_party,
      scope = %record.scope,
      "consent requested"
    );
    Ok(record)
  }

  pub async fn decide<S: HealthStore>(
    &self,
    store: &S,
    id: Uuid,
    decision: Decision,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<ConsentRecord, S::Error> {
    self.apply(store, id, Transition::Decide(decision), actor, now).await
  }

  pub async fn revoke<S: HealthStore>(
    &self,
    store: &S,
    id: Uuid,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<ConsentRecord, S::Error> {
    self.apply(store, id, Transition::Revoke, actor, now).await
  }

  /// Revoke every APPROVED record past its expiry.
  pub async fn sweep_expired<S: HealthStore>(
    &self,
    store: &S,
    now: DateTime<Utc>,
  ) -> Result<Vec<ConsentRecord>, S::Error> {
    let expired = store.expire_consents(now).await?;
    for record in &expired {
      self.invalidate(&record.subject_key, &record.requesting_party);
      tracing::info!(record = %record.record_id, actor = SYSTEM_ACTOR, "consent expired");
    }
    Ok(expired)
  }

  async fn apply<S: HealthStore>(
    &self,
    store: &S,
    id: Uuid,
    change: Transition,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<ConsentRecord, S::Error> {
    let record = store.transition_consent(id, change, actor.to_owned(), now).await?;
    // Invalidate after the write commits so no reader can cache the old state
    // under the new generation.
    self.invalidate(&record.subject_key, &record.requesting_party);
    if record.status == ConsentStatus::Revoked || record.status == ConsentStatus::Approved {
      tracing::info!(record = %record.record_id, status = %record.status, "consent changed");
    } else {
      tracing::debug!(record = %record.record_id, status = %record.status, "consent changed");
    }
    Ok(record)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key() -> IdentityKey { IdentityKey::parse(&"c3".repeat(32)).unwrap() }

  fn fresh(epoch: u64) -> Cached { Cached { epoch, cached_at: Instant::now(), grant: Some(None) } }

  #[test]
  fn invalidate_fences_the_pair_and_drops_its_entries() {
    let gate = ConsentGate::new(Duration::from_secs(60));
    {
      let mut state = gate.lock().unwrap();
      state.entries.put((key(), "dr".into(), DataScope::All), fresh(0));
      state.entries.put((key(), "other".into(), DataScope::All), fresh(0));
    }
    gate.invalidate(&key(), "dr");
    let state = gate.lock().unwrap();
    assert_eq!(state.fence(&(key(), "dr".to_owned())), 1);
    assert_eq!(state.fence(&(key(), "other".to_owned())), 0);
    assert_eq!(state.entries.len(), 1);
    assert!(state.entries.contains(&(key(), "other".to_owned(), DataScope::All)));
  }

  #[test]
  fn cache_never_exceeds_its_capacity() {
    let gate = ConsentGate::with_capacity(Duration::from_secs(60), 3);
    {
      let mut state = gate.lock().unwrap();
      for n in 0..10 {
        state.entries.put((key(), format!("dr-{n}"), DataScope::All), fresh(0));
      }
    }
    for n in 0..10 {
      gate.invalidate(&key(), &format!("dr-{n}"));
    }
    let state = gate.lock().unwrap();
    assert_eq!(state.entries.len(), 0);
    assert_eq!(state.fences.len(), 3);
    drop(state);
    assert_eq!(gate.cached_entries(), 0);
  }

  #[test]
  fn evicted_fences_still_fence() {
    let gate = ConsentGate::with_capacity(Duration::from_secs(60), 1);
    gate.invalidate(&key(), "dr-a");
    gate.invalidate(&key(), "dr-b");
    let state = gate.lock().unwrap();
    // dr-a's fence was evicted; the floor keeps it from reading as zero.
    assert_eq!(state.fence(&(key(), "dr-a".to_owned())), 1);
    assert_eq!(state.fence(&(key(), "dr-b".to_owned())), 2);
  }

  #[test]
  fn zero_ttl_or_capacity_disables_the_cache() {
    assert!(ConsentGate::new(Duration::ZERO).lock().is_none());
    assert!(ConsentGate::with_capacity(Duration::from_secs(5), 0).lock().is_none());
  }
}
