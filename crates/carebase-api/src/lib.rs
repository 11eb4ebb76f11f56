//! JSON REST API for Carebase.
//!
//! Exposes an axum [`Router`] backed by any [`HealthStore`]. Authentication,
//! TLS, and transport concerns are the caller's responsibility: the router
//! expects an authenticated [`Caller`] in the request extensions for every
//! route except identity registration.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api/v1", carebase_api::api_router(state))
//! ```

pub mod caller;
pub mod consents;
pub mod devices;
pub mod error;
pub mod identities;
pub mod readings;
pub mod summary;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use carebase_core::{
  gate::ConsentGate,
  identity::{IdentityKey, IdentityService},
  ingest::IngestPolicy,
  store::HealthStore,
};
use chrono::{DateTime, Utc};

pub use caller::{Caller, Role};
pub use error::ApiError;

/// Source of "now" for every handler.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared state threaded through all handlers.
pub struct ApiState<S> {
  pub store:    Arc<S>,
  pub identity: Arc<IdentityService>,
  pub ingest:   Arc<IngestPolicy>,
  pub gate:     Arc<ConsentGate>,
  pub clock:    Clock,
}

impl<S> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self {
      store:    self.store.clone(),
      identity: self.identity.clone(),
      ingest:   self.ingest.clone(),
      gate:     self.gate.clone(),
      clock:    self.clock.clone(),
    }
  }
}

impl<S> ApiState<S> {
  pub fn new(
    store: Arc<S>,
    identity: IdentityService,
    ingest: IngestPolicy,
    gate: Arc<ConsentGate>,
  ) -> Self {
    Self {
      store,
      identity: Arc::new(identity),
      ingest: Arc::new(ingest),
      gate,
      clock: Arc::new(Utc::now),
    }
  }

  /// Replace the wall clock, for tests that pin "now".
  pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  pub(crate) fn now(&self) -> DateTime<Utc> { (self.clock)() }
}

/// Build the API router for `state`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(state: ApiState<S>) -> Router<()>
where
  S: HealthStore + 'static,
{
  Router::new()
    // Identities
    .route("/identities", post(identities::register::<S>))
    // Subject data
    .route("/subjects/{key}/readings", post(readings::submit::<S>))
    .route("/subjects/{key}/import/apple-health", post(readings::import_json::<S>))
    .route("/subjects/{key}/import/apple-health.xml", post(readings::import_xml::<S>))
    .route(
      "/subjects/{key}/events",
      get(readings::recent::<S>).delete(readings::erase::<S>),
    )
    .route(
      "/subjects/{key}/devices",
      get(devices::list::<S>).post(devices::register::<S>),
    )
    .route("/subjects/{key}/summary", get(summary::comprehensive::<S>))
    .route("/subjects/{key}/rollups", get(summary::rollups::<S>))
    // Consents
    .route("/subjects/{key}/consents", get(consents::list_for_subject::<S>))
    .route("/consents", post(consents::request::<S>))
    .route("/consents/{id}", get(consents::get_one::<S>))
    .route("/consents/{id}/decision", post(consents::decide::<S>))
    .route("/consents/{id}/revoke", post(consents::revoke::<S>))
    .route("/parties/me/consents", get(consents::list_for_party::<S>))
    .with_state(state)
}

/// Parse a `{key}` path segment.
pub(crate) fn subject_key(raw: &str) -> Result<IdentityKey, ApiError> {
  IdentityKey::parse(raw).map_err(|_| ApiError::NotFound(format!("subject {raw} not found")))
}
