//! The Carebase server: configuration, authentication and the background
//! work that runs beside the API.

pub mod auth;
pub mod config;
pub mod error;

pub use config::ServerConfig;
pub use error::Error;

use std::{sync::Arc, time::Duration};

use axum::{Json, Router, middleware, routing::get};
use carebase_api::{ApiState, api_router};
use carebase_core::{
  gate::ConsentGate,
  identity::IdentityService,
  store::HealthStore,
};
use chrono::Utc;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use auth::{AuthConfig, authenticate};

// ─── Router ───────────────────────────────────────────────────────────────────

/// The full application: `/health` plus the authenticated API under
/// `/api/v1`.
pub fn app<S>(state: ApiState<S>, auth: Arc<AuthConfig>) -> Router
where
  S: HealthStore + 'static,
{
  let api = api_router(state).layer(middleware::from_fn_with_state(auth, authenticate));
  Router::new()
    .route("/health", get(health))
    .nest("/api/v1", api)
    .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> { Json(json!({ "status": "ok" })) }

// ─── Background work ─────────────────────────────────────────────────────────

/// Revoke expired consents every `period`, forever.
pub async fn sweep_consents<S: HealthStore>(store: Arc<S>, gate: Arc<ConsentGate>, period: Duration) {
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    match gate.sweep_expired(store.as_ref(), Utc::now()).await {
      Ok(expired) if !expired.is_empty() => {
        tracing::info!(count = expired.len(), "expired consents revoked");
      }
      Ok(_) => {}
      Err(e) => tracing::warn!(error = %e, "consent sweep failed"),
    }
  }
}

// ─── Maintenance ─────────────────────────────────────────────────────────────

/// Re-seal every identity backup not already under the active backup key.
/// Returns how many were rewritten.
pub async fn rotate_backups<S: HealthStore>(
  store: &S,
  identity: &IdentityService,
) -> Result<usize, S::Error> {
  let mut rotated = 0;
  for (key, backup) in store.list_backups().await? {
    let replacement = identity.rotate(&key, &backup)?;
    if replacement == backup {
      continue;
    }
    if store.replace_backup(key.clone(), backup, replacement).await? {
      rotated += 1;
    } else {
      tracing::warn!(identity = key.prefix(), "backup changed during rotation; skipped");
    }
  }
  tracing::info!(rotated, active = identity.active_backup_key(), "backup rotation finished");
  Ok(rotated)
}
