//! Server configuration, deserialised from `config.toml` layered with
//! `CAREBASE_`-prefixed environment variables.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use carebase_api::Role;
use carebase_core::{
  gate::{ConsentGate, DEFAULT_CACHE_CAPACITY},
  identity::KeyMaterial,
  ingest::IngestPolicy,
};
use chrono::TimeDelta;
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:       String,
  #[serde(default = "default_port")]
  pub port:       u16,
  pub store_path: PathBuf,
  #[serde(default)]
  pub accounts:   Vec<Account>,
  pub identity:   IdentityConfig,
  #[serde(default)]
  pub ingest:     IngestConfig,
  #[serde(default)]
  pub consent:    ConsentConfig,
}

fn default_host() -> String { "127.0.0.1".to_owned() }

fn default_port() -> u16 { 8080 }

/// A login and the party it acts as.
#[derive(Deserialize, Clone)]
pub struct Account {
  pub username:      String,
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub password_hash: String,
  pub role:          Role,
  /// The identity key for patients; any stable id for other parties.
  pub party_id:      String,
}

impl std::fmt::Debug for Account {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Account")
      .field("username", &self.username)
      .field("role", &self.role)
      .finish_non_exhaustive()
  }
}

/// Hex-encoded key material.
#[derive(Deserialize, Clone)]
pub struct IdentityConfig {
  pub lookup_key:        String,
  pub backup_keys:       BTreeMap<String, String>,
  pub active_backup_key: String,
}

impl std::fmt::Debug for IdentityConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IdentityConfig")
      .field("backup_keys", &self.backup_keys.keys().collect::<Vec<_>>())
      .field("active_backup_key", &self.active_backup_key)
      .finish_non_exhaustive()
  }
}

impl IdentityConfig {
  pub fn key_material(&self) -> carebase_core::Result<KeyMaterial> {
    KeyMaterial::from_hex(&self.lookup_key, &self.backup_keys, &self.active_backup_key)
  }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct IngestConfig {
  pub max_future_skew_secs: i64,
  pub retention_days:       i64,
  pub chunk_size:           usize,
}

impl Default for IngestConfig {
  fn default() -> Self {
    Self { max_future_skew_secs: 300, retention_days: 90, chunk_size: 500 }
  }
}

impl IngestConfig {
  /// Fails for negative windows or ones too long to represent.
  pub fn policy(&self) -> Result<IngestPolicy, config::ConfigError> {
    let max_future_skew = Some(self.max_future_skew_secs)
      .filter(|secs| *secs >= 0)
      .and_then(TimeDelta::try_seconds)
      .ok_or_else(|| out_of_range("ingest.max_future_skew_secs"))?;
    let retention = Some(self.retention_days)
      .filter(|days| *days >= 0)
      .and_then(TimeDelta::try_days)
      .ok_or_else(|| out_of_range("ingest.retention_days"))?;
    Ok(IngestPolicy { max_future_skew, retention, chunk_size: self.chunk_size })
  }
}

fn out_of_range(key: &str) -> config::ConfigError {
  config::ConfigError::Message(format!("{key} is out of range"))
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConsentConfig {
  pub cache_ttl_secs:      u64,
  /// Most gate answers held at once; zero disables the cache.
  pub cache_capacity:      usize,
  pub sweep_interval_secs: u64,
}

impl Default for ConsentConfig {
  fn default() -> Self {
    Self {
      cache_ttl_secs:      5,
      cache_capacity:      DEFAULT_CACHE_CAPACITY,
      sweep_interval_secs: 60,
    }
  }
}

impl ConsentConfig {
  pub fn cache_ttl(&self) -> Duration { Duration::from_secs(self.cache_ttl_secs) }

  pub fn gate(&self) -> ConsentGate { ConsentGate::with_capacity(self.cache_ttl(), self.cache_capacity) }

  /// Never zero; `tokio::time::interval` panics on a zero period.
  pub fn sweep_interval(&self) -> Duration { Duration::from_secs(self.sweep_interval_secs.max(1)) }
}

impl ServerConfig {
  /// Read `path` (optional) and the environment.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("CAREBASE")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()?
      .try_deserialize()
  }

  /// `store_path` with a leading `~` expanded.
  pub fn store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
