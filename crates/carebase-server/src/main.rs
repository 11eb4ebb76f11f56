//! carebase-server binary.
//!
//! Reads `config.toml` (or the path given with `--config`) layered with
//! `CAREBASE_*` environment variables, opens the SQLite store and serves the
//! JSON API over HTTP.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for an account's `password_hash`:
//!
//! ```text
//! cargo run -p carebase-server -- hash-password
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use carebase_api::ApiState;
use carebase_core::{
  identity::{IdentityKey, IdentityService},
  store::HealthStore,
};
use carebase_server::{ServerConfig, auth::AuthConfig};
use carebase_store_sqlite::SqliteStore;
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use rand_core::OsRng;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Carebase health record server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml", global = true)]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the API (the default).
  Serve,
  /// Print the argon2 hash for a password entered on stdin and exit.
  HashPassword,
  /// Discard rollups and replay them from raw events.
  RebuildRollups {
    /// Only this subject's identity key.
    #[arg(long)]
    subject: Option<String>,
  },
  /// Delete rollups whose period started more than `days` days ago.
  PruneRollups {
    #[arg(long)]
    days: u32,
  },
  /// Re-seal identity backups under the active backup key.
  RotateBackups,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  match cli.command.unwrap_or(Command::Serve) {
    Command::Serve => {
      let (server_cfg, store, identity) = open(&cli.config).await?;
      serve(server_cfg, store, identity).await
    }
    Command::HashPassword => hash_password(),
    Command::RebuildRollups { subject } => {
      let subject = subject
        .as_deref()
        .map(IdentityKey::parse)
        .transpose()
        .context("invalid --subject")?;
      let (_, store, _) = open(&cli.config).await?;
      let replayed = store.rebuild_rollups(subject).await.context("rebuild failed")?;
      println!("replayed {replayed} events");
      Ok(())
    }
    Command::PruneRollups { days } => {
      let before = TimeDelta::try_days(i64::from(days))
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .context("--days is out of range")?;
      let (_, store, _) = open(&cli.config).await?;
      let removed = store.prune_rollups(before).await.context("prune failed")?;
      println!("removed {removed} rollups");
      Ok(())
    }
    Command::RotateBackups => {
      let (_, store, identity) = open(&cli.config).await?;
      let rotated = carebase_server::rotate_backups(&store, &identity)
        .await
        .context("rotation failed")?;
      println!("rotated {rotated} backups");
      Ok(())
    }
  }
}

/// Load configuration and key material, then open the store. Refuses to go
/// on without usable keys.
async fn open(path: &Path) -> anyhow::Result<(ServerConfig, SqliteStore, IdentityService)> {
  let server_cfg = ServerConfig::load(path).context("failed to load configuration")?;

  let keys = server_cfg
    .identity
    .key_material()
    .context("identity key material unavailable")?;

  let store_path = server_cfg.store_path();
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  Ok((server_cfg, store, IdentityService::new(keys)))
}

async fn serve(
  server_cfg: ServerConfig,
  store: SqliteStore,
  identity: IdentityService,
) -> anyhow::Result<()> {
  if server_cfg.accounts.is_empty() {
    tracing::warn!("no accounts configured; only registration will be reachable");
  }

  let policy = server_cfg.ingest.policy().context("invalid ingest settings")?;
  let store = Arc::new(store);
  let gate = Arc::new(server_cfg.consent.gate());
  tokio::spawn(carebase_server::sweep_consents(
    store.clone(),
    gate.clone(),
    server_cfg.consent.sweep_interval(),
  ));

  let state = ApiState::new(store, identity, policy, gate);
  let auth = Arc::new(AuthConfig { accounts: server_cfg.accounts.clone() });
  let app = carebase_server::app(state, auth);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      tokio::signal::ctrl_c().await.ok();
    })
    .await
    .context("server error")?;

  Ok(())
}

/// Hash a password read from stdin and print the PHC string.
fn hash_password() -> anyhow::Result<()> {
  use std::io::{self, BufRead, Write};

  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  io::stdin().lock().read_line(&mut line)?;
  let password = line.trim_end_matches(['\n', '\r']);

  let salt = SaltString::generate(&mut OsRng);
  let hash = Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
    .to_string();
  println!("{hash}");
  Ok(())
}
