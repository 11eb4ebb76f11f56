//! [`SqliteStore`], the SQLite implementation of [`HealthStore`].

use std::{collections::HashMap, path::Path};

use carebase_core::{
  consent::{
    self, ConsentFilter, ConsentHistory, ConsentRecord, ConsentStatus, DataScope, NewConsent,
    SYSTEM_ACTOR, Transition,
  },
  identity::{EncryptedBackup, IdentityKey, SubjectIdentity},
  device::{Device, NewDevice},
  metric::{DedupKey, EventQuery, MetricEvent, MetricType, Reading, Resolution, resolve},
  rollup::{
    Accumulator, Applied, ComprehensiveSummary, Delta, Granularity, MAX_SUMMARY_DAYS,
    RollupPoint, RollupQuery, SummaryWindow, apply_delta,
  },
  store::{ApplyOutcome, HealthStore},
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    CONSENT_COLUMNS, DEVICE_COLUMNS, EVENT_COLUMNS, ROLLUP_COLUMNS, RawAudit, RawBackup,
    RawConsent, RawDevice, RawEvent, RawIdentity, RawRollup, check_trail, decode_dt,
    decode_metric, encode_dt, encode_uuid, rollup_table,
  },
  schema::SCHEMA,
};

/// Conditional writes retried this many times before a reading is reported
/// as failed.
const MAX_WRITE_ATTEMPTS: usize = 4;

const GRANULARITIES: [Granularity; 2] = [Granularity::Hourly, Granularity::Daily];

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Carebase health store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run `f` on the connection thread, keeping this crate's error type.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    self.conn.call(move |conn| Ok(f(conn))).await?
  }
}

// ─── Events and rollups ──────────────────────────────────────────────────────

fn select_event(conn: &Connection, key: &DedupKey) -> Result<Option<MetricEvent>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {EVENT_COLUMNS} FROM metric_events
         WHERE subject_key = ?1 AND device_id = ?2 AND metric_type = ?3 AND timestamp = ?4"
      ),
      params![
        key.subject_key.as_str(),
        key.device_id,
        key.metric_type.as_str(),
        encode_dt(key.timestamp),
      ],
      RawEvent::from_row,
    )
    .optional()?;
  raw.map(RawEvent::into_event).transpose()
}

/// Resolve one reading against its stored event and write the outcome.
///
/// The event write is conditional on the row still holding what we read, so
/// a writer that loses a race re-resolves against the winner instead of
/// applying a delta computed from a value that no longer exists.
fn apply_reading(
  tx: &Transaction<'_>,
  subject_key: &IdentityKey,
  reading: &Reading,
) -> Result<Resolution> {
  let subject = subject_key.as_str();
  let key = reading.dedup_key(subject_key);
  let metric = reading.metric_type.as_str();
  let ts = encode_dt(reading.timestamp);
  let ingested = encode_dt(reading.ingested_at);

  for _ in 0..MAX_WRITE_ATTEMPTS {
    let existing = select_event(tx, &key)?;
    let resolution = resolve(existing.as_ref(), reading);

    let written = match (resolution, &existing) {
      (Resolution::Insert, _) => tx.execute(
        "INSERT INTO metric_events
           (subject_key, device_id, metric_type, timestamp, value, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (subject_key, device_id, metric_type, timestamp) DO NOTHING",
        params![subject, reading.device_id, metric, ts, reading.value, ingested],
      )?,
      (Resolution::Correct { previous }, Some(event)) => tx.execute(
        "UPDATE metric_events SET value = ?5, ingested_at = ?6
         WHERE subject_key = ?1 AND device_id = ?2 AND metric_type = ?3 AND timestamp = ?4
           AND value = ?7 AND ingested_at = ?8",
        params![
          subject,
          reading.device_id,
          metric,
          ts,
          reading.value,
          ingested,
          previous,
          encode_dt(event.ingested_at),
        ],
      )?,
      _ => return Ok(resolution),
    };
    if written == 0 {
      continue;
    }

    let old = match resolution {
      Resolution::Correct { previous } => Some(previous),
      _ => None,
    };
    let delta = Delta { old, new: reading.value };
    for granularity in GRANULARITIES {
      apply_rollup(tx, granularity, subject, reading.metric_type, reading.timestamp, delta)?;
    }
    return Ok(resolution);
  }

  Err(Error::Contention(format!("{metric} at {ts}")))
}

fn apply_rollup(
  conn: &Connection,
  granularity: Granularity,
  subject: &str,
  metric_type: MetricType,
  timestamp: DateTime<Utc>,
  delta: Delta,
) -> Result<()> {
  let table = rollup_table(granularity);
  let start = granularity.truncate(timestamp);
  let start_s = encode_dt(start);

  let current = conn
    .query_row(
      &format!(
        "SELECT count, sum, min, max FROM {table}
         WHERE subject_key = ?1 AND metric_type = ?2 AND period_start = ?3"
      ),
      params![subject, metric_type.as_str(), start_s],
      |row| {
        Ok(Accumulator {
          count: u64::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
          sum:   row.get(1)?,
          min:   row.get(2)?,
          max:   row.get(3)?,
        })
      },
    )
    .optional()?;

  let acc = match apply_delta(current, delta) {
    Applied::Updated(acc) => acc,
    Applied::NeedsRescan => {
      tracing::debug!(%metric_type, %granularity, period = %start_s, "rescanning period");
      let (count, sum, min, max): (i64, Option<f64>, Option<f64>, Option<f64>) = conn.query_row(
        "SELECT COUNT(*), SUM(value), MIN(value), MAX(value) FROM metric_events
         WHERE subject_key = ?1 AND metric_type = ?2 AND timestamp >= ?3 AND timestamp < ?4",
        params![
          subject,
          metric_type.as_str(),
          start_s,
          encode_dt(start + granularity.period()),
        ],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )?;
      match (sum, min, max) {
        (Some(sum), Some(min), Some(max)) => Accumulator {
          count: u64::try_from(count).unwrap_or(0),
          sum,
          min,
          max,
        },
        // The event was written in this transaction, so the period is never
        // empty here.
        _ => Accumulator::single(delta.new),
      }
    }
  };

  upsert_rollup(conn, table, subject, metric_type, &start_s, acc)
}

fn upsert_rollup(
  conn: &Connection,
  table: &str,
  subject: &str,
  metric_type: MetricType,
  period_start: &str,
  acc: Accumulator,
) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT INTO {table} (subject_key, metric_type, period_start, count, sum, min, max)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
       ON CONFLICT (subject_key, metric_type, period_start) DO UPDATE SET
         count = excluded.count, sum = excluded.sum,
         min = excluded.min, max = excluded.max"
    ),
    params![
      subject,
      metric_type.as_str(),
      period_start,
      i64::try_from(acc.count).unwrap_or(i64::MAX),
      acc.sum,
      acc.min,
      acc.max,
    ],
  )?;
  Ok(())
}

fn select_rollups(
  conn: &Connection,
  granularity: Granularity,
  subject: &str,
  metric_type: Option<MetricType>,
  from: DateTime<Utc>,
  to: DateTime<Utc>,
) -> Result<Vec<RollupPoint>> {
  let table = rollup_table(granularity);
  let mut stmt = conn.prepare(&format!(
    "SELECT {ROLLUP_COLUMNS} FROM {table}
     WHERE subject_key = ?1 AND (?2 IS NULL OR metric_type = ?2)
       AND period_start >= ?3 AND period_start < ?4
     ORDER BY metric_type, period_start"
  ))?;
  let raws = stmt
    .query_map(
      params![subject, metric_type.map(MetricType::as_str), encode_dt(from), encode_dt(to)],
      RawRollup::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(|r| r.into_point(granularity)).collect()
}

/// Clear rollups and replay events into fresh accumulators.
fn rebuild(tx: &Transaction<'_>, subject: Option<&str>) -> Result<u64> {
  for granularity in GRANULARITIES {
    tx.execute(
      &format!("DELETE FROM {} WHERE ?1 IS NULL OR subject_key = ?1", rollup_table(granularity)),
      params![subject],
    )?;
  }

  let mut stmt = tx.prepare(
    "SELECT subject_key, metric_type, timestamp, value FROM metric_events
     WHERE ?1 IS NULL OR subject_key = ?1",
  )?;
  let rows = stmt
    .query_map(params![subject], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, f64>(3)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut folded: HashMap<(Granularity, String, MetricType, DateTime<Utc>), Accumulator> =
    HashMap::new();
  for (subject, metric, ts, value) in &rows {
    let metric = decode_metric(metric)?;
    let ts = decode_dt(ts)?;
    for granularity in GRANULARITIES {
      folded
        .entry((granularity, subject.clone(), metric, granularity.truncate(ts)))
        .and_modify(|acc| acc.push(*value))
        .or_insert_with(|| Accumulator::single(*value));
    }
  }

  for ((granularity, subject, metric, start), acc) in folded {
    upsert_rollup(tx, rollup_table(granularity), &subject, metric, &encode_dt(start), acc)?;
  }
  Ok(rows.len() as u64)
}

// ─── Consents ────────────────────────────────────────────────────────────────

fn load_consent(conn: &Connection, id: &str) -> Result<Option<ConsentRecord>> {
  let raw = conn
    .query_row(
      &format!("SELECT {CONSENT_COLUMNS} FROM consent_records r WHERE r.record_id = ?1"),
      params![id],
      RawConsent::from_row,
    )
    .optional()?;
  raw.map(RawConsent::into_record).transpose()
}

fn load_audit(conn: &Connection, id: &str) -> Result<Vec<consent::AuditEntry>> {
  let mut stmt = conn.prepare(
    "SELECT seq, record_id, actor, from_status, to_status, recorded_at
     FROM consent_audit WHERE record_id = ?1 ORDER BY seq",
  )?;
  let raws = stmt
    .query_map(params![id], RawAudit::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawAudit::into_entry).collect()
}

fn must_load(conn: &Connection, id: Uuid) -> Result<ConsentRecord> {
  load_consent(conn, &encode_uuid(id))?
    .ok_or(Error::Core(carebase_core::Error::ConsentNotFound(id)))
}

/// Validate and append one transition. Terminal states release the triple's
/// active slot in the same transaction.
fn apply_transition(
  tx: &Transaction<'_>,
  record: &ConsentRecord,
  change: Transition,
  actor: &str,
  now: DateTime<Utc>,
) -> Result<ConsentRecord> {
  let entry = consent::transition(record, change, actor, now)?;
  let id = encode_uuid(entry.record_id);

  tx.execute(
    "INSERT INTO consent_audit (record_id, actor, from_status, to_status, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    params![id, entry.actor, entry.from.as_str(), entry.to.as_str(), encode_dt(entry.at)],
  )?;
  if entry.to.is_terminal() {
    tx.execute("DELETE FROM consent_active WHERE record_id = ?1", params![id])?;
  }
  must_load(tx, entry.record_id)
}

fn select_consents(
  conn: &Connection,
  subject: Option<&str>,
  party: Option<&str>,
  active_only: bool,
) -> Result<Vec<ConsentRecord>> {
  let join = if active_only {
    "JOIN consent_active c ON c.record_id = r.record_id"
  } else {
    ""
  };
  let mut stmt = conn.prepare(&format!(
    "SELECT {CONSENT_COLUMNS} FROM consent_records r {join}
     WHERE (?1 IS NULL OR r.subject_key = ?1) AND (?2 IS NULL OR r.requesting_party = ?2)
     ORDER BY r.requested_at DESC, r.record_id"
  ))?;
  let raws = stmt
    .query_map(params![subject, party], RawConsent::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawConsent::into_record).collect()
}

// ─── HealthStore impl ────────────────────────────────────────────────────────

impl HealthStore for SqliteStore {
  type Error = Error;

  // ── Identities ────────────────────────────────────────────────────────────

  async fn register_identity(
    &self,
    key: IdentityKey,
    backup: EncryptedBackup,
    now: DateTime<Utc>,
  ) -> Result<SubjectIdentity> {
    let at = encode_dt(now);
    let registered_at = decode_dt(&at)?;

    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
          "INSERT INTO identities (identity_key, registered_at) VALUES (?1, ?2)
           ON CONFLICT (identity_key) DO NOTHING",
          params![key.as_str(), at],
        )?;
        if inserted == 0 {
          return Err(carebase_core::Error::DuplicateIdentity(key.prefix().to_owned()).into());
        }
        tx.execute(
          "INSERT INTO identity_backups (identity_key, key_id, sealed, updated_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![key.as_str(), backup.key_id, backup.sealed, at],
        )?;
        tx.commit()?;
        Ok(SubjectIdentity { identity_key: key, registered_at })
      })
      .await
  }

  async fn get_identity(&self, key: &IdentityKey) -> Result<Option<SubjectIdentity>> {
    let key = key.as_str().to_owned();
    let raw: Option<RawIdentity> = self
      .with_conn(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT identity_key, registered_at FROM identities WHERE identity_key = ?1",
              params![key],
              RawIdentity::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawIdentity::into_identity).transpose()
  }

  async fn list_backups(&self) -> Result<Vec<(IdentityKey, EncryptedBackup)>> {
    let raws: Vec<RawBackup> = self
      .with_conn(|conn| {
        let mut stmt = conn.prepare(
          "SELECT identity_key, key_id, sealed FROM identity_backups ORDER BY identity_key",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawBackup {
              identity_key: row.get(0)?,
              key_id:       row.get(1)?,
              sealed:       row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawBackup::into_pair).collect()
  }

  async fn replace_backup(
    &self,
    key: IdentityKey,
    expected: EncryptedBackup,
    replacement: EncryptedBackup,
  ) -> Result<bool> {
    let now = encode_dt(Utc::now());
    self
      .with_conn(move |conn| {
        let changed = conn.execute(
          "UPDATE identity_backups SET key_id = ?4, sealed = ?5, updated_at = ?6
           WHERE identity_key = ?1 AND key_id = ?2 AND sealed = ?3",
          params![
            key.as_str(),
            expected.key_id,
            expected.sealed,
            replacement.key_id,
            replacement.sealed,
            now,
          ],
        )?;
        Ok(changed == 1)
      })
      .await
  }

  // ── Events ────────────────────────────────────────────────────────────────

  async fn apply_readings(
    &self,
    subject: &IdentityKey,
    readings: Vec<Reading>,
  ) -> Result<Vec<ApplyOutcome>> {
    let subject = subject.clone();
    self
      .with_conn(move |conn| {
        let mut outcomes = Vec::with_capacity(readings.len());
        for reading in &readings {
          let applied = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(Error::from)
            .and_then(|tx| {
              let resolution = apply_reading(&tx, &subject, reading)?;
              tx.commit()?;
              Ok(resolution)
            });
          outcomes.push(match applied {
            Ok(resolution) => ApplyOutcome::Resolved(resolution),
            Err(e) => {
              tracing::warn!(metric_type = %reading.metric_type, error = %e, "reading write failed");
              ApplyOutcome::Failed(e.to_string())
            }
          });
        }
        Ok(outcomes)
      })
      .await
  }

  async fn list_events(
    &self,
    subject: &IdentityKey,
    query: &EventQuery,
  ) -> Result<Vec<MetricEvent>> {
    let subject = subject.as_str().to_owned();
    let query = query.clone();
    let raws: Vec<RawEvent> = self
      .with_conn(move |conn| {
        let limit = query.limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let mut stmt = conn.prepare(&format!(
          "SELECT {EVENT_COLUMNS} FROM metric_events
           WHERE subject_key = ?1 AND (?2 IS NULL OR metric_type = ?2)
             AND (?3 IS NULL OR timestamp >= ?3)
           ORDER BY timestamp DESC, metric_type, device_id
           LIMIT ?4"
        ))?;
        let rows = stmt
          .query_map(
            params![
              subject,
              query.metric_type.map(MetricType::as_str),
              query.since.map(encode_dt),
              limit,
            ],
            RawEvent::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawEvent::into_event).collect()
  }

  async fn erase_events(&self, subject: &IdentityKey) -> Result<u64> {
    let subject = subject.as_str().to_owned();
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for granularity in GRANULARITIES {
          tx.execute(
            &format!("DELETE FROM {} WHERE subject_key = ?1", rollup_table(granularity)),
            params![subject],
          )?;
        }
        let removed = tx.execute("DELETE FROM metric_events WHERE subject_key = ?1", params![subject])?;
        tx.commit()?;
        Ok(removed as u64)
      })
      .await
  }

  // ── Devices ───────────────────────────────────────────────────────────────

  async fn register_device(
    &self,
    subject: &IdentityKey,
    device: NewDevice,
    now: DateTime<Utc>,
  ) -> Result<Device> {
    let device = device.normalize()?;
    let subject = subject.clone();
    let at = encode_dt(now);
    let registered_at = decode_dt(&at)?;

    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let known: Option<String> = tx
          .query_row(
            "SELECT identity_key FROM identities WHERE identity_key = ?1",
            params![subject.as_str()],
            |row| row.get(0),
          )
          .optional()?;
        if known.is_none() {
          return Err(carebase_core::Error::IdentityNotFound(subject.prefix().to_owned()).into());
        }
        let inserted = tx.execute(
          "INSERT INTO devices (subject_key, device_id, name, kind, registered_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (subject_key, device_id) DO NOTHING",
          params![subject.as_str(), device.device_id, device.name, device.kind, at],
        )?;
        if inserted == 0 {
          return Err(carebase_core::Error::DuplicateDevice(device.device_id).into());
        }
        tx.commit()?;
        Ok(Device {
          subject_key: subject,
          device_id: device.device_id,
          name: device.name,
          kind: device.kind,
          registered_at,
          last_sync_at: None,
          readings_synced: 0,
        })
      })
      .await
  }

  async fn list_devices(&self, subject: &IdentityKey) -> Result<Vec<Device>> {
    let subject = subject.as_str().to_owned();
    let raws: Vec<RawDevice> = self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {DEVICE_COLUMNS} FROM devices WHERE subject_key = ?1
           ORDER BY registered_at DESC, device_id"
        ))?;
        let rows = stmt
          .query_map(params![subject], RawDevice::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawDevice::into_device).collect()
  }

  async fn record_sync(
    &self,
    subject: &IdentityKey,
    synced: Vec<(String, u64)>,
    at: DateTime<Utc>,
  ) -> Result<usize> {
    let subject = subject.as_str().to_owned();
    let at = encode_dt(at);
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut updated = 0;
        {
          let mut stmt = tx.prepare(
            "UPDATE devices SET last_sync_at = ?3, readings_synced = readings_synced + ?4
             WHERE subject_key = ?1 AND device_id = ?2",
          )?;
          for (device_id, count) in &synced {
            let count = i64::try_from(*count).unwrap_or(i64::MAX);
            updated += stmt.execute(params![subject, device_id, at, count])?;
          }
        }
        tx.commit()?;
        Ok(updated)
      })
      .await
  }

  // ── Rollups ───────────────────────────────────────────────────────────────

  async fn read_rollup(
    &self,
    subject: &IdentityKey,
    query: &RollupQuery,
  ) -> Result<Vec<RollupPoint>> {
    if query.from >= query.to {
      return Err(carebase_core::Error::Validation("rollup range is empty".into()).into());
    }
    let subject = subject.as_str().to_owned();
    let query = query.clone();
    self
      .with_conn(move |conn| {
        select_rollups(
          conn,
          query.granularity,
          &subject,
          Some(query.metric_type),
          query.from,
          query.to,
        )
      })
      .await
  }

  async fn read_comprehensive(
    &self,
    subject: &IdentityKey,
    days: u32,
    scope: DataScope,
    as_of: DateTime<Utc>,
  ) -> Result<ComprehensiveSummary> {
    if !(1..=MAX_SUMMARY_DAYS).contains(&days) {
      return Err(
        carebase_core::Error::Validation(format!("days must be between 1 and {MAX_SUMMARY_DAYS}"))
          .into(),
      );
    }
    let window = SummaryWindow::new(as_of, days);
    let subject_key = subject.clone();
    let subject = subject.as_str().to_owned();

    let (daily, hourly) = self
      .with_conn(move |conn| {
        // Both resolutions come from one read snapshot.
        let tx = conn.transaction()?;
        let daily =
          select_rollups(&tx, Granularity::Daily, &subject, None, window.daily_from, window.until)?;
        let hourly = select_rollups(
          &tx,
          Granularity::Hourly,
          &subject,
          None,
          window.hourly_from,
          window.until,
        )?;
        tx.commit()?;
        Ok((daily, hourly))
      })
      .await?;

    let in_scope = |p: &RollupPoint| scope.includes(p.metric_type);
    Ok(ComprehensiveSummary {
      subject_key,
      as_of,
      days,
      scope,
      daily: daily.into_iter().filter(in_scope).collect(),
      hourly: hourly.into_iter().filter(in_scope).collect(),
    })
  }

  async fn rebuild_rollups(&self, subject: Option<IdentityKey>) -> Result<u64> {
    let subject = subject.map(|k| k.as_str().to_owned());
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let replayed = rebuild(&tx, subject.as_deref())?;
        tx.commit()?;
        Ok(replayed)
      })
      .await
  }

  async fn prune_rollups(&self, before: DateTime<Utc>) -> Result<u64> {
    let before = encode_dt(before);
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        for granularity in GRANULARITIES {
          removed += tx.execute(
            &format!("DELETE FROM {} WHERE period_start < ?1", rollup_table(granularity)),
            params![before],
          )?;
        }
        tx.commit()?;
        Ok(removed as u64)
      })
      .await
  }

  // ── Consents ──────────────────────────────────────────────────────────────

  async fn create_consent(
    &self,
    input: NewConsent,
    actor: String,
    now: DateTime<Utc>,
  ) -> Result<ConsentRecord> {
    if input.requesting_party.trim().is_empty() {
      return Err(carebase_core::Error::Validation("requesting party is empty".into()).into());
    }
    if input.expires_at.is_some_and(|exp| exp <= now) {
      return Err(carebase_core::Error::Validation("expiry is in the past".into()).into());
    }

    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let subject = input.subject_key.as_str();
        let scope = input.scope.as_str();

        let active: Option<String> = tx
          .query_row(
            "SELECT record_id FROM consent_active
             WHERE subject_key = ?1 AND requesting_party = ?2 AND scope = ?3",
            params![subject, input.requesting_party, scope],
            |row| row.get(0),
          )
          .optional()?;
        if let Some(active_id) = active {
          let existing = load_consent(&tx, &active_id)?
            .ok_or_else(|| Error::Decode(format!("dangling active consent {active_id}")))?;
          if existing.is_expired(now) {
            apply_transition(&tx, &existing, Transition::Expire, SYSTEM_ACTOR, now)?;
          } else {
            return Err(carebase_core::Error::DuplicatePending(existing.record_id).into());
          }
        }

        let record_id = Uuid::new_v4();
        let id = encode_uuid(record_id);
        let at = encode_dt(now);
        tx.execute(
          "INSERT INTO consent_records
             (record_id, subject_key, requesting_party, scope, requested_at, expires_at, description)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          params![
            id,
            subject,
            input.requesting_party,
            scope,
            at,
            input.expires_at.map(encode_dt),
            input.description,
          ],
        )?;
        tx.execute(
          "INSERT INTO consent_active (subject_key, requesting_party, scope, record_id)
           VALUES (?1, ?2, ?3, ?4)",
          params![subject, input.requesting_party, scope, id],
        )?;
        tx.execute(
          "INSERT INTO consent_audit (record_id, actor, from_status, to_status, recorded_at)
           VALUES (?1, ?2, NULL, ?3, ?4)",
          params![id, actor, ConsentStatus::Pending.as_str(), at],
        )?;

        let record = must_load(&tx, record_id)?;
        tx.commit()?;
        Ok(record)
      })
      .await
  }

  async fn get_consent(&self, id: Uuid) -> Result<Option<ConsentHistory>> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        let id_s = encode_uuid(id);
        let Some(record) = load_consent(&tx, &id_s)? else {
          return Ok(None);
        };
        let audit = load_audit(&tx, &id_s)?;
        tx.commit()?;
        check_trail(&record, &audit)?;
        Ok(Some(ConsentHistory { record, audit }))
      })
      .await
  }

  async fn list_consents(&self, filter: &ConsentFilter) -> Result<Vec<ConsentRecord>> {
    let filter = filter.clone();
    self
      .with_conn(move |conn| {
        let records = select_consents(
          conn,
          filter.subject_key.as_ref().map(IdentityKey::as_str),
          filter.requesting_party.as_deref(),
          false,
        )?;
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
      })
      .await
  }

  async fn transition_consent(
    &self,
    id: Uuid,
    change: Transition,
    actor: String,
    now: DateTime<Utc>,
  ) -> Result<ConsentRecord> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = must_load(&tx, id)?;
        let updated = apply_transition(&tx, &record, change, &actor, now)?;
        tx.commit()?;
        Ok(updated)
      })
      .await
  }

  async fn find_authorizing(
    &self,
    subject: &IdentityKey,
    party: &str,
    scope: DataScope,
    at: DateTime<Utc>,
  ) -> Result<Option<ConsentRecord>> {
    let subject = subject.as_str().to_owned();
    let party = party.to_owned();
    self
      .with_conn(move |conn| {
        let records = select_consents(conn, Some(&subject), Some(&party), true)?;
        Ok(records.into_iter().find(|r| r.authorizes(scope, at)))
      })
      .await
  }

  async fn expire_consents(&self, now: DateTime<Utc>) -> Result<Vec<ConsentRecord>> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let due: Vec<String> = {
          let mut stmt = tx.prepare(
            "SELECT r.record_id FROM consent_active c
             JOIN consent_records r ON r.record_id = c.record_id
             WHERE r.expires_at IS NOT NULL AND r.expires_at <= ?1",
          )?;
          stmt
            .query_map(params![encode_dt(now)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut expired = Vec::new();
        for id in due {
          let Some(record) = load_consent(&tx, &id)? else { continue };
          // Pending records past expiry stay pending until the subject acts.
          if record.is_expired(now) {
            expired.push(apply_transition(&tx, &record, Transition::Expire, SYSTEM_ACTOR, now)?);
          }
        }
        tx.commit()?;
        Ok(expired)
      })
      .await
  }
}
