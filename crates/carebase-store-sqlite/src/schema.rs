//! SQL schema for the Carebase SQLite store.
//!
//! Executed once at connection startup. Timestamps are RFC 3339 UTC strings
//! with a fixed microsecond width, so text comparison orders them correctly.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

-- Identity keys are append-only. The backup lives in its own table and is
-- never joined on lookup paths.
CREATE TABLE IF NOT EXISTS identities (
    identity_key  TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_backups (
    identity_key TEXT PRIMARY KEY REFERENCES identities(identity_key),
    key_id       TEXT NOT NULL,
    sealed       TEXT NOT NULL,   -- base64(nonce || ciphertext || tag)
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metric_events (
    subject_key TEXT NOT NULL REFERENCES identities(identity_key),
    device_id   TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    timestamp   TEXT NOT NULL,   -- event time
    value       REAL NOT NULL,
    ingested_at TEXT NOT NULL,
    UNIQUE (subject_key, device_id, metric_type, timestamp)
);

CREATE INDEX IF NOT EXISTS metric_events_period_idx
    ON metric_events(subject_key, metric_type, timestamp);

-- Registered devices. Readings do not reference this table; ingestion
-- accepts any device id.
CREATE TABLE IF NOT EXISTS devices (
    subject_key     TEXT    NOT NULL REFERENCES identities(identity_key),
    device_id       TEXT    NOT NULL,
    name            TEXT    NOT NULL,
    kind            TEXT    NOT NULL,
    registered_at   TEXT    NOT NULL,
    last_sync_at    TEXT,
    readings_synced INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (subject_key, device_id)
);

CREATE TABLE IF NOT EXISTS hourly_rollups (
    subject_key  TEXT    NOT NULL,
    metric_type  TEXT    NOT NULL,
    period_start TEXT    NOT NULL,
    count        INTEGER NOT NULL,
    sum          REAL    NOT NULL,
    min          REAL    NOT NULL,
    max          REAL    NOT NULL,
    PRIMARY KEY (subject_key, metric_type, period_start)
);

CREATE TABLE IF NOT EXISTS daily_rollups (
    subject_key  TEXT    NOT NULL,
    metric_type  TEXT    NOT NULL,
    period_start TEXT    NOT NULL,
    count        INTEGER NOT NULL,
    sum          REAL    NOT NULL,
    min          REAL    NOT NULL,
    max          REAL    NOT NULL,
    PRIMARY KEY (subject_key, metric_type, period_start)
);

-- Consent records are strictly append-only; status lives in the audit trail.
CREATE TABLE IF NOT EXISTS consent_records (
    record_id        TEXT PRIMARY KEY,
    subject_key      TEXT NOT NULL REFERENCES identities(identity_key),
    requesting_party TEXT NOT NULL,
    scope            TEXT NOT NULL,   -- 'activity' | 'vitals' | 'sleep' | 'all'
    requested_at     TEXT NOT NULL,
    expires_at       TEXT,
    description      TEXT
);

CREATE TABLE IF NOT EXISTS consent_audit (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id   TEXT NOT NULL REFERENCES consent_records(record_id),
    actor       TEXT NOT NULL,
    from_status TEXT,                 -- NULL for the filing entry
    to_status   TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

-- One row per triple holding a PENDING or APPROVED record. The primary key
-- is the at-most-one-active constraint.
CREATE TABLE IF NOT EXISTS consent_active (
    subject_key      TEXT NOT NULL,
    requesting_party TEXT NOT NULL,
    scope            TEXT NOT NULL,
    record_id        TEXT NOT NULL UNIQUE REFERENCES consent_records(record_id),
    PRIMARY KEY (subject_key, requesting_party, scope)
);

CREATE INDEX IF NOT EXISTS consent_records_subject_idx ON consent_records(subject_key);
CREATE INDEX IF NOT EXISTS consent_records_party_idx   ON consent_records(requesting_party);
CREATE INDEX IF NOT EXISTS consent_audit_record_idx    ON consent_audit(record_id, seq);

PRAGMA user_version = 2;
";
