//! Integration tests for `SqliteStore` against an in-memory database.

use std::collections::{BTreeMap, HashMap};

use carebase_core::{
  consent::{ConsentFilter, ConsentStatus, DataScope, Decision, NewConsent, SYSTEM_ACTOR, Transition},
  gate::ConsentGate,
  identity::{IdentityKey, IdentityService, KeyMaterial, verhoeff_check_digit},
  ingest::{IngestPolicy, RawReading, RejectReason, ingest},
  device::NewDevice,
  metric::{EventQuery, MetricType},
  rollup::{Granularity, RollupQuery},
  store::{HealthStore, StoreError as _},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap() }

fn at(h: u32, m: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap() }

fn service() -> IdentityService {
  let mut ring = BTreeMap::new();
  ring.insert("k1".to_owned(), [3u8; 32]);
  ring.insert("k2".to_owned(), [5u8; 32]);
  IdentityService::new(KeyMaterial::new(vec![11u8; 32], ring, "k1").unwrap())
}

fn number(payload: &str) -> String {
  format!("{payload}{}", verhoeff_check_digit(payload).unwrap())
}

async fn subject(s: &SqliteStore) -> IdentityKey {
  service()
    .register(s, &number("23456789012"), now())
    .await
    .unwrap()
    .identity_key
}

fn hr(device: &str, timestamp: DateTime<Utc>, value: f64) -> RawReading {
  reading(device, "heart_rate", timestamp, value)
}

fn reading(device: &str, metric: &str, timestamp: DateTime<Utc>, value: f64) -> RawReading {
  RawReading {
    device_id: device.into(),
    metric_type: metric.into(),
    timestamp,
    value,
  }
}

fn steps() -> EventQuery {
  EventQuery { metric_type: Some(MetricType::Steps), ..Default::default() }
}

async fn rollups(
  s: &SqliteStore,
  key: &IdentityKey,
  metric_type: MetricType,
  granularity: Granularity,
) -> Vec<carebase_core::rollup::RollupPoint> {
  let query = RollupQuery {
    metric_type,
    granularity,
    from: now() - Duration::days(30),
    to: now() + Duration::days(1),
  };
  s.read_rollup(key, &query).await.unwrap()
}

// ─── Identities ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn register_and_get_identity() {
  let s = store().await;
  let key = subject(&s).await;

  let fetched = s.get_identity(&key).await.unwrap().unwrap();
  assert_eq!(fetched.identity_key, key);
  assert_eq!(fetched.registered_at, now());
}

#[tokio::test]
async fn same_number_registers_once() {
  let s = store().await;
  subject(&s).await;

  // Different grouping, same person.
  let raw = number("23456789012");
  let grouped = format!("{} {} {}", &raw[..4], &raw[4..8], &raw[8..]);
  let err = service().register(&s, &grouped, now()).await.unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::DuplicateIdentity(_))));
}

#[tokio::test]
async fn unknown_identity_is_none() {
  let s = store().await;
  let key = IdentityKey::parse(&"ab".repeat(32)).unwrap();
  assert!(s.get_identity(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn backups_rotate_under_a_conditional_swap() {
  let s = store().await;
  let key = subject(&s).await;
  let svc = service();

  let backups = s.list_backups().await.unwrap();
  assert_eq!(backups.len(), 1);
  let (stored_key, old) = backups.into_iter().next().unwrap();
  assert_eq!(stored_key, key);
  assert_eq!(svc.recover(&key, &old).unwrap(), number("23456789012"));

  let mut ring = BTreeMap::new();
  ring.insert("k1".to_owned(), [3u8; 32]);
  ring.insert("k2".to_owned(), [5u8; 32]);
  let rotating = IdentityService::new(KeyMaterial::new(vec![11u8; 32], ring, "k2").unwrap());
  let fresh = rotating.rotate(&key, &old).unwrap();
  assert_eq!(fresh.key_id, "k2");

  assert!(s.replace_backup(key.clone(), old.clone(), fresh.clone()).await.unwrap());
  // The old backup is no longer current, so a second swap loses.
  assert!(!s.replace_backup(key.clone(), old, fresh.clone()).await.unwrap());

  let (_, current) = s.list_backups().await.unwrap().into_iter().next().unwrap();
  assert_eq!(current, fresh);
  assert_eq!(rotating.recover(&key, &current).unwrap(), number("23456789012"));
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_in_batch_is_suppressed_and_rolled_up_once() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![hr("D", at(9, 0), 70.0), hr("D", at(9, 0), 70.0), hr("D", at(10, 0), 75.0)];

  let result = ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();
  assert_eq!((result.accepted, result.duplicate, result.corrected), (2, 1, 0));
  assert!(result.rejected.is_empty());

  let hourly = rollups(&s, &key, MetricType::HeartRate, Granularity::Hourly).await;
  assert_eq!(hourly.len(), 2);
  assert_eq!(hourly[0].period_start, at(9, 0));
  assert_eq!((hourly[0].count, hourly[0].avg), (1, 70.0));

  let daily = rollups(&s, &key, MetricType::HeartRate, Granularity::Daily).await;
  assert_eq!(daily.len(), 1);
  assert_eq!(daily[0].count, 2);
  assert_eq!(daily[0].avg, 72.5);
  assert_eq!((daily[0].min, daily[0].max), (70.0, 75.0));
}

#[tokio::test]
async fn resubmitting_a_batch_is_idempotent() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![
    hr("D", at(8, 15), 64.0),
    hr("D", at(9, 15), 71.0),
    reading("D", "steps", at(9, 0), 420.0),
  ];

  ingest(&s, &key, batch.clone(), &IngestPolicy::default(), now()).await.unwrap();
  let before = rollups(&s, &key, MetricType::HeartRate, Granularity::Daily).await;

  let again = ingest(&s, &key, batch, &IngestPolicy::default(), now() + Duration::minutes(5))
    .await
    .unwrap();
  assert_eq!((again.accepted, again.duplicate, again.corrected), (0, 3, 0));
  assert_eq!(rollups(&s, &key, MetricType::HeartRate, Granularity::Daily).await, before);
}

#[tokio::test]
async fn later_correction_replaces_value_in_rollups() {
  let s = store().await;
  let key = subject(&s).await;
  let policy = IngestPolicy::default();

  ingest(&s, &key, vec![reading("D", "steps", at(9, 0), 10.0)], &policy, now()).await.unwrap();
  let result = ingest(
    &s,
    &key,
    vec![reading("D", "steps", at(9, 0), 12.0)],
    &policy,
    now() + Duration::minutes(1),
  )
  .await
  .unwrap();
  assert_eq!(result.corrected, 1);

  let daily = rollups(&s, &key, MetricType::Steps, Granularity::Daily).await;
  assert_eq!((daily[0].count, daily[0].sum), (1, 12.0));

  let events = s.list_events(&key, &steps()).await.unwrap();
  assert_eq!(events.len(), 1);
  let event = &events[0];
  assert_eq!(event.value, 12.0);
  assert_eq!(event.ingested_at, now() + Duration::minutes(1));
}

#[tokio::test]
async fn earlier_ingestion_is_rejected_as_stale() {
  let s = store().await;
  let key = subject(&s).await;
  let policy = IngestPolicy::default();

  ingest(&s, &key, vec![reading("D", "steps", at(9, 0), 10.0)], &policy, now()).await.unwrap();
  let result = ingest(
    &s,
    &key,
    vec![reading("D", "steps", at(9, 0), 99.0)],
    &policy,
    now() - Duration::minutes(1),
  )
  .await
  .unwrap();
  assert_eq!(result.rejected.len(), 1);
  assert_eq!(result.rejected[0].reason, RejectReason::Stale);

  let daily = rollups(&s, &key, MetricType::Steps, Granularity::Daily).await;
  assert_eq!(daily[0].sum, 10.0);
}

#[tokio::test]
async fn later_position_in_a_batch_wins() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![hr("D", at(9, 0), 70.0), hr("D", at(9, 0), 72.0)];

  let result = ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();
  assert_eq!((result.accepted, result.corrected), (1, 1));

  let daily = rollups(&s, &key, MetricType::HeartRate, Granularity::Daily).await;
  assert_eq!((daily[0].count, daily[0].sum), (1, 72.0));
}

#[tokio::test]
async fn different_devices_are_distinct_events() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![
    reading("phone", "steps", at(9, 0), 100.0),
    reading("watch", "steps", at(9, 0), 140.0),
  ];

  let result = ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();
  assert_eq!(result.accepted, 2);
  assert_eq!(rollups(&s, &key, MetricType::Steps, Granularity::Hourly).await[0].sum, 240.0);
}

#[tokio::test]
async fn invalid_readings_are_itemised_without_blocking_others() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![
    hr("D", at(9, 0), 70.0),
    hr("D", now() + Duration::hours(2), 70.0),
    reading("D", "mood", at(9, 0), 3.0),
    hr("D", at(9, 30), 900.0),
    hr("D", at(10, 0), 75.0),
  ];

  let result = ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();
  assert_eq!(result.accepted, 2);
  let reasons: Vec<_> = result.rejected.iter().map(|r| (r.index, r.reason)).collect();
  assert_eq!(reasons, vec![
    (1, RejectReason::OutOfRange),
    (2, RejectReason::UnknownMetricType),
    (3, RejectReason::InvalidValue),
  ]);
}

#[tokio::test]
async fn ingest_for_unregistered_subject_fails() {
  let s = store().await;
  let key = IdentityKey::parse(&"ab".repeat(32)).unwrap();
  let err = ingest(&s, &key, vec![hr("D", at(9, 0), 70.0)], &IngestPolicy::default(), now())
    .await
    .unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::IdentityNotFound(_))));
}

#[tokio::test]
async fn small_chunks_give_the_same_result() {
  let s = store().await;
  let key = subject(&s).await;
  let policy = IngestPolicy { chunk_size: 2, ..IngestPolicy::default() };
  let batch: Vec<_> = (0..7).map(|i| hr("D", at(9, i * 5), 60.0 + f64::from(i))).collect();

  let result = ingest(&s, &key, batch, &policy, now()).await.unwrap();
  assert_eq!(result.accepted, 7);
  assert_eq!(rollups(&s, &key, MetricType::HeartRate, Granularity::Hourly).await[0].count, 7);
}

// ─── Rollups ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn lowering_the_maximum_rescans_the_period() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![hr("D", at(9, 0), 60.0), hr("D", at(9, 10), 80.0), hr("D", at(9, 20), 100.0)];
  ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();

  ingest(
    &s,
    &key,
    vec![hr("D", at(9, 20), 70.0)],
    &IngestPolicy::default(),
    now() + Duration::minutes(1),
  )
  .await
  .unwrap();

  let hourly = rollups(&s, &key, MetricType::HeartRate, Granularity::Hourly).await;
  assert_eq!((hourly[0].count, hourly[0].sum), (3, 210.0));
  assert_eq!((hourly[0].min, hourly[0].max), (60.0, 80.0));
}

#[tokio::test]
async fn correcting_a_dominant_value_keeps_the_sum_exact() {
  let s = store().await;
  let key = subject(&s).await;
  let policy = IngestPolicy::default();
  let batch = vec![
    reading("phone", "steps", at(9, 0), 1e16),
    reading("watch", "steps", at(9, 30), 1.0),
  ];
  ingest(&s, &key, batch, &policy, now()).await.unwrap();

  let fix = vec![reading("phone", "steps", at(9, 0), 5.0)];
  let result = ingest(&s, &key, fix, &policy, now() + Duration::minutes(1)).await.unwrap();
  assert_eq!(result.corrected, 1);

  let events = s.list_events(&key, &steps()).await.unwrap();
  let raw: f64 = events.iter().map(|e| e.value).sum();
  assert_eq!(raw, 6.0);
  for granularity in [Granularity::Hourly, Granularity::Daily] {
    let points = rollups(&s, &key, MetricType::Steps, granularity).await;
    assert_eq!(points.iter().map(|p| p.sum).sum::<f64>(), raw);
  }
}

#[tokio::test]
async fn rollups_equal_the_fold_of_raw_events_and_rebuild_is_identical() {
  let s = store().await;
  let key = subject(&s).await;
  let policy = IngestPolicy::default();
  let mut batch = Vec::new();
  for day in 0..3 {
    for hour in [1, 7, 13, 22] {
      let ts = Utc.with_ymd_and_hms(2026, 3, 7 + day, hour, 30, 0).unwrap();
      batch.push(reading("ring", "steps", ts, f64::from(day * 100 + hour)));
      batch.push(hr("ring", ts, 55.0 + f64::from(hour)));
    }
  }
  ingest(&s, &key, batch, &policy, now()).await.unwrap();
  // A round of corrections.
  let fixes = vec![
    reading("ring", "steps", Utc.with_ymd_and_hms(2026, 3, 8, 7, 30, 0).unwrap(), 5.0),
    hr("ring", Utc.with_ymd_and_hms(2026, 3, 9, 22, 30, 0).unwrap(), 50.0),
  ];
  ingest(&s, &key, fixes, &policy, now() + Duration::minutes(1)).await.unwrap();

  let events = s.list_events(&key, &steps()).await.unwrap();
  let mut per_day: HashMap<DateTime<Utc>, f64> = HashMap::new();
  for e in &events {
    *per_day.entry(Granularity::Daily.truncate(e.timestamp)).or_default() += e.value;
  }
  let daily = rollups(&s, &key, MetricType::Steps, Granularity::Daily).await;
  assert_eq!(daily.len(), 3);
  for point in &daily {
    assert_eq!(per_day[&point.period_start], point.sum);
  }

  let hr_before = rollups(&s, &key, MetricType::HeartRate, Granularity::Hourly).await;
  let replayed = s.rebuild_rollups(Some(key.clone())).await.unwrap();
  assert_eq!(replayed, 24);
  assert_eq!(rollups(&s, &key, MetricType::Steps, Granularity::Daily).await, daily);
  assert_eq!(rollups(&s, &key, MetricType::HeartRate, Granularity::Hourly).await, hr_before);
}

#[tokio::test]
async fn comprehensive_read_filters_by_scope_and_window() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![
    hr("D", at(9, 0), 70.0),
    reading("D", "steps", at(9, 0), 500.0),
    reading("D", "sleep_duration", at(6, 0), 7.5),
    // Two days ago: in the daily window only.
    hr("D", now() - Duration::days(2), 66.0),
  ];
  ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();

  let all = s.read_comprehensive(&key, 7, DataScope::All, now()).await.unwrap();
  assert_eq!(all.daily.len(), 4);
  assert_eq!(all.hourly.len(), 3);
  assert_eq!(all.as_of, now());

  let vitals = s.read_comprehensive(&key, 7, DataScope::Vitals, now()).await.unwrap();
  assert!(vitals.daily.iter().all(|p| p.metric_type == MetricType::HeartRate));
  assert_eq!(vitals.daily.len(), 2);
  assert_eq!(vitals.hourly.len(), 1);

  let today = s.read_comprehensive(&key, 1, DataScope::Vitals, now()).await.unwrap();
  assert_eq!(today.daily.len(), 1);

  let err = s.read_comprehensive(&key, 0, DataScope::All, now()).await.unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::Validation(_))));
}

#[tokio::test]
async fn recent_events_come_newest_first_within_the_window() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![
    reading("D", "steps", at(8, 0), 1.0),
    hr("D", at(9, 0), 60.0),
    reading("D", "steps", at(10, 0), 2.0),
    reading("D", "steps", at(11, 0), 3.0),
  ];
  ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();

  let all = s.list_events(&key, &EventQuery::default()).await.unwrap();
  let times: Vec<_> = all.iter().map(|e| e.timestamp).collect();
  assert_eq!(times, vec![at(11, 0), at(10, 0), at(9, 0), at(8, 0)]);

  let windowed = EventQuery { since: Some(at(9, 0)), ..steps() };
  let values: Vec<f64> = s.list_events(&key, &windowed).await.unwrap().iter().map(|e| e.value).collect();
  assert_eq!(values, vec![3.0, 2.0]);

  let capped = EventQuery { limit: Some(1), ..Default::default() };
  let newest = s.list_events(&key, &capped).await.unwrap();
  assert_eq!((newest.len(), newest[0].timestamp), (1, at(11, 0)));
}

fn watch(id: &str) -> NewDevice {
  NewDevice { device_id: id.into(), name: "Watch".into(), kind: "smart_watch".into() }
}

#[tokio::test]
async fn devices_register_once_per_subject() {
  let s = store().await;
  let key = subject(&s).await;

  let device = s.register_device(&key, watch(" watch-1 "), now()).await.unwrap();
  assert_eq!((device.device_id.as_str(), device.last_sync_at), ("watch-1", None));

  let err = s.register_device(&key, watch("watch-1"), now()).await.unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::DuplicateDevice(_))));

  let ghost = IdentityKey::parse(&"ab".repeat(32)).unwrap();
  let err = s.register_device(&ghost, watch("watch-1"), now()).await.unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::IdentityNotFound(_))));

  assert_eq!(s.list_devices(&key).await.unwrap(), vec![device]);
  assert!(s.list_devices(&ghost).await.unwrap().is_empty());
}

#[tokio::test]
async fn accepted_batches_stamp_registered_devices() {
  let s = store().await;
  let key = subject(&s).await;
  let policy = IngestPolicy::default();
  s.register_device(&key, watch("watch-1"), at(8, 0)).await.unwrap();

  let batch = vec![
    hr("watch-1", at(9, 0), 60.0),
    hr("watch-1", at(9, 5), 62.0),
    hr("phone", at(9, 0), 70.0),
  ];
  ingest(&s, &key, batch.clone(), &policy, now()).await.unwrap();

  let later = now() + Duration::minutes(5);
  ingest(&s, &key, batch, &policy, later).await.unwrap();

  let devices = s.list_devices(&key).await.unwrap();
  assert_eq!(devices.len(), 1);
  assert_eq!(devices[0].readings_synced, 2);
  assert_eq!(devices[0].last_sync_at, Some(later));
}

#[tokio::test]
async fn erasure_cascades_to_rollups() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![hr("D", at(9, 0), 70.0), hr("D", at(10, 0), 75.0)];
  ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();

  assert_eq!(s.erase_events(&key).await.unwrap(), 2);
  assert!(s.list_events(&key, &EventQuery::default()).await.unwrap().is_empty());
  assert!(rollups(&s, &key, MetricType::HeartRate, Granularity::Daily).await.is_empty());
  assert!(rollups(&s, &key, MetricType::HeartRate, Granularity::Hourly).await.is_empty());
}

#[tokio::test]
async fn pruning_drops_old_periods_only() {
  let s = store().await;
  let key = subject(&s).await;
  let batch = vec![hr("D", now() - Duration::days(5), 70.0), hr("D", at(9, 0), 75.0)];
  ingest(&s, &key, batch, &IngestPolicy::default(), now()).await.unwrap();

  let removed = s.prune_rollups(now() - Duration::days(1)).await.unwrap();
  assert_eq!(removed, 2);
  let daily = rollups(&s, &key, MetricType::HeartRate, Granularity::Daily).await;
  assert_eq!(daily.len(), 1);
  assert_eq!(daily[0].period_start, at(0, 0));
  // Events are untouched.
  assert_eq!(s.list_events(&key, &EventQuery::default()).await.unwrap().len(), 2);
}

// ─── Consents ────────────────────────────────────────────────────────────────

fn request(key: &IdentityKey, scope: DataScope) -> NewConsent {
  NewConsent {
    subject_key:      key.clone(),
    requesting_party: "dr-rao".into(),
    scope,
    expires_at:       Some(now() + Duration::days(90)),
    description:      Some("cardiology follow-up".into()),
  }
}

#[tokio::test]
async fn consent_lifecycle_with_audit_trail() {
  let s = store().await;
  let key = subject(&s).await;

  let record = s
    .create_consent(request(&key, DataScope::Vitals), "dr-rao".into(), now())
    .await
    .unwrap();
  assert_eq!(record.status, ConsentStatus::Pending);
  assert!(record.decided_at.is_none());

  let approved = s
    .transition_consent(
      record.record_id,
      Transition::Decide(Decision::Approve),
      key.as_str().to_owned(),
      now() + Duration::minutes(1),
    )
    .await
    .unwrap();
  assert_eq!(approved.status, ConsentStatus::Approved);
  assert_eq!(approved.decided_at, Some(now() + Duration::minutes(1)));

  let found = s
    .find_authorizing(&key, "dr-rao", DataScope::Vitals, now() + Duration::hours(1))
    .await
    .unwrap();
  assert_eq!(found.map(|r| r.record_id), Some(record.record_id));
  assert!(
    s.find_authorizing(&key, "dr-rao", DataScope::Sleep, now())
      .await
      .unwrap()
      .is_none()
  );

  let revoked = s
    .transition_consent(record.record_id, Transition::Revoke, key.as_str().to_owned(), now() + Duration::hours(2))
    .await
    .unwrap();
  assert_eq!(revoked.status, ConsentStatus::Revoked);
  // Decision time is the first transition out of PENDING.
  assert_eq!(revoked.decided_at, Some(now() + Duration::minutes(1)));

  let history = s.get_consent(record.record_id).await.unwrap().unwrap();
  let trail: Vec<_> = history.audit.iter().map(|e| (e.from, e.to)).collect();
  assert_eq!(trail, vec![
    (None, ConsentStatus::Pending),
    (Some(ConsentStatus::Pending), ConsentStatus::Approved),
    (Some(ConsentStatus::Approved), ConsentStatus::Revoked),
  ]);
  assert_eq!(history.audit[0].actor, "dr-rao");
  assert_eq!(history.audit[2].actor, key.as_str());
}

#[tokio::test]
async fn only_one_active_record_per_triple() {
  let s = store().await;
  let key = subject(&s).await;
  let first = s
    .create_consent(request(&key, DataScope::Vitals), "dr-rao".into(), now())
    .await
    .unwrap();

  let err = s
    .create_consent(request(&key, DataScope::Vitals), "dr-rao".into(), now())
    .await
    .unwrap_err();
  assert!(matches!(
    err.domain(),
    Some(carebase_core::Error::DuplicatePending(id)) if *id == first.record_id
  ));

  // A different scope is a different triple.
  s.create_consent(request(&key, DataScope::Sleep), "dr-rao".into(), now())
    .await
    .unwrap();

  // After a denial a fresh record may be filed; history keeps both.
  s.transition_consent(first.record_id, Transition::Decide(Decision::Deny), key.as_str().to_owned(), now())
    .await
    .unwrap();
  let second = s
    .create_consent(request(&key, DataScope::Vitals), "dr-rao".into(), now())
    .await
    .unwrap();
  assert_ne!(second.record_id, first.record_id);

  let filter = ConsentFilter { subject_key: Some(key.clone()), ..Default::default() };
  assert_eq!(s.list_consents(&filter).await.unwrap().len(), 3);
  let denied = ConsentFilter { status: Some(ConsentStatus::Denied), ..filter };
  assert_eq!(s.list_consents(&denied).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_transitions_write_nothing() {
  let s = store().await;
  let key = subject(&s).await;
  let record = s
    .create_consent(request(&key, DataScope::All), "dr-rao".into(), now())
    .await
    .unwrap();

  let err = s
    .transition_consent(record.record_id, Transition::Decide(Decision::Approve), "dr-rao".into(), now())
    .await
    .unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::Forbidden(_))));

  let err = s
    .transition_consent(record.record_id, Transition::Revoke, key.as_str().to_owned(), now())
    .await
    .unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::InvalidTransition { .. })));

  let err = s
    .transition_consent(Uuid::new_v4(), Transition::Revoke, key.as_str().to_owned(), now())
    .await
    .unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::ConsentNotFound(_))));

  let history = s.get_consent(record.record_id).await.unwrap().unwrap();
  assert_eq!(history.record.status, ConsentStatus::Pending);
  assert_eq!(history.audit.len(), 1);
}

#[tokio::test]
async fn expiry_is_applied_by_the_sweep_and_on_request() {
  let s = store().await;
  let key = subject(&s).await;
  let mut input = request(&key, DataScope::Activity);
  input.expires_at = Some(now() + Duration::days(1));
  let record = s.create_consent(input.clone(), "dr-rao".into(), now()).await.unwrap();
  s.transition_consent(record.record_id, Transition::Decide(Decision::Approve), key.as_str().to_owned(), now())
    .await
    .unwrap();

  let later = now() + Duration::days(2);
  assert!(
    s.find_authorizing(&key, "dr-rao", DataScope::Activity, later)
      .await
      .unwrap()
      .is_none()
  );

  // Requesting again past expiry retires the old grant first.
  input.expires_at = Some(later + Duration::days(30));
  let renewed = s.create_consent(input, "dr-rao".into(), later).await.unwrap();
  let old = s.get_consent(record.record_id).await.unwrap().unwrap();
  assert_eq!(old.record.status, ConsentStatus::Revoked);
  assert_eq!(old.audit.last().unwrap().actor, SYSTEM_ACTOR);
  assert_eq!(renewed.status, ConsentStatus::Pending);

  // The periodic sweep finds nothing further to do until the next expiry.
  assert!(s.expire_consents(later).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_revokes_only_approved_records() {
  let s = store().await;
  let key = subject(&s).await;
  let mut approved = request(&key, DataScope::Vitals);
  approved.expires_at = Some(now() + Duration::hours(1));
  let mut pending = request(&key, DataScope::Sleep);
  pending.expires_at = Some(now() + Duration::hours(1));

  let a = s.create_consent(approved, "dr-rao".into(), now()).await.unwrap();
  let p = s.create_consent(pending, "dr-rao".into(), now()).await.unwrap();
  s.transition_consent(a.record_id, Transition::Decide(Decision::Approve), key.as_str().to_owned(), now())
    .await
    .unwrap();

  let gate = ConsentGate::new(std::time::Duration::from_secs(5));
  let swept = gate.sweep_expired(&s, now() + Duration::hours(2)).await.unwrap();
  assert_eq!(swept.len(), 1);
  assert_eq!(swept[0].record_id, a.record_id);
  assert_eq!(swept[0].status, ConsentStatus::Revoked);

  let still = s.get_consent(p.record_id).await.unwrap().unwrap();
  assert_eq!(still.record.status, ConsentStatus::Pending);
}

#[tokio::test]
async fn gate_sees_revocation_on_the_next_check() {
  let s = store().await;
  let key = subject(&s).await;
  let gate = ConsentGate::new(std::time::Duration::from_secs(60));

  assert!(!gate.is_authorized(&s, &key, "dr-rao", DataScope::Vitals, now()).await.unwrap());

  let record = gate.request(&s, request(&key, DataScope::All), now()).await.unwrap();
  gate
    .decide(&s, record.record_id, Decision::Approve, key.as_str(), now())
    .await
    .unwrap();
  assert!(gate.is_authorized(&s, &key, "dr-rao", DataScope::Vitals, now()).await.unwrap());
  // Cached answer.
  assert!(gate.is_authorized(&s, &key, "dr-rao", DataScope::Vitals, now()).await.unwrap());

  gate.revoke(&s, record.record_id, key.as_str(), now()).await.unwrap();
  assert!(!gate.is_authorized(&s, &key, "dr-rao", DataScope::Vitals, now()).await.unwrap());

  let err = gate
    .authorize(&s, &key, "dr-rao", DataScope::Vitals, now())
    .await
    .unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::NotAuthorized { .. })));
}

#[tokio::test]
async fn gate_cache_stays_within_its_capacity() {
  let s = store().await;
  let key = subject(&s).await;
  let gate = ConsentGate::with_capacity(std::time::Duration::from_secs(60), 4);

  for n in 0..50 {
    let party = format!("dr-{n}");
    assert!(!gate.is_authorized(&s, &key, &party, DataScope::Vitals, now()).await.unwrap());
  }
  assert_eq!(gate.cached_entries(), 4);

  // An answer cached for a pair that is later decided on and pushed out of
  // the fence list is still not served.
  let record = gate.request(&s, request(&key, DataScope::All), now()).await.unwrap();
  assert!(!gate.is_authorized(&s, &key, "dr-rao", DataScope::Vitals, now()).await.unwrap());
  gate
    .decide(&s, record.record_id, Decision::Approve, key.as_str(), now())
    .await
    .unwrap();
  for n in 0..10 {
    gate.invalidate(&key, &format!("dr-{n}"));
  }
  assert!(gate.is_authorized(&s, &key, "dr-rao", DataScope::Vitals, now()).await.unwrap());
  assert!(gate.cached_entries() <= 4);
}

#[tokio::test]
async fn request_for_unregistered_subject_is_not_found() {
  let s = store().await;
  let gate = ConsentGate::new(std::time::Duration::ZERO);
  let ghost = IdentityKey::parse(&"ab".repeat(32)).unwrap();
  let err = gate.request(&s, request(&ghost, DataScope::All), now()).await.unwrap_err();
  assert!(matches!(err.domain(), Some(carebase_core::Error::IdentityNotFound(_))));
}
