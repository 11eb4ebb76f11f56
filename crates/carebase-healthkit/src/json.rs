//! The JSON export shape uploaded by the mobile app.

use serde::Deserialize;
use serde_json::Value;

use crate::{Error, ParsedExport, Result, Sample, mapping};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Export {
  device_id:        Option<String>,
  export_timestamp: Option<String>,
  #[serde(default)]
  metrics:          Vec<Metric>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metric {
  #[serde(rename = "type")]
  kind:       String,
  #[serde(default)]
  value:      Value,
  unit:       Option<String>,
  start_date: Option<String>,
  end_date:   Option<String>,
}

pub(crate) fn parse(input: &[u8]) -> Result<ParsedExport> {
  let export: Export = serde_json::from_slice(input)?;
  let device_id = export
    .device_id
    .filter(|d| !d.trim().is_empty())
    .ok_or(Error::MissingDevice)?;

  let mut parsed = ParsedExport {
    device_id: Some(device_id.clone()),
    exported_at: export
      .export_timestamp
      .as_deref()
      .and_then(|t| mapping::parse_date(t).ok()),
    ..Default::default()
  };

  for metric in &export.metrics {
    let value = match &metric.value {
      Value::Number(n) => n.as_f64().map(mapping::SampleValue::Number),
      Value::String(s) => Some(mapping::SampleValue::Text(s.as_str())),
      _ => None,
    };
    parsed.push(Sample {
      kind: &metric.kind,
      value,
      unit: metric.unit.as_deref(),
      start: metric.start_date.as_deref(),
      end: metric.end_date.as_deref(),
      device_id: Some(device_id.as_str()),
    });
  }

  Ok(parsed.finish())
}

#[cfg(test)]
mod tests {
  use carebase_core::ingest::RawReading;
  use chrono::{TimeZone, Utc};

  use crate::{Error, parse_json};

  const EXPORT: &str = r#"{
    "deviceId": "5233E7EE-EF98-4AEB-9E01-1A81FAB21C43",
    "userId": "CB99F596-9067-4786-AD08-639BBF0A96C0",
    "exportTimestamp": "2025-11-13T06:49:53Z",
    "dataRange": {"startDate": "2025-11-12T00:00:00Z", "endDate": "2025-11-13T00:00:00Z"},
    "metrics": [
      {"type": "Heart Rate", "value": 72, "unit": "count/min",
       "startDate": "2025-11-12T09:00:00Z", "endDate": "2025-11-12T09:00:05Z",
       "sourceApp": "Watch", "metadata": {"device": "Apple Watch"}},
      {"type": "HKQuantityTypeIdentifierStepCount", "value": 1200, "unit": "count",
       "startDate": "2025-11-12T09:00:00Z", "endDate": "2025-11-12T10:00:00Z"},
      {"type": "Walking/Running Distance", "value": 1.2, "unit": "km",
       "endDate": "2025-11-12T10:00:00Z"},
      {"type": "Sleep Analysis", "value": "HKCategoryValueSleepAnalysisAsleepDeep",
       "startDate": "2025-11-12T01:00:00Z", "endDate": "2025-11-12T02:00:00Z"},
      {"type": "Workouts", "value": 30, "unit": "min", "endDate": "2025-11-12T18:00:00Z"},
      {"type": "Workouts", "value": 45, "unit": "min", "endDate": "2025-11-12T19:00:00Z"},
      {"type": "Heart Rate", "value": null, "endDate": "2025-11-12T11:00:00Z"},
      {"type": "Heart Rate", "value": 70}
    ]
  }"#;

  #[test]
  fn converts_known_metrics() {
    let parsed = parse_json(EXPORT.as_bytes()).unwrap();
    assert_eq!(parsed.device_id.as_deref(), Some("5233E7EE-EF98-4AEB-9E01-1A81FAB21C43"));
    assert_eq!(parsed.exported_at, Some(Utc.with_ymd_and_hms(2025, 11, 13, 6, 49, 53).unwrap()));

    let device = "5233E7EE-EF98-4AEB-9E01-1A81FAB21C43".to_owned();
    assert_eq!(parsed.readings, vec![
      RawReading {
        device_id:   device.clone(),
        metric_type: "heart_rate".into(),
        timestamp:   Utc.with_ymd_and_hms(2025, 11, 12, 9, 0, 5).unwrap(),
        value:       72.0,
      },
      RawReading {
        device_id:   device.clone(),
        metric_type: "steps".into(),
        timestamp:   Utc.with_ymd_and_hms(2025, 11, 12, 10, 0, 0).unwrap(),
        value:       1200.0,
      },
      RawReading {
        device_id:   device.clone(),
        metric_type: "distance".into(),
        timestamp:   Utc.with_ymd_and_hms(2025, 11, 12, 10, 0, 0).unwrap(),
        value:       1200.0,
      },
      RawReading {
        device_id:   device,
        metric_type: "sleep_stage".into(),
        timestamp:   Utc.with_ymd_and_hms(2025, 11, 12, 2, 0, 0).unwrap(),
        value:       4.0,
      },
    ]);
  }

  #[test]
  fn reports_what_it_could_not_use() {
    let parsed = parse_json(EXPORT.as_bytes()).unwrap();
    assert_eq!(parsed.report.skipped.get("Workouts"), Some(&2));
    // A null value and a missing date.
    assert_eq!(parsed.report.unusable, 2);
  }

  #[test]
  fn device_is_required() {
    let err = parse_json(br#"{"metrics": []}"#).unwrap_err();
    assert!(matches!(err, Error::MissingDevice));
    assert!(matches!(parse_json(b"not json").unwrap_err(), Error::Json(_)));
  }
}
