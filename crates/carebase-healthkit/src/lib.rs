//! Apple Health importer for Carebase.
//!
//! Converts the JSON export the mobile app uploads, and Apple's native
//! `export.xml`, into [`RawReading`] batches for the normal ingestion path.
//! Pure synchronous; no HTTP or database dependencies.
//!
//! # Quick start
//!
//! ```no_run
//! use carebase_healthkit::parse_json;
//!
//! let export = r#"{"deviceId":"watch-1","metrics":[]}"#;
//! let parsed = parse_json(export.as_bytes()).unwrap();
//! println!("{} readings, {} skipped types", parsed.readings.len(), parsed.report.skipped.len());
//! ```

pub mod error;
mod json;
mod mapping;
mod xml;

use std::collections::BTreeMap;

use carebase_core::ingest::RawReading;
use chrono::{DateTime, Utc};
pub use error::{Error, Result};
use serde::Serialize;

use crate::mapping::{Kind, SampleValue};

// ─── Public types ────────────────────────────────────────────────────────────

/// The readings recovered from one export.
#[derive(Debug, Clone, Default)]
pub struct ParsedExport {
  /// Export-level device identifier, when the format carries one.
  pub device_id:   Option<String>,
  pub exported_at: Option<DateTime<Utc>>,
  pub readings:    Vec<RawReading>,
  pub report:      ImportReport,
}

/// What an import could not use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
  /// Samples of types with no metric mapping, by type name.
  pub skipped:  BTreeMap<String, usize>,
  /// Samples of known types with no usable value, unit or date.
  pub unusable: usize,
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// Parse the app's JSON export (`{"deviceId", "metrics": [...]}`).
///
/// Every reading is attributed to the export's `deviceId`.
pub fn parse_json(input: &[u8]) -> Result<ParsedExport> { json::parse(input) }

/// Parse Apple's native `export.xml`.
///
/// Each `<Record>` is attributed to its `sourceName`.
pub fn parse_xml(input: &[u8]) -> Result<ParsedExport> { xml::parse(input) }

// ─── Shared conversion ───────────────────────────────────────────────────────

/// One sample in either format, borrowed from the input.
pub(crate) struct Sample<'a> {
  pub kind:      &'a str,
  pub value:     Option<SampleValue<'a>>,
  pub unit:      Option<&'a str>,
  pub start:     Option<&'a str>,
  pub end:       Option<&'a str>,
  pub device_id: Option<&'a str>,
}

impl ParsedExport {
  /// Convert and record one sample, counting it if it cannot be used.
  pub(crate) fn push(&mut self, sample: Sample<'_>) {
    let Some(kind) = mapping::classify(sample.kind) else {
      *self.report.skipped.entry(sample.kind.to_owned()).or_default() += 1;
      return;
    };
    match convert(kind, &sample) {
      Some(reading) => self.readings.push(reading),
      None => {
        tracing::debug!(kind = sample.kind, "unusable sample");
        self.report.unusable += 1;
      }
    }
  }

  pub(crate) fn finish(self) -> Self {
    tracing::info!(
      readings = self.readings.len(),
      skipped_types = self.report.skipped.len(),
      unusable = self.report.unusable,
      "parsed Apple Health export"
    );
    self
  }
}

fn convert(kind: Kind, sample: &Sample<'_>) -> Option<RawReading> {
  let (metric, value) = match (kind, sample.value?) {
    (Kind::Sleep, value) => mapping::sleep_reading(value, sample.unit)?,
    (Kind::Quantity(metric), SampleValue::Number(n)) => {
      (metric, mapping::normalize(metric, n, sample.unit)?)
    }
    (Kind::Quantity(metric), SampleValue::Text(t)) => {
      (metric, mapping::normalize(metric, t.trim().parse().ok()?, sample.unit)?)
    }
  };
  // The event time is the end of the sample interval.
  let timestamp = mapping::parse_date(sample.end.or(sample.start)?).ok()?;
  let device_id = sample.device_id?.trim();
  if device_id.is_empty() {
    return None;
  }

  Some(RawReading {
    device_id: device_id.to_owned(),
    metric_type: metric.as_str().to_owned(),
    timestamp,
    value,
  })
}
