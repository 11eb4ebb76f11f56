//! Apple's native `export.xml`.
//!
//! Only `<ExportDate>` and `<Record>` elements are read; everything else
//! (`<Me>`, `<Workout>`, `<ActivitySummary>`, metadata children) is passed
//! over.

use quick_xml::events::{BytesStart, Event};

use crate::{Error, ParsedExport, Result, Sample, mapping};

#[derive(Debug, Default)]
struct Record {
  kind:   String,
  source: Option<String>,
  unit:   Option<String>,
  start:  Option<String>,
  end:    Option<String>,
  value:  Option<String>,
}

pub(crate) fn parse(input: &[u8]) -> Result<ParsedExport> {
  let mut reader = quick_xml::Reader::from_reader(input);
  reader.config_mut().trim_text(true);

  let mut parsed = ParsedExport::default();
  let mut buf = Vec::new();

  loop {
    match reader.read_event_into(&mut buf) {
      Ok(Event::Start(ref e) | Event::Empty(ref e)) => match e.name().as_ref() {
        b"ExportDate" => {
          parsed.exported_at = attribute(e, b"value")?
            .and_then(|v| mapping::parse_date(&v).ok());
        }
        b"Record" => {
          let record = read_record(e)?;
          parsed.push(Sample {
            kind:      &record.kind,
            value:     record.value.as_deref().map(mapping::SampleValue::Text),
            unit:      record.unit.as_deref(),
            start:     record.start.as_deref(),
            end:       record.end.as_deref(),
            device_id: record.source.as_deref(),
          });
        }
        _ => {}
      },
      Ok(Event::Eof) => break,
      Err(e) => return Err(Error::Xml(e.to_string())),
      _ => {}
    }
    buf.clear();
  }

  Ok(parsed.finish())
}

fn read_record(e: &BytesStart<'_>) -> Result<Record> {
  let mut record = Record::default();
  for attr in e.attributes() {
    let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
    let value = attr
      .unescape_value()
      .map_err(|e| Error::Xml(e.to_string()))?
      .into_owned();
    match attr.key.as_ref() {
      b"type" => record.kind = value,
      b"sourceName" => record.source = Some(value),
      b"unit" => record.unit = Some(value),
      b"startDate" => record.start = Some(value),
      b"endDate" => record.end = Some(value),
      b"value" => record.value = Some(value),
      _ => {}
    }
  }
  Ok(record)
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
  for attr in e.attributes() {
    let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
    if attr.key.as_ref() == key {
      let value = attr.unescape_value().map_err(|e| Error::Xml(e.to_string()))?;
      return Ok(Some(value.into_owned()));
    }
  }
  Ok(None)
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use crate::{Error, parse_xml};

  const EXPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE HealthData [
<!ELEMENT HealthData (ExportDate,Me,(Record|Workout)*)>
]>
<HealthData locale="en_GB">
 <ExportDate value="2024-01-06 08:00:00 +0000"/>
 <Me HKCharacteristicTypeIdentifierDateOfBirth="1980-02-01"/>
 <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="Sam&apos;s Watch" unit="count/min" startDate="2024-01-05 07:30:00 +0100" endDate="2024-01-05 07:30:00 +0100" value="64">
  <MetadataEntry key="HKMetadataKeyHeartRateMotionContext" value="1"/>
 </Record>
 <Record type="HKQuantityTypeIdentifierOxygenSaturation" sourceName="Sam&apos;s Watch" unit="%" startDate="2024-01-05 07:31:00 +0100" endDate="2024-01-05 07:31:00 +0100" value="0.97"/>
 <Record type="HKCategoryTypeIdentifierSleepAnalysis" sourceName="Sam&apos;s Watch" startDate="2024-01-05 01:00:00 +0100" endDate="2024-01-05 02:00:00 +0100" value="HKCategoryValueSleepAnalysisAsleepCore"/>
 <Record type="HKQuantityTypeIdentifierBodyMass" sourceName="Scale" unit="kg" startDate="2024-01-05 07:00:00 +0100" endDate="2024-01-05 07:00:00 +0100" value="70"/>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" startDate="2024-01-05 07:00:00 +0100" endDate="2024-01-05 08:00:00 +0100" value="300"/>
 <Workout workoutActivityType="HKWorkoutActivityTypeRunning" duration="30"/>
</HealthData>
"#;

  #[test]
  fn reads_records_by_source() {
    let parsed = parse_xml(EXPORT.as_bytes()).unwrap();
    assert_eq!(parsed.device_id, None);
    assert_eq!(parsed.exported_at, Some(Utc.with_ymd_and_hms(2024, 1, 6, 8, 0, 0).unwrap()));

    let summary: Vec<_> = parsed
      .readings
      .iter()
      .map(|r| (r.device_id.as_str(), r.metric_type.as_str(), r.value))
      .collect();
    assert_eq!(summary, vec![
      ("Sam's Watch", "heart_rate", 64.0),
      ("Sam's Watch", "oxygen_saturation", 97.0),
      ("Sam's Watch", "sleep_stage", 3.0),
    ]);
    assert_eq!(parsed.readings[0].timestamp, Utc.with_ymd_and_hms(2024, 1, 5, 6, 30, 0).unwrap());
  }

  #[test]
  fn counts_skipped_and_unusable() {
    let parsed = parse_xml(EXPORT.as_bytes()).unwrap();
    assert_eq!(parsed.report.skipped.get("HKQuantityTypeIdentifierBodyMass"), Some(&1));
    // The step record has no source to attribute it to.
    assert_eq!(parsed.report.unusable, 1);
  }

  #[test]
  fn malformed_xml_is_an_error() {
    let err = parse_xml(b"<HealthData><Record type=\"x\"></HealthData>").unwrap_err();
    assert!(matches!(err, Error::Xml(_)));
  }
}
