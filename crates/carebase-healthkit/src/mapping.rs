//! HealthKit type identifiers, display names and units.

use carebase_core::metric::{MetricType, SleepStage};
use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// How a HealthKit sample type maps onto the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
  Quantity(MetricType),
  /// Sleep analysis: a stage category, or a duration when a time unit is
  /// attached.
  Sleep,
}

/// Accepts both `HK…TypeIdentifier…` names (native export) and the iOS
/// display names the mobile app sends.
pub(crate) fn classify(hk_type: &str) -> Option<Kind> {
  use MetricType::*;
  let kind = match hk_type {
    "HKQuantityTypeIdentifierHeartRate" | "Heart Rate" => Kind::Quantity(HeartRate),
    "HKQuantityTypeIdentifierRestingHeartRate" | "Resting Heart Rate" => {
      Kind::Quantity(RestingHeartRate)
    }
    "HKQuantityTypeIdentifierStepCount" | "Step Count" | "Steps" => Kind::Quantity(Steps),
    "HKQuantityTypeIdentifierActiveEnergyBurned" | "Active Energy" => Kind::Quantity(Calories),
    "HKQuantityTypeIdentifierDistanceWalkingRunning" | "Walking/Running Distance"
    | "Walking + Running Distance" => Kind::Quantity(Distance),
    "HKQuantityTypeIdentifierFlightsClimbed" | "Flights Climbed" => Kind::Quantity(FlightsClimbed),
    "HKQuantityTypeIdentifierVO2Max" | "VO2 Max" | "Cardio Fitness" => Kind::Quantity(Vo2Max),
    "HKQuantityTypeIdentifierOxygenSaturation" | "Blood Oxygen" | "Oxygen Saturation" => {
      Kind::Quantity(OxygenSaturation)
    }
    "HKQuantityTypeIdentifierBloodPressureSystolic" | "Blood Pressure Systolic" => {
      Kind::Quantity(BloodPressureSystolic)
    }
    "HKQuantityTypeIdentifierBloodPressureDiastolic" | "Blood Pressure Diastolic" => {
      Kind::Quantity(BloodPressureDiastolic)
    }
    "HKCategoryTypeIdentifierSleepAnalysis"
    | "HKQuantityTypeIdentifierSleepAnalysis"
    | "Sleep Analysis" => Kind::Sleep,
    _ => return None,
  };
  Some(kind)
}

/// Convert `value` in `unit` to the metric's canonical unit. `None` when the
/// unit is not one we can convert.
pub(crate) fn normalize(metric: MetricType, value: f64, unit: Option<&str>) -> Option<f64> {
  let unit = unit.map(str::trim).filter(|u| !u.is_empty());
  match metric {
    MetricType::Distance => match unit {
      None | Some("m") => Some(value),
      Some("km") => Some(value * 1000.0),
      Some("mi") => Some(value * 1609.344),
      Some("ft") => Some(value * 0.3048),
      Some(_) => None,
    },
    MetricType::Calories => match unit {
      None | Some("kcal" | "Cal" | "cal") => Some(value),
      Some("kJ") => Some(value / 4.184),
      Some(_) => None,
    },
    // HealthKit stores saturation as a fraction.
    MetricType::OxygenSaturation if value <= 1.0 => Some(value * 100.0),
    _ => Some(value),
  }
}

/// Stage code for a sleep category value, by HealthKit constant or short name.
pub(crate) fn sleep_stage(value: &str) -> Option<SleepStage> {
  let name = value
    .trim()
    .strip_prefix("HKCategoryValueSleepAnalysis")
    .unwrap_or(value.trim());
  let stage = match name {
    "InBed" | "In Bed" => SleepStage::InBed,
    "Asleep" | "AsleepUnspecified" => SleepStage::Asleep,
    "Awake" => SleepStage::Awake,
    "AsleepCore" | "Core" => SleepStage::Core,
    "AsleepDeep" | "Deep" => SleepStage::Deep,
    "AsleepREM" | "REM" => SleepStage::Rem,
    _ => return None,
  };
  Some(stage)
}

/// A sleep sample's metric and value.
pub(crate) fn sleep_reading(value: SampleValue<'_>, unit: Option<&str>) -> Option<(MetricType, f64)> {
  match value {
    SampleValue::Text(text) => match text.trim().parse::<f64>() {
      Ok(n) => sleep_reading(SampleValue::Number(n), unit),
      Err(_) => sleep_stage(text).map(|s| (MetricType::SleepStage, s.code())),
    },
    SampleValue::Number(n) => match unit.map(str::trim) {
      Some("hr" | "h" | "hours") => Some((MetricType::SleepDuration, n)),
      Some("min") => Some((MetricType::SleepDuration, n / 60.0)),
      Some("s") => Some((MetricType::SleepDuration, n / 3600.0)),
      _ if n.fract() == 0.0 && (0.0..=5.0).contains(&n) => Some((MetricType::SleepStage, n)),
      _ => None,
    },
  }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SampleValue<'a> {
  Number(f64),
  Text(&'a str),
}

/// Apple's native export writes `2024-01-05 07:30:00 +0100`; the app sends
/// RFC 3339.
pub(crate) fn parse_date(value: &str) -> Result<DateTime<Utc>> {
  let value = value.trim();
  DateTime::parse_from_rfc3339(value)
    .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z"))
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| Error::InvalidDate { value: value.to_owned() })
}
