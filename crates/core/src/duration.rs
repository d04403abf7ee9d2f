//! Unit-keyed durations used by stopping thresholds and transition time deltas.

use crate::{SimulationError, SimulationResult};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Weeks,
    Days,
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
    Microseconds,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Weeks => "weeks",
            TimeUnit::Days => "days",
            TimeUnit::Hours => "hours",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Microseconds => "microseconds",
        }
    }

    fn microseconds_per_unit(self) -> i64 {
        match self {
            TimeUnit::Weeks => 7 * 24 * 3_600_000_000,
            TimeUnit::Days => 24 * 3_600_000_000,
            TimeUnit::Hours => 3_600_000_000,
            TimeUnit::Minutes => 60_000_000,
            TimeUnit::Seconds => 1_000_000,
            TimeUnit::Milliseconds => 1_000,
            TimeUnit::Microseconds => 1,
        }
    }

    /// `None` when the amount does not fit in a [`Duration`].
    fn duration(self, amount: &Number) -> Option<Duration> {
        if let Some(whole) = amount.as_i64() {
            return match self {
                TimeUnit::Weeks => Duration::try_weeks(whole),
                TimeUnit::Days => Duration::try_days(whole),
                TimeUnit::Hours => Duration::try_hours(whole),
                TimeUnit::Minutes => Duration::try_minutes(whole),
                TimeUnit::Seconds => Duration::try_seconds(whole),
                TimeUnit::Milliseconds => Duration::try_milliseconds(whole),
                TimeUnit::Microseconds => Some(Duration::microseconds(whole)),
            };
        }

        // Fractional amounts, and integers beyond i64, go through microseconds.
        let micros = amount.as_f64()? * self.microseconds_per_unit() as f64;
        if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Duration::microseconds(micros.round() as i64))
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A duration written as a map of unit to amount, e.g. `{days: 10, hours: 12}` or
/// `{days: 0.5}`.
///
/// The amounts of all units are summed. Fractional amounts are rounded to the nearest
/// microsecond.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSpec(BTreeMap<TimeUnit, Number>);

impl DurationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` of `unit`, accumulating onto any existing amount.
    pub fn with(mut self, unit: TimeUnit, amount: i64) -> Self {
        let total = match self.0.get(&unit) {
            Some(existing) => match existing.as_i64() {
                Some(whole) => Number::from(whole.saturating_add(amount)),
                None => existing
                    .as_f64()
                    .and_then(|fraction| Number::from_f64(fraction + amount as f64))
                    .unwrap_or_else(|| existing.clone()),
            },
            None => Number::from(amount),
        };
        self.0.insert(unit, total);
        self
    }

    pub fn days(amount: i64) -> Self {
        Self::new().with(TimeUnit::Days, amount)
    }

    /// Sums every unit into a single [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if any amount, or the total, is out of range.
    pub fn to_duration(&self) -> SimulationResult<Duration> {
        self.0.iter().try_fold(Duration::zero(), |total, (unit, amount)| {
            unit.duration(amount)
                .and_then(|part| total.checked_add(&part))
                .ok_or_else(|| {
                    SimulationError::InvalidConfig(format!(
                        "duration of {amount} {unit} is out of range"
                    ))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_all_units() {
        let spec: DurationSpec =
            serde_json::from_str(r#"{"days": 1, "hours": 12, "minutes": 30}"#).expect("parse");
        assert_eq!(
            spec.to_duration().expect("in range"),
            Duration::days(1) + Duration::hours(12) + Duration::minutes(30)
        );
    }

    #[test]
    fn fractional_amounts_are_accepted() {
        let spec: DurationSpec =
            serde_yaml::from_str("days: 0.5\nseconds: 1.25").expect("parse");
        assert_eq!(
            spec.to_duration().expect("in range"),
            Duration::hours(12) + Duration::milliseconds(1250)
        );
    }

    #[test]
    fn out_of_range_amounts_are_errors() {
        let spec: DurationSpec =
            serde_json::from_value(serde_json::json!({"days": i64::MAX})).expect("parse");
        assert!(matches!(
            spec.to_duration(),
            Err(SimulationError::InvalidConfig(_))
        ));

        let spec: DurationSpec =
            serde_json::from_value(serde_json::json!({"weeks": 1e300})).expect("parse");
        assert!(spec.to_duration().is_err());
    }

    #[test]
    fn total_overflow_is_an_error() {
        let days = DurationSpec::days(100_000_000_000);
        assert!(days.to_duration().is_ok());
        let both = days.with(TimeUnit::Weeks, 14_000_000_000);
        assert!(both.to_duration().is_err());
    }

    #[test]
    fn rejects_unknown_units() {
        let err = serde_json::from_str::<DurationSpec>(r#"{"fortnights": 1}"#)
            .expect_err("unknown unit should fail");
        assert!(err.to_string().contains("fortnights"));
    }

    #[test]
    fn empty_spec_is_zero() {
        assert_eq!(DurationSpec::new().to_duration().expect("zero"), Duration::zero());
    }
}
