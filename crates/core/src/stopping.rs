//! Stopping conditions for a patient simulation.

use crate::duration::DurationSpec;
use crate::{SimulationError, SimulationResult};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoppingKind {
    MaxNumSteps,
    MaxPatientTime,
    MaxRealTime,
}

impl StoppingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoppingKind::MaxNumSteps => "max_num_steps",
            StoppingKind::MaxPatientTime => "max_patient_time",
            StoppingKind::MaxRealTime => "max_real_time",
        }
    }
}

impl fmt::Display for StoppingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The configured condition under which a simulation ends normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoppingCondition {
    /// Stop once this many steps have run.
    MaxNumSteps(u64),
    /// Stop once patient time has advanced this far from the patient's start time.
    MaxPatientTime(DurationSpec),
    /// Stop once this much wall-clock time has passed since the simulation started.
    MaxRealTime(DurationSpec),
}

/// Clock readings a stopping condition is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clocks {
    pub step: u64,
    pub patient_start_time: DateTime<Utc>,
    pub patient_time: DateTime<Utc>,
    pub real_start_time: DateTime<Utc>,
    pub real_time: DateTime<Utc>,
}

impl StoppingCondition {
    /// Builds a condition from its kind name and threshold value.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStoppingCondition` for an unrecognised kind, or `InvalidConfig` if the
    /// threshold has the wrong shape.
    pub fn parse(kind: &str, threshold: &Value) -> SimulationResult<Self> {
        match kind {
            "max_num_steps" => threshold
                .as_u64()
                .map(StoppingCondition::MaxNumSteps)
                .ok_or_else(|| {
                    SimulationError::InvalidConfig(format!(
                        "max_num_steps must be a non-negative integer, got {threshold}"
                    ))
                }),
            "max_patient_time" => {
                parse_duration(kind, threshold).map(StoppingCondition::MaxPatientTime)
            }
            "max_real_time" => {
                parse_duration(kind, threshold).map(StoppingCondition::MaxRealTime)
            }
            other => Err(SimulationError::UnknownStoppingCondition(other.to_owned())),
        }
    }

    /// Builds a condition from a single-entry `{kind: threshold}` map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` unless the map has exactly one entry, plus any error from
    /// [`StoppingCondition::parse`].
    pub fn from_map(map: &BTreeMap<String, Value>) -> SimulationResult<Self> {
        let mut entries = map.iter();
        match (entries.next(), entries.next()) {
            (Some((kind, threshold)), None) => Self::parse(kind, threshold),
            _ => Err(SimulationError::InvalidConfig(format!(
                "stopping_condition must have exactly one entry, got {}",
                map.len()
            ))),
        }
    }

    pub fn kind(&self) -> StoppingKind {
        match self {
            StoppingCondition::MaxNumSteps(_) => StoppingKind::MaxNumSteps,
            StoppingCondition::MaxPatientTime(_) => StoppingKind::MaxPatientTime,
            StoppingCondition::MaxRealTime(_) => StoppingKind::MaxRealTime,
        }
    }

    /// Returns true once the threshold has been reached.
    ///
    /// A duration threshold too large to represent is never reached.
    pub fn is_met(&self, clocks: &Clocks) -> bool {
        match self {
            StoppingCondition::MaxNumSteps(max) => clocks.step >= *max,
            StoppingCondition::MaxPatientTime(max) => max.to_duration().is_ok_and(|max| {
                clocks.patient_time - clocks.patient_start_time >= max
            }),
            StoppingCondition::MaxRealTime(max) => max
                .to_duration()
                .is_ok_and(|max| clocks.real_time - clocks.real_start_time >= max),
        }
    }
}

fn parse_duration(kind: &str, threshold: &Value) -> SimulationResult<DurationSpec> {
    let spec: DurationSpec = serde_json::from_value(threshold.clone()).map_err(|e| {
        SimulationError::InvalidConfig(format!("{kind} must be a map of time units: {e}"))
    })?;
    spec.to_duration()
        .map_err(|e| SimulationError::InvalidConfig(format!("{kind}: {e}")))?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_timestamp;
    use chrono::Duration;
    use serde_json::json;

    fn clocks(step: u64, patient_days: i64, real_seconds: i64) -> Clocks {
        let start = parse_timestamp("2021-01-01").expect("timestamp");
        Clocks {
            step,
            patient_start_time: start,
            patient_time: start + Duration::days(patient_days),
            real_start_time: start,
            real_time: start + Duration::seconds(real_seconds),
        }
    }

    #[test]
    fn max_num_steps_is_inclusive() {
        let condition = StoppingCondition::parse("max_num_steps", &json!(3)).expect("parse");
        assert!(!condition.is_met(&clocks(2, 0, 0)));
        assert!(condition.is_met(&clocks(3, 0, 0)));
    }

    #[test]
    fn max_patient_time_sums_units() {
        let condition =
            StoppingCondition::parse("max_patient_time", &json!({"weeks": 1, "days": 3}))
                .expect("parse");
        assert_eq!(condition.kind(), StoppingKind::MaxPatientTime);
        assert!(!condition.is_met(&clocks(0, 9, 0)));
        assert!(condition.is_met(&clocks(0, 10, 0)));
    }

    #[test]
    fn thresholds_against_fixed_dates() {
        let steps = StoppingCondition::MaxNumSteps(20);
        assert!(!steps.is_met(&clocks(10, 0, 0)));
        assert!(steps.is_met(&clocks(20, 0, 0)));
        assert!(steps.is_met(&clocks(30, 0, 0)));

        let start = parse_timestamp("2021-02-01").expect("start");
        let now = parse_timestamp("2021-02-07").expect("now");
        let elapsed = Clocks {
            step: 0,
            patient_start_time: start,
            patient_time: now,
            real_start_time: start,
            real_time: now,
        };
        for kind in ["max_patient_time", "max_real_time"] {
            let five = StoppingCondition::parse(kind, &json!({"days": 5})).expect("five days");
            let twenty = StoppingCondition::parse(kind, &json!({"days": 20})).expect("twenty days");
            assert!(five.is_met(&elapsed), "{kind} with 5 days");
            assert!(!twenty.is_met(&elapsed), "{kind} with 20 days");
        }
    }

    #[test]
    fn max_real_time_uses_wall_clock() {
        let condition =
            StoppingCondition::parse("max_real_time", &json!({"seconds": 30})).expect("parse");
        assert!(!condition.is_met(&clocks(100, 1000, 29)));
        assert!(condition.is_met(&clocks(0, 0, 30)));
    }

    #[test]
    fn oversized_duration_thresholds_are_rejected_at_parse() {
        for kind in ["max_patient_time", "max_real_time"] {
            let err = StoppingCondition::parse(kind, &json!({"days": i64::MAX}))
                .expect_err("threshold out of range");
            match err {
                SimulationError::InvalidConfig(message) => assert!(message.contains(kind)),
                other => panic!("expected InvalidConfig, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = StoppingCondition::parse("max_heartbeats", &json!(3)).expect_err("unknown kind");
        match err {
            SimulationError::UnknownStoppingCondition(kind) => assert_eq!(kind, "max_heartbeats"),
            other => panic!("expected UnknownStoppingCondition, got {other:?}"),
        }
    }

    #[test]
    fn map_must_have_single_entry() {
        let mut map = BTreeMap::new();
        assert!(StoppingCondition::from_map(&map).is_err());
        map.insert("max_num_steps".to_string(), json!(5));
        assert_eq!(
            StoppingCondition::from_map(&map).expect("parse"),
            StoppingCondition::MaxNumSteps(5)
        );
        map.insert("max_real_time".to_string(), json!({"seconds": 1}));
        assert!(matches!(
            StoppingCondition::from_map(&map),
            Err(SimulationError::InvalidConfig(_))
        ));
    }
}
