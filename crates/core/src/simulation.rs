//! The per-patient simulation step loop.
//!
//! A run moves from `Running` to `Stopped(reason)` and never back. Each iteration:
//! 1. stops with `HardLimit` if the step ceiling has been reached,
//! 2. asks the intelligence for a decision in the current environment,
//! 3. appends the produced entries to the patient and records the visit on the environment,
//! 4. advances the step counter and the real clock, and logs on cadence,
//! 5. stops with `Death` if the patient died, or with `Condition` if the stopping condition
//!    holds on the post-step clocks,
//! 6. otherwise switches to the chosen next environment.
//!
//! The stopping condition is also checked once before the first step.

use crate::constants::{DEFAULT_HARD_STOP, DEFAULT_LOG_EVERY, MAIN_LOG_TARGET};
use crate::environment::EnvironmentState;
use crate::intelligence::Intelligence;
use crate::interaction::InteractionRegistry;
use crate::patient::{PatientState, RecordLogScope};
use crate::record::{DuplicateAction, PendingEntry, RawEntry};
use crate::stopping::{Clocks, StoppingCondition, StoppingKind};
use crate::{SimulationError, SimulationResult};
use abm_types::{EnvironmentId, PatientId};
use abm_uuid::SimulationId;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Settings shared by every patient run of a simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub stopping_condition: StoppingCondition,
    /// Log every N steps. Must be at least 1.
    pub log_every: u64,
    /// Buffer a message for every step, not just the ones on cadence.
    pub log_intermediate: bool,
    /// Ceiling on the number of steps.
    pub hard_stop: u64,
    /// Include the entries added since the last log in patient state logs.
    pub log_patient_record: bool,
    pub duplicate_action: DuplicateAction,
}

impl RunSettings {
    pub fn new(stopping_condition: StoppingCondition) -> Self {
        Self {
            stopping_condition,
            log_every: DEFAULT_LOG_EVERY,
            log_intermediate: false,
            hard_stop: DEFAULT_HARD_STOP,
            log_patient_record: true,
            duplicate_action: DuplicateAction::Add,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Condition(StoppingKind),
    Death,
    HardLimit,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Condition(kind) => kind.as_str(),
            StopReason::Death => "death",
            StopReason::HardLimit => "hard_stop",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StopReason {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
}

/// Structured message emitted on the main log target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLogMessage {
    pub simulation_id: SimulationId,
    pub simulation_status: RunStatus,
    pub simulation_created_at: DateTime<Utc>,
    pub simulation_time: DateTime<Utc>,
    pub simulation_time_elapsed_ms: i64,
    pub patient_time: DateTime<Utc>,
    pub patient_time_elapsed_seconds: i64,
    pub simulation_step: u64,
    pub interaction_names: Option<Vec<String>>,
    pub patient_id: PatientId,
    pub environment_id: EnvironmentId,
    pub next_environment_id: Option<EnvironmentId>,
    pub number_of_patient_record_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopping_reason: Option<StopReason>,
}

/// Source of real (wall-clock) time.
pub trait RealClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl RealClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

static SYSTEM_CLOCK: SystemClock = SystemClock;

/// Final state of one patient run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub simulation_id: SimulationId,
    pub patient: PatientState,
    pub environments: BTreeMap<EnvironmentId, EnvironmentState>,
    pub state: LoopState,
    pub steps: u64,
    pub patient_time: DateTime<Utc>,
    pub log_messages: Vec<StepLogMessage>,
}

impl SimulationOutcome {
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            LoopState::Stopped(reason) => Some(reason),
            LoopState::Running => None,
        }
    }
}

/// Runs the step loop for one patient.
pub struct PatientSimulation<'a> {
    simulation_id: SimulationId,
    registry: &'a InteractionRegistry,
    intelligence: &'a dyn Intelligence,
    settings: &'a RunSettings,
    clock: &'a dyn RealClock,
}

/// Mutable bookkeeping of a run in progress.
struct Progress {
    step: u64,
    patient_time: DateTime<Utc>,
    real_start_time: DateTime<Utc>,
    real_time: DateTime<Utc>,
    environment_id: EnvironmentId,
    next_environment_id: Option<EnvironmentId>,
    interaction_names: Option<Vec<String>>,
}

impl<'a> PatientSimulation<'a> {
    pub fn new(
        simulation_id: SimulationId,
        registry: &'a InteractionRegistry,
        intelligence: &'a dyn Intelligence,
        settings: &'a RunSettings,
    ) -> Self {
        Self {
            simulation_id,
            registry,
            intelligence,
            settings,
            clock: &SYSTEM_CLOCK,
        }
    }

    pub fn with_clock(mut self, clock: &'a dyn RealClock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the loop to completion.
    ///
    /// # Arguments
    ///
    /// * `patient` - The patient, moved into the run.
    /// * `environments` - This patient's own copy of every environment.
    /// * `initial_environment_id` - Where the patient starts.
    /// * `rng` - Random source handed to the intelligence.
    ///
    /// # Returns
    ///
    /// Returns the final patient and environments, the stop reason and the emitted log
    /// messages.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `log_every` is zero, `UnknownEnvironment` if the initial
    /// environment is missing, `PolicyContract` if the intelligence names no (or an unknown)
    /// next environment for a living patient, or any error raised while applying a decision.
    pub fn run(
        &self,
        mut patient: PatientState,
        mut environments: BTreeMap<EnvironmentId, EnvironmentState>,
        initial_environment_id: &EnvironmentId,
        rng: &mut dyn RngCore,
    ) -> SimulationResult<SimulationOutcome> {
        if self.settings.log_every == 0 {
            return Err(SimulationError::InvalidConfig(
                "log_every must be at least 1".into(),
            ));
        }
        if !environments.contains_key(initial_environment_id) {
            return Err(SimulationError::UnknownEnvironment(
                initial_environment_id.to_string(),
            ));
        }

        let real_start_time = self.clock.now();
        let mut progress = Progress {
            step: 0,
            patient_time: patient.start_time(),
            real_start_time,
            real_time: real_start_time,
            environment_id: initial_environment_id.clone(),
            next_environment_id: None,
            interaction_names: None,
        };
        let mut pending = Vec::new();
        let mut emitted = Vec::new();

        let reason = if self.condition_met(&patient, &progress) {
            StopReason::Condition(self.settings.stopping_condition.kind())
        } else {
            loop {
                if progress.step >= self.settings.hard_stop {
                    break StopReason::HardLimit;
                }

                let environment = environments
                    .get_mut(&progress.environment_id)
                    .ok_or_else(|| {
                        SimulationError::UnknownEnvironment(progress.environment_id.to_string())
                    })?;
                let decision = self.intelligence.decide(
                    &mut patient,
                    environment,
                    progress.patient_time,
                    self.registry,
                    rng,
                )?;
                progress.patient_time = decision.patient_time;

                let new_entries: Vec<RawEntry> = decision
                    .update_data
                    .new_patient_record_entries
                    .into_iter()
                    .map(|payload| {
                        RawEntry::from(
                            PendingEntry::wrap(payload, progress.patient_time)
                                .environment(progress.environment_id.clone())
                                .interactions(decision.interaction_names.clone())
                                .step(progress.step),
                        )
                    })
                    .collect();
                let report = patient.update(new_entries, self.settings.duplicate_action)?;
                environment.update(&patient, decision.update_data.patient_data);

                progress.real_time = self.clock.now();
                progress.step += 1;
                progress.next_environment_id = decision.next_environment_id;
                progress.interaction_names = Some(decision.interaction_names);

                let on_cadence = progress.step % self.settings.log_every == 0;
                if self.settings.log_intermediate || on_cadence {
                    pending.push(self.message(&patient, &progress, RunStatus::Running, None));
                }
                if on_cadence {
                    let scope = if self.settings.log_patient_record {
                        RecordLogScope::Last(report.appended)
                    } else {
                        RecordLogScope::Omit
                    };
                    patient.log_state(scope)?;
                    flush(&mut pending, &mut emitted)?;
                }

                if !patient.is_alive() {
                    break StopReason::Death;
                }
                if self.condition_met(&patient, &progress) {
                    break StopReason::Condition(self.settings.stopping_condition.kind());
                }

                let next = progress.next_environment_id.clone().ok_or_else(|| {
                    SimulationError::PolicyContract(format!(
                        "no next environment chosen at step {} for a living patient",
                        progress.step
                    ))
                })?;
                if !environments.contains_key(&next) {
                    return Err(SimulationError::PolicyContract(format!(
                        "next environment '{next}' is not present in the list of environments"
                    )));
                }
                progress.environment_id = next;
            }
        };

        flush(&mut pending, &mut emitted)?;
        let finished = self.message(&patient, &progress, RunStatus::Finished, Some(reason));
        pending.push(finished);
        flush(&mut pending, &mut emitted)?;

        Ok(SimulationOutcome {
            simulation_id: self.simulation_id.clone(),
            patient,
            environments,
            state: LoopState::Stopped(reason),
            steps: progress.step,
            patient_time: progress.patient_time,
            log_messages: emitted,
        })
    }

    fn condition_met(&self, patient: &PatientState, progress: &Progress) -> bool {
        self.settings.stopping_condition.is_met(&Clocks {
            step: progress.step,
            patient_start_time: patient.start_time(),
            patient_time: progress.patient_time,
            real_start_time: progress.real_start_time,
            real_time: progress.real_time,
        })
    }

    fn message(
        &self,
        patient: &PatientState,
        progress: &Progress,
        status: RunStatus,
        stopping_reason: Option<StopReason>,
    ) -> StepLogMessage {
        let simulation_step = match status {
            RunStatus::Running => progress.step.saturating_sub(1),
            RunStatus::Finished => progress.step,
        };
        StepLogMessage {
            simulation_id: self.simulation_id.clone(),
            simulation_status: status,
            simulation_created_at: progress.real_start_time,
            simulation_time: progress.real_time,
            simulation_time_elapsed_ms: (progress.real_time - progress.real_start_time)
                .num_milliseconds(),
            patient_time: progress.patient_time,
            patient_time_elapsed_seconds: (progress.patient_time - patient.start_time())
                .num_seconds(),
            simulation_step,
            interaction_names: progress.interaction_names.clone(),
            patient_id: patient.patient_id().clone(),
            environment_id: progress.environment_id.clone(),
            next_environment_id: progress.next_environment_id.clone(),
            number_of_patient_record_entries: patient.record().len(),
            stopping_reason,
        }
    }
}

fn flush(
    pending: &mut Vec<StepLogMessage>,
    emitted: &mut Vec<StepLogMessage>,
) -> SimulationResult<()> {
    for message in pending.drain(..) {
        let line = serde_json::to_string(&message).map_err(SimulationError::Serialization)?;
        tracing::info!(target: MAIN_LOG_TARGET, simulation_id = %message.simulation_id, "{line}");
        emitted.push(message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::DurationSpec;
    use crate::environment::EnvironmentType;
    use crate::intelligence::{Decision, RandomIntelligence};
    use crate::interaction::{InteractionOutcome, Transitions, UpdateData};
    use crate::record::Payload;
    use crate::time::parse_timestamp;
    use abm_types::Gender;
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    fn ts(text: &str) -> DateTime<Utc> {
        parse_timestamp(text).expect("valid timestamp")
    }

    fn patient() -> PatientState {
        PatientState::new(PatientId::from(1), Gender::Female, ts("1985-05-24"), ts("2021-02-01"))
            .expect("patient")
    }

    /// Advances one minute per reading.
    struct StepClock(Mutex<DateTime<Utc>>);

    impl RealClock for StepClock {
        fn now(&self) -> DateTime<Utc> {
            let mut now = self.0.lock().expect("clock lock");
            *now += Duration::minutes(1);
            *now
        }
    }

    fn registry() -> InteractionRegistry {
        let mut registry = InteractionRegistry::new();
        registry
            .register(
                "measure_bmi",
                |_: &mut PatientState,
                 _: &mut EnvironmentState,
                 time: DateTime<Utc>|
                 -> SimulationResult<InteractionOutcome> {
                    Ok(InteractionOutcome {
                        update_data: UpdateData {
                            new_patient_record_entries: vec![
                                Payload::entry("Encounter", "GP visit", time),
                                Payload::entry("Observation", "BMI", time).with("value", 24.5),
                            ],
                            patient_data: Some(vec![serde_json::json!({"bmi": 24.5})]),
                        },
                        transitions: Transitions::new()
                            .with(EnvironmentId::from(0), 0.5, Duration::days(10))
                            .with(EnvironmentId::from(1), 0.5, Duration::days(10)),
                    })
                },
            )
            .expect("register");
        registry
    }

    fn environments(interactions: &[&str]) -> BTreeMap<EnvironmentId, EnvironmentState> {
        (0..2)
            .map(|id| {
                let env = EnvironmentState::new(
                    EnvironmentId::from(id),
                    EnvironmentType::Gp,
                    interactions.iter().copied(),
                )
                .expect("environment");
                (EnvironmentId::from(id), env)
            })
            .collect()
    }

    fn run(
        settings: &RunSettings,
        interactions: &[&str],
        intelligence: &dyn Intelligence,
    ) -> SimulationResult<SimulationOutcome> {
        let registry = registry();
        let mut rng = StdRng::seed_from_u64(42);
        PatientSimulation::new(SimulationId::new(), &registry, intelligence, settings).run(
            patient(),
            environments(interactions),
            &EnvironmentId::from(0),
            &mut rng,
        )
    }

    #[test]
    fn death_only_environment_stops_after_one_step() {
        let settings = RunSettings::new(StoppingCondition::MaxNumSteps(10));

        let outcome = run(&settings, &[], &RandomIntelligence).expect("run");

        assert_eq!(outcome.state, LoopState::Stopped(StopReason::Death));
        assert_eq!(outcome.steps, 1);
        assert!(!outcome.patient.is_alive());
        let profile = outcome.patient.profile().expect("profile");
        assert_eq!(profile.payload().end().expect("end"), Some(ts("2021-02-01")));
    }

    #[test]
    fn max_num_steps_stops_loop() {
        let settings = RunSettings::new(StoppingCondition::MaxNumSteps(3));

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");

        assert_eq!(
            outcome.stop_reason(),
            Some(StopReason::Condition(StoppingKind::MaxNumSteps))
        );
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.patient.record().len(), 7);
        assert_eq!(outcome.patient_time, ts("2021-03-03"));

        let steps: Vec<Option<u64>> = outcome.patient.record()[1..]
            .iter()
            .map(|e| e.simulation_step())
            .collect();
        assert_eq!(steps, vec![Some(0), Some(0), Some(1), Some(1), Some(2), Some(2)]);
        for (index, entry) in outcome.patient.record().iter().enumerate() {
            assert_eq!(entry.record_index(), index);
        }
    }

    #[test]
    fn entries_are_stamped_with_advanced_patient_time() {
        let settings = RunSettings::new(StoppingCondition::MaxNumSteps(1));

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");

        let entry = &outcome.patient.record()[1];
        assert_eq!(entry.patient_time(), ts("2021-02-11"));
        assert_eq!(entry.environment_id(), Some(&EnvironmentId::from(0)));
        assert_eq!(entry.interactions(), Some(&["measure_bmi".to_string()][..]));
    }

    #[test]
    fn max_patient_time_stops_loop() {
        let settings = RunSettings::new(StoppingCondition::MaxPatientTime(DurationSpec::days(25)));

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");

        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.patient_time, ts("2021-03-03"));
    }

    #[test]
    fn hard_stop_is_checked_before_each_step() {
        let mut settings = RunSettings::new(StoppingCondition::MaxNumSteps(100));
        settings.hard_stop = 2;

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");

        assert_eq!(outcome.state, LoopState::Stopped(StopReason::HardLimit));
        assert_eq!(outcome.steps, 2);
    }

    #[test]
    fn condition_met_before_first_step_runs_nothing() {
        let settings = RunSettings::new(StoppingCondition::MaxNumSteps(0));

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");

        assert_eq!(outcome.steps, 0);
        assert_eq!(outcome.patient.record().len(), 1);
        assert_eq!(outcome.log_messages.len(), 1);
        assert_eq!(outcome.log_messages[0].simulation_status, RunStatus::Finished);
    }

    #[test]
    fn max_real_time_uses_injected_clock() {
        let settings = RunSettings::new(StoppingCondition::MaxRealTime(
            DurationSpec::new().with(crate::duration::TimeUnit::Minutes, 2),
        ));
        let registry = registry();
        let clock = StepClock(Mutex::new(ts("2021-01-01")));
        let mut rng = StdRng::seed_from_u64(1);

        let outcome =
            PatientSimulation::new(SimulationId::new(), &registry, &RandomIntelligence, &settings)
                .with_clock(&clock)
                .run(patient(), environments(&["measure_bmi"]), &EnvironmentId::from(0), &mut rng)
                .expect("run");

        assert_eq!(outcome.steps, 2);
    }

    #[test]
    fn environment_history_tracks_each_visit() {
        let settings = RunSettings::new(StoppingCondition::MaxNumSteps(4));

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");

        let visits: usize = outcome
            .environments
            .values()
            .map(|env| env.interaction_history(outcome.patient.patient_id()).len())
            .sum();
        assert_eq!(visits, 4);
        let data: usize = outcome
            .environments
            .values()
            .map(|env| env.patient_data(outcome.patient.patient_id()).len())
            .sum();
        assert_eq!(data, 4);
    }

    #[test]
    fn log_cadence_controls_messages() {
        let mut settings = RunSettings::new(StoppingCondition::MaxNumSteps(6));
        settings.log_every = 3;

        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");
        let running: Vec<u64> = outcome
            .log_messages
            .iter()
            .filter(|m| m.simulation_status == RunStatus::Running)
            .map(|m| m.simulation_step)
            .collect();
        assert_eq!(running, vec![2, 5]);
        let last = outcome.log_messages.last().expect("finished message");
        assert_eq!(last.stopping_reason, Some(StopReason::Condition(StoppingKind::MaxNumSteps)));

        settings.log_intermediate = true;
        let outcome = run(&settings, &["measure_bmi"], &RandomIntelligence).expect("run");
        assert_eq!(outcome.log_messages.len(), 7);
    }

    #[test]
    fn missing_next_environment_is_a_policy_violation() {
        let settings = RunSettings::new(StoppingCondition::MaxNumSteps(5));
        let stuck = |_: &mut PatientState,
                     _: &mut EnvironmentState,
                     time: DateTime<Utc>,
                     _: &InteractionRegistry,
                     _: &mut dyn RngCore|
         -> SimulationResult<Decision> {
            Ok(Decision {
                patient_time: time,
                update_data: UpdateData::default(),
                next_environment_id: None,
                interaction_names: vec![],
                transitions: Transitions::new(),
            })
        };

        let err = run(&settings, &[], &stuck).expect_err("policy violation");
        assert!(matches!(err, SimulationError::PolicyContract(_)));
    }

    #[test]
    fn zero_log_every_is_rejected() {
        let mut settings = RunSettings::new(StoppingCondition::MaxNumSteps(1));
        settings.log_every = 0;

        let err = run(&settings, &[], &RandomIntelligence).expect_err("invalid settings");
        assert!(matches!(err, SimulationError::InvalidConfig(_)));
    }
}
