//! Decision policies.
//!
//! An [`Intelligence`] decides what happens to a patient during one step: which interactions
//! run, what they write to the record, where the patient goes next and how far patient time
//! advances.

use crate::constants::DEATH_INTERACTION;
use crate::environment::EnvironmentState;
use crate::interaction::{InteractionRegistry, Transitions, UpdateData};
use crate::patient::PatientState;
use crate::{SimulationError, SimulationResult};
use abm_types::EnvironmentId;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::RngCore;

/// The result of one policy decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Patient time after the step. Entries produced by the step are stamped with it.
    pub patient_time: DateTime<Utc>,
    pub update_data: UpdateData,
    /// Where the patient goes next. Must be set unless the patient died.
    pub next_environment_id: Option<EnvironmentId>,
    pub interaction_names: Vec<String>,
    pub transitions: Transitions,
}

pub trait Intelligence: Send + Sync {
    /// Decides one step for `patient` in `environment` at `patient_time`.
    ///
    /// # Errors
    ///
    /// Implementations return `PolicyContract` when they cannot produce a valid decision, or
    /// propagate interaction errors.
    fn decide(
        &self,
        patient: &mut PatientState,
        environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
        interactions: &InteractionRegistry,
        rng: &mut dyn RngCore,
    ) -> SimulationResult<Decision>;
}

impl<F> Intelligence for F
where
    F: Fn(
            &mut PatientState,
            &mut EnvironmentState,
            DateTime<Utc>,
            &InteractionRegistry,
            &mut dyn RngCore,
        ) -> SimulationResult<Decision>
        + Send
        + Sync,
{
    fn decide(
        &self,
        patient: &mut PatientState,
        environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
        interactions: &InteractionRegistry,
        rng: &mut dyn RngCore,
    ) -> SimulationResult<Decision> {
        self(patient, environment, patient_time, interactions, rng)
    }
}

/// Picks one of the environment's interactions at random, excluding `death`, runs it, and
/// samples the next environment from the returned transitions.
///
/// Patient time advances by the time delta of the chosen next environment. When the
/// environment only offers `death`, that is what runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIntelligence;

impl Intelligence for RandomIntelligence {
    fn decide(
        &self,
        patient: &mut PatientState,
        environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
        interactions: &InteractionRegistry,
        rng: &mut dyn RngCore,
    ) -> SimulationResult<Decision> {
        let candidates: Vec<String> = environment
            .interactions()
            .filter(|name| *name != DEATH_INTERACTION)
            .map(str::to_owned)
            .collect();
        let name = candidates
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| DEATH_INTERACTION.to_owned());

        let outcome = interactions.apply(&name, patient, environment, patient_time)?;
        let next_environment_id = outcome.transitions.sample(rng)?;
        let patient_time = match &next_environment_id {
            Some(next) => {
                let delta = outcome.transitions.time_delta(next).ok_or_else(|| {
                    SimulationError::PolicyContract(format!(
                        "interaction '{name}' gave no time delta for environment '{next}'"
                    ))
                })?;
                patient_time.checked_add_signed(delta).ok_or_else(|| {
                    SimulationError::PolicyContract(format!(
                        "interaction '{name}' moved patient time out of range going to '{next}'"
                    ))
                })?
            }
            None => patient_time,
        };

        Ok(Decision {
            patient_time,
            update_data: outcome.update_data,
            next_environment_id,
            interaction_names: vec![name],
            transitions: outcome.transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentType;
    use crate::interaction::InteractionOutcome;
    use crate::record::Payload;
    use crate::time::parse_timestamp;
    use abm_types::{Gender, PatientId};
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ts(text: &str) -> DateTime<Utc> {
        parse_timestamp(text).expect("valid timestamp")
    }

    fn patient() -> PatientState {
        PatientState::new(PatientId::from(1), Gender::Male, ts("1960-01-01"), ts("2021-01-01"))
            .expect("patient")
    }

    fn registry() -> InteractionRegistry {
        registry_with_delta(Duration::days(10))
    }

    fn registry_with_delta(delta: Duration) -> InteractionRegistry {
        let mut registry = InteractionRegistry::new();
        registry
            .register(
                "measure_bmi",
                move |_: &mut PatientState,
                      _: &mut EnvironmentState,
                      time: DateTime<Utc>|
                      -> SimulationResult<InteractionOutcome> {
                    Ok(InteractionOutcome {
                        update_data: UpdateData {
                            new_patient_record_entries: vec![
                                Payload::entry("Observation", "BMI", time).with("value", 27.1)
                            ],
                            patient_data: None,
                        },
                        transitions: Transitions::new().with(EnvironmentId::from(1), 1.0, delta),
                    })
                },
            )
            .expect("register");
        registry
    }

    #[test]
    fn random_intelligence_never_picks_death_when_alternatives_exist() {
        let registry = registry();
        let mut env =
            EnvironmentState::new(EnvironmentId::from(0), EnvironmentType::Gp, ["measure_bmi"])
                .expect("environment");
        let mut patient = patient();
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..10 {
            let decision = RandomIntelligence
                .decide(&mut patient, &mut env, ts("2021-01-01"), &registry, &mut rng)
                .expect("decide");
            assert_eq!(decision.interaction_names, vec!["measure_bmi".to_string()]);
            assert_eq!(decision.next_environment_id, Some(EnvironmentId::from(1)));
            assert_eq!(decision.patient_time, ts("2021-01-11"));
            assert_eq!(decision.update_data.new_patient_record_entries.len(), 1);
        }
        assert!(patient.is_alive());
    }

    #[test]
    fn random_intelligence_falls_back_to_death() {
        let registry = registry();
        let mut env = EnvironmentState::new(
            EnvironmentId::from(0),
            EnvironmentType::Gp,
            Vec::<String>::new(),
        )
        .expect("environment");
        let mut patient = patient();
        let mut rng = StdRng::seed_from_u64(1);

        let decision = RandomIntelligence
            .decide(&mut patient, &mut env, ts("2021-01-01"), &registry, &mut rng)
            .expect("decide");

        assert_eq!(decision.interaction_names, vec!["death".to_string()]);
        assert_eq!(decision.next_environment_id, None);
        assert_eq!(decision.patient_time, ts("2021-01-01"));
        assert!(!patient.is_alive());
    }

    #[test]
    fn time_delta_overflow_is_a_policy_violation() {
        let registry = registry_with_delta(Duration::MAX);
        let mut env =
            EnvironmentState::new(EnvironmentId::from(0), EnvironmentType::Gp, ["measure_bmi"])
                .expect("environment");
        let mut rng = StdRng::seed_from_u64(1);

        let err = RandomIntelligence
            .decide(&mut patient(), &mut env, ts("2021-01-01"), &registry, &mut rng)
            .expect_err("patient time overflow");
        match err {
            SimulationError::PolicyContract(message) => assert!(message.contains("out of range")),
            other => panic!("expected PolicyContract, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_environment_interaction_is_an_error() {
        let registry = InteractionRegistry::new();
        let mut env =
            EnvironmentState::new(EnvironmentId::from(0), EnvironmentType::Gp, ["measure_bmi"])
                .expect("environment");
        let mut rng = StdRng::seed_from_u64(1);

        let err = RandomIntelligence
            .decide(&mut patient(), &mut env, ts("2021-01-01"), &registry, &mut rng)
            .expect_err("unregistered");
        assert!(matches!(err, SimulationError::UnknownInteraction(_)));
    }
}
