//! Interactions between a patient and an environment.
//!
//! An interaction is a named operation that may change the patient and the environment and
//! reports what happened: new record payloads, data for the environment, and the transition
//! probabilities and time deltas to the next environment. Interactions are looked up by name
//! in an [`InteractionRegistry`]; the built-in `death` interaction is always registered.

use crate::constants::DEATH_INTERACTION;
use crate::environment::EnvironmentState;
use crate::patient::PatientState;
use crate::record::Payload;
use crate::{SimulationError, SimulationResult};
use abm_types::EnvironmentId;
use chrono::{DateTime, Duration, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Data produced by an interaction for the patient record and the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateData {
    pub new_patient_record_entries: Vec<Payload>,
    pub patient_data: Option<Vec<Value>>,
}

/// Candidate next environments with their selection weights and time deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transitions {
    probabilities: BTreeMap<EnvironmentId, f64>,
    time_deltas: BTreeMap<EnvironmentId, Duration>,
}

impl Transitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate. Weights need not sum to one.
    pub fn with(
        mut self,
        environment_id: EnvironmentId,
        probability: f64,
        time_delta: Duration,
    ) -> Self {
        self.probabilities.insert(environment_id.clone(), probability);
        self.time_deltas.insert(environment_id, time_delta);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    pub fn probabilities(&self) -> &BTreeMap<EnvironmentId, f64> {
        &self.probabilities
    }

    pub fn time_deltas(&self) -> &BTreeMap<EnvironmentId, Duration> {
        &self.time_deltas
    }

    pub fn time_delta(&self, environment_id: &EnvironmentId) -> Option<Duration> {
        self.time_deltas.get(environment_id).copied()
    }

    /// Samples the next environment by weight. Returns `None` when there are no candidates.
    ///
    /// # Errors
    ///
    /// Returns `PolicyContract` if any weight is negative or not finite, or if all weights
    /// are zero.
    pub fn sample(&self, rng: &mut dyn RngCore) -> SimulationResult<Option<EnvironmentId>> {
        if self.probabilities.is_empty() {
            return Ok(None);
        }
        let ids: Vec<&EnvironmentId> = self.probabilities.keys().collect();
        let weights: Vec<f64> = self.probabilities.values().copied().collect();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SimulationError::PolicyContract(format!(
                "transition probabilities must be non-negative, got {weights:?}"
            )));
        }
        let distribution = WeightedIndex::new(&weights).map_err(|e| {
            SimulationError::PolicyContract(format!("invalid transition probabilities: {e}"))
        })?;
        Ok(Some(ids[distribution.sample(rng)].clone()))
    }
}

/// Everything an interaction reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionOutcome {
    pub update_data: UpdateData,
    pub transitions: Transitions,
}

/// A named operation between a patient and an environment.
///
/// Implemented for any `Fn(&mut PatientState, &mut EnvironmentState, DateTime<Utc>)` closure
/// with the right return type.
pub trait Interaction: Send + Sync {
    fn apply(
        &self,
        patient: &mut PatientState,
        environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
    ) -> SimulationResult<InteractionOutcome>;
}

impl<F> Interaction for F
where
    F: Fn(
            &mut PatientState,
            &mut EnvironmentState,
            DateTime<Utc>,
        ) -> SimulationResult<InteractionOutcome>
        + Send
        + Sync,
{
    fn apply(
        &self,
        patient: &mut PatientState,
        environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
    ) -> SimulationResult<InteractionOutcome> {
        self(patient, environment, patient_time)
    }
}

/// Built-in interaction: marks the patient deceased at the current patient time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Death;

impl Interaction for Death {
    fn apply(
        &self,
        patient: &mut PatientState,
        _environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
    ) -> SimulationResult<InteractionOutcome> {
        patient.mark_deceased(patient_time);
        Ok(InteractionOutcome::default())
    }
}

/// Name-to-interaction lookup shared by all patients of a simulation.
#[derive(Clone)]
pub struct InteractionRegistry {
    interactions: BTreeMap<String, Arc<dyn Interaction>>,
}

impl Default for InteractionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InteractionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.interactions.keys()).finish()
    }
}

impl InteractionRegistry {
    /// Creates a registry holding only the built-in interactions.
    pub fn new() -> Self {
        let mut interactions: BTreeMap<String, Arc<dyn Interaction>> = BTreeMap::new();
        interactions.insert(DEATH_INTERACTION.to_owned(), Arc::new(Death));
        Self { interactions }
    }

    /// Registers a custom interaction.
    ///
    /// # Errors
    ///
    /// Returns `ReservedInteractionName` for `death`, or `InvalidInput` if `name` is empty or
    /// already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        interaction: impl Interaction + 'static,
    ) -> SimulationResult<()> {
        let name = name.into();
        if name == DEATH_INTERACTION {
            return Err(SimulationError::ReservedInteractionName(name));
        }
        if name.trim().is_empty() {
            return Err(SimulationError::InvalidInput(
                "interaction name cannot be empty".into(),
            ));
        }
        if self.interactions.contains_key(&name) {
            return Err(SimulationError::InvalidInput(format!(
                "interaction '{name}' is already registered"
            )));
        }
        self.interactions.insert(name, Arc::new(interaction));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.interactions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.interactions.keys().map(String::as_str)
    }

    /// Runs the interaction registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownInteraction` if nothing is registered under `name`, or whatever the
    /// interaction returns.
    pub fn apply(
        &self,
        name: &str,
        patient: &mut PatientState,
        environment: &mut EnvironmentState,
        patient_time: DateTime<Utc>,
    ) -> SimulationResult<InteractionOutcome> {
        let interaction = self
            .interactions
            .get(name)
            .ok_or_else(|| SimulationError::UnknownInteraction(name.to_owned()))?;
        interaction.apply(patient, environment, patient_time)
    }
}
