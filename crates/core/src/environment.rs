//! Care environment agent state.
//!
//! An environment is a setting a patient can occupy (A&E, GP surgery, ward, ...). It holds
//! the names of the interactions available there, per-patient data handed over by those
//! interactions, and a per-patient history of visits.

use crate::constants::DEATH_INTERACTION;
use crate::patient::PatientState;
use crate::time::{serde_timestamp, serde_timestamp_opt};
use crate::{SimulationError, SimulationResult};
use abm_types::{EnvironmentId, NonEmptyText, PatientId};
use abm_uuid::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const ENVIRONMENT_CORE_FIELDS: [&str; 14] = [
    "id",
    "created_at",
    "environment_id",
    "environment_type",
    "name",
    "patient_present",
    "location",
    "organization",
    "practitioners",
    "interactions",
    "patient_data",
    "patient_interaction_history",
    "capacity",
    "wait_time",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    #[serde(rename = "a_and_e")]
    AAndE,
    Gp,
    Community,
    Outpatient,
    Inpatient,
    #[default]
    Generic,
}

impl EnvironmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentType::AAndE => "a_and_e",
            EnvironmentType::Gp => "gp",
            EnvironmentType::Community => "community",
            EnvironmentType::Outpatient => "outpatient",
            EnvironmentType::Inpatient => "inpatient",
            EnvironmentType::Generic => "generic",
        }
    }
}

/// One point of a step schedule: `value` applies from `time` until the next point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePoint {
    #[serde(with = "serde_timestamp")]
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// One visit of a patient to an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub time: DateTime<Utc>,
    pub last_record_index: usize,
    pub interactions: Option<Vec<String>>,
}

/// Construction parameters for an environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub environment_id: EnvironmentId,
    #[serde(default, alias = "type")]
    pub environment_type: EnvironmentType,
    /// Display name. Defaults to the environment type.
    #[serde(default)]
    pub name: Option<NonEmptyText>,
    #[serde(default)]
    pub patient_present: bool,
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub organization: Option<Value>,
    #[serde(default)]
    pub practitioners: Vec<Value>,
    #[serde(default)]
    pub interactions: Vec<String>,
    #[serde(default)]
    pub capacity: Vec<SchedulePoint>,
    #[serde(default)]
    pub wait_time: Vec<SchedulePoint>,
    #[serde(default)]
    pub id: Option<AgentId>,
    #[serde(default, deserialize_with = "serde_timestamp_opt::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub additional_fields: BTreeMap<String, Value>,
}

impl EnvironmentConfig {
    pub fn new(environment_id: EnvironmentId, environment_type: EnvironmentType) -> Self {
        Self {
            environment_id,
            environment_type,
            name: None,
            patient_present: false,
            location: None,
            organization: None,
            practitioners: Vec::new(),
            interactions: Vec::new(),
            capacity: Vec::new(),
            wait_time: Vec::new(),
            id: None,
            created_at: None,
            additional_fields: BTreeMap::new(),
        }
    }

    pub fn with_interactions<I, S>(mut self, interactions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interactions = interactions.into_iter().map(Into::into).collect();
        self
    }
}

/// The full state of one care environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    id: AgentId,
    created_at: DateTime<Utc>,
    environment_id: EnvironmentId,
    environment_type: EnvironmentType,
    name: NonEmptyText,
    patient_present: bool,
    location: Option<Value>,
    organization: Option<Value>,
    practitioners: Vec<Value>,
    interactions: BTreeSet<String>,
    patient_data: BTreeMap<PatientId, Vec<Value>>,
    patient_interaction_history: BTreeMap<PatientId, Vec<VisitRecord>>,
    capacity: Vec<SchedulePoint>,
    wait_time: Vec<SchedulePoint>,
    additional_fields: BTreeMap<String, Value>,
}

impl EnvironmentState {
    /// Creates an environment with default settings and the given interactions.
    ///
    /// # Errors
    ///
    /// See [`EnvironmentState::from_config`].
    pub fn new<I, S>(
        environment_id: EnvironmentId,
        environment_type: EnvironmentType,
        interactions: I,
    ) -> SimulationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_config(
            EnvironmentConfig::new(environment_id, environment_type)
                .with_interactions(interactions),
        )
    }

    /// Creates an environment from construction parameters.
    ///
    /// The interaction set always contains `death`. Schedules are sorted by time.
    ///
    /// # Errors
    ///
    /// Returns `FieldCollision` if an additional field reuses a built-in attribute name.
    pub fn from_config(config: EnvironmentConfig) -> SimulationResult<Self> {
        if let Some(field) = config
            .additional_fields
            .keys()
            .find(|k| ENVIRONMENT_CORE_FIELDS.contains(&k.as_str()))
        {
            return Err(SimulationError::FieldCollision {
                owner: "environment",
                field: field.clone(),
            });
        }

        let name = match config.name {
            Some(name) => name,
            None => NonEmptyText::new(config.environment_type.as_str())?,
        };
        let mut interactions: BTreeSet<String> = config.interactions.into_iter().collect();
        interactions.insert(DEATH_INTERACTION.to_owned());

        let mut capacity = config.capacity;
        capacity.sort_by_key(|point| point.time);
        let mut wait_time = config.wait_time;
        wait_time.sort_by_key(|point| point.time);

        Ok(Self {
            id: config.id.unwrap_or_default(),
            created_at: config.created_at.unwrap_or_else(Utc::now),
            environment_id: config.environment_id,
            environment_type: config.environment_type,
            name,
            patient_present: config.patient_present,
            location: config.location,
            organization: config.organization,
            practitioners: config.practitioners,
            interactions,
            patient_data: BTreeMap::new(),
            patient_interaction_history: BTreeMap::new(),
            capacity,
            wait_time,
            additional_fields: config.additional_fields,
        })
    }

    /// Records the patient's latest step in this environment.
    ///
    /// Appends a [`VisitRecord`] built from the patient's last record entry and extends the
    /// patient's data list with `patient_data`, if any.
    pub fn update(&mut self, patient: &PatientState, patient_data: Option<Vec<Value>>) {
        let patient_id = patient.patient_id();
        if let Some(last) = patient.last_entry() {
            self.patient_interaction_history
                .entry(patient_id.clone())
                .or_default()
                .push(VisitRecord {
                    time: last.patient_time(),
                    last_record_index: last.record_index(),
                    interactions: last.interactions().map(<[String]>::to_vec),
                });
        }
        if let Some(data) = patient_data {
            self.patient_data
                .entry(patient_id.clone())
                .or_default()
                .extend(data);
        }
    }

    /// Capacity in effect at `time`, or `None` before the first schedule point.
    pub fn capacity_at(&self, time: DateTime<Utc>) -> Option<f64> {
        schedule_value_at(&self.capacity, time)
    }

    /// Wait time in effect at `time`, or `None` before the first schedule point.
    pub fn wait_time_at(&self, time: DateTime<Utc>) -> Option<f64> {
        schedule_value_at(&self.wait_time, time)
    }

    pub fn set_patient_present(&mut self, present: bool) {
        self.patient_present = present;
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn environment_id(&self) -> &EnvironmentId {
        &self.environment_id
    }

    pub fn environment_type(&self) -> EnvironmentType {
        self.environment_type
    }

    pub fn name(&self) -> &NonEmptyText {
        &self.name
    }

    pub fn patient_present(&self) -> bool {
        self.patient_present
    }

    pub fn location(&self) -> Option<&Value> {
        self.location.as_ref()
    }

    pub fn organization(&self) -> Option<&Value> {
        self.organization.as_ref()
    }

    pub fn practitioners(&self) -> &[Value] {
        &self.practitioners
    }

    /// Interaction names in sorted order.
    pub fn interactions(&self) -> impl Iterator<Item = &str> {
        self.interactions.iter().map(String::as_str)
    }

    pub fn has_interaction(&self, name: &str) -> bool {
        self.interactions.contains(name)
    }

    pub fn patient_data(&self, patient_id: &PatientId) -> &[Value] {
        self.patient_data
            .get(patient_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn interaction_history(&self, patient_id: &PatientId) -> &[VisitRecord] {
        self.patient_interaction_history
            .get(patient_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn additional_fields(&self) -> &BTreeMap<String, Value> {
        &self.additional_fields
    }
}

fn schedule_value_at(schedule: &[SchedulePoint], time: DateTime<Utc>) -> Option<f64> {
    schedule
        .iter()
        .take_while(|point| point.time <= time)
        .last()
        .map(|point| point.value)
}
