//! Patient agent state.
//!
//! A [`PatientState`] owns the append-only record and the three projection tables derived from
//! it. Every successful [`PatientState::update`] re-folds the whole record into each table, so
//! the tables always agree with the record.

use crate::constants::{
    PATIENT_LOG_TARGET, PATIENT_PROFILE_TAG, PATIENT_RESOURCE_TYPE, PROFILE_ENVIRONMENT_ID,
};
use crate::projection::{ProjectionKind, ProjectionSeed, ProjectionTable};
use crate::record::{DuplicateAction, Payload, PatientRecord, RawEntry, RecordEntry, UpdateReport};
use crate::time::{format_date, serde_timestamp, serde_timestamp_opt};
use crate::{SimulationError, SimulationResult};
use abm_types::{EnvironmentId, Gender, NonEmptyText, PatientId};
use abm_uuid::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute names that additional fields may not reuse.
const PATIENT_CORE_FIELDS: [&str; 13] = [
    "id",
    "created_at",
    "patient_id",
    "gender",
    "birth_date",
    "start_time",
    "name",
    "alive",
    "inpatient",
    "record",
    "conditions",
    "medications",
    "actions",
];

/// Keys written into a synthesised profile payload.
const PROFILE_CORE_FIELDS: [&str; 6] =
    ["resource_type", "name", "start", "id", "gender", "birth_date"];

fn default_alive() -> bool {
    true
}

/// Construction parameters for a patient.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatientConfig {
    pub patient_id: PatientId,
    pub gender: Gender,
    #[serde(deserialize_with = "serde_timestamp::deserialize")]
    pub birth_date: DateTime<Utc>,
    /// Patient time at which the simulation starts. Defaults to `created_at`.
    #[serde(default, deserialize_with = "serde_timestamp_opt::deserialize")]
    pub start_time: Option<DateTime<Utc>>,
    /// Display name. Defaults to the patient id.
    #[serde(default)]
    pub name: Option<NonEmptyText>,
    /// Pre-existing record entries. A leading `Patient` entry becomes the profile.
    #[serde(default)]
    pub record: Vec<Payload>,
    #[serde(default)]
    pub conditions: Vec<ProjectionSeed>,
    #[serde(default)]
    pub medications: Vec<ProjectionSeed>,
    #[serde(default)]
    pub actions: Vec<ProjectionSeed>,
    #[serde(default)]
    pub conditions_custom_fields: Vec<String>,
    #[serde(default)]
    pub medications_custom_fields: Vec<String>,
    #[serde(default)]
    pub actions_custom_fields: Vec<String>,
    #[serde(default)]
    pub inpatient: Option<Value>,
    #[serde(default = "default_alive")]
    pub alive: bool,
    #[serde(default)]
    pub id: Option<AgentId>,
    #[serde(default, deserialize_with = "serde_timestamp_opt::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    /// Extra keys merged into the profile payload.
    #[serde(default)]
    pub profile_fields: BTreeMap<String, Value>,
    /// Free-form attributes carried alongside the patient.
    #[serde(default)]
    pub additional_fields: BTreeMap<String, Value>,
}

impl PatientConfig {
    pub fn new(patient_id: PatientId, gender: Gender, birth_date: DateTime<Utc>) -> Self {
        Self {
            patient_id,
            gender,
            birth_date,
            start_time: None,
            name: None,
            record: Vec::new(),
            conditions: Vec::new(),
            medications: Vec::new(),
            actions: Vec::new(),
            conditions_custom_fields: Vec::new(),
            medications_custom_fields: Vec::new(),
            actions_custom_fields: Vec::new(),
            inpatient: None,
            alive: true,
            id: None,
            created_at: None,
            profile_fields: BTreeMap::new(),
            additional_fields: BTreeMap::new(),
        }
    }
}

/// How much of the record [`PatientState::log_state`] includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLogScope {
    Omit,
    Last(usize),
    All,
}

/// The full state of one simulated patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientState {
    id: AgentId,
    created_at: DateTime<Utc>,
    patient_id: PatientId,
    gender: Gender,
    birth_date: DateTime<Utc>,
    start_time: DateTime<Utc>,
    name: NonEmptyText,
    alive: bool,
    inpatient: Option<Value>,
    record: PatientRecord,
    conditions: ProjectionTable,
    medications: ProjectionTable,
    actions: ProjectionTable,
    additional_fields: BTreeMap<String, Value>,
}

impl PatientState {
    /// Creates a patient with default settings.
    ///
    /// # Errors
    ///
    /// See [`PatientState::from_config`].
    pub fn new(
        patient_id: PatientId,
        gender: Gender,
        birth_date: DateTime<Utc>,
        start_time: DateTime<Utc>,
    ) -> SimulationResult<Self> {
        let mut config = PatientConfig::new(patient_id, gender, birth_date);
        config.start_time = Some(start_time);
        Self::from_config(config)
    }

    /// Creates a patient from construction parameters.
    ///
    /// The profile entry is placed at position 0. If `record` starts with a `Patient` entry
    /// that entry is used as the profile; otherwise one is synthesised from the demographics.
    /// Projection tables are seeded from the supplied rows and then folded over the record.
    ///
    /// # Errors
    ///
    /// Returns `FieldCollision` if an additional, profile or custom field reuses a reserved
    /// name, `DuplicateProjectionKey` for clashing seed rows, or any record append error.
    pub fn from_config(config: PatientConfig) -> SimulationResult<Self> {
        if let Some(field) = config
            .additional_fields
            .keys()
            .find(|k| PATIENT_CORE_FIELDS.contains(&k.as_str()))
        {
            return Err(SimulationError::FieldCollision {
                owner: "patient",
                field: field.clone(),
            });
        }
        if let Some(field) = config
            .profile_fields
            .keys()
            .find(|k| PROFILE_CORE_FIELDS.contains(&k.as_str()))
        {
            return Err(SimulationError::FieldCollision {
                owner: "patient profile",
                field: field.clone(),
            });
        }

        let created_at = config.created_at.unwrap_or_else(Utc::now);
        let start_time = config.start_time.unwrap_or(created_at);
        let name = match config.name {
            Some(name) => name,
            None => NonEmptyText::new(config.patient_id.as_str())?,
        };

        let mut existing = config.record;
        let mut profile_payload =
            if existing.first().and_then(Payload::resource_type) == Some(PATIENT_RESOURCE_TYPE) {
                existing.remove(0)
            } else {
                Payload::entry(PATIENT_RESOURCE_TYPE, config.patient_id.as_str(), start_time)
                    .with("id", config.patient_id.as_str())
                    .with("gender", config.gender.as_str())
                    .with("birth_date", format_date(config.birth_date))
            };
        for (key, value) in config.profile_fields {
            profile_payload.insert(key, value);
        }
        let record = PatientRecord::with_profile(
            profile_payload,
            start_time,
            created_at,
            PATIENT_PROFILE_TAG,
            EnvironmentId::from(PROFILE_ENVIRONMENT_ID),
        )?;

        let conditions = ProjectionTable::from_seeds(
            ProjectionKind::Conditions,
            config.conditions_custom_fields,
            config.conditions,
            created_at,
        )?;
        let medications = ProjectionTable::from_seeds(
            ProjectionKind::Medications,
            config.medications_custom_fields,
            config.medications,
            created_at,
        )?;
        let actions = ProjectionTable::from_seeds(
            ProjectionKind::Actions,
            config.actions_custom_fields,
            config.actions,
            created_at,
        )?;

        let mut patient = Self {
            id: config.id.unwrap_or_default(),
            created_at,
            patient_id: config.patient_id,
            gender: config.gender,
            birth_date: config.birth_date,
            start_time,
            name,
            alive: config.alive,
            inpatient: config.inpatient,
            record,
            conditions,
            medications,
            actions,
            additional_fields: config.additional_fields,
        };
        patient.refold()?;
        patient.update(
            existing.into_iter().map(RawEntry::Bare).collect(),
            DuplicateAction::Add,
        )?;
        Ok(patient)
    }

    /// Appends entries to the record and re-folds the projection tables.
    ///
    /// An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns any error from [`PatientRecord::append`]; the record and tables are unchanged
    /// in that case.
    pub fn update(
        &mut self,
        entries: Vec<RawEntry>,
        duplicate_action: DuplicateAction,
    ) -> SimulationResult<UpdateReport> {
        if entries.is_empty() {
            return Ok(UpdateReport::default());
        }
        let report = self
            .record
            .append(entries, duplicate_action, &self.patient_id)?;
        self.refold()?;
        Ok(report)
    }

    fn refold(&mut self) -> SimulationResult<()> {
        let entries = self.record.entries();
        self.conditions.fold(entries)?;
        self.medications.fold(entries)?;
        self.actions.fold(entries)?;
        Ok(())
    }

    /// Marks the patient deceased and closes the profile entry at `at`.
    pub fn mark_deceased(&mut self, at: DateTime<Utc>) {
        if let Some(profile) = self.record.profile_mut() {
            profile.close(at);
        }
        self.alive = false;
    }

    /// Sets an additional field.
    ///
    /// # Errors
    ///
    /// Returns `FieldCollision` if `key` is a built-in patient attribute.
    pub fn set_additional_field(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> SimulationResult<()> {
        let key = key.into();
        if PATIENT_CORE_FIELDS.contains(&key.as_str()) {
            return Err(SimulationError::FieldCollision {
                owner: "patient",
                field: key,
            });
        }
        self.additional_fields.insert(key, value.into());
        Ok(())
    }

    pub fn set_inpatient(&mut self, inpatient: Option<Value>) {
        self.inpatient = inpatient;
    }

    /// Emits the patient state on the patient log target.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the state cannot be encoded.
    pub fn log_state(&self, scope: RecordLogScope) -> SimulationResult<()> {
        let entries = self.record.entries();
        let record = match scope {
            RecordLogScope::Omit => &entries[..0],
            RecordLogScope::Last(n) => &entries[entries.len().saturating_sub(n)..],
            RecordLogScope::All => entries,
        };
        let last = entries.last();
        let summary = StateSummary {
            id: self.id,
            real_time_elapsed_ms: (Utc::now() - self.created_at).num_milliseconds(),
            patient_time_elapsed_seconds: last
                .map(|entry| (entry.patient_time() - self.start_time).num_seconds()),
            last_entry_resource_type: last.map(RecordEntry::resource_type),
            last_entry_real_time: last.map(RecordEntry::real_time),
            patient_id: &self.patient_id,
            gender: self.gender,
            birth_date: self.birth_date,
            start_time: self.start_time,
            name: &self.name,
            alive: self.alive,
            inpatient: self.inpatient.as_ref(),
            record_length: entries.len(),
            conditions: &self.conditions,
            medications: &self.medications,
            actions: &self.actions,
            additional_fields: &self.additional_fields,
            record,
        };
        let state = serde_json::to_string(&summary).map_err(SimulationError::Serialization)?;
        tracing::info!(target: PATIENT_LOG_TARGET, patient_id = %self.patient_id, "{state}");
        Ok(())
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn gender(&self) -> Gender {
        self.gender
    }

    pub fn birth_date(&self) -> DateTime<Utc> {
        self.birth_date
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn name(&self) -> &NonEmptyText {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn inpatient(&self) -> Option<&Value> {
        self.inpatient.as_ref()
    }

    pub fn record(&self) -> &[RecordEntry] {
        self.record.entries()
    }

    /// The profile entry at position 0.
    pub fn profile(&self) -> Option<&RecordEntry> {
        self.record.entries().first()
    }

    pub fn last_entry(&self) -> Option<&RecordEntry> {
        self.record.last()
    }

    pub fn conditions(&self) -> &ProjectionTable {
        &self.conditions
    }

    pub fn medications(&self) -> &ProjectionTable {
        &self.medications
    }

    pub fn actions(&self) -> &ProjectionTable {
        &self.actions
    }

    pub fn projection(&self, kind: ProjectionKind) -> &ProjectionTable {
        match kind {
            ProjectionKind::Conditions => &self.conditions,
            ProjectionKind::Medications => &self.medications,
            ProjectionKind::Actions => &self.actions,
        }
    }

    pub fn additional_fields(&self) -> &BTreeMap<String, Value> {
        &self.additional_fields
    }
}

#[derive(Serialize)]
struct StateSummary<'a> {
    id: AgentId,
    real_time_elapsed_ms: i64,
    patient_time_elapsed_seconds: Option<i64>,
    last_entry_resource_type: Option<&'a str>,
    last_entry_real_time: Option<DateTime<Utc>>,
    patient_id: &'a PatientId,
    gender: Gender,
    birth_date: DateTime<Utc>,
    start_time: DateTime<Utc>,
    name: &'a NonEmptyText,
    alive: bool,
    inpatient: Option<&'a Value>,
    record_length: usize,
    conditions: &'a ProjectionTable,
    medications: &'a ProjectionTable,
    actions: &'a ProjectionTable,
    additional_fields: &'a BTreeMap<String, Value>,
    record: &'a [RecordEntry],
}
