//! Append-only patient record.
//!
//! A record is an ordered list of [`RecordEntry`] values. Position 0 always holds the patient
//! profile. Entries are never removed or reordered; the only in-place change is closing the
//! profile when the patient dies.
//!
//! Appending runs three checks per entry, in this order:
//! - Bundle-typed entries are rejected outright and nothing from the batch is appended
//! - an entry whose payload equals an existing payload is a duplicate; it is appended or
//!   skipped according to [`DuplicateAction`], with a warning either way
//! - an entry whose patient time is earlier than the last entry's patient time is appended
//!   with a warning

use crate::constants::{BUNDLE_RESOURCE_TYPE, PATIENT_LOG_TARGET, PATIENT_RESOURCE_TYPE};
use crate::time::{format_timestamp, timestamp_from_value};
use crate::{SimulationError, SimulationResult};
use abm_types::{EnvironmentId, PatientId};
use abm_uuid::EntryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Payload
// ============================================================================

/// Opaque clinical payload of a record entry.
///
/// Every payload carries at least `name`, `start` and `resource_type`. `end` is optional; a
/// `null` end is the same as no end. Timestamps are stored as RFC 3339 text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a payload with the three required keys.
    pub fn entry(resource_type: &str, name: &str, start: DateTime<Utc>) -> Self {
        Self::new()
            .with("resource_type", resource_type)
            .with("name", name)
            .with_time("start", start)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wraps a JSON value, which must be an object.
    pub fn from_value(value: Value) -> SimulationResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SimulationError::InvalidInput(format!(
                "record entry payload must be an object, got {other}"
            ))),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_time(mut self, key: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        self.insert(key, format_timestamp(timestamp));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.0.get("resource_type").and_then(Value::as_str)
    }

    /// Returns the parsed `start` timestamp.
    ///
    /// # Errors
    ///
    /// Returns `MissingPayloadField` if absent and `InvalidTimestamp` if unparseable.
    pub fn start(&self) -> SimulationResult<DateTime<Utc>> {
        match self.0.get("start") {
            None | Some(Value::Null) => Err(SimulationError::MissingPayloadField("start")),
            Some(value) => parse_field("start", value),
        }
    }

    /// Returns the parsed `end` timestamp, or `None` when absent or null.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimestamp` if present but unparseable.
    pub fn end(&self) -> SimulationResult<Option<DateTime<Utc>>> {
        match self.0.get("end") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_field("end", value).map(Some),
        }
    }

    /// Checks the required keys and the Bundle restriction.
    pub fn validate(&self) -> SimulationResult<()> {
        let resource_type = self
            .resource_type()
            .ok_or(SimulationError::MissingPayloadField("resource_type"))?;
        if resource_type == BUNDLE_RESOURCE_TYPE {
            return Err(SimulationError::BundleEntry);
        }
        if self.name().is_none() {
            return Err(SimulationError::MissingPayloadField("name"));
        }
        self.start()?;
        self.end()?;
        Ok(())
    }
}

fn parse_field(field: &str, value: &Value) -> SimulationResult<DateTime<Utc>> {
    timestamp_from_value(value).ok_or_else(|| SimulationError::InvalidTimestamp {
        field: field.to_owned(),
        value: value.to_string(),
    })
}

// ============================================================================
// Entries
// ============================================================================

/// What to do with an entry whose payload already appears in the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    #[default]
    Add,
    Skip,
}

/// One immutable entry of a patient record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    entry_id: EntryId,
    record_index: usize,
    real_time: DateTime<Utc>,
    patient_time: DateTime<Utc>,
    environment_id: Option<EnvironmentId>,
    interactions: Option<Vec<String>>,
    simulation_step: Option<u64>,
    resource_type: String,
    tag: Option<String>,
    fhir_resource: Option<Map<String, Value>>,
    payload: Payload,
}

impl RecordEntry {
    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn record_index(&self) -> usize {
        self.record_index
    }

    pub fn real_time(&self) -> DateTime<Utc> {
        self.real_time
    }

    pub fn patient_time(&self) -> DateTime<Utc> {
        self.patient_time
    }

    pub fn environment_id(&self) -> Option<&EnvironmentId> {
        self.environment_id.as_ref()
    }

    pub fn interactions(&self) -> Option<&[String]> {
        self.interactions.as_deref()
    }

    pub fn simulation_step(&self) -> Option<u64> {
        self.simulation_step
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Raw FHIR overlay supplied when the entry was wrapped.
    pub fn fhir_resource(&self) -> Option<&Map<String, Value>> {
        self.fhir_resource.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Sets the `end` of the payload. Only used to close the profile entry.
    pub(crate) fn close(&mut self, end: DateTime<Utc>) {
        self.payload.insert("end", format_timestamp(end));
    }

    /// Merges extra keys into the payload. Only used while building the profile entry.
    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }
}

/// An entry that has been wrapped with its context but not yet appended.
///
/// Fields left as `None` are filled at append time: `real_time` with the current wall clock
/// and `entry_id` with a fresh id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub payload: Payload,
    pub patient_time: DateTime<Utc>,
    pub real_time: Option<DateTime<Utc>>,
    pub environment_id: Option<EnvironmentId>,
    pub interactions: Option<Vec<String>>,
    pub simulation_step: Option<u64>,
    pub tag: Option<String>,
    pub fhir_resource: Option<Map<String, Value>>,
    pub entry_id: Option<EntryId>,
}

impl PendingEntry {
    /// Wraps a payload at the given patient time.
    pub fn wrap(payload: Payload, patient_time: DateTime<Utc>) -> Self {
        Self {
            payload,
            patient_time,
            real_time: None,
            environment_id: None,
            interactions: None,
            simulation_step: None,
            tag: None,
            fhir_resource: None,
            entry_id: None,
        }
    }

    /// Wraps a bare payload, taking the patient time from its `end`, or `start` if open.
    pub fn from_payload(payload: Payload) -> SimulationResult<Self> {
        let patient_time = match payload.end()? {
            Some(end) => end,
            None => payload.start()?,
        };
        Ok(Self::wrap(payload, patient_time))
    }

    pub fn environment(mut self, environment_id: EnvironmentId) -> Self {
        self.environment_id = Some(environment_id);
        self
    }

    pub fn interactions(mut self, interactions: Vec<String>) -> Self {
        self.interactions = Some(interactions);
        self
    }

    pub fn step(mut self, step: u64) -> Self {
        self.simulation_step = Some(step);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn fhir_resource(mut self, resource: Map<String, Value>) -> Self {
        self.fhir_resource = Some(resource);
        self
    }

    pub fn real_time(mut self, real_time: DateTime<Utc>) -> Self {
        self.real_time = Some(real_time);
        self
    }

    pub fn entry_id(mut self, entry_id: EntryId) -> Self {
        self.entry_id = Some(entry_id);
        self
    }

    fn into_entry(self, record_index: usize) -> SimulationResult<RecordEntry> {
        let resource_type = self
            .payload
            .resource_type()
            .ok_or(SimulationError::MissingPayloadField("resource_type"))?
            .to_owned();
        Ok(RecordEntry {
            entry_id: self.entry_id.unwrap_or_default(),
            record_index,
            real_time: self.real_time.unwrap_or_else(Utc::now),
            patient_time: self.patient_time,
            environment_id: self.environment_id,
            interactions: self.interactions,
            simulation_step: self.simulation_step,
            resource_type,
            tag: self.tag,
            fhir_resource: self.fhir_resource,
            payload: self.payload,
        })
    }
}

/// Input to [`PatientRecord::append`]: either already wrapped or a bare payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEntry {
    Wrapped(PendingEntry),
    Bare(Payload),
}

impl RawEntry {
    fn payload(&self) -> &Payload {
        match self {
            RawEntry::Wrapped(pending) => &pending.payload,
            RawEntry::Bare(payload) => payload,
        }
    }

    fn into_pending(self) -> SimulationResult<PendingEntry> {
        match self {
            RawEntry::Wrapped(pending) => Ok(pending),
            RawEntry::Bare(payload) => PendingEntry::from_payload(payload),
        }
    }
}

impl From<PendingEntry> for RawEntry {
    fn from(pending: PendingEntry) -> Self {
        RawEntry::Wrapped(pending)
    }
}

impl From<Payload> for RawEntry {
    fn from(payload: Payload) -> Self {
        RawEntry::Bare(payload)
    }
}

/// Counts reported by one append call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub appended: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub out_of_order: usize,
}

// ============================================================================
// Record
// ============================================================================

/// The append-only list of entries for one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientRecord(Vec<RecordEntry>);

impl PatientRecord {
    /// Creates a record whose first entry is the patient profile.
    pub(crate) fn with_profile(
        payload: Payload,
        patient_time: DateTime<Utc>,
        real_time: DateTime<Utc>,
        tag: &str,
        environment_id: EnvironmentId,
    ) -> SimulationResult<Self> {
        if payload.resource_type() != Some(PATIENT_RESOURCE_TYPE) {
            return Err(SimulationError::InvalidInput(
                "the first record entry must be a Patient profile".into(),
            ));
        }
        let profile = PendingEntry::wrap(payload, patient_time)
            .real_time(real_time)
            .environment(environment_id)
            .tag(tag)
            .into_entry(0)?;
        Ok(Self(vec![profile]))
    }

    pub fn entries(&self) -> &[RecordEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&RecordEntry> {
        self.0.last()
    }

    pub(crate) fn profile_mut(&mut self) -> Option<&mut RecordEntry> {
        self.0.first_mut()
    }

    /// Appends a batch of entries.
    ///
    /// # Arguments
    ///
    /// * `raw_entries` - Entries to append, in order.
    /// * `duplicate_action` - Whether duplicate payloads are appended or skipped.
    /// * `patient_id` - Used only to label warnings.
    ///
    /// # Returns
    ///
    /// Returns an [`UpdateReport`] with per-check counts.
    ///
    /// # Errors
    ///
    /// Returns `BundleEntry` if any entry is a Bundle, or a payload error if any entry lacks a
    /// required field. The whole batch is validated first, so on error nothing is appended.
    pub fn append(
        &mut self,
        raw_entries: Vec<RawEntry>,
        duplicate_action: DuplicateAction,
        patient_id: &PatientId,
    ) -> SimulationResult<UpdateReport> {
        for raw in &raw_entries {
            raw.payload().validate()?;
        }
        let pending = raw_entries
            .into_iter()
            .map(RawEntry::into_pending)
            .collect::<SimulationResult<Vec<_>>>()?;

        let mut report = UpdateReport::default();
        for entry in pending {
            if self.0.iter().any(|existing| existing.payload == entry.payload) {
                report.duplicates += 1;
                let verb = match duplicate_action {
                    DuplicateAction::Add => "Adding",
                    DuplicateAction::Skip => "Skipping",
                };
                let payload = Value::Object(entry.payload.as_map().clone());
                tracing::warn!(
                    target: PATIENT_LOG_TARGET,
                    patient_id = %patient_id,
                    "entry {payload} already in the patient record. {verb}"
                );
                if duplicate_action == DuplicateAction::Skip {
                    report.skipped += 1;
                    continue;
                }
            }

            if let Some(last) = self.0.last() {
                if entry.patient_time < last.patient_time {
                    report.out_of_order += 1;
                    tracing::warn!(
                        target: PATIENT_LOG_TARGET,
                        patient_id = %patient_id,
                        "entry patient_time {} is earlier than the last entry patient_time {}",
                        format_timestamp(entry.patient_time),
                        format_timestamp(last.patient_time)
                    );
                }
            }

            let record_index = self.0.len();
            self.0.push(entry.into_entry(record_index)?);
            report.appended += 1;
        }
        Ok(report)
    }
}
