//! Export of a patient record as an interchange bundle.
//!
//! The mapping is structural only: every record entry becomes one resource carrying the
//! entry's payload fields, with the entry's raw overlay (if any) merged over the result.
//! Field-level clinical mappings are left to the overlay.

use crate::constants::PATIENT_RESOURCE_TYPE;
use crate::environment::EnvironmentState;
use crate::patient::PatientState;
use crate::record::RecordEntry;
use crate::time::{format_date, format_timestamp};
use abm_fhir::{Bundle, BundleData, BundleType, FhirResult, Patient, PatientData, Resource};
use abm_types::EnvironmentId;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Turns a finished patient run into a bundle.
pub trait BundleGenerator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`abm_fhir::FhirError`] if a resource cannot be built or fails validation.
    fn generate(
        &self,
        patient: &PatientState,
        environments: &BTreeMap<EnvironmentId, EnvironmentState>,
    ) -> FhirResult<BundleData>;
}

impl<F> BundleGenerator for F
where
    F: Fn(&PatientState, &BTreeMap<EnvironmentId, EnvironmentState>) -> FhirResult<BundleData>
        + Send
        + Sync,
{
    fn generate(
        &self,
        patient: &PatientState,
        environments: &BTreeMap<EnvironmentId, EnvironmentState>,
    ) -> FhirResult<BundleData> {
        self(patient, environments)
    }
}

/// Default generator: one resource per record entry, in record order, in a transaction bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordBundleGenerator;

impl BundleGenerator for RecordBundleGenerator {
    fn generate(
        &self,
        patient: &PatientState,
        _environments: &BTreeMap<EnvironmentId, EnvironmentState>,
    ) -> FhirResult<BundleData> {
        let resources = patient
            .record()
            .iter()
            .map(|entry| entry_to_resource(patient, entry))
            .collect::<FhirResult<Vec<_>>>()?;
        Bundle::build(BundleType::Transaction, resources)
    }
}

/// Converts one record entry into a resource.
///
/// The profile entry goes through [`Patient::to_resource`]; everything else copies the payload
/// and adds a `subject` reference by display name.
///
/// # Errors
///
/// Returns [`abm_fhir::FhirError`] if the profile cannot be rendered.
pub fn entry_to_resource(patient: &PatientState, entry: &RecordEntry) -> FhirResult<Resource> {
    let mut resource = if entry.resource_type() == PATIENT_RESOURCE_TYPE {
        let end = entry.payload().end().ok().flatten();
        Patient::to_resource(&PatientData {
            id: entry.entry_id().to_string(),
            name: Some(patient.name().to_string()),
            gender: Some(patient.gender().as_str().to_owned()),
            birth_date: Some(format_date(patient.birth_date())),
            deceased_date_time: end.map(format_timestamp),
        })?
    } else {
        let mut resource: Resource = entry
            .payload()
            .as_map()
            .iter()
            .filter(|(key, _)| key.as_str() != "resource_type")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        resource.insert(
            "resourceType".into(),
            Value::String(entry.resource_type().to_owned()),
        );
        resource.insert("id".into(), Value::String(entry.entry_id().to_string()));
        resource.insert(
            "subject".into(),
            json!({ "display": patient.name().as_str() }),
        );
        resource
    };

    if let Some(overlay) = entry.fhir_resource() {
        for (key, value) in overlay {
            resource.insert(key.clone(), value.clone());
        }
    }
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DuplicateAction, Payload, PendingEntry, RawEntry};
    use crate::time::parse_timestamp;
    use abm_types::{Gender, PatientId};
    use chrono::{DateTime, Utc};
    use serde_json::Map;

    fn ts(text: &str) -> DateTime<Utc> {
        parse_timestamp(text).expect("valid timestamp")
    }

    fn patient_with_history() -> PatientState {
        let mut patient =
            PatientState::new(PatientId::from(7), Gender::Male, ts("1970-03-02"), ts("2021-01-01"))
                .expect("patient");
        let mut overlay = Map::new();
        overlay.insert("status".into(), json!("active"));
        let entries = vec![
            RawEntry::from(
                PendingEntry::wrap(
                    Payload::entry("Condition", "Diabetes", ts("2021-01-05")).with("code", "E11"),
                    ts("2021-01-05"),
                )
                .fhir_resource(overlay),
            ),
            RawEntry::from(Payload::entry("Encounter", "GP visit", ts("2021-01-06"))),
        ];
        patient
            .update(entries, DuplicateAction::Add)
            .expect("update");
        patient
    }

    #[test]
    fn record_becomes_transaction_bundle() {
        let patient = patient_with_history();

        let bundle = RecordBundleGenerator
            .generate(&patient, &BTreeMap::new())
            .expect("bundle");

        assert_eq!(bundle.bundle_type, BundleType::Transaction);
        let types: Vec<&str> = bundle
            .resources
            .iter()
            .filter_map(|r| r.get("resourceType").and_then(Value::as_str))
            .collect();
        assert_eq!(types, vec!["Patient", "Condition", "Encounter"]);

        let rendered = Bundle::render(&bundle).expect("render");
        let parsed = Bundle::parse(&rendered).expect("parse");
        assert_eq!(parsed.resources.len(), 3);
    }

    #[test]
    fn entry_resource_carries_payload_subject_and_overlay() {
        let patient = patient_with_history();
        let entry = &patient.record()[1];

        let resource = entry_to_resource(&patient, entry).expect("resource");

        assert_eq!(resource.get("id"), Some(&json!(entry.entry_id().to_string())));
        assert_eq!(resource.get("code"), Some(&json!("E11")));
        assert_eq!(resource.get("status"), Some(&json!("active")));
        assert_eq!(resource.get("subject"), Some(&json!({"display": "7"})));
        assert!(resource.get("resource_type").is_none());
    }

    #[test]
    fn profile_resource_records_death() {
        let mut patient = patient_with_history();
        patient.mark_deceased(ts("2021-02-01"));

        let resource = entry_to_resource(&patient, &patient.record()[0]).expect("resource");
        let data = Patient::from_resource(&resource).expect("patient data");

        assert_eq!(data.gender.as_deref(), Some("male"));
        assert_eq!(data.birth_date.as_deref(), Some("1970-03-02"));
        assert_eq!(data.deceased_date_time.as_deref(), Some("2021-02-01T00:00:00Z"));
    }

    #[test]
    fn closure_generators_are_accepted() {
        let failing = |_: &PatientState,
                       _: &BTreeMap<EnvironmentId, EnvironmentState>|
         -> FhirResult<BundleData> {
            Err(abm_fhir::FhirError::Validation("rejected".into()))
        };
        let generator: &dyn BundleGenerator = &failing;

        let err = generator
            .generate(&patient_with_history(), &BTreeMap::new())
            .expect_err("generator should fail");
        assert!(err.to_string().contains("rejected"));
    }
}
