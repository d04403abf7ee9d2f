//! FHIR-aligned patient wire model and translation helpers.
//!
//! This module provides both the domain-level carrier and the wire model for the Patient
//! resource exported from a simulated patient's demographics.
//!
//! Responsibilities:
//! - Define a public domain-level type for the demographics that survive export
//! - Define a strict wire model for serialisation/deserialisation
//! - Provide translation helpers between the domain carrier and the wire model

use crate::bundle::Resource;
use crate::{FhirError, FhirResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Public domain-level types
// ============================================================================

/// Domain-level carrier for patient demographics (flat structure).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatientData {
    /// Resource id.
    pub id: String,

    /// Display name, exported as `name[0].text`.
    pub name: Option<String>,

    /// Administrative gender (`male` / `female`).
    pub gender: Option<String>,

    /// Date of birth (ISO 8601 date format: YYYY-MM-DD).
    pub birth_date: Option<String>,

    /// Date and time of death, when the patient died during the simulation.
    pub deceased_date_time: Option<String>,
}

// ============================================================================
// Public Patient operations
// ============================================================================

/// Patient resource operations.
///
/// This is a zero-sized type used for namespacing patient-related operations.
/// All methods are associated functions.
pub struct Patient;

impl Patient {
    /// Render patient demographics as a JSON resource object.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the id is empty, or
    /// [`FhirError::Translation`] if serialisation fails.
    pub fn to_resource(data: &PatientData) -> FhirResult<Resource> {
        if data.id.trim().is_empty() {
            return Err(FhirError::InvalidInput("Patient id cannot be empty".into()));
        }
        let wire = domain_to_wire(data);
        match serde_json::to_value(&wire) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(FhirError::Translation(format!(
                "Patient serialised to a non-object value: {other}"
            ))),
            Err(e) => Err(FhirError::Translation(format!(
                "Failed to serialise patient: {e}"
            ))),
        }
    }

    /// Parse patient demographics from a JSON resource object.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if:
    /// - the resource does not match the wire schema,
    /// - any unknown keys are present (due to `#[serde(deny_unknown_fields)]`),
    /// - resourceType is not "Patient".
    pub fn from_resource(resource: &Resource) -> FhirResult<PatientData> {
        let value = Value::Object(resource.clone());
        let wire = match serde_path_to_error::deserialize::<_, PatientWire>(value) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() {
                    "<root>"
                } else {
                    path.as_str()
                };
                return Err(FhirError::Translation(format!(
                    "Patient schema mismatch at {path}: {source}"
                )));
            }
        };

        if wire.resource_type != "Patient" {
            return Err(FhirError::InvalidInput(format!(
                "Expected resourceType 'Patient', got '{}'",
                wire.resource_type
            )));
        }

        Ok(wire_to_domain(wire))
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct PatientWire {
    #[serde(rename = "resourceType")]
    pub resource_type: String,

    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name: Vec<HumanNameWire>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,

    #[serde(rename = "birthDate", skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,

    #[serde(rename = "deceasedDateTime", skip_serializing_if = "Option::is_none")]
    pub deceased_date_time: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct HumanNameWire {
    pub text: String,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn wire_to_domain(wire: PatientWire) -> PatientData {
    PatientData {
        id: wire.id,
        name: wire.name.into_iter().next().map(|n| n.text),
        gender: wire.gender,
        birth_date: wire.birth_date,
        deceased_date_time: wire.deceased_date_time,
    }
}

fn domain_to_wire(data: &PatientData) -> PatientWire {
    PatientWire {
        resource_type: "Patient".to_string(),
        id: data.id.clone(),
        name: data
            .name
            .iter()
            .map(|text| HumanNameWire { text: text.clone() })
            .collect(),
        gender: data.gender.clone(),
        birth_date: data.birth_date.clone(),
        deceased_date_time: data.deceased_date_time.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_patient_resource() {
        let data = PatientData {
            id: "1".into(),
            name: Some("Jane Doe".into()),
            gender: Some("female".into()),
            birth_date: Some("1985-05-24".into()),
            deceased_date_time: None,
        };

        let resource = Patient::to_resource(&data).expect("render");
        assert_eq!(resource.get("birthDate"), Some(&json!("1985-05-24")));
        assert!(resource.get("deceasedDateTime").is_none());

        let parsed = Patient::from_resource(&resource).expect("parse");
        assert_eq!(parsed, data);
    }

    #[test]
    fn strict_validation_rejects_unknown_keys() {
        let resource = match json!({"resourceType": "Patient", "id": "1", "unexpected_key": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = Patient::from_resource(&resource).expect_err("should reject unknown key");
        match err {
            FhirError::Translation(msg) => assert!(msg.contains("unexpected_key")),
            other => panic!("expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_resource_type() {
        let resource = match json!({"resourceType": "Condition", "id": "1"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = Patient::from_resource(&resource).expect_err("should reject resourceType");
        match err {
            FhirError::InvalidInput(msg) => assert!(msg.contains("Condition")),
            other => panic!("expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_id() {
        let err = Patient::to_resource(&PatientData::default()).expect_err("empty id");
        assert!(matches!(err, FhirError::InvalidInput(_)));
    }
}
