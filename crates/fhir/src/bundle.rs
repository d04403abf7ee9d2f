//! FHIR transaction bundle wire model and translation helpers.
//!
//! Responsibilities:
//! - Define the public domain-level carrier ([`BundleData`]) for a list of resources
//! - Define a strict wire model for serialisation/deserialisation
//! - Validate each resource structurally before it is wrapped
//!
//! Notes:
//! - Each entry carries a `POST <resourceType>` request so the file can be submitted to a
//!   server as a transaction without further processing

use crate::{FhirError, FhirResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// A single FHIR resource as a JSON object.
pub type Resource = Map<String, Value>;

const BUNDLE_RESOURCE_TYPE: &str = "Bundle";

// ============================================================================
// Public domain-level types
// ============================================================================

/// Bundle type as defined by the FHIR `bundle-type` value set (subset).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    #[default]
    Transaction,
    Batch,
    Collection,
}

/// Domain-level carrier for a bundle of resources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BundleData {
    pub bundle_type: BundleType,
    pub resources: Vec<Resource>,
}

// ============================================================================
// Public Bundle operations
// ============================================================================

/// Bundle operations.
///
/// This is a zero-sized type used for namespacing bundle-related operations.
/// All methods are associated functions.
pub struct Bundle;

impl Bundle {
    /// Build a bundle from a list of resources, validating each one.
    ///
    /// # Arguments
    ///
    /// * `bundle_type` - Bundle type to declare.
    /// * `resources` - Resources to wrap, in record order.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Validation`] naming the offending entry index if any resource fails
    /// [`Bundle::validate_resource`].
    pub fn build(bundle_type: BundleType, resources: Vec<Resource>) -> FhirResult<BundleData> {
        for (index, resource) in resources.iter().enumerate() {
            Self::validate_resource(resource)
                .map_err(|e| FhirError::Validation(format!("entry {index}: {e}")))?;
        }
        Ok(BundleData {
            bundle_type,
            resources,
        })
    }

    /// Structurally validate a single resource.
    ///
    /// A valid resource has a non-empty string `resourceType` other than `Bundle` and a non-empty
    /// string `id`.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Validation`] describing the first violated rule.
    pub fn validate_resource(resource: &Resource) -> FhirResult<()> {
        let resource_type = match resource.get("resourceType") {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(other) => {
                return Err(FhirError::Validation(format!(
                    "resourceType must be a non-empty string, got {other}"
                )))
            }
            None => return Err(FhirError::Validation("missing resourceType".into())),
        };
        if resource_type == BUNDLE_RESOURCE_TYPE {
            return Err(FhirError::Validation(
                "nested Bundle resources are not supported".into(),
            ));
        }
        match resource.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(()),
            _ => Err(FhirError::Validation(format!(
                "{resource_type} resource is missing a non-empty string id"
            ))),
        }
    }

    /// Render a bundle as pretty-printed JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if a resource is structurally invalid or serialisation fails.
    pub fn render(data: &BundleData) -> FhirResult<String> {
        let wire = domain_to_wire(data)?;
        serde_json::to_string_pretty(&wire)
            .map_err(|e| FhirError::Translation(format!("Failed to serialise bundle: {e}")))
    }

    /// Parse a bundle from JSON text.
    ///
    /// This uses `serde_path_to_error` to surface a best-effort "path" (e.g. `entry.0.request`)
    /// to the failing field when the JSON does not match the wire schema.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if:
    /// - the JSON does not match the bundle wire schema,
    /// - any unknown keys are present on the bundle or its entries,
    /// - resourceType is not "Bundle",
    /// - any resource fails structural validation or its request URL does not match it.
    pub fn parse(json_text: &str) -> FhirResult<BundleData> {
        let mut deserializer = serde_json::Deserializer::from_str(json_text);

        let wire = match serde_path_to_error::deserialize::<_, BundleWire>(&mut deserializer) {
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
                    "Bundle schema mismatch at {path}: {source}"
                )));
            }
        };

        if wire.resource_type != BUNDLE_RESOURCE_TYPE {
            return Err(FhirError::InvalidInput(format!(
                "Expected resourceType 'Bundle', got '{}'",
                wire.resource_type
            )));
        }

        wire_to_domain(wire)
    }

    /// Render a bundle and write it to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if rendering fails or the file cannot be written.
    pub fn write(data: &BundleData, path: &Path) -> FhirResult<()> {
        let text = Self::render(data)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct BundleWire {
    #[serde(rename = "resourceType")]
    pub resource_type: String,

    #[serde(rename = "type")]
    pub bundle_type: BundleType,

    #[serde(default)]
    pub entry: Vec<BundleEntryWire>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct BundleEntryWire {
    pub resource: Resource,

    pub request: BundleRequestWire,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct BundleRequestWire {
    pub method: String,

    pub url: String,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn resource_type_of(resource: &Resource) -> &str {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn domain_to_wire(data: &BundleData) -> FhirResult<BundleWire> {
    let entry = data
        .resources
        .iter()
        .enumerate()
        .map(|(index, resource)| {
            Bundle::validate_resource(resource)
                .map_err(|e| FhirError::Validation(format!("entry {index}: {e}")))?;
            Ok(BundleEntryWire {
                resource: resource.clone(),
                request: BundleRequestWire {
                    method: "POST".to_string(),
                    url: resource_type_of(resource).to_string(),
                },
            })
        })
        .collect::<FhirResult<Vec<_>>>()?;

    Ok(BundleWire {
        resource_type: BUNDLE_RESOURCE_TYPE.to_string(),
        bundle_type: data.bundle_type,
        entry,
    })
}

fn wire_to_domain(wire: BundleWire) -> FhirResult<BundleData> {
    let mut resources = Vec::with_capacity(wire.entry.len());
    for (index, entry) in wire.entry.into_iter().enumerate() {
        Bundle::validate_resource(&entry.resource)
            .map_err(|e| FhirError::Validation(format!("entry {index}: {e}")))?;
        let resource_type = resource_type_of(&entry.resource);
        if entry.request.url != resource_type {
            return Err(FhirError::Validation(format!(
                "entry {index}: request url '{}' does not match resourceType '{resource_type}'",
                entry.request.url
            )));
        }
        resources.push(entry.resource);
    }
    Ok(BundleData {
        bundle_type: wire.bundle_type,
        resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn resource(value: Value) -> Resource {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn condition() -> Resource {
        resource(json!({
            "resourceType": "Condition",
            "id": "0f6c5d7e0d3b4e1e9d1c7b1a2f3e4d5c",
            "name": "Diabetes",
            "code": 44054006
        }))
    }

    #[test]
    fn round_trips_transaction_bundle() {
        let data = Bundle::build(BundleType::Transaction, vec![condition()]).expect("build");
        let text = Bundle::render(&data).expect("render");
        assert!(text.contains("\"method\": \"POST\""));
        assert!(text.contains("\"url\": \"Condition\""));

        let parsed = Bundle::parse(&text).expect("parse");
        assert_eq!(parsed, data);
    }

    #[test]
    fn rejects_nested_bundle() {
        let nested = resource(json!({"resourceType": "Bundle", "id": "abc"}));
        let err = Bundle::build(BundleType::Transaction, vec![condition(), nested])
            .expect_err("nested bundle should be rejected");
        match err {
            FhirError::Validation(msg) => {
                assert!(msg.contains("entry 1"));
                assert!(msg.contains("nested Bundle"));
            }
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_resource_without_id() {
        let missing_id = resource(json!({"resourceType": "Observation"}));
        let err = Bundle::validate_resource(&missing_id).expect_err("missing id should fail");
        match err {
            FhirError::Validation(msg) => assert!(msg.contains("Observation")),
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn strict_validation_rejects_unknown_keys() {
        let input = r#"{"resourceType": "Bundle", "type": "transaction", "entry": [], "extra": 1}"#;
        let err = Bundle::parse(input).expect_err("should reject unknown key");
        match err {
            FhirError::Translation(msg) => assert!(msg.contains("extra")),
            other => panic!("expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_mismatched_request_url() {
        let input = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{
                "resource": {"resourceType": "Condition", "id": "a"},
                "request": {"method": "POST", "url": "Observation"}
            }]
        })
        .to_string();
        let err = Bundle::parse(&input).expect_err("should reject mismatched url");
        assert!(matches!(err, FhirError::Validation(_)));
    }

    #[test]
    fn writes_bundle_creating_parent_dirs() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("fhir").join("bundle.json");
        let data = Bundle::build(BundleType::Transaction, vec![condition()]).expect("build");

        Bundle::write(&data, &path).expect("write");

        let text = fs::read_to_string(&path).expect("read back");
        assert_eq!(Bundle::parse(&text).expect("parse"), data);
    }
}
