//! FHIR wire/boundary support for simulated patient records.
//!
//! This crate provides **wire models** and **format/translation helpers** for the interchange
//! bundle written at the end of each patient simulation:
//! - a transaction [`Bundle`] wrapping one resource per record entry
//! - a strict [`Patient`] resource model for the demographics entry
//!
//! This crate focuses on:
//! - structural validation (resource type and id present, no nested bundles)
//! - serialisation/deserialisation
//! - translation between domain carriers and wire structs
//!
//! Profile conformance checks against a FHIR server are out of scope.

pub mod bundle;
pub mod patient;

// Re-export facades
pub use bundle::Bundle;
pub use patient::Patient;

// Re-export public domain-level types
pub use bundle::{BundleData, BundleType, Resource};
pub use patient::PatientData;

/// Errors returned by the `abm-fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;
