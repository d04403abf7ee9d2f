//! Identifier utilities for simulation agents, record entries and simulation runs.
//!
//! Generated identifiers use a *canonical* UUID representation: **32 lowercase hexadecimal
//! characters** (no hyphens). The same value is embedded into file names and FHIR resource ids,
//! so it must never contain separators.
//!
//! This crate provides:
//! - [`EntryId`], the identifier of one patient record entry.
//! - [`AgentId`], the internal identity of a patient or environment agent instance.
//! - [`SimulationId`], the identifier of one patient's simulation run. It is either a canonical
//!   UUID or a caller-supplied, path-safe name such as `simulation_for_patient_7`.
//!
//! ## Canonical UUID form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! Non-canonical values (uppercase, hyphenated, wrong length, non-hex) are rejected by the
//! `parse` constructors.

mod service;

// Re-export public types
pub use service::{AgentId, EntryId, SimulationId, Uuid};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
