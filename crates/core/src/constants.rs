//! Constants used throughout the simulation core crate.
//!
//! Names that appear in persisted output (file names, log targets, tags) live here so the
//! on-disk layout stays consistent across modules.

/// Name of the built-in interaction that ends a patient's life.
pub const DEATH_INTERACTION: &str = "death";

/// Resource type of the patient profile entry.
pub const PATIENT_RESOURCE_TYPE: &str = "Patient";

/// Resource type that may never be appended to a patient record.
pub const BUNDLE_RESOURCE_TYPE: &str = "Bundle";

/// Tag carried by the profile entry at position 0 of every record.
pub const PATIENT_PROFILE_TAG: &str = "patient_profile";

/// Environment id recorded on the profile entry.
pub const PROFILE_ENVIRONMENT_ID: i64 = -1;

/// Record index given to bulk-imported projection rows that have no record entry.
pub const IMPORTED_RECORD_INDEX: i64 = -1;

/// Tracing target for step-level simulation messages.
pub const MAIN_LOG_TARGET: &str = "abm::main";

/// Tracing target for patient state and record messages.
pub const PATIENT_LOG_TARGET: &str = "abm::patient";

/// Filename for the step-level log inside a simulation directory.
pub const MAIN_LOG_FILENAME: &str = "main.log";

/// Filename for the patient log inside a simulation directory.
pub const PATIENT_LOG_FILENAME: &str = "patient.log";

/// Directory name for agent snapshots inside a simulation directory.
pub const AGENTS_DIR_NAME: &str = "agents";

/// Directory name for interchange output inside a simulation directory.
pub const FHIR_DIR_NAME: &str = "fhir";

/// Filename for the interchange bundle.
pub const BUNDLE_FILENAME: &str = "bundle.json";

/// Default ceiling on the number of steps of one simulation.
pub const DEFAULT_HARD_STOP: u64 = 100_000_000;

/// Default logging cadence, in steps.
pub const DEFAULT_LOG_EVERY: u64 = 1;

/// Logging cadences below this value produce a warning.
pub const FREQUENT_LOGGING_THRESHOLD: u64 = 5;

/// Default worker count for the simulation driver.
pub const DEFAULT_WORKERS: usize = 1;
