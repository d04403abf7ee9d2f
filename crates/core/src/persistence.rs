//! On-disk layout and agent snapshots for a simulation run.
//!
//! Every run that has an output directory writes into `<save_dir>/<simulation_id>/`:
//!
//! ```text
//! <simulation_id>/
//!   main.log
//!   patient.log
//!   agents/
//!     patient_<patient_id>.json
//!     environment_<environment_id>.json
//!   fhir/
//!     bundle.json
//! ```
//!
//! Snapshots are the serde form of [`PatientState`] and [`EnvironmentState`]; loading one
//! rebuilds an equal value.

use crate::constants::{
    AGENTS_DIR_NAME, BUNDLE_FILENAME, FHIR_DIR_NAME, MAIN_LOG_FILENAME, PATIENT_LOG_FILENAME,
};
use crate::environment::EnvironmentState;
use crate::patient::PatientState;
use crate::{SimulationError, SimulationResult};
use abm_types::{EnvironmentId, PatientId};
use abm_uuid::SimulationId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Paths of one simulation directory. No I/O happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPaths {
    root: PathBuf,
}

impl SimulationPaths {
    pub fn new(save_dir: &Path, simulation_id: &SimulationId) -> Self {
        Self {
            root: save_dir.join(simulation_id.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn main_log(&self) -> PathBuf {
        self.root.join(MAIN_LOG_FILENAME)
    }

    pub fn patient_log(&self) -> PathBuf {
        self.root.join(PATIENT_LOG_FILENAME)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join(AGENTS_DIR_NAME)
    }

    pub fn bundle(&self) -> PathBuf {
        self.root.join(FHIR_DIR_NAME).join(BUNDLE_FILENAME)
    }
}

/// Reads and writes agent snapshots under a simulation directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    paths: SimulationPaths,
}

impl SnapshotStore {
    pub fn new(paths: SimulationPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &SimulationPaths {
        &self.paths
    }

    /// Writes `patient_<id>.json`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the patient id is not usable as a file name, or an I/O or
    /// serialisation error.
    pub fn save_patient(&self, patient: &PatientState) -> SimulationResult<PathBuf> {
        let path = self.snapshot_path("patient", patient.patient_id().as_str())?;
        write_json(&path, patient)?;
        Ok(path)
    }

    /// # Errors
    ///
    /// Returns `FileRead` if the snapshot does not exist, or `Deserialization` if it is not a
    /// valid patient snapshot.
    pub fn load_patient(&self, patient_id: &PatientId) -> SimulationResult<PatientState> {
        read_json(&self.snapshot_path("patient", patient_id.as_str())?)
    }

    /// Writes `environment_<id>.json`.
    ///
    /// # Errors
    ///
    /// As for [`SnapshotStore::save_patient`].
    pub fn save_environment(&self, environment: &EnvironmentState) -> SimulationResult<PathBuf> {
        let path = self.snapshot_path("environment", environment.environment_id().as_str())?;
        write_json(&path, environment)?;
        Ok(path)
    }

    /// # Errors
    ///
    /// As for [`SnapshotStore::load_patient`].
    pub fn load_environment(
        &self,
        environment_id: &EnvironmentId,
    ) -> SimulationResult<EnvironmentState> {
        read_json(&self.snapshot_path("environment", environment_id.as_str())?)
    }

    fn snapshot_path(&self, kind: &str, id: &str) -> SimulationResult<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && id != "."
            && id != "..";
        if !safe {
            return Err(SimulationError::InvalidInput(format!(
                "{kind} id '{id}' cannot be used in a snapshot file name"
            )));
        }
        Ok(self.paths.agents_dir().join(format!("{kind}_{id}.json")))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> SimulationResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(SimulationError::DirCreation)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(SimulationError::Serialization)?;
    fs::write(path, json).map_err(SimulationError::FileWrite)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> SimulationResult<T> {
    let contents = fs::read_to_string(path).map_err(SimulationError::FileRead)?;
    serde_json::from_str(&contents).map_err(SimulationError::Deserialization)
}
