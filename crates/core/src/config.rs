//! Simulation configuration.
//!
//! A [`SimulationConfig`] is read once, from YAML or JSON text, and then turned into the
//! patients, environments, initial placements and run settings the driver needs. Schema
//! mismatches are reported with the path of the failing field.
//!
//! ```yaml
//! patients:
//!   - patient_id: 0
//!     gender: female
//!     birth_date: 1985-05-24
//! environments: environments.json
//! initial_environment_ids:
//!   from_id: 0
//! stopping_condition:
//!   max_patient_time:
//!     days: 365
//! log_every: 10
//! save_dir: ./output
//! seed: 42
//! ```

use crate::constants::{DEFAULT_HARD_STOP, DEFAULT_LOG_EVERY, DEFAULT_WORKERS};
use crate::environment::{EnvironmentConfig, EnvironmentState};
use crate::patient::{PatientConfig, PatientState};
use crate::record::DuplicateAction;
use crate::simulation::RunSettings;
use crate::stopping::StoppingCondition;
use crate::{SimulationError, SimulationResult};
use abm_types::EnvironmentId;
use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

fn default_log_every() -> u64 {
    DEFAULT_LOG_EVERY
}

fn default_hard_stop() -> u64 {
    DEFAULT_HARD_STOP
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_true() -> bool {
    true
}

/// Agents given inline or as a path to a JSON/YAML list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AgentSource {
    Inline(Vec<Value>),
    File(PathBuf),
}

impl AgentSource {
    fn load(&self, base_dir: Option<&Path>) -> SimulationResult<Vec<Value>> {
        match self {
            AgentSource::Inline(values) => Ok(values.clone()),
            AgentSource::File(path) => read_list(&resolve_path(path, base_dir)),
        }
    }
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    pub patients: AgentSource,
    pub environments: AgentSource,
    /// Single-entry map naming the placement method.
    pub initial_environment_ids: BTreeMap<String, Value>,
    /// Single-entry map naming the stopping condition.
    pub stopping_condition: BTreeMap<String, Value>,
    #[serde(default = "default_log_every")]
    pub log_every: u64,
    #[serde(default)]
    pub log_intermediate: bool,
    #[serde(default = "default_hard_stop")]
    pub hard_stop: u64,
    #[serde(default = "default_true")]
    pub log_patient_record: bool,
    #[serde(default)]
    pub patient_record_duplicate_action: DuplicateAction,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub simulation_id_prefix: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Directory that relative paths are resolved against; set by [`SimulationConfig::from_path`].
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl SimulationConfig {
    /// Parses configuration text. JSON is accepted as a subset of YAML.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the failing field path if the text does not match the
    /// schema, including unknown keys.
    pub fn from_yaml_str(text: &str) -> SimulationResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(text);
        serde_path_to_error::deserialize(deserializer).map_err(|err| {
            let path = err.path().to_string();
            let source = err.into_inner();
            SimulationError::InvalidConfig(format!("schema mismatch at {path}: {source}"))
        })
    }

    /// Reads and parses a configuration file. Relative paths inside it resolve against the
    /// file's directory.
    ///
    /// # Errors
    ///
    /// Returns `FileRead` if the file cannot be read, or any error from
    /// [`SimulationConfig::from_yaml_str`].
    pub fn from_path(path: &Path) -> SimulationResult<Self> {
        let text = fs::read_to_string(path).map_err(SimulationError::FileRead)?;
        let mut config = Self::from_yaml_str(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Builds the patients in configuration order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the patient index and field path on a schema mismatch,
    /// or any construction error from [`PatientState::from_config`].
    pub fn load_patients(&self) -> SimulationResult<Vec<PatientState>> {
        self.patients
            .load(self.base_dir.as_deref())?
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let config: PatientConfig = from_value("patients", index, value)?;
                PatientState::from_config(config)
            })
            .collect()
    }

    /// Builds the environments in configuration order.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEnvironmentId` if two environments share an id, `InvalidConfig` on a
    /// schema mismatch, or any construction error from [`EnvironmentState::from_config`].
    pub fn load_environments(&self) -> SimulationResult<Vec<EnvironmentState>> {
        let mut seen = BTreeSet::new();
        self.environments
            .load(self.base_dir.as_deref())?
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let config: EnvironmentConfig = from_value("environments", index, value)?;
                if !seen.insert(config.environment_id.clone()) {
                    return Err(SimulationError::DuplicateEnvironmentId(
                        config.environment_id.to_string(),
                    ));
                }
                EnvironmentState::from_config(config)
            })
            .collect()
    }

    /// # Errors
    ///
    /// See [`StoppingCondition::from_map`].
    pub fn stopping_condition(&self) -> SimulationResult<StoppingCondition> {
        StoppingCondition::from_map(&self.stopping_condition)
    }

    /// # Errors
    ///
    /// See [`InitialEnvironmentSelection::parse`].
    pub fn initial_environment_selection(&self) -> SimulationResult<InitialEnvironmentSelection> {
        InitialEnvironmentSelection::parse(&self.initial_environment_ids)
    }

    /// Collects the per-run settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `log_every` is zero, or any stopping condition error.
    pub fn run_settings(&self) -> SimulationResult<RunSettings> {
        if self.log_every == 0 {
            return Err(SimulationError::InvalidConfig(
                "log_every must be at least 1".into(),
            ));
        }
        Ok(RunSettings {
            stopping_condition: self.stopping_condition()?,
            log_every: self.log_every,
            log_intermediate: self.log_intermediate,
            hard_stop: self.hard_stop,
            log_patient_record: self.log_patient_record,
            duplicate_action: self.patient_record_duplicate_action,
        })
    }
}

/// How each patient's first environment is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialEnvironmentSelection {
    /// One id shared by every patient, or one id per patient.
    FromId(Vec<EnvironmentId>),
    /// One probability per environment, in configuration order.
    FromProbability(Vec<f64>),
    /// Exactly one id per patient.
    FromList(Vec<EnvironmentId>),
    /// A JSON/YAML file holding exactly one id per patient.
    FromFile(PathBuf),
}

impl InitialEnvironmentSelection {
    /// Parses a single-entry `{method: value}` map.
    ///
    /// `from_json` is accepted as another name for `from_file`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownInitialEnvironmentMethod` for an unrecognised method, or
    /// `InvalidConfig` if the map does not have exactly one entry or the value has the wrong
    /// shape.
    pub fn parse(map: &BTreeMap<String, Value>) -> SimulationResult<Self> {
        let mut entries = map.iter();
        let (method, value) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(SimulationError::InvalidConfig(format!(
                    "initial_environment_ids must have exactly one entry, got {}",
                    map.len()
                )))
            }
        };

        match method.as_str() {
            "from_id" => match value {
                Value::Array(_) => Ok(Self::FromId(typed(method, value)?)),
                _ => Ok(Self::FromId(vec![typed(method, value)?])),
            },
            "from_probability" => Ok(Self::FromProbability(typed(method, value)?)),
            "from_list" => Ok(Self::FromList(typed(method, value)?)),
            "from_file" | "from_json" => Ok(Self::FromFile(typed(method, value)?)),
            other => Err(SimulationError::UnknownInitialEnvironmentMethod(
                other.to_owned(),
            )),
        }
    }

    /// Picks an initial environment for each of `patient_count` patients.
    ///
    /// A single `from_id` id is repeated for every patient. Every other id list must hold
    /// exactly one id per patient. Probabilities are sampled with `rng`.
    ///
    /// # Errors
    ///
    /// Returns `InitialEnvironmentCount` if the number of ids fits neither rule,
    /// `UnknownEnvironment` if an id is not among `environment_ids`, or `InvalidConfig` if the
    /// probabilities do not match the environments or are not a valid distribution.
    pub fn resolve(
        &self,
        environment_ids: &[EnvironmentId],
        patient_count: usize,
        rng: &mut dyn RngCore,
        base_dir: Option<&Path>,
    ) -> SimulationResult<Vec<EnvironmentId>> {
        let ids = match self {
            Self::FromId(ids) => match ids.as_slice() {
                [single] => vec![single.clone(); patient_count],
                _ => one_per_patient(ids.clone(), patient_count)?,
            },
            Self::FromList(ids) => one_per_patient(ids.clone(), patient_count)?,
            Self::FromFile(path) => {
                let values = read_list(&resolve_path(path, base_dir))?;
                let ids = values
                    .into_iter()
                    .enumerate()
                    .map(|(index, value)| from_value("initial_environment_ids", index, value))
                    .collect::<SimulationResult<Vec<EnvironmentId>>>()?;
                one_per_patient(ids, patient_count)?
            }
            Self::FromProbability(probabilities) => {
                if probabilities.len() != environment_ids.len() {
                    return Err(SimulationError::InvalidConfig(format!(
                        "from_probability has {} probabilities for {} environments",
                        probabilities.len(),
                        environment_ids.len()
                    )));
                }
                let distribution = WeightedIndex::new(probabilities).map_err(|e| {
                    SimulationError::InvalidConfig(format!("invalid from_probability: {e}"))
                })?;
                (0..patient_count)
                    .map(|_| environment_ids[distribution.sample(&mut *rng)].clone())
                    .collect()
            }
        };

        if let Some(unknown) = ids.iter().find(|id| !environment_ids.contains(id)) {
            return Err(SimulationError::UnknownEnvironment(unknown.to_string()));
        }
        Ok(ids)
    }
}

fn one_per_patient(
    ids: Vec<EnvironmentId>,
    patient_count: usize,
) -> SimulationResult<Vec<EnvironmentId>> {
    if ids.len() == patient_count {
        Ok(ids)
    } else {
        Err(SimulationError::InitialEnvironmentCount {
            patients: patient_count,
            ids: ids.len(),
        })
    }
}

fn typed<T: DeserializeOwned>(method: &str, value: &Value) -> SimulationResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| SimulationError::InvalidConfig(format!("invalid {method} value: {e}")))
}

fn from_value<T: DeserializeOwned>(
    section: &str,
    index: usize,
    value: Value,
) -> SimulationResult<T> {
    serde_path_to_error::deserialize(value).map_err(|err| {
        let path = err.path().to_string();
        let source = err.into_inner();
        SimulationError::InvalidConfig(format!("{section}[{index}] at {path}: {source}"))
    })
}

fn resolve_path(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

fn read_list(path: &Path) -> SimulationResult<Vec<Value>> {
    let text = fs::read_to_string(path).map_err(SimulationError::FileRead)?;
    serde_yaml::from_str(&text).map_err(SimulationError::YamlDeserialization)
}
