//! Runs the step loop once per patient.
//!
//! Patients never share mutable state: each run gets its own clone of every environment and
//! its own random source, so runs are independent and may execute on a worker pool. Results
//! come back in patient order whatever the completion order.
//!
//! When a save directory is configured each run writes its snapshots, logs and bundle under
//! `<save_dir>/<simulation_id>/` (see [`crate::persistence`]). Bundle generation is best
//! effort; a failure is logged and the run still succeeds.

use crate::config::SimulationConfig;
use crate::constants::{FREQUENT_LOGGING_THRESHOLD, MAIN_LOG_TARGET};
use crate::environment::EnvironmentState;
use crate::intelligence::Intelligence;
use crate::interaction::InteractionRegistry;
use crate::interchange::{BundleGenerator, RecordBundleGenerator};
use crate::logging::simulation_dispatch;
use crate::patient::PatientState;
use crate::persistence::{SimulationPaths, SnapshotStore};
use crate::simulation::{PatientSimulation, RunSettings, SimulationOutcome};
use crate::{SimulationError, SimulationResult};
use abm_fhir::Bundle;
use abm_types::{EnvironmentId, PatientId};
use abm_uuid::SimulationId;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of one patient's run.
#[derive(Debug)]
pub struct PatientRun {
    pub patient_id: PatientId,
    pub result: SimulationResult<SimulationOutcome>,
}

/// Runs every patient of a simulation.
pub struct SimulationDriver {
    patients: Vec<PatientState>,
    environments: BTreeMap<EnvironmentId, EnvironmentState>,
    initial_environment_ids: Vec<EnvironmentId>,
    registry: InteractionRegistry,
    intelligence: Box<dyn Intelligence>,
    settings: RunSettings,
    bundle_generator: Arc<dyn BundleGenerator>,
    save_dir: Option<PathBuf>,
    simulation_id_prefix: Option<String>,
    seed: Option<u64>,
    workers: usize,
}

impl SimulationDriver {
    /// Creates a driver over already-built agents.
    ///
    /// # Arguments
    ///
    /// * `patients` - Patients to simulate, in output order.
    /// * `environments` - Environments every patient gets a copy of.
    /// * `initial_environment_ids` - One starting environment per patient.
    /// * `registry` - Interactions available to the intelligence.
    /// * `intelligence` - Decision policy shared by all runs.
    /// * `settings` - Stopping condition and logging settings.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEnvironmentId` for repeated environment ids, `UnknownInteraction` if an
    /// environment names an unregistered interaction, `InitialEnvironmentCount` if there is not
    /// one starting environment per patient, or `UnknownEnvironment` for a starting
    /// environment that does not exist.
    pub fn new(
        patients: Vec<PatientState>,
        environments: Vec<EnvironmentState>,
        initial_environment_ids: Vec<EnvironmentId>,
        registry: InteractionRegistry,
        intelligence: impl Intelligence + 'static,
        settings: RunSettings,
    ) -> SimulationResult<Self> {
        let mut by_id = BTreeMap::new();
        for environment in environments {
            if let Some(name) = environment
                .interactions()
                .find(|name| !registry.contains(name))
            {
                return Err(SimulationError::UnknownInteraction(name.to_owned()));
            }
            let id = environment.environment_id().clone();
            if by_id.insert(id.clone(), environment).is_some() {
                return Err(SimulationError::DuplicateEnvironmentId(id.to_string()));
            }
        }

        if initial_environment_ids.len() != patients.len() {
            return Err(SimulationError::InitialEnvironmentCount {
                patients: patients.len(),
                ids: initial_environment_ids.len(),
            });
        }
        if let Some(unknown) = initial_environment_ids
            .iter()
            .find(|id| !by_id.contains_key(*id))
        {
            return Err(SimulationError::UnknownEnvironment(unknown.to_string()));
        }

        if settings.log_every < FREQUENT_LOGGING_THRESHOLD {
            tracing::warn!(
                target: MAIN_LOG_TARGET,
                log_every = settings.log_every,
                "logging every {} steps; frequent logging slows the simulation down",
                settings.log_every
            );
        }

        Ok(Self {
            patients,
            environments: by_id,
            initial_environment_ids,
            registry,
            intelligence: Box::new(intelligence),
            settings,
            bundle_generator: Arc::new(RecordBundleGenerator),
            save_dir: None,
            simulation_id_prefix: None,
            seed: None,
            workers: 1,
        })
    }

    /// Builds a driver from a loaded configuration.
    ///
    /// Initial environments are resolved with a random source seeded from `seed` when one is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns any configuration, agent construction or validation error.
    pub fn from_config(
        config: &SimulationConfig,
        registry: InteractionRegistry,
        intelligence: impl Intelligence + 'static,
    ) -> SimulationResult<Self> {
        let settings = config.run_settings()?;
        let patients = config.load_patients()?;
        let environments = config.load_environments()?;
        let environment_ids: Vec<EnvironmentId> = environments
            .iter()
            .map(|env| env.environment_id().clone())
            .collect();

        let mut rng = seeded_rng(config.seed);
        let initial_environment_ids = config.initial_environment_selection()?.resolve(
            &environment_ids,
            patients.len(),
            &mut rng,
            config.base_dir.as_deref(),
        )?;

        let mut driver = Self::new(
            patients,
            environments,
            initial_environment_ids,
            registry,
            intelligence,
            settings,
        )?
        .with_workers(config.workers)?;
        driver.save_dir = config.save_dir.clone();
        driver.simulation_id_prefix = config.simulation_id_prefix.clone();
        driver.seed = config.seed;
        Ok(driver)
    }

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(save_dir.into());
        self
    }

    /// Names each run `<prefix>_<patient_id>` instead of a random id.
    pub fn with_simulation_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.simulation_id_prefix = Some(prefix.into());
        self
    }

    /// Makes runs reproducible: patient `i` uses `seed + i`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` if `workers` is zero.
    pub fn with_workers(mut self, workers: usize) -> SimulationResult<Self> {
        if workers == 0 {
            return Err(SimulationError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        self.workers = workers;
        Ok(self)
    }

    pub fn with_bundle_generator(mut self, generator: impl BundleGenerator + 'static) -> Self {
        self.bundle_generator = Arc::new(generator);
        self
    }

    pub fn patients(&self) -> &[PatientState] {
        &self.patients
    }

    pub fn initial_environment_ids(&self) -> &[EnvironmentId] {
        &self.initial_environment_ids
    }

    /// Runs every patient.
    ///
    /// A failing patient run is reported in its [`PatientRun`] and does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPool` if the worker pool cannot be created.
    pub fn run(&self) -> SimulationResult<Vec<PatientRun>> {
        tracing::info!(
            target: MAIN_LOG_TARGET,
            patients = self.patients.len(),
            workers = self.workers,
            "starting simulation"
        );

        let runs = if self.workers <= 1 {
            self.patients
                .iter()
                .enumerate()
                .map(|(index, patient)| self.run_patient(index, patient))
                .collect()
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .build()
                .map_err(|e| SimulationError::WorkerPool(e.to_string()))?;
            pool.install(|| {
                self.patients
                    .par_iter()
                    .enumerate()
                    .map(|(index, patient)| self.run_patient(index, patient))
                    .collect()
            })
        };
        Ok(runs)
    }

    fn run_patient(&self, index: usize, patient: &PatientState) -> PatientRun {
        let result = self.simulate_patient(index, patient);
        if let Err(err) = &result {
            tracing::error!(
                target: MAIN_LOG_TARGET,
                patient_id = %patient.patient_id(),
                error = %err,
                "patient simulation failed"
            );
        }
        PatientRun {
            patient_id: patient.patient_id().clone(),
            result,
        }
    }

    fn simulate_patient(
        &self,
        index: usize,
        patient: &PatientState,
    ) -> SimulationResult<SimulationOutcome> {
        let simulation_id = match &self.simulation_id_prefix {
            Some(prefix) => SimulationId::for_patient(prefix, patient.patient_id().as_str())?,
            None => SimulationId::new(),
        };

        match &self.save_dir {
            Some(save_dir) => {
                let paths = SimulationPaths::new(save_dir, &simulation_id);
                if paths.root().exists() {
                    tracing::warn!(
                        target: MAIN_LOG_TARGET,
                        simulation_id = %simulation_id,
                        "simulation directory already exists; output will be appended"
                    );
                }
                let dispatch = simulation_dispatch(&paths)?;
                tracing::dispatcher::with_default(&dispatch, || -> SimulationResult<_> {
                    let outcome = self.simulate(index, patient, simulation_id)?;
                    self.persist(&outcome, SnapshotStore::new(paths))?;
                    Ok(outcome)
                })
            }
            None => self.simulate(index, patient, simulation_id),
        }
    }

    fn simulate(
        &self,
        index: usize,
        patient: &PatientState,
        simulation_id: SimulationId,
    ) -> SimulationResult<SimulationOutcome> {
        let mut rng = seeded_rng(self.seed.map(|seed| seed.wrapping_add(index as u64)));
        let simulation = PatientSimulation::new(
            simulation_id,
            &self.registry,
            self.intelligence.as_ref(),
            &self.settings,
        );
        simulation.run(
            patient.clone(),
            self.environments.clone(),
            &self.initial_environment_ids[index],
            &mut rng,
        )
    }

    fn persist(&self, outcome: &SimulationOutcome, store: SnapshotStore) -> SimulationResult<()> {
        store.save_patient(&outcome.patient)?;
        for environment in outcome.environments.values() {
            store.save_environment(environment)?;
        }

        let bundle_path = store.paths().bundle();
        let written = self
            .bundle_generator
            .generate(&outcome.patient, &outcome.environments)
            .and_then(|bundle| Bundle::write(&bundle, &bundle_path));
        if let Err(err) = written {
            tracing::error!(
                target: MAIN_LOG_TARGET,
                simulation_id = %outcome.simulation_id,
                error = %err,
                "failed to write FHIR bundle; continuing without it"
            );
        }
        Ok(())
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
