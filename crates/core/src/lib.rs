//! # ABM Core
//!
//! Agent-based simulation of patients moving through care environments.
//!
//! A simulation is made of:
//! - patients ([`PatientState`]), each owning an append-only record and three projection
//!   tables derived from it (conditions, medications, actions)
//! - environments ([`EnvironmentState`]) offering named interactions
//! - an [`Intelligence`] that decides, step by step, which interactions run and where the
//!   patient goes next
//! - a [`StoppingCondition`] that ends each run
//!
//! [`PatientSimulation`] runs the step loop for one patient. [`SimulationDriver`] runs every
//! patient of a [`SimulationConfig`], optionally on a worker pool, and persists the results.
//!
//! **No CLI concerns**: argument parsing and process setup belong to the embedding program.

pub mod config;
pub mod constants;
pub mod driver;
pub mod duration;
pub mod environment;
pub mod error;
pub mod intelligence;
pub mod interaction;
pub mod interchange;
pub mod logging;
pub mod patient;
pub mod persistence;
pub mod projection;
pub mod record;
pub mod simulation;
pub mod stopping;
pub mod time;

pub use config::{AgentSource, InitialEnvironmentSelection, SimulationConfig};
pub use driver::{PatientRun, SimulationDriver};
pub use duration::{DurationSpec, TimeUnit};
pub use environment::{EnvironmentConfig, EnvironmentState, EnvironmentType, SchedulePoint};
pub use error::{SimulationError, SimulationResult};
pub use intelligence::{Decision, Intelligence, RandomIntelligence};
pub use interaction::{
    Death, Interaction, InteractionOutcome, InteractionRegistry, Transitions, UpdateData,
};
pub use interchange::{BundleGenerator, RecordBundleGenerator};
pub use patient::{PatientConfig, PatientState, RecordLogScope};
pub use persistence::{SimulationPaths, SnapshotStore};
pub use projection::{ProjectionKind, ProjectionRow, ProjectionSeed, ProjectionTable};
pub use record::{
    DuplicateAction, PatientRecord, Payload, PendingEntry, RawEntry, RecordEntry, UpdateReport,
};
pub use simulation::{
    LoopState, PatientSimulation, RealClock, RunSettings, RunStatus, SimulationOutcome,
    StepLogMessage, StopReason, SystemClock,
};
pub use stopping::{Clocks, StoppingCondition, StoppingKind};

pub use abm_types::{EnvironmentId, Gender, NonEmptyText, PatientId};
pub use abm_uuid::{AgentId, EntryId, SimulationId};
