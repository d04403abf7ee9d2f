#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    #[error("invalid value: {0}")]
    InvalidValue(#[from] abm_types::TypesError),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] abm_uuid::UuidError),

    #[error("there are multiple environments with the same ID '{0}'; environment IDs must be unique")]
    DuplicateEnvironmentId(String),
    #[error("invalid stopping condition '{0}'; must be one of 'max_num_steps', 'max_patient_time' or 'max_real_time'")]
    UnknownStoppingCondition(String),
    #[error("invalid initial environment method '{0}'; must be one of 'from_id', 'from_probability', 'from_list' or 'from_file'")]
    UnknownInitialEnvironmentMethod(String),
    #[error("there are {patients} patients but {ids} initial environment IDs")]
    InitialEnvironmentCount { patients: usize, ids: usize },
    #[error("environment '{0}' is not present in the list of environments")]
    UnknownEnvironment(String),
    #[error("interaction '{0}' is not registered")]
    UnknownInteraction(String),
    #[error("'{0}' is a reserved interaction name")]
    ReservedInteractionName(String),
    #[error("field '{field}' collides with a built-in {owner} field")]
    FieldCollision { owner: &'static str, field: String },

    #[error("cannot update patient record with a FHIR Bundle")]
    BundleEntry,
    #[error("{table} table must have unique (name, start) pairs; found duplicate ({name}, {start})")]
    DuplicateProjectionKey {
        table: &'static str,
        name: String,
        start: String,
    },
    #[error("record entry payload is missing required field '{0}'")]
    MissingPayloadField(&'static str),
    #[error("invalid timestamp in field '{field}': {value}")]
    InvalidTimestamp { field: String, value: String },
    #[error("policy contract violation: {0}")]
    PolicyContract(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
    #[error("failed to create directory: {0}")]
    DirCreation(std::io::Error),
    #[error("failed to write file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize: {0}")]
    Deserialization(serde_json::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(serde_yaml::Error),

    #[error("FHIR error: {0}")]
    Fhir(#[from] abm_fhir::FhirError),
}

pub type SimulationResult<T> = std::result::Result<T, SimulationError>;
