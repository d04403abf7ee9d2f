//! Internal implementation of the identifier types.

use crate::{UuidError, UuidResult};
use std::{fmt, str::FromStr};

/// Re-exported for convenience.
pub use ::uuid::Uuid;

/// Maximum length of a simulation id; it becomes a directory name.
const MAX_SIMULATION_ID_LEN: usize = 128;

/// Returns true if `input` is in canonical UUID form.
fn is_canonical(input: &str) -> bool {
    input.len() == 32
        && input
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn parse_canonical(input: &str) -> UuidResult<Uuid> {
    if is_canonical(input) {
        return Uuid::parse_str(input).map_err(|e| UuidError::InvalidInput(e.to_string()));
    }
    Err(UuidError::InvalidInput(format!(
        "UUID must be 32 lowercase hex characters without hyphens, got: '{}'",
        input
    )))
}

macro_rules! canonical_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Generates a new random identifier in canonical form.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Validates and parses an identifier that must already be in canonical form.
            ///
            /// # Errors
            ///
            /// Returns [`UuidError::InvalidInput`] if `input` is not canonical.
            pub fn parse(input: &str) -> UuidResult<Self> {
                parse_canonical(input).map(Self)
            }

            /// Returns true if `input` is a canonical 32-character lowercase hex string.
            pub fn is_canonical(input: &str) -> bool {
                is_canonical(input)
            }

            /// Returns the underlying `uuid::Uuid`.
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = UuidError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        #[cfg(feature = "serde")]
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        #[cfg(feature = "serde")]
        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

canonical_id! {
    /// Identifier of a single patient record entry.
    ///
    /// Unique within a patient record and used as the FHIR resource id when the record is
    /// exported.
    EntryId
}

canonical_id! {
    /// Internal identity of a patient or environment agent instance.
    ///
    /// Distinct from the user-facing patient and environment ids; two copies of the same
    /// environment handed to different patients keep the same `AgentId`.
    AgentId
}

/// Identifier of one patient's simulation run.
///
/// Used as the name of the run's output directory, so only ASCII letters, digits, `.`, `-` and
/// `_` are accepted. Freshly generated ids are canonical UUIDs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimulationId(String);

impl Default for SimulationId {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationId {
    /// Generates a new simulation id in canonical UUID form.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Validates a caller-supplied simulation id.
    ///
    /// # Arguments
    ///
    /// * `input` - Candidate id. Must be non-empty, at most 128 characters, not `.` or `..`, and
    ///   contain only ASCII letters, digits, `.`, `-` or `_`.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if any of the rules above is violated.
    pub fn parse(input: &str) -> UuidResult<Self> {
        if input.is_empty() || input.len() > MAX_SIMULATION_ID_LEN {
            return Err(UuidError::InvalidInput(format!(
                "simulation id must be between 1 and {MAX_SIMULATION_ID_LEN} characters, got {}",
                input.len()
            )));
        }
        if input == "." || input == ".." {
            return Err(UuidError::InvalidInput(format!(
                "simulation id cannot be '{input}'"
            )));
        }
        if let Some(bad) = input
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(UuidError::InvalidInput(format!(
                "simulation id '{input}' contains unsupported character '{bad}'"
            )));
        }
        Ok(Self(input.to_owned()))
    }

    /// Builds the id `<prefix>_<patient_id>` used when runs are named after their patient.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if the combined id is not path-safe.
    pub fn for_patient(prefix: &str, patient_id: &str) -> UuidResult<Self> {
        Self::parse(&format!("{prefix}_{patient_id}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SimulationId {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for SimulationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for SimulationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_canonical_entry_id() {
        let id = EntryId::new();
        let canonical = id.to_string();

        assert_eq!(canonical.len(), 32);
        assert!(EntryId::is_canonical(&canonical));
    }

    #[test]
    fn test_parse_valid_canonical_entry_id() {
        let canonical = "550e8400e29b41d4a716446655440000";
        let id = EntryId::parse(canonical).expect("canonical id should parse");

        assert_eq!(id.to_string(), canonical);
    }

    #[test]
    fn test_parse_rejects_hyphenated_uuid() {
        let result = AgentId::parse("550e8400-e29b-41d4-a716-446655440000");

        match result {
            Err(UuidError::InvalidInput(msg)) => {
                assert!(msg.contains("32 lowercase hex characters"));
            }
            other => panic!("Expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn test_is_canonical_invalid() {
        assert!(!EntryId::is_canonical("550E8400E29B41D4A716446655440000"));
        assert!(!EntryId::is_canonical("550e8400e29b41d4a71644665544000"));
        assert!(!EntryId::is_canonical("550e8400e29b41d4a716446655440zzz"));
        assert!(!EntryId::is_canonical(""));
    }

    #[test]
    fn test_entry_id_serde_round_trip() {
        let id = EntryId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        let parsed: EntryId = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(id, parsed);
        assert!(serde_json::from_str::<EntryId>("\"not-canonical\"").is_err());
    }

    #[test]
    fn test_simulation_id_for_patient() {
        let id = SimulationId::for_patient("simulation_for_patient", "7").expect("valid id");
        assert_eq!(id.as_str(), "simulation_for_patient_7");
    }

    #[test]
    fn test_simulation_id_rejects_path_separators() {
        for bad in ["", ".", "..", "../escape", "a/b", "with space"] {
            match SimulationId::parse(bad) {
                Err(UuidError::InvalidInput(_)) => {}
                other => panic!("expected InvalidInput for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_generated_simulation_id_is_canonical() {
        let id = SimulationId::new();
        assert!(EntryId::is_canonical(id.as_str()));
    }
}
