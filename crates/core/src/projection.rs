//! Derived projection tables over a patient record.
//!
//! Each table keeps one row per `(name, start)` pair of the record entries whose resource type
//! it accepts. Folding the whole record into a table is idempotent: rows are matched on their
//! key and updated in place, so re-folding the same record leaves the table unchanged.
//!
//! Row columns are fixed when the table is created: the identity columns, the kind's core
//! fields, and any custom fields. A custom field may not reuse an identity or core column name.

use crate::constants::{IMPORTED_RECORD_INDEX, PATIENT_LOG_TARGET};
use crate::record::RecordEntry;
use crate::time::{format_timestamp, serde_timestamp, serde_timestamp_opt};
use crate::{SimulationError, SimulationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Columns present in every projection table.
pub const IDENTITY_COLUMNS: [&str; 8] = [
    "name",
    "start",
    "real_start_time",
    "end",
    "real_end_time",
    "active",
    "count",
    "record_index",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    Conditions,
    Medications,
    Actions,
}

impl ProjectionKind {
    pub const ALL: [ProjectionKind; 3] = [
        ProjectionKind::Conditions,
        ProjectionKind::Medications,
        ProjectionKind::Actions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionKind::Conditions => "conditions",
            ProjectionKind::Medications => "medications",
            ProjectionKind::Actions => "actions",
        }
    }

    /// Resource types folded into this table.
    pub fn resource_types(self) -> &'static [&'static str] {
        match self {
            ProjectionKind::Conditions => &["Condition"],
            ProjectionKind::Medications => &["MedicationRequest"],
            ProjectionKind::Actions => &["Appointment", "ServiceRequest"],
        }
    }

    /// Kind-specific columns copied from the payload.
    pub fn core_fields(self) -> &'static [&'static str] {
        match self {
            ProjectionKind::Conditions => &["code"],
            ProjectionKind::Medications => &["code", "dosage", "frequency"],
            ProjectionKind::Actions => &["resource_type"],
        }
    }

    pub fn accepts(self, resource_type: &str) -> bool {
        self.resource_types().contains(&resource_type)
    }
}

/// One row of a projection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRow {
    name: String,
    start: DateTime<Utc>,
    real_start_time: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    real_end_time: Option<DateTime<Utc>>,
    active: bool,
    count: u32,
    record_index: i64,
    fields: BTreeMap<String, Value>,
}

impl ProjectionRow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn real_start_time(&self) -> DateTime<Utc> {
        self.real_start_time
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn real_end_time(&self) -> Option<DateTime<Utc>> {
        self.real_end_time
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Position of the record entry that created the row, or -1 for imported rows.
    pub fn record_index(&self) -> i64 {
        self.record_index
    }

    /// Value of a core or custom column. `None` if the table has no such column.
    pub fn field(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    fn key(&self) -> (String, DateTime<Utc>) {
        (self.name.clone(), self.start)
    }
}

/// A row supplied at construction time instead of derived from the record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectionSeed {
    pub name: String,
    #[serde(deserialize_with = "serde_timestamp::deserialize")]
    pub start: DateTime<Utc>,
    #[serde(default, deserialize_with = "serde_timestamp_opt::deserialize")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "serde_timestamp_opt::deserialize")]
    pub real_start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "serde_timestamp_opt::deserialize")]
    pub real_end_time: Option<DateTime<Utc>>,
    /// Ignored; recomputed from `end`.
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub record_index: Option<i64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl ProjectionSeed {
    pub fn new(name: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start,
            end: None,
            real_start_time: None,
            real_end_time: None,
            active: None,
            count: None,
            record_index: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }
}

/// A projection table for one [`ProjectionKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProjectionTableWire", into = "ProjectionTableWire")]
pub struct ProjectionTable {
    kind: ProjectionKind,
    custom_fields: Vec<String>,
    rows: Vec<ProjectionRow>,
    index: HashMap<(String, DateTime<Utc>), usize>,
    name_counts: HashMap<String, u32>,
}

impl ProjectionTable {
    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// Returns `FieldCollision` if a custom field reuses an identity or core column name, or
    /// is listed twice.
    pub fn new(kind: ProjectionKind, custom_fields: Vec<String>) -> SimulationResult<Self> {
        let mut seen = HashSet::new();
        for field in &custom_fields {
            if IDENTITY_COLUMNS.contains(&field.as_str())
                || kind.core_fields().contains(&field.as_str())
                || !seen.insert(field.as_str())
            {
                return Err(SimulationError::FieldCollision {
                    owner: kind.as_str(),
                    field: field.clone(),
                });
            }
        }
        Ok(Self {
            kind,
            custom_fields,
            rows: Vec::new(),
            index: HashMap::new(),
            name_counts: HashMap::new(),
        })
    }

    /// Creates a table from rows supplied up front.
    ///
    /// Rows are ordered by `(name, start)`. `count` is the 1-based position of the row among
    /// rows of the same name; a supplied count that disagrees is replaced with a warning.
    /// `real_start_time` defaults to `default_real_start_time`, `record_index` to -1, and
    /// `active` is recomputed from `end`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateProjectionKey` if two seeds share `(name, start)`, `InvalidInput` if a
    /// seed sets a column the table does not have, or any error from [`ProjectionTable::new`].
    pub fn from_seeds(
        kind: ProjectionKind,
        custom_fields: Vec<String>,
        mut seeds: Vec<ProjectionSeed>,
        default_real_start_time: DateTime<Utc>,
    ) -> SimulationResult<Self> {
        let mut table = Self::new(kind, custom_fields)?;
        seeds.sort_by(|a, b| (&a.name, a.start).cmp(&(&b.name, b.start)));

        for seed in seeds {
            let key = (seed.name.clone(), seed.start);
            if table.index.contains_key(&key) {
                return Err(SimulationError::DuplicateProjectionKey {
                    table: kind.as_str(),
                    name: seed.name,
                    start: format_timestamp(seed.start),
                });
            }
            if let Some(unknown) = seed.fields.keys().find(|c| !table.has_column(c)) {
                return Err(SimulationError::InvalidInput(format!(
                    "{} table has no column '{unknown}'",
                    kind.as_str()
                )));
            }

            let count = table.name_counts.get(&seed.name).copied().unwrap_or(0) + 1;
            if let Some(given) = seed.count.filter(|given| *given != count) {
                tracing::warn!(
                    target: PATIENT_LOG_TARGET,
                    "{} row ({}, {}) has count {given}; replacing with {count}",
                    kind.as_str(),
                    seed.name,
                    format_timestamp(seed.start)
                );
            }

            let fields = table
                .columns()
                .map(|column| {
                    let value = seed.fields.get(column).cloned().unwrap_or(Value::Null);
                    (column.to_owned(), value)
                })
                .collect();
            let row = ProjectionRow {
                name: seed.name,
                start: seed.start,
                real_start_time: seed.real_start_time.unwrap_or(default_real_start_time),
                end: seed.end,
                real_end_time: seed.real_end_time,
                active: seed.end.is_none(),
                count,
                record_index: seed.record_index.unwrap_or(IMPORTED_RECORD_INDEX),
                fields,
            };
            table.insert_row(row);
        }
        Ok(table)
    }

    pub fn kind(&self) -> ProjectionKind {
        self.kind
    }

    pub fn custom_fields(&self) -> &[String] {
        &self.custom_fields
    }

    /// Core columns followed by custom columns.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.kind
            .core_fields()
            .iter()
            .copied()
            .chain(self.custom_fields.iter().map(String::as_str))
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns().any(|c| c == column)
    }

    pub fn rows(&self) -> &[ProjectionRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, name: &str, start: DateTime<Utc>) -> Option<&ProjectionRow> {
        self.index
            .get(&(name.to_owned(), start))
            .map(|position| &self.rows[*position])
    }

    pub fn active_rows(&self) -> impl Iterator<Item = &ProjectionRow> {
        self.rows.iter().filter(|row| row.active)
    }

    /// Folds record entries into the table.
    ///
    /// Entries of other resource types are ignored. For an existing key the row's `end`,
    /// `real_end_time`, `active` and every core/custom column are overwritten from the entry;
    /// a column absent from the payload becomes null. A new key appends a row whose `count` is
    /// one more than the number of rows already sharing its name.
    ///
    /// # Errors
    ///
    /// Returns a payload error if an accepted entry has no name or unparseable timestamps.
    pub fn fold(&mut self, entries: &[RecordEntry]) -> SimulationResult<()> {
        for entry in entries {
            if !self.kind.accepts(entry.resource_type()) {
                continue;
            }
            let payload = entry.payload();
            let name = payload
                .name()
                .ok_or(SimulationError::MissingPayloadField("name"))?
                .to_owned();
            let start = payload.start()?;
            let end = payload.end()?;
            let real_end_time = end.map(|_| entry.real_time());
            let fields: BTreeMap<String, Value> = self
                .columns()
                .map(|column| {
                    let value = payload.get(column).cloned().unwrap_or(Value::Null);
                    (column.to_owned(), value)
                })
                .collect();

            match self.index.get(&(name.clone(), start)) {
                Some(position) => {
                    let row = &mut self.rows[*position];
                    row.end = end;
                    row.real_end_time = real_end_time;
                    row.active = end.is_none();
                    row.fields = fields;
                }
                None => {
                    let count = self.name_counts.get(&name).copied().unwrap_or(0) + 1;
                    self.insert_row(ProjectionRow {
                        name,
                        start,
                        real_start_time: entry.real_time(),
                        end,
                        real_end_time,
                        active: end.is_none(),
                        count,
                        record_index: entry.record_index() as i64,
                        fields,
                    });
                }
            }
        }
        Ok(())
    }

    fn insert_row(&mut self, row: ProjectionRow) {
        *self.name_counts.entry(row.name.clone()).or_insert(0) += 1;
        self.index.insert(row.key(), self.rows.len());
        self.rows.push(row);
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectionTableWire {
    kind: ProjectionKind,
    custom_fields: Vec<String>,
    rows: Vec<ProjectionRow>,
}

impl TryFrom<ProjectionTableWire> for ProjectionTable {
    type Error = SimulationError;

    fn try_from(wire: ProjectionTableWire) -> Result<Self, Self::Error> {
        let mut table = ProjectionTable::new(wire.kind, wire.custom_fields)?;
        for row in wire.rows {
            if table.index.contains_key(&row.key()) {
                return Err(SimulationError::DuplicateProjectionKey {
                    table: wire.kind.as_str(),
                    name: row.name,
                    start: format_timestamp(row.start),
                });
            }
            table.insert_row(row);
        }
        Ok(table)
    }
}

impl From<ProjectionTable> for ProjectionTableWire {
    fn from(table: ProjectionTable) -> Self {
        Self {
            kind: table.kind,
            custom_fields: table.custom_fields,
            rows: table.rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DuplicateAction, Payload, PatientRecord};
    use crate::time::parse_timestamp;
    use abm_types::{EnvironmentId, PatientId};

    fn ts(text: &str) -> DateTime<Utc> {
        parse_timestamp(text).expect("valid timestamp")
    }

    fn record_with(payloads: Vec<Payload>) -> PatientRecord {
        let mut record = PatientRecord::with_profile(
            Payload::entry("Patient", "1", ts("2021-01-01")),
            ts("2021-01-01"),
            ts("2021-01-01"),
            "patient_profile",
            EnvironmentId::from(-1),
        )
        .expect("profile");
        record
            .append(
                payloads.into_iter().map(Into::into).collect(),
                DuplicateAction::Add,
                &PatientId::from(1),
            )
            .expect("append");
        record
    }

    #[test]
    fn fold_inserts_then_updates() {
        let diabetes =
            Payload::entry("Condition", "Diabetes", ts("2021-02-01")).with("code", 44054006);
        let mut record = record_with(vec![diabetes.clone()]);
        let mut table = ProjectionTable::new(ProjectionKind::Conditions, vec![]).expect("table");

        table.fold(record.entries()).expect("fold");
        let row = table.get("Diabetes", ts("2021-02-01")).expect("row");
        assert!(row.active());
        assert_eq!(row.count(), 1);
        assert_eq!(row.record_index(), 1);
        assert_eq!(row.field("code"), Some(&Value::from(44054006)));

        let resolved = diabetes.with_time("end", ts("2021-02-10"));
        record
            .append(vec![resolved.into()], DuplicateAction::Add, &PatientId::from(1))
            .expect("append");
        table.fold(record.entries()).expect("fold");

        assert_eq!(table.len(), 1);
        let row = table.get("Diabetes", ts("2021-02-01")).expect("row");
        assert!(!row.active());
        assert_eq!(row.end(), Some(ts("2021-02-10")));
        assert_eq!(row.real_end_time(), Some(record.entries()[2].real_time()));
    }

    #[test]
    fn refold_is_idempotent() {
        let record = record_with(vec![
            Payload::entry("Condition", "Fever", ts("2021-02-01")),
            Payload::entry("Condition", "Fever", ts("2021-03-01")),
            Payload::entry("Observation", "BMI", ts("2021-03-02")),
        ]);
        let mut table = ProjectionTable::new(ProjectionKind::Conditions, vec![]).expect("table");

        table.fold(record.entries()).expect("fold");
        let once = table.clone();
        table.fold(record.entries()).expect("fold");

        assert_eq!(table, once);
        assert_eq!(table.len(), 2);
        let counts: Vec<u32> = table.rows().iter().map(|r| r.count()).collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn latest_entry_overwrites_columns_with_null() {
        let with_dose = Payload::entry("MedicationRequest", "Metformin", ts("2021-02-01"))
            .with("dosage", "500mg");
        let without_dose = Payload::entry("MedicationRequest", "Metformin", ts("2021-02-01"))
            .with_time("end", ts("2021-04-01"));
        let record = record_with(vec![with_dose, without_dose]);
        let mut table = ProjectionTable::new(ProjectionKind::Medications, vec![]).expect("table");

        table.fold(record.entries()).expect("fold");

        let row = table.get("Metformin", ts("2021-02-01")).expect("row");
        assert_eq!(row.field("dosage"), Some(&Value::Null));
    }

    #[test]
    fn actions_accept_appointments_and_service_requests() {
        let record = record_with(vec![
            Payload::entry("Appointment", "Clinic", ts("2021-02-01")),
            Payload::entry("ServiceRequest", "Bloods", ts("2021-02-02")),
            Payload::entry("Condition", "Fever", ts("2021-02-03")),
        ]);
        let mut table = ProjectionTable::new(ProjectionKind::Actions, vec![]).expect("table");

        table.fold(record.entries()).expect("fold");

        assert_eq!(table.len(), 2);
        let row = table.get("Bloods", ts("2021-02-02")).expect("row");
        assert_eq!(row.field("resource_type"), Some(&Value::from("ServiceRequest")));
    }

    #[test]
    fn custom_fields_cannot_collide() {
        for field in ["count", "code", "severity"] {
            let custom = vec![field.to_string(), "severity".to_string()];
            let result = ProjectionTable::new(ProjectionKind::Conditions, custom);
            match result {
                Err(SimulationError::FieldCollision { field: collided, .. }) => {
                    assert_eq!(collided, field)
                }
                other => panic!("expected FieldCollision for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn seeds_are_sorted_and_counted() {
        let seeds = vec![
            ProjectionSeed::new("Fever", ts("2021-03-01")),
            ProjectionSeed::new("Asthma", ts("2010-01-01")),
            ProjectionSeed {
                count: Some(7),
                ..ProjectionSeed::new("Fever", ts("2021-01-01"))
            },
        ];

        let table = ProjectionTable::from_seeds(
            ProjectionKind::Conditions,
            vec![],
            seeds,
            ts("2021-06-01"),
        )
        .expect("table");

        let summary: Vec<(&str, u32, i64)> = table
            .rows()
            .iter()
            .map(|r| (r.name(), r.count(), r.record_index()))
            .collect();
        assert_eq!(
            summary,
            vec![("Asthma", 1, -1), ("Fever", 1, -1), ("Fever", 2, -1)]
        );
        assert_eq!(table.rows()[0].real_start_time(), ts("2021-06-01"));
    }

    #[test]
    fn seeds_with_duplicate_keys_are_rejected() {
        let seeds = vec![
            ProjectionSeed::new("Fever", ts("2021-03-01")),
            ProjectionSeed::new("Fever", ts("2021-03-01")),
        ];
        let err =
            ProjectionTable::from_seeds(ProjectionKind::Conditions, vec![], seeds, ts("2021-06-01"))
                .expect_err("duplicate key");
        assert!(matches!(err, SimulationError::DuplicateProjectionKey { .. }));
    }

    #[test]
    fn seeds_with_unknown_columns_are_rejected() {
        let seeds = vec![ProjectionSeed::new("Fever", ts("2021-03-01")).with_field("severity", 2)];
        let err =
            ProjectionTable::from_seeds(ProjectionKind::Conditions, vec![], seeds, ts("2021-06-01"))
                .expect_err("unknown column");
        assert!(matches!(err, SimulationError::InvalidInput(_)));
    }

    #[test]
    fn serde_round_trip_rebuilds_index() {
        let record = record_with(vec![Payload::entry("Condition", "Fever", ts("2021-02-01"))]);
        let mut table = ProjectionTable::new(ProjectionKind::Conditions, vec!["severity".into()])
            .expect("table");
        table.fold(record.entries()).expect("fold");

        let json = serde_json::to_string(&table).expect("serialize");
        let restored: ProjectionTable = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored, table);
        assert!(restored.get("Fever", ts("2021-02-01")).is_some());
    }
}
