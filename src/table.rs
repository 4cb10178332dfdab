use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::index::FileIndex;

/// One entry of the remote database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "ID", deserialize_with = "de_id")]
    pub id: u64,
    #[serde(rename = "Project", default, deserialize_with = "de_label")]
    pub project: String,
    #[serde(rename = "Participant", default, deserialize_with = "de_label")]
    pub participant: String,
    #[serde(rename = "Session", default, deserialize_with = "de_label")]
    pub session: String,
    #[serde(rename = "Trial", default, deserialize_with = "de_label")]
    pub trial: String,
    #[serde(rename = "File", default, deserialize_with = "de_label")]
    pub file_type: String,
}

impl Record {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            &self.participant,
            &self.session,
            &self.trial,
            &self.file_type,
        )
    }

    pub fn matches(&self, key: &RecordKey) -> bool {
        self.participant == key.participant
            && self.session == key.session
            && self.trial == key.trial
            && self.file_type == key.file_type
    }
}

/// The (participant, session, trial, file type) tuple that identifies an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub participant: String,
    pub session: String,
    pub trial: String,
    pub file_type: String,
}

impl RecordKey {
    pub fn new(participant: &str, session: &str, trial: &str, file_type: &str) -> Self {
        Self {
            participant: participant.to_string(),
            session: session.to_string(),
            trial: trial.to_string(),
            file_type: file_type.to_string(),
        }
    }

    pub fn with_file_type(&self, file_type: &str) -> Self {
        Self {
            file_type: file_type.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}",
            self.participant, self.session, self.trial, self.file_type
        )
    }
}

// The PHP endpoint is not consistent about quoting numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Scalar::deserialize(deserializer)? {
        Scalar::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid file id {n}"))),
        Scalar::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid file id {s:?}"))),
    }
}

fn de_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Option::<Scalar>::deserialize(deserializer)? {
        Some(Scalar::Text(s)) => s,
        Some(Scalar::Number(n)) => n.to_string(),
        None => String::new(),
    })
}

/// A record joined with the file that currently carries its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnifiedRow {
    #[serde(flatten)]
    pub record: Record,
    #[serde(rename = "FileName")]
    pub file_name: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    rows: Vec<UnifiedRow>,
}

impl Table {
    /// Left join of `records` onto the file index. Files whose identifier has
    /// no record are left out.
    pub fn join(records: Vec<Record>, index: &FileIndex) -> Self {
        let rows = records
            .into_iter()
            .map(|record| {
                let file_name = index.get(record.id).map(Path::to_path_buf);
                UnifiedRow { record, file_name }
            })
            .collect();
        Self { rows }
    }

    pub fn rows(&self) -> &[UnifiedRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, id: u64) -> Option<&UnifiedRow> {
        self.rows.iter().find(|row| row.record.id == id)
    }

    pub fn find(&self, key: &RecordKey) -> Option<&UnifiedRow> {
        self.rows.iter().find(|row| row.record.matches(key))
    }

    pub fn filter<'a>(&'a self, query: &'a Query) -> impl Iterator<Item = &'a UnifiedRow> + 'a {
        self.rows.iter().filter(move |row| query.accepts(&row.record))
    }

    pub fn summarize(&self, query: &Query) -> Summary {
        let rows: Vec<&UnifiedRow> = self.filter(query).collect();
        Summary {
            projects: distinct(rows.iter().map(|r| r.record.project.clone())),
            participants: distinct(rows.iter().map(|r| r.record.participant.clone())),
            sessions: distinct(rows.iter().map(|r| r.record.session.clone())),
            trials: distinct(rows.iter().map(|r| r.record.trial.clone())),
            file_types: distinct(rows.iter().map(|r| r.record.file_type.clone())),
            file_names: distinct(rows.iter().map(|r| r.file_name.clone())),
            ids: distinct(rows.iter().map(|r| r.record.id)),
        }
    }

    pub fn participants(&self) -> Vec<&str> {
        distinct(self.rows.iter().map(|r| r.record.participant.as_str()))
    }

    pub fn sessions(&self) -> Vec<&str> {
        distinct(self.rows.iter().map(|r| r.record.session.as_str()))
    }

    pub fn trials(&self) -> Vec<&str> {
        distinct(self.rows.iter().map(|r| r.record.trial.as_str()))
    }

    pub fn file_types(&self) -> Vec<&str> {
        distinct(self.rows.iter().map(|r| r.record.file_type.as_str()))
    }
}

fn distinct<T: Eq + std::hash::Hash + Clone>(values: impl Iterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    values.filter(|v| seen.insert(v.clone())).collect()
}

/// Filter over the joined table. Empty or missing fields match every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub participant: Option<String>,
    pub session: Option<String>,
    pub trial: Option<String>,
    pub file_type: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participant(mut self, value: &str) -> Self {
        self.participant = Some(value.to_string());
        self
    }

    pub fn session(mut self, value: &str) -> Self {
        self.session = Some(value.to_string());
        self
    }

    pub fn trial(mut self, value: &str) -> Self {
        self.trial = Some(value.to_string());
        self
    }

    pub fn file_type(mut self, value: &str) -> Self {
        self.file_type = Some(value.to_string());
        self
    }

    pub fn accepts(&self, record: &Record) -> bool {
        fn pass(filter: &Option<String>, value: &str) -> bool {
            match filter.as_deref() {
                None | Some("") => true,
                Some(expected) => expected == value,
            }
        }
        pass(&self.participant, &record.participant)
            && pass(&self.session, &record.session)
            && pass(&self.trial, &record.trial)
            && pass(&self.file_type, &record.file_type)
    }
}

impl From<&RecordKey> for Query {
    fn from(key: &RecordKey) -> Self {
        Query::new()
            .participant(&key.participant)
            .session(&key.session)
            .trial(&key.trial)
            .file_type(&key.file_type)
    }
}

/// Distinct values of each column after filtering, in first-seen order.
///
/// Every column is a list; a column narrowed down to one value is a
/// singleton, which [`Summary::only`] unwraps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub projects: Vec<String>,
    pub participants: Vec<String>,
    pub sessions: Vec<String>,
    pub trials: Vec<String>,
    pub file_types: Vec<String>,
    pub file_names: Vec<Option<PathBuf>>,
    pub ids: Vec<u64>,
}

impl Summary {
    pub fn only<T>(values: &[T]) -> Option<&T> {
        match values {
            [single] => Some(single),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileIndex;

    fn record(id: u64, participant: &str, session: &str, trial: &str, file_type: &str) -> Record {
        Record {
            id,
            project: "FC_XX16E".into(),
            participant: participant.into(),
            session: session.into(),
            trial: trial.into(),
            file_type: file_type.into(),
        }
    }

    fn sample_table() -> Table {
        let mut index = FileIndex::default();
        index.insert(42, PathBuf::from("/root/take1_dbfid42n.raw"));
        Table::join(
            vec![
                record(42, "P01", "SB01", "T1", "RawKinematics"),
                record(43, "P02", "SB01", "T1", "RawKinematics"),
                record(44, "P02", "SB02", "T2", "Processed"),
            ],
            &index,
        )
    }

    #[test]
    fn test_join_is_left_join() {
        let table = sample_table();
        assert_eq!(table.rows().len(), 3);
        assert_eq!(
            table.row(42).and_then(|r| r.file_name.clone()),
            Some(PathBuf::from("/root/take1_dbfid42n.raw"))
        );
        assert_eq!(table.row(43).map(|r| r.file_name.is_none()), Some(true));
    }

    #[test]
    fn test_join_ignores_orphan_files() {
        let mut index = FileIndex::default();
        index.insert(1000, PathBuf::from("/root/orphan_dbfid1000n.txt"));
        let table = Table::join(vec![record(1, "P01", "S", "T", "F")], &index);
        assert_eq!(table.rows().len(), 1);
        assert!(table.row(1000).is_none());
    }

    #[test]
    fn test_query_single_participant() {
        let summary = sample_table().summarize(&Query::new().participant("P01"));
        assert_eq!(Summary::only(&summary.file_types).map(String::as_str), Some("RawKinematics"));
        assert_eq!(Summary::only(&summary.ids), Some(&42));
        assert_eq!(
            Summary::only(&summary.file_names),
            Some(&Some(PathBuf::from("/root/take1_dbfid42n.raw")))
        );
    }

    #[test]
    fn test_query_filters_are_conjunctive() {
        let table = sample_table();
        let summary = table.summarize(&Query::new().participant("P02").session("SB01"));
        assert_eq!(summary.ids, vec![43]);

        let summary = table.summarize(&Query::new().participant("P02"));
        assert_eq!(summary.ids, vec![43, 44]);
        assert_eq!(summary.sessions, vec!["SB01".to_string(), "SB02".to_string()]);
        assert_eq!(Summary::only(&summary.sessions), None);
    }

    #[test]
    fn test_empty_filter_passes_all() {
        let table = sample_table();
        let summary = table.summarize(&Query::new().participant("").trial(""));
        assert_eq!(summary.ids.len(), 3);
        assert_eq!(summary.projects, vec!["FC_XX16E".to_string()]);
    }

    #[test]
    fn test_query_without_match_is_empty() {
        assert!(sample_table().summarize(&Query::new().participant("P99")).is_empty());
    }

    #[test]
    fn test_distinct_labels_keep_first_seen_order() {
        let table = sample_table();
        assert_eq!(table.participants(), vec!["P01", "P02"]);
        assert_eq!(table.file_types(), vec!["RawKinematics", "Processed"]);
    }

    #[test]
    fn test_find_by_key() {
        let table = sample_table();
        let key = RecordKey::new("P02", "SB02", "T2", "Processed");
        assert_eq!(table.find(&key).map(|r| r.record.id), Some(44));
        assert!(table.find(&key.with_file_type("Raw")).is_none());
    }

    #[test]
    fn test_record_deserialization_accepts_loose_types() {
        let json = r#"[
            {"ID": "42", "Project": "FC", "Participant": "P01", "Session": "SB01", "Trial": 3, "File": "Raw"},
            {"ID": 43, "Participant": "P01", "Session": null, "Trial": "T", "File": "Raw"}
        ]"#;
        let records: Vec<Record> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].id, 42);
        assert_eq!(records[0].trial, "3");
        assert_eq!(records[1].id, 43);
        assert_eq!(records[1].project, "");
        assert_eq!(records[1].session, "");
    }

    #[test]
    fn test_record_deserialization_rejects_bad_id() {
        let json = r#"[{"ID": "abc", "Participant": "P01"}]"#;
        assert!(serde_json::from_str::<Vec<Record>>(json).is_err());
    }
}
