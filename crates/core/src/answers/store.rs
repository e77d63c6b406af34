//! Persistence of the subproject's answers file.
//!
//! The file is a TOML document committed alongside the generated project,
//! so the rendering is deterministic: keys are sorted and timestamps have
//! second precision. Saving data that was just loaded reproduces the file
//! byte for byte.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use toml::{Table, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::RestampConfig;
use crate::errors::AnswersError;
use crate::fsutil::atomic_write;
use crate::models::{AnswerSet, HistoryRecord, Provenance};

/// First line of every answers file.
pub const ANSWERS_HEADER: &str =
    "# Changes here will be overwritten by restamp; do not edit by hand.\n";

const SRC_PATH_KEY: &str = "_src_path";
const COMMIT_KEY: &str = "_commit";
const HISTORY_KEY: &str = "_history";

/// Reads and writes `(AnswerSet, Provenance)` for a subproject.
#[derive(Debug, Clone)]
pub struct AnswersStore {
    file_name: String,
}

impl AnswersStore {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn from_config(config: &RestampConfig) -> Self {
        Self::new(config.answers.file_name.clone())
    }

    /// File name relative to the subproject root.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Absolute location of the answers file for `subproject`.
    pub fn path(&self, subproject: &Path) -> PathBuf {
        subproject.join(&self.file_name)
    }

    /// Load the answers and provenance recorded in `subproject`.
    #[instrument(skip(self), fields(subproject = %subproject.display()))]
    pub fn load(&self, subproject: &Path) -> Result<(AnswerSet, Provenance), AnswersError> {
        let path = self.path(subproject);
        if !path.is_file() {
            return Err(AnswersError::Missing(path.display().to_string()));
        }

        let text = std::fs::read_to_string(&path)?;
        let loaded = parse_document(&text, &path.display().to_string())?;
        debug!(answers = loaded.0.len(), history = loaded.1.history.len(), "answers loaded");
        Ok(loaded)
    }

    /// Atomically persist `answers` and `provenance` into `subproject`.
    pub fn save(
        &self,
        subproject: &Path,
        answers: &AnswerSet,
        provenance: &Provenance,
    ) -> Result<(), AnswersError> {
        let prepared = self.prepare(answers, provenance)?;
        self.write(subproject, &prepared)
    }

    /// Validate and render the answers file without touching disk.
    ///
    /// Callers that write other files first prepare here, so a rejected
    /// answer set fails before anything changes.
    pub fn prepare(
        &self,
        answers: &AnswerSet,
        provenance: &Provenance,
    ) -> Result<PreparedAnswers, AnswersError> {
        Ok(PreparedAnswers {
            contents: render_document(answers, provenance)?,
            commit: provenance.template_commit.clone(),
        })
    }

    /// Atomically write a prepared answers file into `subproject`.
    #[instrument(skip(self, prepared), fields(subproject = %subproject.display()))]
    pub fn write(&self, subproject: &Path, prepared: &PreparedAnswers) -> Result<(), AnswersError> {
        let path = self.path(subproject);
        atomic_write(&path, prepared.contents.as_bytes())?;
        info!(
            path = %path.display(),
            commit = prepared.commit.as_deref().unwrap_or("-"),
            "answers saved"
        );
        Ok(())
    }
}

/// A rendered answers file that passed validation.
#[derive(Debug, Clone)]
pub struct PreparedAnswers {
    contents: String,
    commit: Option<String>,
}

impl PreparedAnswers {
    pub fn contents(&self) -> &str {
        &self.contents
    }
}

/// Reject answer names in the `_` namespace, which holds provenance keys.
pub fn check_answer_keys(answers: &AnswerSet) -> Result<(), AnswersError> {
    match answers.keys().find(|k| k.starts_with('_')) {
        Some(key) => Err(AnswersError::ReservedKey(key.clone())),
        None => Ok(()),
    }
}

/// Serialize answers and provenance into the answers-file text.
pub fn render_document(answers: &AnswerSet, provenance: &Provenance) -> Result<String, AnswersError> {
    check_answer_keys(answers)?;
    let mut doc = Table::new();
    for (key, value) in answers {
        doc.insert(key.clone(), value.clone());
    }

    doc.insert(
        SRC_PATH_KEY.into(),
        Value::String(provenance.template_location.clone()),
    );
    if let Some(commit) = &provenance.template_commit {
        doc.insert(COMMIT_KEY.into(), Value::String(commit.clone()));
    }

    if !provenance.history.is_empty() {
        let mut records = Vec::with_capacity(provenance.history.len());
        for record in &provenance.history {
            records.push(Value::Table(render_record(record)?));
        }
        doc.insert(HISTORY_KEY.into(), Value::Array(records));
    }

    let body = toml::to_string(&doc).map_err(|e| AnswersError::SerializeError(e.to_string()))?;
    Ok(format!("{ANSWERS_HEADER}{body}"))
}

fn render_record(record: &HistoryRecord) -> Result<Table, AnswersError> {
    if let Some(key) = record.answers.keys().find(|k| k.starts_with('_')) {
        return Err(AnswersError::ReservedKey(key.clone()));
    }

    let mut table = Table::new();
    table.insert("commit".into(), Value::String(record.commit.clone()));
    table.insert(
        "recorded_at".into(),
        Value::String(record.recorded_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    table.insert(
        "answers".into(),
        Value::Table(record.answers.clone().into_iter().collect()),
    );
    Ok(table)
}

/// Parse answers-file text. `origin` names the file in error messages.
pub fn parse_document(text: &str, origin: &str) -> Result<(AnswerSet, Provenance), AnswersError> {
    let mut doc: Table = toml::from_str(text).map_err(|e| AnswersError::ParseError {
        path: origin.to_string(),
        detail: e.to_string(),
    })?;
    let invalid = |detail: &str| AnswersError::InvalidDocument {
        path: origin.to_string(),
        detail: detail.to_string(),
    };

    let template_location = match doc.remove(SRC_PATH_KEY) {
        Some(Value::String(s)) => s,
        Some(_) => return Err(invalid("_src_path must be a string")),
        None => return Err(invalid("missing _src_path")),
    };

    let template_commit = match doc.remove(COMMIT_KEY) {
        Some(Value::String(s)) => Some(s),
        Some(_) => return Err(invalid("_commit must be a string")),
        None => None,
    };

    let history = match doc.remove(HISTORY_KEY) {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| parse_record(item).map_err(|detail| invalid(&detail)))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid("_history must be an array of tables")),
        None => Vec::new(),
    };

    let mut answers = AnswerSet::new();
    for (key, value) in doc {
        if key.starts_with('_') {
            warn!(key = %key, "ignoring unknown metadata key in answers file");
            continue;
        }
        answers.insert(key, value);
    }

    Ok((
        answers,
        Provenance {
            template_location,
            template_commit,
            history,
        },
    ))
}

fn parse_record(item: Value) -> Result<HistoryRecord, String> {
    let Value::Table(mut table) = item else {
        return Err("_history entries must be tables".into());
    };

    let commit = match table.remove("commit") {
        Some(Value::String(s)) => s,
        _ => return Err("_history entry is missing a string 'commit'".into()),
    };
    let recorded_at = match table.remove("recorded_at") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map_err(|e| format!("_history entry has a bad 'recorded_at': {e}"))?
            .with_timezone(&Utc),
        _ => return Err("_history entry is missing a string 'recorded_at'".into()),
    };
    let answers = match table.remove("answers") {
        Some(Value::Table(t)) => t.into_iter().collect(),
        None => AnswerSet::new(),
        Some(_) => return Err("_history entry 'answers' must be a table".into()),
    };

    Ok(HistoryRecord {
        commit,
        answers,
        recorded_at,
    })
}
