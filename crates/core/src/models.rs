//! Domain model types shared across restamp.
//!
//! These types bridge the answers store, the outdated checker, the
//! reconciliation engine, and whatever front end reports the results.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictRegion;

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// A single answered value: scalar, sequence, or mapping.
pub type AnswerValue = toml::Value;

/// Question key to answered value. Keys are unique by construction.
pub type AnswerSet = BTreeMap<String, AnswerValue>;

/// Where a subproject came from and which template states it has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Location of the template history (`_src_path`).
    pub template_location: String,
    /// Template commit the subproject was last rendered from (`_commit`).
    pub template_commit: Option<String>,
    /// Answer sets superseded by later updates, oldest first.
    pub history: Vec<HistoryRecord>,
}

impl Provenance {
    pub fn new(template_location: impl Into<String>, template_commit: Option<String>) -> Self {
        Self {
            template_location: template_location.into(),
            template_commit,
            history: Vec::new(),
        }
    }

    /// Record that the subproject moved from its current state to
    /// `new_commit`, archiving `previous_answers` in the history.
    pub fn advance(&mut self, previous_answers: &AnswerSet, new_commit: Option<String>) {
        if let Some(commit) = self.template_commit.take() {
            self.history
                .push(HistoryRecord::new(commit, previous_answers.clone()));
        }
        self.template_commit = new_commit;
    }
}

/// One prior (commit, answers) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub commit: String,
    pub answers: AnswerSet,
    /// Seconds precision, so the record survives a save/load round trip.
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(commit: impl Into<String>, answers: AnswerSet) -> Self {
        Self {
            commit: commit.into(),
            answers,
            recorded_at: Utc::now().trunc_subsecs(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Check warnings
// ---------------------------------------------------------------------------

/// Non-fatal conditions surfaced alongside a check or update result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckWarning {
    /// The subproject working tree has uncommitted changes.
    DirtySubproject,
    /// The template working tree has uncommitted changes; they are treated
    /// as newer than its head commit.
    DirtyTemplate,
}

impl std::fmt::Display for CheckWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirtySubproject => write!(f, "subproject has uncommitted changes"),
            Self::DirtyTemplate => write!(f, "template has uncommitted changes"),
        }
    }
}

// ---------------------------------------------------------------------------
// Update result
// ---------------------------------------------------------------------------

/// Terminal status of one update invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    UpToDate,
    Updated,
    ConflictsRemain,
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up_to_date"),
            Self::Updated => write!(f, "updated"),
            Self::ConflictsRemain => write!(f, "conflicts_remain"),
        }
    }
}

/// A template-side rename, reported when rename detection is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameNote {
    pub from: String,
    pub to: String,
}

/// Outcome of one update invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub status: UpdateStatus,
    pub from_commit: Option<String>,
    pub to_commit: Option<String>,
    /// Subproject paths written or deleted, in path order.
    pub touched_paths: Vec<String>,
    /// Unresolved conflicts, in path order then in-file position.
    pub conflicts: Vec<ConflictRegion>,
    pub warnings: Vec<CheckWarning>,
    pub renames: Vec<RenameNote>,
}

impl UpdateResult {
    pub fn up_to_date(commit: Option<String>, warnings: Vec<CheckWarning>) -> Self {
        Self {
            status: UpdateStatus::UpToDate,
            from_commit: commit.clone(),
            to_commit: commit,
            touched_paths: Vec::new(),
            conflicts: Vec::new(),
            warnings,
            renames: Vec::new(),
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}
