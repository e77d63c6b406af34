//! Conflict detection logic.
//!
//! For every path the template changed, [`classify`] compares the old
//! render, the new render and the subproject's current entry and decides
//! what the reconciliation must do with it.

use serde::{Deserialize, Serialize};

use crate::conflict::merger::ConflictMarker;
use crate::snapshot::tree::Entry;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed overlapping lines of a text file.
    Content,
    /// The user created a file the template now also creates.
    AddAdd,
    /// One side edited, the other deleted.
    EditDelete,
    /// Binary file changed on both sides.
    Binary,
    /// Symlink retargeted on both sides.
    Symlink,
    /// A regular file became a symlink or the reverse, and the other side
    /// also changed the path.
    TypeChange,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::AddAdd => write!(f, "add_add"),
            Self::EditDelete => write!(f, "edit_delete"),
            Self::Binary => write!(f, "binary"),
            Self::Symlink => write!(f, "symlink"),
            Self::TypeChange => write!(f, "type_change"),
        }
    }
}

/// Lifecycle status of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Reported by a reconciliation, awaiting a decision.
    Unresolved,
    /// A resolution has been applied.
    Resolved,
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Where in a file a conflict sits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConflictLocation {
    /// The whole path; no markers are written.
    WholeFile,
    /// A marker block, from the `<<<<<<<` line to the `>>>>>>>` line
    /// (1-indexed, inclusive) of the merged file.
    Lines { start_line: usize, end_line: usize },
}

/// A conflict between the template's change and the subproject's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictRegion {
    /// Subproject-relative path.
    pub path: String,
    /// 1-based position among the conflicts of `path`.
    pub index: usize,
    pub conflict_type: ConflictType,
    pub location: ConflictLocation,
    /// Old template version of the region (`None`: absent).
    pub old: Option<Entry>,
    /// New template version of the region.
    pub new: Option<Entry>,
    /// The subproject's version of the region.
    pub current: Option<Entry>,
    pub status: ConflictStatus,
}

impl ConflictRegion {
    /// A conflict covering the whole path.
    pub fn whole_file(
        path: impl Into<String>,
        conflict_type: ConflictType,
        old: Option<Entry>,
        new: Option<Entry>,
        current: Option<Entry>,
    ) -> Self {
        Self {
            path: path.into(),
            index: 1,
            conflict_type,
            location: ConflictLocation::WholeFile,
            old,
            new,
            current,
            status: ConflictStatus::Unresolved,
        }
    }

    /// A conflict for one marker block of a merged text file.
    pub fn from_marker(
        path: impl Into<String>,
        index: usize,
        conflict_type: ConflictType,
        marker: &ConflictMarker,
    ) -> Self {
        // An add/add conflict has no old side at all.
        let old = match conflict_type {
            ConflictType::AddAdd => None,
            _ => Some(Entry::file(marker.base.as_bytes())),
        };
        Self {
            path: path.into(),
            index,
            conflict_type,
            location: ConflictLocation::Lines {
                start_line: marker.start_line,
                end_line: marker.end_line,
            },
            old,
            new: Some(Entry::file(marker.theirs.as_bytes())),
            current: Some(Entry::file(marker.ours.as_bytes())),
            status: ConflictStatus::Unresolved,
        }
    }

    /// Stable identifier: `<path>#<index>`.
    pub fn id(&self) -> String {
        format!("{}#{}", self.path, self.index)
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    /// First line of the block, or 0 for whole-file conflicts.
    pub fn start_line(&self) -> usize {
        match self.location {
            ConflictLocation::WholeFile => 0,
            ConflictLocation::Lines { start_line, .. } => start_line,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What to do with one path during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAction {
    /// Leave the subproject's entry (or absence) as it is.
    Keep,
    /// Replace the path with the new template entry.
    Write(Entry),
    /// Remove the path.
    Delete,
    /// Both sides changed text; run a three-way merge. `conflict_type` is
    /// attached to any marker blocks it produces.
    Merge { conflict_type: ConflictType },
    /// Whole-file conflict; the subproject's state is kept.
    Conflict(ConflictType),
}

/// Decide how to reconcile one path given its old render, new render and
/// current subproject entry.
pub fn classify(old: Option<&Entry>, new: Option<&Entry>, current: Option<&Entry>) -> PathAction {
    match (old, new) {
        (None, None) => PathAction::Keep,

        (None, Some(new)) => match current {
            None => PathAction::Write(new.clone()),
            Some(current) if current == new => PathAction::Keep,
            Some(current) => both_changed(None, new, current, ConflictType::AddAdd),
        },

        (Some(old), Some(new)) if old == new => PathAction::Keep,

        (Some(old), Some(new)) => match current {
            // The user deleted what the template now changes.
            None => PathAction::Conflict(ConflictType::EditDelete),
            Some(current) if current == new => PathAction::Keep,
            // A file/symlink switch is never applied silently.
            Some(_) if !old.same_kind(new) => PathAction::Conflict(ConflictType::TypeChange),
            Some(current) if current == old => PathAction::Write(new.clone()),
            Some(current) => both_changed(Some(old), new, current, ConflictType::Content),
        },

        (Some(old), None) => match current {
            None => PathAction::Keep,
            Some(current) if current == old => PathAction::Delete,
            Some(_) => PathAction::Conflict(ConflictType::EditDelete),
        },
    }
}

fn both_changed(
    old: Option<&Entry>,
    new: &Entry,
    current: &Entry,
    text_conflict: ConflictType,
) -> PathAction {
    let mixed_kinds = !new.same_kind(current) || old.is_some_and(|o| !o.same_kind(new));
    if mixed_kinds {
        return PathAction::Conflict(ConflictType::TypeChange);
    }
    if new.is_symlink() {
        return PathAction::Conflict(ConflictType::Symlink);
    }
    let all_text = new.is_text() && current.is_text() && old.map_or(true, Entry::is_text);
    if !all_text {
        return PathAction::Conflict(ConflictType::Binary);
    }
    PathAction::Merge {
        conflict_type: text_conflict,
    }
}
