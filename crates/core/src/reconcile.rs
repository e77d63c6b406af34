//! Three-tree reconciliation.
//!
//! The template's own change set, `diff(old, new)`, is replayed onto the
//! subproject's current tree. Paths the template did not touch are never
//! looked at, so user edits outside the change set survive untouched and
//! `reconcile(s, s, t) == t` for any `s` and `t`.
//!
//! This phase is pure: it produces the merged tree and the operations that
//! would turn the current tree into it, and never touches disk.

use tracing::{debug, info, instrument};

use crate::config::MergeConfig;
use crate::conflict::{classify, ConflictRegion, ConflictStyle, ConflictType, Merger, PathAction};
use crate::models::RenameNote;
use crate::snapshot::tree::{detect_renames, diff, DiffOp, Entry, FileTreeSnapshot};

/// Everything a reconciliation produced.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// The current tree with the template's changes applied.
    pub merged: FileTreeSnapshot,
    /// Unresolved conflicts, by path then position in the file.
    pub conflicts: Vec<ConflictRegion>,
    /// Operations turning the current tree into `merged`.
    pub changes: Vec<DiffOp>,
    /// Template-side renames, when rename detection is enabled.
    pub renames: Vec<RenameNote>,
}

impl ReconcileOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Computes merged trees from (old render, new render, current tree).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine {
    merger: Merger,
    detect_renames: bool,
}

impl ReconciliationEngine {
    pub fn new(style: ConflictStyle, detect_renames: bool) -> Self {
        Self {
            merger: Merger::new(style),
            detect_renames,
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(config.conflict_style, config.detect_renames)
    }

    /// Apply the template's change between `old` and `new` onto `current`.
    #[instrument(skip_all, fields(old = old.len(), new = new.len(), current = current.len()))]
    pub fn reconcile(
        &self,
        old: &FileTreeSnapshot,
        new: &FileTreeSnapshot,
        current: &FileTreeSnapshot,
    ) -> ReconcileOutcome {
        let template_changes = diff(old, new);
        let mut merged = current.clone();
        let mut conflicts = Vec::new();

        for op in &template_changes {
            let path = op.path();
            let (o, n, c) = (old.get(path), new.get(path), current.get(path));

            match classify(o, n, c) {
                PathAction::Keep => debug!(path, "kept"),
                PathAction::Write(entry) => {
                    debug!(path, "template version applied");
                    merged.insert(path, entry);
                }
                PathAction::Delete => {
                    debug!(path, "deleted");
                    merged.remove(path);
                }
                PathAction::Merge { conflict_type } => {
                    self.merge_text(path, conflict_type, o, n, c, &mut merged, &mut conflicts);
                }
                PathAction::Conflict(conflict_type) => {
                    debug!(path, %conflict_type, "whole-file conflict");
                    conflicts.push(ConflictRegion::whole_file(
                        path,
                        conflict_type,
                        o.cloned(),
                        n.cloned(),
                        c.cloned(),
                    ));
                }
            }
        }

        conflicts.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.start_line().cmp(&b.start_line()))
        });

        let renames = if self.detect_renames {
            detect_renames(template_changes)
                .into_iter()
                .filter_map(|op| match op {
                    DiffOp::Rename { from, to, .. } => Some(RenameNote { from, to }),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };

        let changes = diff(current, &merged);
        info!(
            changes = changes.len(),
            conflicts = conflicts.len(),
            "reconciliation computed"
        );

        ReconcileOutcome {
            merged,
            conflicts,
            changes,
            renames,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_text(
        &self,
        path: &str,
        conflict_type: ConflictType,
        old: Option<&Entry>,
        new: Option<&Entry>,
        current: Option<&Entry>,
        merged: &mut FileTreeSnapshot,
        conflicts: &mut Vec<ConflictRegion>,
    ) {
        let base = old.and_then(Entry::as_text).unwrap_or("");
        let (Some(theirs), Some(ours)) = (new.and_then(Entry::as_text), current.and_then(Entry::as_text))
        else {
            // classify only asks for a merge when every present side is text.
            conflicts.push(ConflictRegion::whole_file(
                path,
                ConflictType::Binary,
                old.cloned(),
                new.cloned(),
                current.cloned(),
            ));
            return;
        };

        let result = self.merger.three_way_merge(base, ours, theirs);
        for (idx, marker) in result.conflict_markers.iter().enumerate() {
            conflicts.push(ConflictRegion::from_marker(path, idx + 1, conflict_type, marker));
        }
        debug!(
            path,
            conflicts = result.conflict_markers.len(),
            "three-way merge applied"
        );
        merged.insert(path, Entry::File(result.merged_content.into_bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictLocation;

    fn tree(files: &[(&str, &str)]) -> FileTreeSnapshot {
        let mut snap = FileTreeSnapshot::new();
        for (path, content) in files {
            snap.insert(*path, Entry::file(content.as_bytes()));
        }
        snap
    }

    fn numbered(edit: Option<(usize, &str)>) -> String {
        (1..=12)
            .map(|n| match edit {
                Some((line, text)) if line == n => format!("{text}\n"),
                _ => format!("line {n}\n"),
            })
            .collect()
    }

    #[test]
    fn test_unchanged_template_is_identity() {
        let s = tree(&[("a.txt", "a\n"), ("b.txt", "b\n")]);
        let t = tree(&[("a.txt", "edited\n"), ("c.txt", "mine\n")]);
        let outcome = ReconciliationEngine::default().reconcile(&s, &s, &t);
        assert_eq!(outcome.merged, t);
        assert!(outcome.changes.is_empty());
        assert!(outcome.is_clean());
    }

    #[test]
    fn test_added_and_deleted_files() {
        let old = tree(&[("keep.txt", "k\n"), ("obsolete.txt", "o\n")]);
        let new = tree(&[("keep.txt", "k\n"), ("new.txt", "n\n")]);
        let current = old.clone();

        let outcome = ReconciliationEngine::default().reconcile(&old, &new, &current);
        assert_eq!(outcome.merged, new);
        assert_eq!(outcome.changes.len(), 2);
        assert!(outcome.is_clean());
    }

    #[test]
    fn test_non_overlapping_edits_merge() {
        let old = tree(&[("config.txt", numbered(None).as_str())]);
        let new = tree(&[("config.txt", numbered(Some((3, "template 3"))).as_str())]);
        let current = tree(&[("config.txt", numbered(Some((10, "local 10"))).as_str())]);

        let outcome = ReconciliationEngine::default().reconcile(&old, &new, &current);
        assert!(outcome.is_clean());
        let text = outcome.merged.get("config.txt").and_then(Entry::as_text).unwrap();
        assert!(text.contains("template 3\n"));
        assert!(text.contains("local 10\n"));
    }

    #[test]
    fn test_same_line_conflict() {
        let old = tree(&[("config.txt", numbered(None).as_str())]);
        let new = tree(&[("config.txt", numbered(Some((3, "template 3"))).as_str())]);
        let current = tree(&[("config.txt", numbered(Some((3, "local 3"))).as_str())]);

        let outcome = ReconciliationEngine::default().reconcile(&old, &new, &current);
        assert_eq!(outcome.conflicts.len(), 1);
        let region = &outcome.conflicts[0];
        assert_eq!(region.path, "config.txt");
        assert_eq!(region.conflict_type, ConflictType::Content);
        assert_eq!(
            region.location,
            ConflictLocation::Lines {
                start_line: 3,
                end_line: 9
            }
        );
        assert_eq!(region.current, Some(Entry::file("local 3\n")));
        assert_eq!(region.new, Some(Entry::file("template 3\n")));
        assert_eq!(region.old, Some(Entry::file("line 3\n")));
    }

    #[test]
    fn test_conflicts_sorted_and_deterministic() {
        let old = tree(&[("b.txt", "x\n"), ("a.txt", "x\n"), ("gone.txt", "g\n")]);
        let new = tree(&[("b.txt", "y\n"), ("a.txt", "y\n")]);
        let current = tree(&[("b.txt", "z\n"), ("a.txt", "z\n"), ("gone.txt", "edited\n")]);

        let engine = ReconciliationEngine::default();
        let first = engine.reconcile(&old, &new, &current);
        let second = engine.reconcile(&old, &new, &current);

        let ids: Vec<_> = first.conflicts.iter().map(ConflictRegion::id).collect();
        assert_eq!(ids, vec!["a.txt#1", "b.txt#1", "gone.txt#1"]);
        assert_eq!(first.merged.fingerprint(), second.merged.fingerprint());
        assert_eq!(first.conflicts, second.conflicts);
        // Edit/delete keeps the user's file without markers.
        assert_eq!(first.merged.get("gone.txt"), Some(&Entry::file("edited\n")));
    }

    #[test]
    fn test_add_add_conflict_is_inline() {
        let old = tree(&[]);
        let new = tree(&[("LICENSE", "MIT\n")]);
        let current = tree(&[("LICENSE", "Apache\n")]);

        let outcome = ReconciliationEngine::default().reconcile(&old, &new, &current);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].conflict_type, ConflictType::AddAdd);
        assert_eq!(outcome.conflicts[0].old, None);
        let text = outcome.merged.get("LICENSE").and_then(Entry::as_text).unwrap();
        assert!(text.starts_with("<<<<<<< before updating\nApache\n"));
    }

    #[test]
    fn test_binary_conflict_keeps_current() {
        let mut old = FileTreeSnapshot::new();
        old.insert("logo.png", Entry::file(vec![0u8, 1]));
        let mut new = FileTreeSnapshot::new();
        new.insert("logo.png", Entry::file(vec![0u8, 2]));
        let mut current = FileTreeSnapshot::new();
        current.insert("logo.png", Entry::file(vec![0u8, 3]));

        let outcome = ReconciliationEngine::default().reconcile(&old, &new, &current);
        assert_eq!(outcome.conflicts[0].conflict_type, ConflictType::Binary);
        assert_eq!(outcome.merged, current);
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn test_rename_reporting() {
        let old = tree(&[("old_name.txt", "same\n")]);
        let new = tree(&[("new_name.txt", "same\n")]);

        let engine = ReconciliationEngine::new(ConflictStyle::Diff3, true);
        let outcome = engine.reconcile(&old, &new, &old);
        assert_eq!(
            outcome.renames,
            vec![RenameNote {
                from: "old_name.txt".into(),
                to: "new_name.txt".into()
            }]
        );
        assert_eq!(outcome.merged, new);

        let quiet = ReconciliationEngine::default().reconcile(&old, &new, &old);
        assert!(quiet.renames.is_empty());
    }
}
