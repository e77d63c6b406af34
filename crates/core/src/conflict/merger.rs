//! Three-way merge engine.
//!
//! Uses the `diffy` crate to diff a base text against each side, then aligns
//! the two edit lists on base line positions. Edits that overlap or touch are
//! grouped; a group changed by only one side (or identically by both) merges
//! cleanly, anything else becomes a conflict chunk. Chunks stay structured
//! until they are serialized into the marker text of a [`MergeResult`].
//!
//! In restamp the sides are fixed: "ours" is the subproject as it is now,
//! "theirs" is the new template render, and the base is the old render.

use diffy::Line;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Opens a conflict block; followed by the subproject's lines.
pub const MARKER_CURRENT: &str = "<<<<<<< before updating";
/// Precedes the old template lines (diff3 style only).
pub const MARKER_BASE: &str = "||||||| last update";
/// Separates the subproject's lines from the new template lines.
pub const MARKER_SEPARATOR: &str = "=======";
/// Closes a conflict block.
pub const MARKER_TEMPLATE: &str = ">>>>>>> after updating";

/// How conflict blocks are written into merged text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStyle {
    /// Include the old template lines between `|||||||` and `=======`.
    #[default]
    Diff3,
    /// Only the two competing sides.
    Merge,
}

/// One piece of a structured merge.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MergeChunk {
    /// Lines every side agrees on after merging.
    Clean(Vec<String>),
    /// Lines the two sides changed incompatibly.
    Conflict {
        base: Vec<String>,
        ours: Vec<String>,
        theirs: Vec<String>,
    },
}

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (may contain conflict markers if `has_conflicts` is true).
    pub merged_content: String,
    /// Whether the merge completed without conflicts.
    pub has_conflicts: bool,
    /// Locations of conflict markers within the merged content.
    pub conflict_markers: Vec<ConflictMarker>,
}

/// A single conflict block within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// Line number (1-indexed) of the opening `<<<<<<<` line.
    pub start_line: usize,
    /// Line number (1-indexed) of the closing `>>>>>>>` line.
    pub end_line: usize,
    /// Old template text of the region.
    pub base: String,
    /// Subproject text of the region.
    pub ours: String,
    /// New template text of the region.
    pub theirs: String,
}

/// Three-way merge engine parameterized by marker style.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merger {
    style: ConflictStyle,
}

impl Merger {
    pub fn new(style: ConflictStyle) -> Self {
        Self { style }
    }

    /// Attempt a three-way merge of `base`, `ours`, and `theirs`.
    ///
    /// Always returns merged content. If the merge is clean, `has_conflicts`
    /// is `false`; otherwise marker blocks are inserted and each one is
    /// described by a [`ConflictMarker`].
    pub fn three_way_merge(&self, base: &str, ours: &str, theirs: &str) -> MergeResult {
        info!(style = ?self.style, "performing three-way merge");

        // Fast path: if either side is identical to base, the other side wins cleanly.
        if ours == base {
            debug!("ours == base, theirs wins cleanly");
            return clean_result(theirs);
        }
        if theirs == base {
            debug!("theirs == base, ours wins cleanly");
            return clean_result(ours);
        }

        // Fast path: if both sides made the exact same change, no conflict.
        if ours == theirs {
            debug!("ours == theirs, identical changes");
            return clean_result(ours);
        }

        let chunks = merge_chunks(base, ours, theirs);
        let (merged_content, conflict_markers) = render_chunks(&chunks, self.style);
        debug!(conflicts = conflict_markers.len(), "merge computed");

        MergeResult {
            merged_content,
            has_conflicts: !conflict_markers.is_empty(),
            conflict_markers,
        }
    }
}

fn clean_result(content: &str) -> MergeResult {
    MergeResult {
        merged_content: content.to_string(),
        has_conflicts: false,
        conflict_markers: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Edit extraction
// ---------------------------------------------------------------------------

/// Replacement of base lines `start..end` with `lines`.
#[derive(Debug, Clone)]
struct Edit {
    start: usize,
    end: usize,
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Ours,
    Theirs,
}

/// Zero-based first line of a hunk range. An empty range only occurs when
/// that side of the diff is empty.
fn range_start(range: &diffy::HunkRange) -> usize {
    if range.len() == 0 {
        0
    } else {
        range.start().saturating_sub(1)
    }
}

/// Edits turning `base` into `side`, in base coordinates.
fn edits(base: &str, side: &str) -> Vec<Edit> {
    let side_lines: Vec<&str> = side.split_inclusive('\n').collect();
    let patch = diffy::create_patch(base, side);

    let mut edits = Vec::new();
    for hunk in patch.hunks() {
        let mut old = range_start(&hunk.old_range());
        let mut new = range_start(&hunk.new_range());
        let mut pending: Option<Edit> = None;

        for line in hunk.lines() {
            match line {
                Line::Context(_) => {
                    if let Some(edit) = pending.take() {
                        edits.push(edit);
                    }
                    old += 1;
                    new += 1;
                }
                Line::Delete(_) => {
                    let edit = pending.get_or_insert_with(|| Edit {
                        start: old,
                        end: old,
                        lines: Vec::new(),
                    });
                    old += 1;
                    edit.end = old;
                }
                Line::Insert(text) => {
                    let edit = pending.get_or_insert_with(|| Edit {
                        start: old,
                        end: old,
                        lines: Vec::new(),
                    });
                    // The side's own line keeps its exact line ending.
                    let content = side_lines.get(new).copied().unwrap_or(*text);
                    edit.lines.push(content.to_string());
                    new += 1;
                }
            }
        }
        if let Some(edit) = pending.take() {
            edits.push(edit);
        }
    }
    edits
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

fn merge_chunks(base: &str, ours: &str, theirs: &str) -> Vec<MergeChunk> {
    let base_lines: Vec<&str> = base.split_inclusive('\n').collect();

    let mut all: Vec<(Side, Edit)> = edits(base, ours)
        .into_iter()
        .map(|e| (Side::Ours, e))
        .chain(edits(base, theirs).into_iter().map(|e| (Side::Theirs, e)))
        .collect();
    all.sort_by_key(|(_, e)| (e.start, e.end));

    let mut chunks = Vec::new();
    let mut pos = 0;
    let mut i = 0;
    while i < all.len() {
        let start = all[i].1.start;
        let mut end = all[i].1.end;
        let mut j = i + 1;
        // Overlapping or touching edits form one group.
        while j < all.len() && all[j].1.start <= end {
            end = end.max(all[j].1.end);
            j += 1;
        }
        let group = &all[i..j];

        push_clean(&mut chunks, &base_lines[pos..start]);

        let ours_edits: Vec<&Edit> = group
            .iter()
            .filter(|(s, _)| *s == Side::Ours)
            .map(|(_, e)| e)
            .collect();
        let theirs_edits: Vec<&Edit> = group
            .iter()
            .filter(|(s, _)| *s == Side::Theirs)
            .map(|(_, e)| e)
            .collect();

        let ours_text = apply_edits(&base_lines, start, end, &ours_edits);
        let theirs_text = apply_edits(&base_lines, start, end, &theirs_edits);

        if theirs_edits.is_empty() || ours_text == theirs_text {
            push_clean_owned(&mut chunks, ours_text);
        } else if ours_edits.is_empty() {
            push_clean_owned(&mut chunks, theirs_text);
        } else {
            chunks.push(MergeChunk::Conflict {
                base: base_lines[start..end].iter().map(|l| l.to_string()).collect(),
                ours: ours_text,
                theirs: theirs_text,
            });
        }

        pos = end;
        i = j;
    }
    push_clean(&mut chunks, &base_lines[pos..]);
    chunks
}

/// Base lines `start..end` with one side's edits applied.
fn apply_edits(base_lines: &[&str], start: usize, end: usize, edits: &[&Edit]) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = start;
    for edit in edits {
        out.extend(base_lines[pos..edit.start].iter().map(|l| l.to_string()));
        out.extend(edit.lines.iter().cloned());
        pos = edit.end;
    }
    out.extend(base_lines[pos..end].iter().map(|l| l.to_string()));
    out
}

fn push_clean(chunks: &mut Vec<MergeChunk>, lines: &[&str]) {
    push_clean_owned(chunks, lines.iter().map(|l| l.to_string()).collect());
}

fn push_clean_owned(chunks: &mut Vec<MergeChunk>, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    if let Some(MergeChunk::Clean(prev)) = chunks.last_mut() {
        prev.extend(lines);
    } else {
        chunks.push(MergeChunk::Clean(lines));
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

struct MarkerWriter {
    out: String,
    line: usize,
}

impl MarkerWriter {
    fn push_line(&mut self, line: &str) {
        self.out.push_str(line);
        self.line += 1;
    }

    /// Markers always start a line, even after a final line without '\n'.
    fn push_marker(&mut self, marker: &str) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
        self.out.push_str(marker);
        self.out.push('\n');
        self.line += 1;
    }

    fn push_section(&mut self, lines: &[String]) {
        for line in lines {
            self.push_line(line);
        }
    }
}

fn render_chunks(chunks: &[MergeChunk], style: ConflictStyle) -> (String, Vec<ConflictMarker>) {
    let mut writer = MarkerWriter {
        out: String::new(),
        line: 0,
    };
    let mut markers = Vec::new();

    for chunk in chunks {
        match chunk {
            MergeChunk::Clean(lines) => writer.push_section(lines),
            MergeChunk::Conflict { base, ours, theirs } => {
                writer.push_marker(MARKER_CURRENT);
                let start_line = writer.line;
                writer.push_section(ours);
                if style == ConflictStyle::Diff3 {
                    writer.push_marker(MARKER_BASE);
                    writer.push_section(base);
                }
                writer.push_marker(MARKER_SEPARATOR);
                writer.push_section(theirs);
                writer.push_marker(MARKER_TEMPLATE);

                markers.push(ConflictMarker {
                    start_line,
                    end_line: writer.line,
                    base: base.concat(),
                    ours: ours.concat(),
                    theirs: theirs.concat(),
                });
            }
        }
    }

    (writer.out, markers)
}
