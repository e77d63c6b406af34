//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] applies a named [`Resolution`] to the conflicts
//! an update reported: marker blocks are replaced in the merged text, and
//! whole-file conflicts yield the entry the path should end up with.

use tracing::{debug, info};

use crate::conflict::detector::{ConflictLocation, ConflictRegion, ConflictStatus};
use crate::conflict::merger::{MARKER_CURRENT, MARKER_TEMPLATE};
use crate::errors::ConflictError;
use crate::snapshot::tree::Entry;

/// Named resolution strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the subproject's version.
    KeepCurrent,
    /// Take the new template version.
    AcceptTemplate,
    /// Go back to the old template version.
    AcceptOld,
    /// Use caller-supplied text.
    Custom(String),
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepCurrent => write!(f, "keep_current"),
            Self::AcceptTemplate => write!(f, "accept_template"),
            Self::AcceptOld => write!(f, "accept_old"),
            Self::Custom(_) => write!(f, "custom"),
        }
    }
}

/// Stateless conflict resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Get the content that should be used for a resolved conflict.
    ///
    /// `None` means the path (or region) should not exist.
    pub fn resolved_content(region: &ConflictRegion, resolution: &Resolution) -> Option<Entry> {
        match resolution {
            Resolution::KeepCurrent => region.current.clone(),
            Resolution::AcceptTemplate => region.new.clone(),
            Resolution::AcceptOld => region.old.clone(),
            Resolution::Custom(text) => {
                let symlink = [&region.current, &region.new]
                    .iter()
                    .any(|e| e.as_ref().is_some_and(Entry::is_symlink));
                Some(if symlink {
                    Entry::symlink(text.clone())
                } else {
                    Entry::file(text.as_bytes())
                })
            }
        }
    }

    /// Resolve a whole-file conflict. Returns the entry the path should
    /// hold, or `None` if it should be removed.
    pub fn resolve_whole_file(
        region: &mut ConflictRegion,
        resolution: &Resolution,
    ) -> Result<Option<Entry>, ConflictError> {
        if region.is_resolved() {
            return Err(ConflictError::AlreadyResolved(region.id()));
        }
        if region.location != ConflictLocation::WholeFile {
            return Err(ConflictError::InvalidResolution {
                id: region.id(),
                detail: "region is a marker block; resolve it within the file text".into(),
            });
        }

        let content = Self::resolved_content(region, resolution);
        region.status = ConflictStatus::Resolved;
        info!(id = %region.id(), %resolution, "whole-file conflict resolved");
        Ok(content)
    }

    /// Replace the marker blocks of one file's `text`.
    ///
    /// `regions` must be the line conflicts of that file, as reported by the
    /// update that wrote `text`. `choose` picks a resolution per region.
    /// Blocks are replaced bottom-up so the recorded line numbers of earlier
    /// blocks stay valid. Nothing is marked resolved unless every block
    /// checks out.
    pub fn resolve_text<F>(
        text: &str,
        regions: &mut [ConflictRegion],
        mut choose: F,
    ) -> Result<String, ConflictError>
    where
        F: FnMut(&ConflictRegion) -> Resolution,
    {
        let mut lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();

        let mut plan = Vec::with_capacity(regions.len());
        for (idx, region) in regions.iter().enumerate() {
            if region.is_resolved() {
                return Err(ConflictError::AlreadyResolved(region.id()));
            }
            let ConflictLocation::Lines {
                start_line,
                end_line,
            } = region.location
            else {
                return Err(ConflictError::InvalidResolution {
                    id: region.id(),
                    detail: "whole-file conflicts have no markers to replace".into(),
                });
            };
            check_block(&lines, region, start_line, end_line)?;
            plan.push((idx, start_line, end_line, choose(region)));
        }

        plan.sort_by(|a, b| b.1.cmp(&a.1));
        for (idx, start_line, end_line, resolution) in &plan {
            let replacement = match Self::resolved_content(&regions[*idx], resolution) {
                Some(Entry::File(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => String::new(),
            };
            debug!(start_line, end_line, "replacing conflict block");
            lines.splice(
                start_line - 1..*end_line,
                replacement.split_inclusive('\n').map(str::to_string),
            );
        }

        for (idx, _, _, resolution) in &plan {
            regions[*idx].status = ConflictStatus::Resolved;
            info!(id = %regions[*idx].id(), %resolution, "conflict block resolved");
        }
        Ok(lines.concat())
    }
}

fn check_block(
    lines: &[String],
    region: &ConflictRegion,
    start_line: usize,
    end_line: usize,
) -> Result<(), ConflictError> {
    let is = |line: usize, marker: &str| {
        line >= 1
            && lines
                .get(line - 1)
                .is_some_and(|l| l.trim_end_matches(['\n', '\r']) == marker)
    };
    if start_line > end_line || !is(start_line, MARKER_CURRENT) || !is(end_line, MARKER_TEMPLATE) {
        return Err(ConflictError::MarkerMismatch {
            id: region.id(),
            start_line,
            end_line,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::detector::ConflictType;
    use crate::conflict::merger::Merger;

    fn conflicted() -> (String, Vec<ConflictRegion>) {
        let base = "a\nb\nc\nd\ne\nf\ng\nh\ni\nj\n";
        let ours = "a\nB-ours\nc\nd\ne\nf\ng\nh\ni\nJ-ours\n";
        let theirs = "a\nB-tpl\nc\nd\ne\nf\ng\nh\ni\nJ-tpl\n";
        let result = Merger::default().three_way_merge(base, ours, theirs);
        let regions = result
            .conflict_markers
            .iter()
            .enumerate()
            .map(|(i, m)| ConflictRegion::from_marker("f.txt", i + 1, ConflictType::Content, m))
            .collect();
        (result.merged_content, regions)
    }

    #[test]
    fn test_resolve_each_side() {
        let (text, mut regions) = conflicted();
        assert_eq!(regions.len(), 2);

        let resolved = ConflictResolver::resolve_text(&text, &mut regions, |r| {
            if r.index == 1 {
                Resolution::KeepCurrent
            } else {
                Resolution::AcceptTemplate
            }
        })
        .unwrap();

        assert_eq!(resolved, "a\nB-ours\nc\nd\ne\nf\ng\nh\ni\nJ-tpl\n");
        assert!(regions.iter().all(ConflictRegion::is_resolved));
    }

    #[test]
    fn test_accept_old_and_custom() {
        let (text, mut regions) = conflicted();
        let resolved = ConflictResolver::resolve_text(&text, &mut regions, |r| {
            if r.index == 1 {
                Resolution::AcceptOld
            } else {
                Resolution::Custom("merged by hand\n".into())
            }
        })
        .unwrap();
        assert_eq!(resolved, "a\nb\nc\nd\ne\nf\ng\nh\ni\nmerged by hand\n");
    }

    #[test]
    fn test_cannot_resolve_twice() {
        let (text, mut regions) = conflicted();
        let once =
            ConflictResolver::resolve_text(&text, &mut regions, |_| Resolution::KeepCurrent).unwrap();
        let again = ConflictResolver::resolve_text(&once, &mut regions, |_| Resolution::KeepCurrent);
        assert!(matches!(again, Err(ConflictError::AlreadyResolved(ref id)) if id == "f.txt#1"));
    }

    #[test]
    fn test_edited_text_is_marker_mismatch() {
        let (text, mut regions) = conflicted();
        let edited = format!("new first line\n{text}");
        let result = ConflictResolver::resolve_text(&edited, &mut regions, |_| Resolution::KeepCurrent);
        assert!(matches!(result, Err(ConflictError::MarkerMismatch { .. })));
        assert!(regions.iter().all(|r| !r.is_resolved()));
    }

    #[test]
    fn test_whole_file_resolution() {
        let mut region = ConflictRegion::whole_file(
            "logo.png",
            ConflictType::Binary,
            Some(Entry::file(vec![0u8, 1])),
            Some(Entry::file(vec![0u8, 2])),
            Some(Entry::file(vec![0u8, 3])),
        );
        let entry = ConflictResolver::resolve_whole_file(&mut region, &Resolution::AcceptTemplate)
            .unwrap();
        assert_eq!(entry, Some(Entry::file(vec![0u8, 2])));
        assert!(matches!(
            ConflictResolver::resolve_whole_file(&mut region, &Resolution::KeepCurrent),
            Err(ConflictError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn test_custom_symlink_target() {
        let region = ConflictRegion::whole_file(
            "link",
            ConflictType::Symlink,
            Some(Entry::symlink("a")),
            Some(Entry::symlink("b")),
            Some(Entry::symlink("c")),
        );
        assert_eq!(
            ConflictResolver::resolved_content(&region, &Resolution::Custom("d".into())),
            Some(Entry::symlink("d"))
        );
    }

    #[test]
    fn test_edit_delete_accept_template_removes_path() {
        let mut region = ConflictRegion::whole_file(
            "gone.txt",
            ConflictType::EditDelete,
            Some(Entry::file("old")),
            None,
            Some(Entry::file("edited")),
        );
        assert_eq!(
            ConflictResolver::resolve_whole_file(&mut region, &Resolution::AcceptTemplate).unwrap(),
            None
        );
    }
}
