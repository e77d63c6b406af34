//! Template history discovery.
//!
//! The chain of template commits a subproject has passed through is the
//! commits recorded in its answers file, checked against the template's
//! actual log.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::answers::AnswersStore;
use crate::errors::{HistoryError, VcsError};
use crate::models::Provenance;
use crate::vcs::{Vcs, WorkingState};

/// Current head of a template history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateHead {
    pub commit: String,
    /// The template working tree has changes on top of `commit`.
    pub uncommitted: bool,
}

/// Where the template recorded in `provenance` lives. Relative locations are
/// taken relative to the subproject.
pub fn template_path(subproject: &Path, provenance: &Provenance) -> PathBuf {
    let location = Path::new(&provenance.template_location);
    if location.is_absolute() {
        location.to_path_buf()
    } else {
        subproject.join(location)
    }
}

/// Answers history questions about templates.
#[derive(Clone)]
pub struct HistoryLocator {
    vcs: Arc<dyn Vcs>,
}

impl HistoryLocator {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }

    /// Template commits `subproject` has been rendered from, oldest first,
    /// ending with the current one.
    #[instrument(skip(self, store), fields(subproject = %subproject.display()))]
    pub fn commit_chain(
        &self,
        subproject: &Path,
        store: &AnswersStore,
    ) -> Result<Vec<String>, HistoryError> {
        let (_, provenance) = store.load(subproject)?;
        self.chain_for(&template_path(subproject, &provenance), &provenance)
    }

    /// Like [`commit_chain`](Self::commit_chain) for already-loaded
    /// provenance. Recorded commits the template no longer contains are
    /// skipped with a warning.
    pub fn chain_for(
        &self,
        template: &Path,
        provenance: &Provenance,
    ) -> Result<Vec<String>, HistoryError> {
        let log = self
            .vcs
            .log(template)
            .map_err(|e| history_error(template, e))?;
        let known: HashSet<&str> = log.iter().map(|c| c.sha.as_str()).collect();

        let recorded = provenance
            .history
            .iter()
            .map(|r| r.commit.as_str())
            .chain(provenance.template_commit.as_deref());

        let mut chain: Vec<String> = Vec::new();
        for recorded_rev in recorded {
            // Recorded revisions may be abbreviated; compare full SHAs.
            let commit = match self.vcs.resolve(template, recorded_rev) {
                Ok(sha) if known.contains(sha.as_str()) => sha,
                _ => {
                    warn!(commit = recorded_rev, "recorded commit is not in the template history");
                    continue;
                }
            };
            if chain.last() != Some(&commit) {
                chain.push(commit);
            }
        }

        debug!(length = chain.len(), "commit chain built");
        Ok(chain)
    }

    /// Head of the template history, and whether its working tree carries
    /// uncommitted changes.
    #[instrument(skip(self), fields(template = %template.display()))]
    pub fn latest_commit(&self, template: &Path) -> Result<TemplateHead, HistoryError> {
        let commit = self
            .vcs
            .head(template)
            .map_err(|e| history_error(template, e))?;
        let uncommitted = match self.vcs.status(template) {
            Ok(WorkingState::Dirty) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "could not read template status, assuming clean");
                false
            }
        };
        debug!(commit = %commit, uncommitted, "template head");
        Ok(TemplateHead {
            commit,
            uncommitted,
        })
    }

    /// Resolve an explicit revision of the template (branch, tag, SHA).
    pub fn resolve(&self, template: &Path, rev: &str) -> Result<String, HistoryError> {
        self.vcs
            .resolve(template, rev)
            .map_err(|e| history_error(template, e))
    }
}

fn history_error(template: &Path, err: VcsError) -> HistoryError {
    match err {
        VcsError::RepositoryNotFound(_) => HistoryError::Unavailable {
            location: template.display().to_string(),
            detail: "not a git repository".into(),
        },
        VcsError::NoCommits(location) => HistoryError::NoCommits(location),
        other => HistoryError::Vcs(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnswerSet;
    use crate::test_support::{commit_all, init_repo, write_files};
    use crate::vcs::GitVcs;

    fn locator() -> HistoryLocator {
        HistoryLocator::new(Arc::new(GitVcs::new()))
    }

    #[test]
    fn test_plain_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = locator().latest_commit(dir.path()).unwrap_err();
        assert!(matches!(err, HistoryError::Unavailable { .. }));
    }

    #[test]
    fn test_empty_repository_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let err = locator().latest_commit(dir.path()).unwrap_err();
        assert!(matches!(err, HistoryError::NoCommits(_)));
    }

    #[test]
    fn test_latest_commit_reports_uncommitted_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        write_files(dir.path(), &[("a.txt", "a")]);
        let head = commit_all(dir.path(), "first");

        let clean = locator().latest_commit(dir.path()).unwrap();
        assert_eq!(clean, TemplateHead { commit: head.clone(), uncommitted: false });

        write_files(dir.path(), &[("a.txt", "changed")]);
        let dirty = locator().latest_commit(dir.path()).unwrap();
        assert_eq!(dirty.commit, head);
        assert!(dirty.uncommitted);
    }

    #[test]
    fn test_commit_chain_follows_provenance() {
        let tpl = tempfile::tempdir().unwrap();
        init_repo(tpl.path());
        write_files(tpl.path(), &[("a.txt", "1")]);
        let c1 = commit_all(tpl.path(), "one");
        write_files(tpl.path(), &[("a.txt", "2")]);
        let c2 = commit_all(tpl.path(), "two");

        let sub = tempfile::tempdir().unwrap();
        let store = AnswersStore::new(".restamp-answers.toml");
        let mut provenance = Provenance::new(tpl.path().display().to_string(), Some(c1.clone()));
        provenance.advance(&AnswerSet::new(), Some(c2.clone()));
        // A commit that was rewritten away is dropped.
        provenance.history.insert(0, crate::models::HistoryRecord::new("0".repeat(40), AnswerSet::new()));
        store.save(sub.path(), &AnswerSet::new(), &provenance).unwrap();

        let chain = locator().commit_chain(sub.path(), &store).unwrap();
        assert_eq!(chain, vec![c1, c2]);
    }

    #[test]
    fn test_abbreviated_recorded_commit_stays_in_chain() {
        let tpl = tempfile::tempdir().unwrap();
        init_repo(tpl.path());
        write_files(tpl.path(), &[("a.txt", "1")]);
        let c1 = commit_all(tpl.path(), "one");
        write_files(tpl.path(), &[("a.txt", "2")]);
        let c2 = commit_all(tpl.path(), "two");

        let mut provenance =
            Provenance::new(tpl.path().display().to_string(), Some(c1[..8].to_string()));
        provenance.advance(&AnswerSet::new(), Some(c2[..12].to_string()));

        let chain = locator().chain_for(tpl.path(), &provenance).unwrap();
        assert_eq!(chain, vec![c1, c2]);
    }

    #[test]
    fn test_relative_template_location() {
        let provenance = Provenance::new("../tpl", None);
        assert_eq!(
            template_path(Path::new("/work/sub"), &provenance),
            PathBuf::from("/work/sub/../tpl")
        );
    }
}
