//! Is the subproject behind its template?
//!
//! The recorded `_commit` is compared with the template head. A recorded
//! commit that is not an ancestor of the head (history rewritten, or a
//! target older than the subproject) is reported as [`OutdatedStatus::Diverged`]
//! rather than quietly treated as up to date.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::answers::AnswersStore;
use crate::dirty::DirtyStateDetector;
use crate::errors::{UpdateError, VcsError};
use crate::history::{template_path, HistoryLocator, TemplateHead};
use crate::models::{CheckWarning, Provenance};
use crate::vcs::{DiffStat, Vcs};

/// Result of comparing the recorded commit with the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum OutdatedStatus {
    UpToDate {
        commit: String,
    },
    Outdated {
        current: String,
        latest: String,
        /// The template's uncommitted changes are part of the update.
        uncommitted: bool,
    },
    /// The recorded commit is not behind `latest` in the template history.
    Diverged { current: String, latest: String },
    /// The answers file records no template commit.
    Unknown,
}

impl OutdatedStatus {
    pub fn is_outdated(&self) -> bool {
        matches!(self, Self::Outdated { .. })
    }
}

/// What a check found, with the warnings that came up along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutdatedReport {
    pub status: OutdatedStatus,
    pub warnings: Vec<CheckWarning>,
    /// Change volume between the recorded and the latest commit.
    pub diff_stat: Option<DiffStat>,
    /// Resolved template location.
    pub template: PathBuf,
    /// Template head; `None` for explicit targets.
    pub head: Option<TemplateHead>,
}

/// Compares a subproject's provenance with its template history.
#[derive(Clone)]
pub struct OutdatedChecker {
    vcs: Arc<dyn Vcs>,
    history: HistoryLocator,
    dirty: DirtyStateDetector,
    store: AnswersStore,
}

impl OutdatedChecker {
    pub fn new(vcs: Arc<dyn Vcs>, store: AnswersStore) -> Self {
        Self {
            history: HistoryLocator::new(Arc::clone(&vcs)),
            dirty: DirtyStateDetector::new(Arc::clone(&vcs)),
            vcs,
            store,
        }
    }

    /// Check `subproject` against the template head.
    pub fn check(&self, subproject: &Path) -> Result<OutdatedReport, UpdateError> {
        self.check_against(subproject, None)
    }

    /// Check `subproject` against `target` (any revision), or the template
    /// head when `None`.
    #[instrument(skip(self), fields(subproject = %subproject.display()))]
    pub fn check_against(
        &self,
        subproject: &Path,
        target: Option<&str>,
    ) -> Result<OutdatedReport, UpdateError> {
        let (_, provenance) = self.store.load(subproject)?;
        self.evaluate(subproject, &provenance, target)
    }

    /// Strict check: anything but up to date is an error.
    pub fn require_up_to_date(&self, subproject: &Path) -> Result<OutdatedReport, UpdateError> {
        let report = self.check(subproject)?;
        for warning in &report.warnings {
            warn!(%warning, "check warning");
        }
        match &report.status {
            OutdatedStatus::UpToDate { .. } => Ok(report),
            OutdatedStatus::Outdated {
                current,
                latest,
                uncommitted,
            } => Err(UpdateError::SubprojectOutdated {
                from: current.clone(),
                to: if *uncommitted {
                    format!("{latest} with uncommitted changes")
                } else {
                    latest.clone()
                },
            }),
            OutdatedStatus::Diverged { current, latest } => Err(UpdateError::HistoryRewound {
                current: current.clone(),
                latest: latest.clone(),
            }),
            OutdatedStatus::Unknown => Err(UpdateError::NoRecordedCommit),
        }
    }

    /// Check already-loaded provenance. Precondition failures (subproject
    /// outside version control, template history unavailable) are errors;
    /// a dirty subproject is a warning.
    pub fn evaluate(
        &self,
        subproject: &Path,
        provenance: &Provenance,
        target: Option<&str>,
    ) -> Result<OutdatedReport, UpdateError> {
        let mut warnings = Vec::new();
        if self.dirty.is_dirty(subproject)? {
            warnings.push(CheckWarning::DirtySubproject);
        }

        let template = template_path(subproject, provenance);
        let (latest, uncommitted, head) = match target {
            Some(rev) => (self.history.resolve(&template, rev)?, false, None),
            None => {
                let head = self.history.latest_commit(&template)?;
                (head.commit.clone(), head.uncommitted, Some(head))
            }
        };
        if uncommitted {
            warnings.push(CheckWarning::DirtyTemplate);
        }

        let Some(recorded) = provenance.template_commit.as_deref() else {
            info!("no recorded template commit");
            return Ok(OutdatedReport {
                status: OutdatedStatus::Unknown,
                warnings,
                diff_stat: None,
                template,
                head,
            });
        };

        let current = match self.vcs.resolve(&template, recorded) {
            Ok(sha) => sha,
            Err(VcsError::RefNotFound(_)) => {
                warn!(recorded, "recorded commit no longer exists in the template");
                return Ok(OutdatedReport {
                    status: OutdatedStatus::Diverged {
                        current: recorded.to_string(),
                        latest,
                    },
                    warnings,
                    diff_stat: None,
                    template,
                    head,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let status = if current == latest {
            if uncommitted {
                OutdatedStatus::Outdated {
                    current,
                    latest,
                    uncommitted,
                }
            } else {
                OutdatedStatus::UpToDate { commit: current }
            }
        } else if self.vcs.is_ancestor(&template, &current, &latest)? {
            OutdatedStatus::Outdated {
                current,
                latest,
                uncommitted,
            }
        } else {
            OutdatedStatus::Diverged { current, latest }
        };

        let diff_stat = match &status {
            OutdatedStatus::Outdated { current, latest, .. } if current != latest => {
                match self.vcs.diff_stat(&template, current, latest) {
                    Ok(stat) => Some(stat),
                    Err(e) => {
                        warn!(error = %e, "could not compute diff stat");
                        None
                    }
                }
            }
            _ => None,
        };

        info!(?status, warnings = warnings.len(), "outdated check complete");
        Ok(OutdatedReport {
            status,
            warnings,
            diff_stat,
            template,
            head,
        })
    }
}
