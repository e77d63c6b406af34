//! Subproject update workflow.
//!
//! The [`UpdateOrchestrator`] drives one update through a small state
//! machine:
//!
//! 1. Load answers and provenance, check whether the subproject is outdated.
//! 2. Render the old and the new template states concurrently, each in its
//!    own scratch directory.
//! 3. Reconcile (old, new, current) in memory.
//! 4. Write the merged tree, then advance provenance.
//!
//! Nothing touches the subproject before step 4, and step 4 starts only
//! once the new answers file has been rendered and every destination
//! checked. A lock prevents concurrent
//! updates through the same orchestrator.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::answers::{check_answer_keys, AnswersStore};
use crate::config::RestampConfig;
use crate::conflict::{ConflictLocation, ConflictRegion, ConflictResolver, Resolution};
use crate::errors::{CoreError, UpdateError};
use crate::models::{AnswerSet, CheckWarning, UpdateResult, UpdateStatus};
use crate::outdated::{OutdatedChecker, OutdatedStatus};
use crate::reconcile::ReconciliationEngine;
use crate::snapshot::engine::{TemplateEngine, TeraEngine};
use crate::snapshot::renderer::{SnapshotRenderer, TemplateSource};
use crate::snapshot::tree::{apply_ops, remove_entry, write_entry, Entry, FileTreeSnapshot};
use crate::vcs::{GitVcs, Vcs};

// ---------------------------------------------------------------------------
// Update state machine
// ---------------------------------------------------------------------------

/// States of an update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    CheckingOutdated,
    UpToDate,
    Rendering,
    Reconciling,
    Clean,
    HasConflicts,
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CheckingOutdated => write!(f, "checking_outdated"),
            Self::UpToDate => write!(f, "up_to_date"),
            Self::Rendering => write!(f, "rendering"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Clean => write!(f, "clean"),
            Self::HasConflicts => write!(f, "has_conflicts"),
        }
    }
}

/// Caller inputs for one update.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Answers merged over the recorded ones.
    pub answers: AnswerSet,
    /// Template revision to update to; the template head when `None`.
    pub vcs_ref: Option<String>,
    /// Proceed even though the subproject has uncommitted changes.
    pub allow_dirty: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs the update workflow for subprojects.
pub struct UpdateOrchestrator {
    store: AnswersStore,
    checker: OutdatedChecker,
    renderer: SnapshotRenderer,
    reconciler: ReconciliationEngine,
    allow_dirty: bool,
    state: Mutex<UpdateState>,
    /// Atomic flag preventing concurrent updates.
    running: Arc<AtomicBool>,
    started_at: Mutex<Option<chrono::DateTime<Utc>>>,
}

impl UpdateOrchestrator {
    /// Build an orchestrator over the given collaborators.
    pub fn new(
        config: &RestampConfig,
        vcs: Arc<dyn Vcs>,
        engine: Arc<dyn TemplateEngine>,
    ) -> Self {
        let store = AnswersStore::from_config(config);
        info!(answers_file = %store.file_name(), "initializing update orchestrator");
        Self {
            checker: OutdatedChecker::new(Arc::clone(&vcs), store.clone()),
            renderer: SnapshotRenderer::new(
                vcs,
                engine,
                config.render.timeout(),
                store.file_name(),
            ),
            reconciler: ReconciliationEngine::from_config(&config.merge),
            allow_dirty: config.update.allow_dirty,
            store,
            state: Mutex::new(UpdateState::Idle),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
        }
    }

    /// Orchestrator backed by git and Tera.
    pub fn from_config(config: &RestampConfig) -> Self {
        Self::new(config, Arc::new(GitVcs::new()), Arc::new(TeraEngine::new()))
    }

    pub fn checker(&self) -> &OutdatedChecker {
        &self.checker
    }

    pub fn store(&self) -> &AnswersStore {
        &self.store
    }

    /// State of the current (or last) update.
    pub fn state(&self) -> UpdateState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Check if an update is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: UpdateState) {
        debug!(state = %next, "update state");
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Update `subproject` to the latest (or requested) template state.
    ///
    /// Merge conflicts are not errors: the merged tree is written with
    /// conflict markers, provenance still advances, and the result carries
    /// the conflicts. Errors leave the subproject untouched, except for
    /// [`UpdateError::WriteFailed`] during the write phase.
    #[instrument(skip(self, request), fields(subproject = %subproject.display()))]
    pub async fn update(
        &self,
        subproject: &Path,
        request: UpdateRequest,
    ) -> Result<UpdateResult, UpdateError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = match self.started_at.lock() {
                Ok(at) => *at,
                Err(poisoned) => *poisoned.into_inner(),
            };
            return Err(UpdateError::AlreadyRunning {
                started_at: started_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".into()),
            });
        }
        let _guard = UpdateLockGuard(self.running.clone());
        if let Ok(mut at) = self.started_at.lock() {
            *at = Some(Utc::now());
        }

        self.set_state(UpdateState::CheckingOutdated);
        let result = self.do_update(subproject, request).await;
        match &result {
            Ok(res) => info!(
                status = %res.status,
                touched = res.touched_paths.len(),
                conflicts = res.conflicts.len(),
                "update finished"
            ),
            Err(e) => {
                warn!(error = %e, "update failed");
                self.set_state(UpdateState::Idle);
            }
        }
        result
    }

    async fn do_update(
        &self,
        subproject: &Path,
        request: UpdateRequest,
    ) -> Result<UpdateResult, UpdateError> {
        check_answer_keys(&request.answers)?;
        let (old_answers, mut provenance) = self.store.load(subproject)?;
        let report = self
            .checker
            .evaluate(subproject, &provenance, request.vcs_ref.as_deref())?;
        for warning in &report.warnings {
            warn!(%warning, "check warning");
        }

        let (current, latest, uncommitted) = match report.status {
            OutdatedStatus::UpToDate { commit } => {
                self.set_state(UpdateState::UpToDate);
                info!(commit = %commit, "subproject is up to date");
                return Ok(UpdateResult::up_to_date(Some(commit), report.warnings));
            }
            OutdatedStatus::Unknown => return Err(UpdateError::NoRecordedCommit),
            OutdatedStatus::Diverged { current, latest } => {
                return Err(UpdateError::HistoryRewound { current, latest })
            }
            OutdatedStatus::Outdated {
                current,
                latest,
                uncommitted,
            } => (current, latest, uncommitted),
        };

        let dirty = report.warnings.contains(&CheckWarning::DirtySubproject);
        if dirty && !(request.allow_dirty || self.allow_dirty) {
            return Err(UpdateError::DirtyAndOutdated {
                from: current,
                to: latest,
            });
        }

        // Rendering
        self.set_state(UpdateState::Rendering);
        let mut new_answers = old_answers.clone();
        new_answers.extend(request.answers);
        let old_source = TemplateSource::Commit(current.clone());
        let new_source = if uncommitted {
            TemplateSource::WorkingTree
        } else {
            TemplateSource::Commit(latest.clone())
        };
        let (old, new) = tokio::try_join!(
            self.renderer
                .render(&report.template, &old_source, &old_answers),
            self.renderer
                .render(&report.template, &new_source, &new_answers),
        )?;

        // Reconciling
        self.set_state(UpdateState::Reconciling);
        let paths: BTreeSet<&str> = old.snapshot.paths().chain(new.snapshot.paths()).collect();
        let current_tree = FileTreeSnapshot::capture_paths(subproject, paths)?;
        let outcome = self
            .reconciler
            .reconcile(&old.snapshot, &new.snapshot, &current_tree);

        // Write phase; the answers file is validated before the tree changes.
        provenance.advance(&old_answers, Some(latest.clone()));
        let prepared = self.store.prepare(&new.answers, &provenance)?;
        apply_ops(subproject, &outcome.changes)?;
        self.store.write(subproject, &prepared)?;

        let touched_paths: BTreeSet<String> = outcome
            .changes
            .iter()
            .flat_map(|op| op.touched_paths())
            .map(str::to_string)
            .collect();
        let status = if outcome.is_clean() {
            self.set_state(UpdateState::Clean);
            UpdateStatus::Updated
        } else {
            self.set_state(UpdateState::HasConflicts);
            UpdateStatus::ConflictsRemain
        };

        Ok(UpdateResult {
            status,
            from_commit: Some(current),
            to_commit: Some(latest),
            touched_paths: touched_paths.into_iter().collect(),
            conflicts: outcome.conflicts,
            warnings: report.warnings,
            renames: outcome.renames,
        })
    }
}

/// Apply resolutions to conflicts an update left in `subproject`.
///
/// Marker blocks are replaced in place; whole-file conflicts write (or
/// remove) the chosen entry. Returns the paths written, in order.
pub fn apply_resolutions<F>(
    subproject: &Path,
    conflicts: &mut [ConflictRegion],
    mut choose: F,
) -> Result<Vec<String>, CoreError>
where
    F: FnMut(&ConflictRegion) -> Resolution,
{
    conflicts.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| a.start_line().cmp(&b.start_line()))
    });

    let mut written = Vec::new();
    for group in conflicts.chunk_by_mut(|a, b| a.path == b.path) {
        let path = group[0].path.clone();
        if group[0].location == ConflictLocation::WholeFile {
            for region in group.iter_mut() {
                let resolution = choose(&*region);
                match ConflictResolver::resolve_whole_file(region, &resolution)? {
                    Some(entry) => write_entry(subproject, &path, &entry)?,
                    None => remove_entry(subproject, &path)?,
                }
            }
        } else {
            let full = subproject.join(&path);
            let text = std::fs::read_to_string(&full).map_err(UpdateError::from)?;
            let resolved = ConflictResolver::resolve_text(&text, group, &mut choose)?;
            write_entry(subproject, &path, &Entry::file(resolved.into_bytes()))?;
        }
        written.push(path);
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Update lock RAII guard
// ---------------------------------------------------------------------------

/// Drop guard that resets the `running` flag to `false`.
struct UpdateLockGuard(Arc<AtomicBool>);

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
