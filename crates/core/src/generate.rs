//! First generation of a subproject from a template.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::answers::{check_answer_keys, AnswersStore};
use crate::config::RestampConfig;
use crate::errors::{HistoryError, UpdateError};
use crate::history::HistoryLocator;
use crate::models::{AnswerSet, Provenance};
use crate::snapshot::engine::{TemplateEngine, TeraEngine};
use crate::snapshot::renderer::{SnapshotRenderer, TemplateSource};
use crate::snapshot::tree::{apply_ops, diff, DiffOp, FileTreeSnapshot};
use crate::vcs::{GitVcs, Vcs};

/// Inputs for one generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub template: PathBuf,
    pub destination: PathBuf,
    pub answers: AnswerSet,
    /// Template revision to render; the head (or working tree) when `None`.
    pub vcs_ref: Option<String>,
    /// Replace existing files whose content differs.
    pub overwrite: bool,
}

/// What a generation wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResult {
    /// Template commit recorded in the answers file, if the template is a
    /// git history.
    pub commit: Option<String>,
    pub source: TemplateSource,
    /// Paths written, in path order.
    pub written: Vec<String>,
    pub answers: AnswerSet,
}

/// Renders a template into a fresh subproject and records its provenance.
pub struct ProjectGenerator {
    history: HistoryLocator,
    renderer: SnapshotRenderer,
    store: AnswersStore,
}

impl ProjectGenerator {
    pub fn new(
        config: &RestampConfig,
        vcs: Arc<dyn Vcs>,
        engine: Arc<dyn TemplateEngine>,
    ) -> Self {
        let store = AnswersStore::from_config(config);
        Self {
            history: HistoryLocator::new(Arc::clone(&vcs)),
            renderer: SnapshotRenderer::new(vcs, engine, config.render.timeout(), store.file_name()),
            store,
        }
    }

    pub fn from_config(config: &RestampConfig) -> Self {
        Self::new(config, Arc::new(GitVcs::new()), Arc::new(TeraEngine::new()))
    }

    #[instrument(skip_all, fields(template = %request.template.display(), destination = %request.destination.display()))]
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResult, UpdateError> {
        check_answer_keys(&request.answers)?;
        let template = request.template.canonicalize()?;
        let (source, commit) = self.select_source(&template, request.vcs_ref.as_deref())?;

        let rendered = self
            .renderer
            .render(&template, &source, &request.answers)
            .await?;

        std::fs::create_dir_all(&request.destination)?;
        let destination = request.destination.as_path();
        let existing = FileTreeSnapshot::capture_paths(destination, rendered.snapshot.paths())?;
        let ops = diff(&existing, &rendered.snapshot);
        if !request.overwrite {
            check_overwrite(destination, &existing, &self.store, &ops)?;
        }

        let provenance = Provenance::new(template.display().to_string(), commit.clone());
        let prepared = self.store.prepare(&rendered.answers, &provenance)?;
        apply_ops(destination, &ops)?;
        self.store.write(destination, &prepared)?;

        let written: Vec<String> = ops.iter().map(|op| op.path().to_string()).collect();
        info!(files = written.len(), commit = commit.as_deref().unwrap_or("-"), "subproject generated");
        Ok(GenerateResult {
            commit,
            source,
            written,
            answers: rendered.answers,
        })
    }

    /// Which template state to render and which commit to record.
    fn select_source(
        &self,
        template: &Path,
        vcs_ref: Option<&str>,
    ) -> Result<(TemplateSource, Option<String>), UpdateError> {
        if let Some(rev) = vcs_ref {
            let sha = self.history.resolve(template, rev)?;
            return Ok((TemplateSource::Commit(sha.clone()), Some(sha)));
        }

        match self.history.latest_commit(template) {
            Ok(head) if head.uncommitted => {
                warn!("template has uncommitted changes; rendering its working tree");
                Ok((TemplateSource::WorkingTree, Some(head.commit)))
            }
            Ok(head) => Ok((TemplateSource::Commit(head.commit.clone()), Some(head.commit))),
            Err(HistoryError::Unavailable { .. } | HistoryError::NoCommits(_)) => {
                warn!("template is not a git history; no commit will be recorded");
                Ok((TemplateSource::WorkingTree, None))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn check_overwrite(
    destination: &Path,
    existing: &FileTreeSnapshot,
    store: &AnswersStore,
    ops: &[DiffOp],
) -> Result<(), UpdateError> {
    if store.path(destination).exists() {
        return Err(UpdateError::WouldOverwrite(store.file_name().to_string()));
    }
    match ops.iter().find(|op| existing.contains(op.path())) {
        Some(op) => Err(UpdateError::WouldOverwrite(op.path().to_string())),
        None => Ok(()),
    }
}
