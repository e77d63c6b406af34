//! Materializes a template state with a set of answers.
//!
//! Checkout and templating run on a blocking thread. The scratch directory
//! belongs to the awaiting side, so it is removed as soon as the render
//! ends or is abandoned. An abandoned render also raises the engine's
//! cancel flag.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::RenderError;
use crate::models::AnswerSet;
use crate::snapshot::engine::{CancelFlag, RenderOutput, TemplateEngine};
use crate::snapshot::tree::FileTreeSnapshot;
use crate::vcs::Vcs;

/// Which state of the template to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "commit")]
pub enum TemplateSource {
    /// A committed state, checked out into scratch space.
    Commit(String),
    /// The template directory as it is on disk, uncommitted changes included.
    WorkingTree,
}

impl std::fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit(sha) => write!(f, "{sha}"),
            Self::WorkingTree => write!(f, "working tree"),
        }
    }
}

/// A rendered tree and the answers it was rendered with.
#[derive(Debug, Clone)]
pub struct RenderedSnapshot {
    pub snapshot: FileTreeSnapshot,
    /// Answers after the template's defaults were applied.
    pub answers: AnswerSet,
    pub source: TemplateSource,
}

/// Runs checkout + templating in isolation with a time limit.
#[derive(Clone)]
pub struct SnapshotRenderer {
    vcs: Arc<dyn Vcs>,
    engine: Arc<dyn TemplateEngine>,
    timeout: Duration,
    answers_file: String,
}

impl SnapshotRenderer {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        engine: Arc<dyn TemplateEngine>,
        timeout: Duration,
        answers_file: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            engine,
            timeout,
            answers_file: answers_file.into(),
        }
    }

    /// Render `template` at `source` with `answers`.
    ///
    /// The subproject's answers file is never part of the result; it is
    /// owned by the answers store.
    #[instrument(skip_all, fields(template = %template.display(), source = %source))]
    pub async fn render(
        &self,
        template: &Path,
        source: &TemplateSource,
        answers: &AnswerSet,
    ) -> Result<RenderedSnapshot, RenderError> {
        let scratch = match source {
            TemplateSource::Commit(_) => Some(
                tempfile::Builder::new()
                    .prefix("restamp-render-")
                    .tempdir()?,
            ),
            TemplateSource::WorkingTree => None,
        };
        let cancel = CancelFlag::new();
        let _abandoned = CancelOnDrop(cancel.clone());

        let vcs = Arc::clone(&self.vcs);
        let engine = Arc::clone(&self.engine);
        let template: PathBuf = template.to_path_buf();
        let workdir = scratch.as_ref().map(|dir| dir.path().to_path_buf());
        let task_source = source.clone();
        let task_answers = answers.clone();
        let task_cancel = cancel.clone();

        let mut handle = tokio::task::spawn_blocking(move || {
            render_blocking(
                vcs.as_ref(),
                engine.as_ref(),
                &template,
                workdir.as_deref(),
                &task_source,
                &task_answers,
                &task_cancel,
            )
        });

        let output = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(RenderError::TaskFailed(join_err.to_string())),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "render timed out, cancelling");
                cancel.cancel();
                if let Some(dir) = scratch {
                    abandon_scratch(dir, handle);
                }
                return Err(RenderError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let mut snapshot = output.snapshot;
        if snapshot.remove(&self.answers_file).is_some() {
            debug!(file = %self.answers_file, "dropped answers file from rendered tree");
        }

        info!(files = snapshot.len(), "snapshot rendered");
        Ok(RenderedSnapshot {
            snapshot,
            answers: output.answers,
            source: source.clone(),
        })
    }
}

/// Raises the flag when the awaiting side goes away, however it leaves.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Remove a timed-out render's scratch directory now, and once more after
/// the blocking task stops in case it wrote there in the meantime.
fn abandon_scratch(
    dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<Result<RenderOutput, RenderError>>,
) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(scratch = %path.display(), error = %e, "failed to remove scratch workspace");
    }
    tokio::spawn(async move {
        let _ = handle.await;
        if path.exists() {
            debug!(scratch = %path.display(), "removing scratch left by cancelled render");
            let _ = std::fs::remove_dir_all(&path);
        }
    });
}

fn render_blocking(
    vcs: &dyn Vcs,
    engine: &dyn TemplateEngine,
    template: &Path,
    scratch: Option<&Path>,
    source: &TemplateSource,
    answers: &AnswerSet,
    cancel: &CancelFlag,
) -> Result<RenderOutput, RenderError> {
    match (source, scratch) {
        (TemplateSource::Commit(commit), Some(scratch)) => {
            vcs.checkout(template, commit, scratch)?;
            cancel.check()?;
            engine.render(scratch, answers, cancel)
        }
        _ => engine.render(template, answers, cancel),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::models::AnswerValue;
    use crate::snapshot::engine::TeraEngine;
    use crate::snapshot::tree::Entry;
    use crate::test_support::{commit_all, init_repo, write_files};
    use crate::vcs::GitVcs;

    fn renderer(engine: Arc<dyn TemplateEngine>, timeout: Duration) -> SnapshotRenderer {
        SnapshotRenderer::new(Arc::new(GitVcs::new()), engine, timeout, ".restamp-answers.toml")
    }

    fn answers() -> AnswerSet {
        let mut answers = AnswerSet::new();
        answers.insert("name".into(), AnswerValue::String("demo".into()));
        answers
    }

    #[tokio::test]
    async fn test_render_commit_and_working_tree() {
        let tpl = tempfile::tempdir().unwrap();
        init_repo(tpl.path());
        write_files(
            tpl.path(),
            &[
                ("hello.txt.tera", "hello {{ name }}\n"),
                (".restamp-answers.toml.tera", "name = \"{{ name }}\"\n"),
            ],
        );
        let first = commit_all(tpl.path(), "first");
        write_files(tpl.path(), &[("hello.txt.tera", "hi {{ name }}\n")]);

        let renderer = renderer(Arc::new(TeraEngine::new()), Duration::from_secs(30));

        let committed = renderer
            .render(tpl.path(), &TemplateSource::Commit(first), &answers())
            .await
            .unwrap();
        assert_eq!(committed.snapshot.get("hello.txt"), Some(&Entry::file("hello demo\n")));
        assert!(!committed.snapshot.contains(".restamp-answers.toml"));

        let live = renderer
            .render(tpl.path(), &TemplateSource::WorkingTree, &answers())
            .await
            .unwrap();
        assert_eq!(live.snapshot.get("hello.txt"), Some(&Entry::file("hi demo\n")));
    }

    #[tokio::test]
    async fn test_unknown_commit_is_checkout_error() {
        let tpl = tempfile::tempdir().unwrap();
        init_repo(tpl.path());
        write_files(tpl.path(), &[("a.txt", "a")]);
        commit_all(tpl.path(), "first");

        let err = renderer(Arc::new(TeraEngine::new()), Duration::from_secs(30))
            .render(tpl.path(), &TemplateSource::Commit("deadbeef".into()), &answers())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Checkout(_)));
    }

    /// Records the directory it renders from, then stalls until cancelled.
    struct SlowEngine {
        seen: Mutex<Option<PathBuf>>,
        stopped: AtomicBool,
        delay: Duration,
    }

    impl TemplateEngine for SlowEngine {
        fn render(
            &self,
            template_dir: &Path,
            _answers: &AnswerSet,
            cancel: &CancelFlag,
        ) -> Result<RenderOutput, RenderError> {
            *self.seen.lock().unwrap() = Some(template_dir.to_path_buf());
            let started = std::time::Instant::now();
            while started.elapsed() < self.delay {
                if let Err(e) = cancel.check() {
                    self.stopped.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(RenderOutput {
                snapshot: FileTreeSnapshot::new(),
                answers: AnswerSet::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_scratch_and_cancels_engine() {
        let tpl = tempfile::tempdir().unwrap();
        init_repo(tpl.path());
        write_files(tpl.path(), &[("a.txt", "a")]);
        let head = commit_all(tpl.path(), "first");

        let engine = Arc::new(SlowEngine {
            seen: Mutex::new(None),
            stopped: AtomicBool::new(false),
            delay: Duration::from_secs(10),
        });
        let err = renderer(engine.clone(), Duration::from_millis(500))
            .render(tpl.path(), &TemplateSource::Commit(head), &answers())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Timeout { .. }));

        let scratch = engine.seen.lock().unwrap().clone().unwrap();
        assert!(!scratch.exists());

        for _ in 0..200 {
            if engine.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.stopped.load(Ordering::SeqCst));
    }
}
