//! The templating collaborator.
//!
//! [`TemplateEngine`] is the seam between restamp and whatever turns a
//! template directory plus answers into files. [`TeraEngine`] is the
//! default implementation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tera::{Context, Tera};
use tracing::{debug, instrument, warn};

use crate::errors::RenderError;
use crate::models::AnswerSet;
use crate::snapshot::template_config::{TemplateConfig, TEMPLATE_CONFIG_FILE};
use crate::snapshot::tree::{Entry, FileTreeSnapshot};

/// What a render produces.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub snapshot: FileTreeSnapshot,
    /// Answers after defaults were applied; these are what gets recorded.
    pub answers: AnswerSet,
}

/// Raised when the caller stops waiting for a render.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> Result<(), RenderError> {
        if self.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        Ok(())
    }
}

/// Renders a materialized template directory. Implementations must be
/// deterministic for a fixed `(template_dir contents, answers)` pair and
/// should poll `cancel` between files.
pub trait TemplateEngine: Send + Sync {
    fn render(
        &self,
        template_dir: &Path,
        answers: &AnswerSet,
        cancel: &CancelFlag,
    ) -> Result<RenderOutput, RenderError>;
}

/// [`TemplateEngine`] backed by Tera.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeraEngine;

impl TeraEngine {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateEngine for TeraEngine {
    #[instrument(skip(self, answers, cancel), fields(template = %template_dir.display()))]
    fn render(
        &self,
        template_dir: &Path,
        answers: &AnswerSet,
        cancel: &CancelFlag,
    ) -> Result<RenderOutput, RenderError> {
        let config = TemplateConfig::load(template_dir)?;
        let resolved = config.resolve_answers(answers)?;
        let context = Context::from_serialize(&resolved).map_err(|e| RenderError::Template {
            path: "<answers>".into(),
            detail: format_tera_error(&e),
        })?;

        let source = FileTreeSnapshot::capture(template_dir)?;
        let suffix = config.settings.templates_suffix.as_str();
        let mut snapshot = FileTreeSnapshot::new();

        for (path, entry) in source.iter() {
            cancel.check()?;
            if path == TEMPLATE_CONFIG_FILE || config.is_excluded(path) {
                continue;
            }
            let Some(mut target) = render_path(path, &context)? else {
                debug!(path, "path rendered empty, skipping");
                continue;
            };

            let rendered = match entry {
                Entry::File(bytes) if !suffix.is_empty() && target.ends_with(suffix) => {
                    target.truncate(target.len() - suffix.len());
                    let text = std::str::from_utf8(bytes).map_err(|e| RenderError::Template {
                        path: path.to_string(),
                        detail: format!("template is not UTF-8: {e}"),
                    })?;
                    Entry::File(render_str(path, text, &context)?.into_bytes())
                }
                other => other.clone(),
            };

            if target.is_empty() || target.ends_with('/') {
                debug!(path, "suffix-only file name, skipping");
                continue;
            }
            if snapshot.insert(target.clone(), rendered).is_some() {
                warn!(path, target = %target, "two template files render to the same path");
            }
        }

        debug!(files = snapshot.len(), fingerprint = %snapshot.fingerprint(), "template rendered");
        Ok(RenderOutput {
            snapshot,
            answers: resolved,
        })
    }
}

/// Render the templated segments of `path`. Returns `None` when any segment
/// renders empty, which is how a template makes a file conditional.
fn render_path(path: &str, context: &Context) -> Result<Option<String>, RenderError> {
    if !path.contains("{{") && !path.contains("{%") {
        return Ok(Some(path.to_string()));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        let rendered = render_str(path, segment, context)?;
        let rendered = rendered.trim();
        if rendered.is_empty() {
            return Ok(None);
        }
        if rendered == "." || rendered == ".." || rendered.contains('\\') {
            return Err(RenderError::Template {
                path: path.to_string(),
                detail: format!("path segment renders to '{rendered}'"),
            });
        }
        segments.push(rendered.to_string());
    }
    Ok(Some(segments.join("/")))
}

fn render_str(path: &str, text: &str, context: &Context) -> Result<String, RenderError> {
    Tera::one_off(text, context, false).map_err(|e| RenderError::Template {
        path: path.to_string(),
        detail: format_tera_error(&e),
    })
}

/// Flatten a Tera error chain into one message without Tera's internal
/// one-off template name.
fn format_tera_error(error: &tera::Error) -> String {
    use std::error::Error;

    let mut messages = Vec::new();
    let mut current: Option<&dyn Error> = Some(error);
    while let Some(err) = current {
        let cleaned = err
            .to_string()
            .replace("while rendering '__tera_one_off'", "")
            .replace("Failed to render '__tera_one_off'", "")
            .replace("Failed to parse '__tera_one_off'", "syntax error")
            .replace("'__tera_one_off'", "template")
            .trim()
            .to_string();
        if !cleaned.is_empty() {
            messages.push(cleaned);
        }
        current = err.source();
    }

    if messages.is_empty() {
        "template rendering failed".to_string()
    } else {
        messages.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnswerValue;
    use crate::test_support::write_files;

    fn answers(name: &str) -> AnswerSet {
        let mut answers = AnswerSet::new();
        answers.insert("project_name".into(), AnswerValue::String(name.into()));
        answers.insert("with_ci".into(), AnswerValue::Boolean(false));
        answers
    }

    fn render(dir: &Path, answers: &AnswerSet) -> Result<RenderOutput, RenderError> {
        TeraEngine::new().render(dir, answers, &CancelFlag::new())
    }

    fn template() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_files(
            dir.path(),
            &[
                ("README.md.tera", "# {{ project_name }}\n"),
                ("static.txt", "{{ not rendered }}\n"),
                ("src/{{ project_name }}/lib.rs", "pub fn hi() {}\n"),
                ("{% if with_ci %}ci.yml{% endif %}", "ci\n"),
                ("notes/skip.md", "excluded\n"),
                (
                    "restamp.toml",
                    "[settings]\nexclude = [\"notes/**\"]\n[questions.project_name]\ntype = \"str\"\n",
                ),
            ],
        );
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "x").unwrap();
        dir
    }

    #[test]
    fn test_render_tree() {
        let tpl = template();
        let output = render(tpl.path(), &answers("demo")).unwrap();
        let paths: Vec<_> = output.snapshot.paths().collect();

        assert_eq!(paths, vec!["README.md", "src/demo/lib.rs", "static.txt"]);
        assert_eq!(
            output.snapshot.get("README.md"),
            Some(&Entry::file("# demo\n"))
        );
        assert_eq!(
            output.snapshot.get("static.txt"),
            Some(&Entry::file("{{ not rendered }}\n"))
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let tpl = template();
        let first = render(tpl.path(), &answers("demo")).unwrap();
        let second = render(tpl.path(), &answers("demo")).unwrap();
        assert_eq!(first.snapshot.fingerprint(), second.snapshot.fingerprint());
    }

    #[test]
    fn test_missing_answer_is_render_error() {
        let tpl = template();
        let err = render(tpl.path(), &AnswerSet::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingAnswer(ref k) if k == "project_name"));
    }

    #[test]
    fn test_syntax_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &[("broken.txt.tera", "{{ unclosed \n")]);
        let err = render(dir.path(), &answers("demo")).unwrap_err();
        match err {
            RenderError::Template { path, detail } => {
                assert_eq!(path, "broken.txt.tera");
                assert!(!detail.contains("__tera_one_off"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_undefined_variable_is_render_error() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &[("a.txt.tera", "{{ nope }}\n")]);
        assert!(matches!(
            render(dir.path(), &answers("demo")),
            Err(RenderError::Template { .. })
        ));
    }

    #[test]
    fn test_cancelled_render_stops() {
        let tpl = template();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = TeraEngine::new()
            .render(tpl.path(), &answers("demo"), &cancel)
            .unwrap_err();
        assert!(matches!(err, RenderError::Cancelled));
    }
}
