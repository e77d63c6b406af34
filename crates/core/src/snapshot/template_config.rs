//! The template's own `restamp.toml`: render settings and questions.
//!
//! The file is optional. Without it every supplied answer is passed through
//! untouched and every regular file is copied verbatim unless it carries the
//! default `.tera` suffix.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::RenderError;
use crate::models::{AnswerSet, AnswerValue};

/// Name of the template configuration file at the template root.
pub const TEMPLATE_CONFIG_FILE: &str = "restamp.toml";

/// Parsed `restamp.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub settings: TemplateSettings,

    /// Questions keyed by answer name.
    #[serde(default)]
    pub questions: BTreeMap<String, Question>,
}

/// `[settings]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Files ending with this suffix are rendered and the suffix is dropped.
    #[serde(default = "default_suffix")]
    pub templates_suffix: String,

    /// Glob patterns (relative to the template root) left out of renders.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_suffix() -> String {
    ".tera".into()
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            templates_suffix: default_suffix(),
            exclude: Vec::new(),
        }
    }
}

/// Declared type of a question's answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Str,
    Int,
    Float,
    Bool,
    List,
    Map,
    #[default]
    Any,
}

impl QuestionType {
    fn accepts(self, value: &AnswerValue) -> bool {
        match self {
            Self::Str => value.is_str(),
            Self::Int => value.is_integer(),
            Self::Float => value.is_float() || value.is_integer(),
            Self::Bool => value.is_bool(),
            Self::List => value.is_array(),
            Self::Map => value.is_table(),
            Self::Any => true,
        }
    }
}

/// One `[questions.<key>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Question {
    #[serde(default, rename = "type")]
    pub kind: QuestionType,

    /// Used when no answer is supplied. Without a default the answer is
    /// required.
    #[serde(default)]
    pub default: Option<AnswerValue>,

    /// If non-empty, the answer must equal one of these.
    #[serde(default)]
    pub choices: Vec<AnswerValue>,

    /// Regular expression string answers must match.
    #[serde(default)]
    pub validator: Option<String>,

    #[serde(default)]
    pub help: Option<String>,
}

impl TemplateConfig {
    /// Load `restamp.toml` from `template_root`, or the defaults if absent.
    pub fn load(template_root: &Path) -> Result<Self, RenderError> {
        let path = template_root.join(TEMPLATE_CONFIG_FILE);
        if !path.is_file() {
            debug!(root = %template_root.display(), "no template config, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse config text; `origin` names the file in errors.
    pub fn parse(text: &str, origin: &str) -> Result<Self, RenderError> {
        let config: Self = toml::from_str(text).map_err(|e| RenderError::TemplateConfig {
            path: origin.to_string(),
            detail: e.to_string(),
        })?;

        // Surface bad validator patterns before any answer is checked.
        for (key, question) in &config.questions {
            if let Some(pattern) = &question.validator {
                regex_lite::Regex::new(pattern).map_err(|e| RenderError::TemplateConfig {
                    path: origin.to_string(),
                    detail: format!("question '{key}' has an invalid validator: {e}"),
                })?;
            }
        }
        Ok(config)
    }

    /// Whether `rel_path` matches one of the `exclude` globs.
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.settings
            .exclude
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, rel_path))
    }

    /// Complete `supplied` with defaults and check every question.
    ///
    /// Supplied keys without a matching question are kept as they are.
    pub fn resolve_answers(&self, supplied: &AnswerSet) -> Result<AnswerSet, RenderError> {
        let mut resolved = supplied.clone();

        for (key, question) in &self.questions {
            let value = match supplied.get(key).or(question.default.as_ref()) {
                Some(value) => value.clone(),
                None => return Err(RenderError::MissingAnswer(key.clone())),
            };
            check_answer(key, question, &value)?;
            resolved.insert(key.clone(), value);
        }

        Ok(resolved)
    }
}

fn check_answer(key: &str, question: &Question, value: &AnswerValue) -> Result<(), RenderError> {
    let invalid = |detail: String| RenderError::InvalidAnswer {
        key: key.to_string(),
        detail,
    };

    if !question.kind.accepts(value) {
        return Err(invalid(format!(
            "expected {:?}, got {}",
            question.kind,
            value.type_str()
        )));
    }

    if !question.choices.is_empty() && !question.choices.contains(value) {
        return Err(invalid(format!("{value} is not one of the allowed choices")));
    }

    if let (Some(pattern), Some(text)) = (&question.validator, value.as_str()) {
        // Patterns were compiled once in `parse`; a failure here means the
        // config was built by hand.
        let re = regex_lite::Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
        if !re.is_match(text) {
            return Err(invalid(format!("'{text}' does not match /{pattern}/")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[settings]
exclude = ["docs/**", "*.bak"]

[questions.project_name]
type = "str"
validator = "^[a-z][a-z0-9_]*$"
help = "Package name"

[questions.port]
type = "int"
default = 8080

[questions.license]
type = "str"
default = "MIT"
choices = ["MIT", "Apache-2.0"]
"#;

    fn answers(pairs: &[(&str, AnswerValue)]) -> AnswerSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TemplateConfig::load(dir.path()).unwrap();
        assert_eq!(config.settings.templates_suffix, ".tera");
        assert!(config.questions.is_empty());
    }

    #[test]
    fn test_resolve_fills_defaults_and_keeps_extras() {
        let config = TemplateConfig::parse(CONFIG, "restamp.toml").unwrap();
        let supplied = answers(&[
            ("project_name", AnswerValue::String("demo".into())),
            ("extra", AnswerValue::Boolean(true)),
        ]);

        let resolved = config.resolve_answers(&supplied).unwrap();
        assert_eq!(resolved["port"], AnswerValue::Integer(8080));
        assert_eq!(resolved["license"], AnswerValue::String("MIT".into()));
        assert_eq!(resolved["extra"], AnswerValue::Boolean(true));
    }

    #[test]
    fn test_missing_required_answer() {
        let config = TemplateConfig::parse(CONFIG, "restamp.toml").unwrap();
        let err = config.resolve_answers(&AnswerSet::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingAnswer(ref k) if k == "project_name"));
    }

    #[test]
    fn test_invalid_answers() {
        let config = TemplateConfig::parse(CONFIG, "restamp.toml").unwrap();

        let bad_pattern = answers(&[("project_name", AnswerValue::String("Demo".into()))]);
        assert!(matches!(
            config.resolve_answers(&bad_pattern),
            Err(RenderError::InvalidAnswer { ref key, .. }) if key == "project_name"
        ));

        let bad_type = answers(&[
            ("project_name", AnswerValue::String("demo".into())),
            ("port", AnswerValue::String("eighty".into())),
        ]);
        assert!(matches!(
            config.resolve_answers(&bad_type),
            Err(RenderError::InvalidAnswer { ref key, .. }) if key == "port"
        ));

        let bad_choice = answers(&[
            ("project_name", AnswerValue::String("demo".into())),
            ("license", AnswerValue::String("GPL".into())),
        ]);
        assert!(matches!(
            config.resolve_answers(&bad_choice),
            Err(RenderError::InvalidAnswer { ref key, .. }) if key == "license"
        ));
    }

    #[test]
    fn test_bad_validator_is_config_error() {
        let text = "[questions.name]\nvalidator = \"(unclosed\"\n";
        assert!(matches!(
            TemplateConfig::parse(text, "restamp.toml"),
            Err(RenderError::TemplateConfig { .. })
        ));
    }

    #[test]
    fn test_exclude_globs() {
        let config = TemplateConfig::parse(CONFIG, "restamp.toml").unwrap();
        assert!(config.is_excluded("docs/guide/intro.md"));
        assert!(config.is_excluded("notes.bak"));
        assert!(!config.is_excluded("src/main.rs"));
    }
}
