//! TOML-based configuration for restamp.
//!
//! Every field carries a serde default, so an empty document is a valid
//! configuration. Environment overrides are applied by
//! [`RestampConfig::apply_env_overrides`].

use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::merger::ConflictStyle;
use crate::errors::ConfigError;

/// Default name of the answers file inside a subproject.
pub const DEFAULT_ANSWERS_FILE: &str = ".restamp-answers.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestampConfig {
    /// Answers file settings.
    #[serde(default)]
    pub answers: AnswersConfig,

    /// Snapshot rendering settings.
    #[serde(default)]
    pub render: RenderConfig,

    /// Reconciliation settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Update workflow settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// Where the answers file lives inside the subproject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswersConfig {
    /// File name, relative to the subproject root.
    #[serde(default = "default_answers_file")]
    pub file_name: String,
}

fn default_answers_file() -> String {
    DEFAULT_ANSWERS_FILE.into()
}

impl Default for AnswersConfig {
    fn default() -> Self {
        Self {
            file_name: default_answers_file(),
        }
    }
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

/// Snapshot rendering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Upper bound for a single checkout + render, in seconds (default 120).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Reconciliation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Conflict marker layout: `diff3` (with the old-template section) or
    /// `merge`.
    #[serde(default)]
    pub conflict_style: ConflictStyle,

    /// Report template-side renames in the update result.
    #[serde(default)]
    pub detect_renames: bool,
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Update workflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Proceed even when the subproject has uncommitted changes.
    #[serde(default)]
    pub allow_dirty: bool,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl RestampConfig {
    /// Load a [`RestampConfig`] from a TOML file at the given path.
    ///
    /// This does **not** apply environment overrides -- call
    /// [`apply_env_overrides`](Self::apply_env_overrides) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: RestampConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Apply `RESTAMP_*` environment overrides.
    ///
    /// Unset variables leave the loaded value alone; malformed values are
    /// rejected with [`ConfigError::InvalidValue`].
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// [`apply_env_overrides`](Self::apply_env_overrides) with variables
    /// read through `lookup` instead of the process environment.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let read_env = |name: &str| non_empty(name, lookup(name));

        if let Some(val) = read_env("RESTAMP_ANSWERS_FILE") {
            self.answers.file_name = val;
        }

        if let Some(val) = read_env("RESTAMP_RENDER_TIMEOUT") {
            self.render.timeout_secs = val.parse().map_err(|_| ConfigError::InvalidValue {
                field: "render.timeout_secs".into(),
                detail: format!("RESTAMP_RENDER_TIMEOUT is not a number: '{val}'"),
            })?;
        }

        if let Some(val) = read_env("RESTAMP_ALLOW_DIRTY") {
            self.update.allow_dirty = match val.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "update.allow_dirty".into(),
                        detail: format!("RESTAMP_ALLOW_DIRTY must be a boolean, got '{other}'"),
                    })
                }
            };
        }

        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let file_name = Path::new(&self.answers.file_name);
        if self.answers.file_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "answers.file_name".into(),
                detail: "answers file name must not be empty".into(),
            });
        }
        if !file_name
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(ConfigError::InvalidValue {
                field: "answers.file_name".into(),
                detail: "answers file must be a relative path inside the subproject".into(),
            });
        }
        if self.render.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "render.timeout_secs".into(),
                detail: "render timeout must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, apply overrides, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

fn non_empty(name: &str, value: Option<String>) -> Option<String> {
    match value {
        Some(val) if !val.is_empty() => {
            debug!(name, "applying env override");
            Some(val)
        }
        Some(_) => {
            warn!(name, "env var is set but empty, ignoring");
            None
        }
        None => None,
    }
}
