//! Error types for the restamp core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Answers(#[from] AnswersError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    DirtyState(#[from] DirtyStateError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

// ---------------------------------------------------------------------------
// Answers file errors
// ---------------------------------------------------------------------------

/// Errors from reading or writing the subproject's answers file.
#[derive(Debug, Error)]
pub enum AnswersError {
    /// No answers file exists in the subproject.
    #[error("answers file not found at '{0}'")]
    Missing(String),

    /// The answers file is not valid TOML.
    #[error("failed to parse answers file '{path}': {detail}")]
    ParseError { path: String, detail: String },

    /// The answers file parsed but is missing a required key or has a
    /// value of the wrong shape.
    #[error("invalid answers file '{path}': {detail}")]
    InvalidDocument { path: String, detail: String },

    /// An answer uses a key reserved for provenance metadata.
    #[error("answer key '{0}' is reserved (keys starting with '_' hold metadata)")]
    ReservedKey(String),

    /// The answers could not be serialized.
    #[error("failed to serialize answers: {0}")]
    SerializeError(String),

    /// Generic I/O wrapper.
    #[error("answers I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// VCS errors
// ---------------------------------------------------------------------------

/// Errors from the version-control collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The path does not exist or is not inside a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// The repository exists but has no commits yet.
    #[error("git repository at '{0}' has no commits")]
    NoCommits(String),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// History errors
// ---------------------------------------------------------------------------

/// Errors from locating the template's commit history.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The template location is not a VCS-tracked history.
    #[error("template history unavailable at '{location}': {detail}")]
    Unavailable { location: String, detail: String },

    /// The template is a repository, but nothing has been committed yet.
    #[error("template repository at '{0}' has no commits yet")]
    NoCommits(String),

    /// Any other VCS failure while walking history.
    #[error("history VCS error: {0}")]
    Vcs(#[from] VcsError),

    /// The answers file could not be read while building the chain.
    #[error("history answers error: {0}")]
    Answers(#[from] AnswersError),
}

// ---------------------------------------------------------------------------
// Dirty-state errors
// ---------------------------------------------------------------------------

/// Errors from working-tree status queries.
#[derive(Debug, Error)]
pub enum DirtyStateError {
    /// The subproject is not tracked by any repository.
    #[error("'{0}' is not tracked by version control")]
    NotTracked(String),

    /// Any other VCS failure while reading status.
    #[error("status VCS error: {0}")]
    Vcs(#[from] VcsError),
}

// ---------------------------------------------------------------------------
// Render errors
// ---------------------------------------------------------------------------

/// Errors from materializing a template snapshot.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Checking the template out into the scratch workspace failed.
    #[error("template checkout failed: {0}")]
    Checkout(#[from] VcsError),

    /// The template's `restamp.toml` could not be read.
    #[error("invalid template configuration '{path}': {detail}")]
    TemplateConfig { path: String, detail: String },

    /// A required question has neither an answer nor a default.
    #[error("missing required answer '{0}'")]
    MissingAnswer(String),

    /// An answer does not satisfy its question's type or validator.
    #[error("invalid answer for '{key}': {detail}")]
    InvalidAnswer { key: String, detail: String },

    /// The templating engine rejected a file (syntax error, undefined
    /// variable, and so on).
    #[error("template error in '{path}': {detail}")]
    Template { path: String, detail: String },

    /// Rendering exceeded the configured timeout.
    #[error("template render timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The engine stopped because the render was abandoned.
    #[error("template render was cancelled")]
    Cancelled,

    /// The blocking render task was cancelled or panicked.
    #[error("template render task failed: {0}")]
    TaskFailed(String),

    /// Generic I/O wrapper.
    #[error("render I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Attempted to resolve a conflict that is already resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// The provided resolution does not apply to this conflict.
    #[error("invalid resolution for conflict {id}: {detail}")]
    InvalidResolution { id: String, detail: String },

    /// The text no longer contains the conflict block at the recorded lines.
    #[error("conflict {id} not found at lines {start_line}-{end_line}")]
    MarkerMismatch {
        id: String,
        start_line: usize,
        end_line: usize,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Update workflow errors
// ---------------------------------------------------------------------------

/// Errors from the check / update / generate workflows.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Another update is already running on this orchestrator.
    #[error("update already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The subproject is outdated and has uncommitted changes.
    #[error(
        "subproject is outdated ({from} -> {to}) and has uncommitted changes; \
         commit or stash them, or allow a dirty update explicitly"
    )]
    DirtyAndOutdated { from: String, to: String },

    /// Strict check: the subproject is behind its template.
    #[error("subproject is outdated: template moved from {from} to {to}")]
    SubprojectOutdated { from: String, to: String },

    /// The recorded commit is not an ancestor of the template head.
    #[error("template history was rewritten: recorded {current} is not an ancestor of {latest}")]
    HistoryRewound { current: String, latest: String },

    /// The answers file does not record which template commit was used.
    #[error("answers file does not record a template commit; cannot compute an update")]
    NoRecordedCommit,

    /// Generation would replace an existing file with different content.
    #[error("refusing to overwrite existing file '{0}'")]
    WouldOverwrite(String),

    /// A destination cannot be written safely: it sits behind a symlinked
    /// or non-directory parent, or a directory occupies a file path.
    #[error("cannot write '{path}': {detail}")]
    UnsafeDestination { path: String, detail: String },

    /// Writing the reconciled tree into the subproject failed.
    #[error("failed to write '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the subproject tree failed.
    #[error("update I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Answers(#[from] AnswersError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    DirtyState(#[from] DirtyStateError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Vcs(#[from] VcsError),
}
