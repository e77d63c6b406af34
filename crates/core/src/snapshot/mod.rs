//! Template snapshots: rendering a template state and comparing file trees.

pub mod engine;
pub mod renderer;
pub mod template_config;
pub mod tree;

pub use engine::{CancelFlag, RenderOutput, TemplateEngine, TeraEngine};
pub use renderer::{RenderedSnapshot, SnapshotRenderer, TemplateSource};
pub use template_config::{Question, QuestionType, TemplateConfig, TEMPLATE_CONFIG_FILE};
pub use tree::{apply_ops, detect_renames, diff, DiffOp, Entry, FileTreeSnapshot};
