//! Conflict detection, three-way merging, and resolution management.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- classifying each path the template changed against the subproject.
//! 2. **Merging** -- line-based three-way merges of text both sides edited.
//! 3. **Resolution** -- applying a caller's decision to reported conflicts.

pub mod detector;
pub mod merger;
pub mod resolver;

pub use detector::{
    classify, ConflictLocation, ConflictRegion, ConflictStatus, ConflictType, PathAction,
};
pub use merger::{ConflictMarker, ConflictStyle, MergeResult, Merger};
pub use resolver::{ConflictResolver, Resolution};
