//! Version-control collaborator.

pub mod client;

pub use client::{CommitInfo, DiffStat, GitVcs, Vcs, WorkingState};
