//! Working-tree dirtiness of a subproject.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::errors::DirtyStateError;
use crate::vcs::{Vcs, WorkingState};

/// Pure query over the VCS status of a subproject.
#[derive(Clone)]
pub struct DirtyStateDetector {
    vcs: Arc<dyn Vcs>,
}

impl DirtyStateDetector {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }

    /// Whether `subproject` has uncommitted changes, untracked files
    /// included. A subproject outside any repository is an error, not dirty.
    pub fn is_dirty(&self, subproject: &Path) -> Result<bool, DirtyStateError> {
        let dirty = match self.vcs.status(subproject)? {
            WorkingState::Clean => false,
            WorkingState::Dirty => true,
            WorkingState::Untracked => {
                return Err(DirtyStateError::NotTracked(
                    subproject.display().to_string(),
                ))
            }
        };
        debug!(subproject = %subproject.display(), dirty, "dirty state");
        Ok(dirty)
    }
}
