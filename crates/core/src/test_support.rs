//! Repository and file helpers for unit tests.

use std::path::Path;

use git2::{IndexAddOption, Repository, Signature};

pub(crate) fn init_repo(path: &Path) -> Repository {
    Repository::init(path).unwrap()
}

/// Stage everything (including deletions) and commit. Returns the new SHA.
pub(crate) fn commit_all(path: &Path, message: &str) -> String {
    let repo = Repository::open(path).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.update_all(["*"].iter(), None).unwrap();
    index.write().unwrap();
    let tree_oid = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
        .to_string()
}

/// Write `files` (relative path, content) under `root`, creating parents.
pub(crate) fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}
