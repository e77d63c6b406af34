//! Local repository operations via `git2`.
//!
//! [`GitVcs`] holds no repository handle: every call opens the repository at
//! the path it is given, so no operation depends on the process's current
//! directory or on state left behind by an earlier call.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, ObjectType, Oid, Repository, StatusOptions, TreeWalkMode, TreeWalkResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::VcsError;

/// Information about a single commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub summary: String,
    pub author_name: String,
    pub author_email: String,
    pub author_time: i64,
}

/// Working-tree state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingState {
    Clean,
    Dirty,
    /// The path is not inside any repository.
    Untracked,
}

/// Change volume between two commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

/// The version-control primitives restamp depends on.
///
/// Every operation names the repository explicitly.
pub trait Vcs: Send + Sync {
    /// Commits reachable from HEAD, newest first.
    fn log(&self, repo_path: &Path) -> Result<Vec<CommitInfo>, VcsError>;

    /// Full SHA of HEAD.
    fn head(&self, repo_path: &Path) -> Result<String, VcsError>;

    /// Resolve any revision expression (branch, tag, short SHA) to a full SHA.
    fn resolve(&self, repo_path: &Path, rev: &str) -> Result<String, VcsError>;

    /// Whether `ancestor` is a strict ancestor of `descendant`.
    fn is_ancestor(&self, repo_path: &Path, ancestor: &str, descendant: &str)
        -> Result<bool, VcsError>;

    /// Change volume between two commits.
    fn diff_stat(&self, repo_path: &Path, from: &str, to: &str) -> Result<DiffStat, VcsError>;

    /// Materialize the tree of `rev` into `target_dir` (which must exist).
    fn checkout(&self, repo_path: &Path, rev: &str, target_dir: &Path) -> Result<(), VcsError>;

    /// Working-tree state of `path` relative to its last commit.
    fn status(&self, path: &Path) -> Result<WorkingState, VcsError>;
}

/// [`Vcs`] backed by `git2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitVcs;

impl GitVcs {
    pub fn new() -> Self {
        Self
    }

    fn open(repo_path: &Path) -> Result<Repository, VcsError> {
        Repository::open(repo_path)
            .map_err(|_| VcsError::RepositoryNotFound(repo_path.display().to_string()))
    }

    fn find_commit<'r>(
        repo: &'r Repository,
        rev: &str,
    ) -> Result<git2::Commit<'r>, VcsError> {
        let object = repo
            .revparse_single(rev)
            .map_err(|_| VcsError::RefNotFound(rev.to_string()))?;
        object
            .peel_to_commit()
            .map_err(|_| VcsError::RefNotFound(rev.to_string()))
    }

    fn head_commit<'r>(
        repo: &'r Repository,
        repo_path: &Path,
    ) -> Result<git2::Commit<'r>, VcsError> {
        let head = repo.head().map_err(|e| match e.code() {
            ErrorCode::UnbornBranch | ErrorCode::NotFound => {
                VcsError::NoCommits(repo_path.display().to_string())
            }
            _ => VcsError::Git2Error(e),
        })?;
        Ok(head.peel_to_commit()?)
    }
}

impl Vcs for GitVcs {
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    fn log(&self, repo_path: &Path) -> Result<Vec<CommitInfo>, VcsError> {
        let repo = Self::open(repo_path)?;
        let head = Self::head_commit(&repo, repo_path)?;

        let mut revwalk = repo.revwalk()?;
        revwalk.push(head.id())?;
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

        let mut commits = Vec::new();
        for oid_result in revwalk {
            let oid = oid_result?;
            let commit = repo.find_commit(oid)?;
            commits.push(CommitInfo {
                sha: oid.to_string(),
                summary: commit.summary().unwrap_or("").to_string(),
                author_name: commit.author().name().unwrap_or("").to_string(),
                author_email: commit.author().email().unwrap_or("").to_string(),
                author_time: commit.author().when().seconds(),
            });
        }
        debug!(count = commits.len(), "collected commits");
        Ok(commits)
    }

    fn head(&self, repo_path: &Path) -> Result<String, VcsError> {
        let repo = Self::open(repo_path)?;
        let commit = Self::head_commit(&repo, repo_path)?;
        Ok(commit.id().to_string())
    }

    fn resolve(&self, repo_path: &Path, rev: &str) -> Result<String, VcsError> {
        let repo = Self::open(repo_path)?;
        let sha = Self::find_commit(&repo, rev)?.id().to_string();
        Ok(sha)
    }

    fn is_ancestor(
        &self,
        repo_path: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, VcsError> {
        let repo = Self::open(repo_path)?;
        let ancestor = Self::find_commit(&repo, ancestor)?.id();
        let descendant = Self::find_commit(&repo, descendant)?.id();
        Ok(repo.graph_descendant_of(descendant, ancestor)?)
    }

    fn diff_stat(&self, repo_path: &Path, from: &str, to: &str) -> Result<DiffStat, VcsError> {
        let repo = Self::open(repo_path)?;
        let from_tree = Self::find_commit(&repo, from)?.tree()?;
        let to_tree = Self::find_commit(&repo, to)?.tree()?;
        let stats = repo
            .diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?
            .stats()?;
        Ok(DiffStat {
            files_changed: stats.files_changed(),
            insertions: stats.insertions(),
            deletions: stats.deletions(),
        })
    }

    #[instrument(skip(self), fields(repo = %repo_path.display(), target = %target_dir.display()))]
    fn checkout(&self, repo_path: &Path, rev: &str, target_dir: &Path) -> Result<(), VcsError> {
        let repo = Self::open(repo_path)?;
        let commit = Self::find_commit(&repo, rev)?;
        let tree = commit.tree()?;

        // Collect first: the walk callback cannot propagate I/O errors.
        let mut blobs: Vec<(PathBuf, Oid, i32)> = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    blobs.push((Path::new(root).join(name), entry.id(), entry.filemode()));
                }
            }
            TreeWalkResult::Ok
        })?;

        for (rel_path, oid, mode) in &blobs {
            let blob = repo.find_blob(*oid)?;
            let dest = target_dir.join(rel_path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_blob(&dest, blob.content(), *mode)?;
        }

        info!(rev, files = blobs.len(), "checked out template tree");
        Ok(())
    }

    fn status(&self, path: &Path) -> Result<WorkingState, VcsError> {
        let repo = match Repository::discover(path) {
            Ok(repo) => repo,
            Err(_) => return Ok(WorkingState::Untracked),
        };
        let Some(workdir) = repo.workdir() else {
            warn!(path = %path.display(), "repository is bare");
            return Ok(WorkingState::Untracked);
        };

        let workdir = workdir.canonicalize()?;
        let target = path.canonicalize()?;
        let prefix = target
            .strip_prefix(&workdir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        if !prefix.is_empty() {
            opts.pathspec(prefix.as_str());
        }

        let statuses = repo.statuses(Some(&mut opts))?;
        let dirty = statuses
            .iter()
            .any(|entry| !entry.status().is_empty() && !entry.status().is_ignored());

        debug!(path = %path.display(), dirty, "working tree status");
        Ok(if dirty {
            WorkingState::Dirty
        } else {
            WorkingState::Clean
        })
    }
}

const MODE_SYMLINK: i32 = 0o120000;
const MODE_EXECUTABLE: i32 = 0o100755;

fn write_blob(dest: &Path, content: &[u8], mode: i32) -> std::io::Result<()> {
    if mode == MODE_SYMLINK {
        let target = String::from_utf8_lossy(content).into_owned();
        return create_symlink(&target, dest);
    }

    std::fs::write(dest, content)?;

    #[cfg(unix)]
    if mode == MODE_EXECUTABLE {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

#[cfg(unix)]
pub(crate) fn create_symlink(target: &str, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

/// Without symlink support the link is stored as a file holding its target,
/// the same fallback git uses with `core.symlinks = false`.
#[cfg(not(unix))]
pub(crate) fn create_symlink(target: &str, dest: &Path) -> std::io::Result<()> {
    std::fs::write(dest, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_all, init_repo};

    #[test]
    fn test_log_and_head() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let first = commit_all(dir.path(), "first");
        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        let second = commit_all(dir.path(), "second");

        let vcs = GitVcs::new();
        assert_eq!(vcs.head(dir.path()).unwrap(), second);
        let log = vcs.log(dir.path()).unwrap();
        let shas: Vec<_> = log.iter().map(|c| c.sha.clone()).collect();
        assert_eq!(shas, vec![second.clone(), first.clone()]);
        assert_eq!(log[0].summary, "second");

        assert!(vcs.is_ancestor(dir.path(), &first, &second).unwrap());
        assert!(!vcs.is_ancestor(dir.path(), &second, &first).unwrap());
        assert_eq!(vcs.resolve(dir.path(), "HEAD~1").unwrap(), first);

        let stat = vcs.diff_stat(dir.path(), &first, &second).unwrap();
        assert_eq!(stat.files_changed, 1);
    }

    #[test]
    fn test_no_commits() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let vcs = GitVcs::new();
        assert!(matches!(vcs.head(dir.path()), Err(VcsError::NoCommits(_))));
        assert!(matches!(vcs.log(dir.path()), Err(VcsError::NoCommits(_))));
    }

    #[test]
    fn test_repo_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = GitVcs::new();
        assert!(matches!(
            vcs.head(dir.path()),
            Err(VcsError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_ref() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        commit_all(dir.path(), "first");
        let vcs = GitVcs::new();
        assert!(matches!(
            vcs.resolve(dir.path(), "no-such-branch"),
            Err(VcsError::RefNotFound(_))
        ));
    }

    #[test]
    fn test_checkout_old_commit_into_scratch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "old").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("src/lib.rs", dir.path().join("link")).unwrap();
        let first = commit_all(dir.path(), "first");
        std::fs::write(dir.path().join("src/lib.rs"), "new").unwrap();
        commit_all(dir.path(), "second");

        let scratch = tempfile::tempdir().unwrap();
        GitVcs::new()
            .checkout(dir.path(), &first, scratch.path())
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(scratch.path().join("src/lib.rs")).unwrap(),
            "old"
        );
        assert!(!scratch.path().join(".git").exists());
        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(scratch.path().join("link")).unwrap(),
            PathBuf::from("src/lib.rs")
        );
    }

    #[test]
    fn test_status_states() {
        let vcs = GitVcs::new();

        let plain = tempfile::tempdir().unwrap();
        assert_eq!(vcs.status(plain.path()).unwrap(), WorkingState::Untracked);

        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        commit_all(dir.path(), "first");
        assert_eq!(vcs.status(dir.path()).unwrap(), WorkingState::Clean);

        std::fs::write(dir.path().join("a.txt"), "changed").unwrap();
        assert_eq!(vcs.status(dir.path()).unwrap(), WorkingState::Dirty);

        commit_all(dir.path(), "second");
        std::fs::write(dir.path().join("untracked.txt"), "new").unwrap();
        assert_eq!(vcs.status(dir.path()).unwrap(), WorkingState::Dirty);
    }
}
