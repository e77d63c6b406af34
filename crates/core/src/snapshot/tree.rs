//! In-memory file trees and the path-keyed diff between them.
//!
//! A [`FileTreeSnapshot`] maps `/`-separated relative paths to [`Entry`]
//! values in sorted order. Snapshots are compared structurally; the only
//! operations that touch disk are [`FileTreeSnapshot::capture`],
//! [`FileTreeSnapshot::capture_paths`] and [`apply_ops`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::errors::UpdateError;
use crate::fsutil::{atomic_write, prune_empty_dirs};
use crate::vcs::client::create_symlink;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Content of one path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entry {
    /// Regular file bytes.
    File(Vec<u8>),
    /// Symlink target, stored verbatim.
    Symlink(String),
}

impl Entry {
    pub fn file(content: impl Into<Vec<u8>>) -> Self {
        Self::File(content.into())
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self::Symlink(target.into())
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::Symlink(_))
    }

    /// The file's text, if it is a regular file holding UTF-8 without NUL
    /// bytes. Anything else is merged at whole-file granularity.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::File(bytes) if !bytes.contains(&0) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        self.as_text().is_some()
    }

    /// Whether both entries are files or both are symlinks.
    pub fn same_kind(&self, other: &Entry) -> bool {
        self.is_symlink() == other.is_symlink()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A captured or rendered file tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeSnapshot {
    entries: BTreeMap<String, Entry>,
}

impl FileTreeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: Entry) -> Option<Entry> {
        self.entries.insert(path.into(), entry)
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// SHA-256 over every path and entry, in order. Equal snapshots have
    /// equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, entry) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            let (tag, bytes) = match entry {
                Entry::File(content) => (b'f', content.as_slice()),
                Entry::Symlink(target) => (b'l', target.as_bytes()),
            };
            hasher.update([tag]);
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        hex::encode(hasher.finalize())
    }

    /// Capture every file and symlink under `root`, skipping `.git`.
    /// Symlinks are recorded, never followed.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn capture(root: &Path) -> io::Result<Self> {
        let mut snapshot = Self::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

        for item in walker {
            let item = item.map_err(io::Error::from)?;
            if item.file_type().is_dir() {
                continue;
            }
            let rel = item
                .path()
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let Some(key) = path_key(rel) else {
                warn!(path = %item.path().display(), "skipping non UTF-8 path");
                continue;
            };
            if let Some(entry) = read_entry(item.path())? {
                snapshot.insert(key, entry);
            }
        }

        debug!(entries = snapshot.len(), "captured tree");
        Ok(snapshot)
    }

    /// Capture only `paths` under `root`. Paths that do not exist, or that
    /// are directories, are absent from the result.
    pub fn capture_paths<'a>(
        root: &Path,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> io::Result<Self> {
        let mut snapshot = Self::new();
        for key in paths {
            let full = safe_join(root, key)?;
            if let Some(entry) = read_entry(&full)? {
                snapshot.insert(key, entry);
            }
        }
        Ok(snapshot)
    }
}

/// `/`-joined relative path, or `None` for non UTF-8 names.
fn path_key(rel: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("/"))
}

fn read_entry(path: &Path) -> io::Result<Option<Entry>> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path)?;
        return Ok(Some(Entry::Symlink(target.to_string_lossy().into_owned())));
    }
    if meta.is_file() {
        return Ok(Some(Entry::File(std::fs::read(path)?)));
    }
    Ok(None)
}

/// Join a snapshot key onto `root`, rejecting keys that could escape it.
pub(crate) fn safe_join(root: &Path, key: &str) -> io::Result<PathBuf> {
    let rel = Path::new(key);
    let normal = !key.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !normal {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsafe snapshot path '{key}'"),
        ));
    }
    Ok(root.join(rel))
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// One path-level difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    Add { path: String, entry: Entry },
    Modify { path: String, old: Entry, new: Entry },
    Delete { path: String, old: Entry },
    Rename { from: String, to: String, entry: Entry },
}

impl DiffOp {
    /// The path this operation leaves populated (or removes, for deletes).
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Modify { path, .. } | Self::Delete { path, .. } => path,
            Self::Rename { to, .. } => to,
        }
    }

    /// Every path the operation touches.
    pub fn touched_paths(&self) -> Vec<&str> {
        match self {
            Self::Rename { from, to, .. } => vec![from.as_str(), to.as_str()],
            other => vec![other.path()],
        }
    }
}

/// Operations turning `from` into `to`, in path order.
pub fn diff(from: &FileTreeSnapshot, to: &FileTreeSnapshot) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    let mut left = from.entries.iter().peekable();
    let mut right = to.entries.iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some((lp, le)), Some((rp, re))) => match lp.cmp(rp) {
                std::cmp::Ordering::Less => {
                    ops.push(DiffOp::Delete {
                        path: (*lp).clone(),
                        old: (*le).clone(),
                    });
                    left.next();
                }
                std::cmp::Ordering::Greater => {
                    ops.push(DiffOp::Add {
                        path: (*rp).clone(),
                        entry: (*re).clone(),
                    });
                    right.next();
                }
                std::cmp::Ordering::Equal => {
                    if le != re {
                        ops.push(DiffOp::Modify {
                            path: (*lp).clone(),
                            old: (*le).clone(),
                            new: (*re).clone(),
                        });
                    }
                    left.next();
                    right.next();
                }
            },
            (Some((lp, le)), None) => {
                ops.push(DiffOp::Delete {
                    path: (*lp).clone(),
                    old: (*le).clone(),
                });
                left.next();
            }
            (None, Some((rp, re))) => {
                ops.push(DiffOp::Add {
                    path: (*rp).clone(),
                    entry: (*re).clone(),
                });
                right.next();
            }
            (None, None) => break,
        }
    }
    ops
}

/// Pair a delete with an add of identical content into a rename. Only
/// unambiguous pairs (one delete and one add sharing the content) are
/// paired; everything else is returned unchanged. Output is sorted by
/// [`DiffOp::path`].
pub fn detect_renames(ops: Vec<DiffOp>) -> Vec<DiffOp> {
    let mut deletes: BTreeMap<&Entry, Vec<usize>> = BTreeMap::new();
    let mut adds: BTreeMap<&Entry, Vec<usize>> = BTreeMap::new();
    for (idx, op) in ops.iter().enumerate() {
        match op {
            DiffOp::Delete { old, .. } => deletes.entry(old).or_default().push(idx),
            DiffOp::Add { entry, .. } => adds.entry(entry).or_default().push(idx),
            _ => {}
        }
    }

    let mut pairs: BTreeMap<usize, usize> = BTreeMap::new();
    for (entry, del) in &deletes {
        if let (Some(add), [d]) = (adds.get(entry), del.as_slice()) {
            if let [a] = add.as_slice() {
                pairs.insert(*d, *a);
            }
        }
    }
    let paired_adds: Vec<usize> = pairs.values().copied().collect();

    let mut out = Vec::with_capacity(ops.len());
    for (idx, op) in ops.iter().enumerate() {
        if paired_adds.contains(&idx) {
            continue;
        }
        match (op, pairs.get(&idx)) {
            (DiffOp::Delete { path, old }, Some(add_idx)) => out.push(DiffOp::Rename {
                from: path.clone(),
                to: ops[*add_idx].path().to_string(),
                entry: old.clone(),
            }),
            _ => out.push(op.clone()),
        }
    }
    out.sort_by(|a, b| a.path().cmp(b.path()));
    out
}

// ---------------------------------------------------------------------------
// Write phase
// ---------------------------------------------------------------------------

/// Apply `ops` to the tree rooted at `root`. Files are replaced atomically;
/// directories left empty by deletions are removed.
///
/// Every destination is checked before the first write, so an op that
/// cannot be applied safely leaves the tree untouched.
#[instrument(skip_all, fields(root = %root.display(), ops = ops.len()))]
pub fn apply_ops(root: &Path, ops: &[DiffOp]) -> Result<(), UpdateError> {
    check_destinations(root, ops)?;
    for op in ops {
        match op {
            DiffOp::Add { path, entry } | DiffOp::Modify { path, new: entry, .. } => {
                write_entry(root, path, entry)?;
            }
            DiffOp::Delete { path, .. } => remove_entry(root, path)?,
            DiffOp::Rename { from, to, entry } => {
                remove_entry(root, from)?;
                write_entry(root, to, entry)?;
            }
        }
    }
    debug!("write phase complete");
    Ok(())
}

fn write_failed(path: &str) -> impl FnOnce(io::Error) -> UpdateError + '_ {
    move |source| UpdateError::WriteFailed {
        path: path.to_string(),
        source,
    }
}

/// Preflight for [`apply_ops`]. Paths the ops delete may be replaced by
/// directories, so they do not block writes below them.
fn check_destinations(root: &Path, ops: &[DiffOp]) -> Result<(), UpdateError> {
    let removed: BTreeSet<&str> = ops
        .iter()
        .filter_map(|op| match op {
            DiffOp::Delete { path, .. } => Some(path.as_str()),
            DiffOp::Rename { from, .. } => Some(from.as_str()),
            _ => None,
        })
        .collect();
    for op in ops {
        for key in op.touched_paths() {
            check_destination(root, key, &removed)?;
        }
    }
    Ok(())
}

/// Resolve `key` under `root` for writing. Parents must be real
/// directories (or not exist yet) and the path itself must not be a
/// directory.
fn check_destination(
    root: &Path,
    key: &str,
    removed: &BTreeSet<&str>,
) -> Result<PathBuf, UpdateError> {
    let dest = safe_join(root, key).map_err(write_failed(key))?;
    let unsafe_dest = |detail: String| UpdateError::UnsafeDestination {
        path: key.to_string(),
        detail,
    };

    let mut parent = root.to_path_buf();
    let mut parent_key = String::new();
    let parts: Vec<&str> = key.split('/').collect();
    for part in &parts[..parts.len() - 1] {
        parent.push(part);
        if !parent_key.is_empty() {
            parent_key.push('/');
        }
        parent_key.push_str(part);

        let meta = match std::fs::symlink_metadata(&parent) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dest),
            Err(e) => return Err(write_failed(key)(e)),
        };
        if meta.is_dir() {
            continue;
        }
        if removed.contains(parent_key.as_str()) {
            return Ok(dest);
        }
        return Err(if meta.file_type().is_symlink() {
            unsafe_dest(format!("parent '{parent_key}' is a symlink"))
        } else {
            unsafe_dest(format!("parent '{parent_key}' is not a directory"))
        });
    }

    match std::fs::symlink_metadata(&dest) {
        Ok(meta) if meta.is_dir() => Err(unsafe_dest("a directory occupies this path".into())),
        Ok(_) => Ok(dest),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(dest),
        Err(e) => Err(write_failed(key)(e)),
    }
}

pub(crate) fn write_entry(root: &Path, key: &str, entry: &Entry) -> Result<(), UpdateError> {
    let dest = check_destination(root, key, &BTreeSet::new())?;

    // A symlink in the way is replaced, never written through.
    let existing_link = std::fs::symlink_metadata(&dest)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if existing_link || entry.is_symlink() {
        match std::fs::remove_file(&dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_failed(key)(e)),
        }
    }

    match entry {
        Entry::File(content) => atomic_write(&dest, content).map_err(write_failed(key)),
        Entry::Symlink(target) => {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(write_failed(key))?;
            }
            create_symlink(target, &dest).map_err(write_failed(key))
        }
    }
}

pub(crate) fn remove_entry(root: &Path, key: &str) -> Result<(), UpdateError> {
    let dest = check_destination(root, key, &BTreeSet::new())?;
    match std::fs::remove_file(&dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(write_failed(key)(e)),
    }
    prune_empty_dirs(root, dest.parent());
    Ok(())
}
