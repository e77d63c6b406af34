//! Small filesystem helpers shared by the answers store and the write phase.

use std::io::{self, Write};
use std::path::Path;

/// Write `contents` to `path` via a temp file in the same directory and an
/// atomic rename, so readers never observe a partial file.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    // Temp files are created 0600; carry over the mode of the file being
    // replaced, or use the usual 0644 for new files.
    let existing = std::fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = tempfile::Builder::new()
        .prefix(".restamp-tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    match existing {
        Some(perms) => tmp.as_file().set_permissions(perms)?,
        None => set_default_permissions(tmp.as_file())?,
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_default_permissions(file: &std::fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_file: &std::fs::File) -> io::Result<()> {
    Ok(())
}

/// Remove empty directories from `start` upwards, stopping at `root`.
pub(crate) fn prune_empty_dirs(root: &Path, start: Option<&Path>) {
    let mut current = start;
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the walk.
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_parents_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/file.txt");
        atomic_write(&target, b"hello").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        atomic_write(&target, b"replaced").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"replaced");

        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".restamp-tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_prune_empty_dirs_stops_at_root_and_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/keep.txt"), "x").unwrap();

        prune_empty_dirs(root, Some(&root.join("a/b/c")));
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
        assert!(root.exists());
    }
}
