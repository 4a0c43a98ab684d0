// SPDX-License-Identifier: Apache-2.0

//! Track links: hard links that keep a tracked file's inode reachable.
//!
//! Every watched directory owns a reserved `.__track_link__` subdirectory.
//! For each tracked identity it holds one hard link named by the identity's
//! `dev:ino` string. Readers open the link instead of the visible name, so a
//! rename or unlink of the visible name never pulls the file out from under
//! them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::monitor::error::{Error, Result};
use crate::monitor::file_id::FileId;

/// Reserved name of the per-directory track link directory.
pub const TRACK_LINK_DIR: &str = ".__track_link__";

/// Shared, relocatable handle to a file's track link.
///
/// The tracker moves the link when the directory holding it disappears;
/// handlers keep a clone and always observe the current location.
#[derive(Debug, Clone)]
pub struct TrackLink {
    path: Arc<RwLock<PathBuf>>,
}

impl TrackLink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(RwLock::new(path)),
        }
    }

    pub fn path(&self) -> PathBuf {
        match self.path.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_path(&self, path: PathBuf) {
        match self.path.write() {
            Ok(mut p) => *p = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    /// Make sure the link still exists. If it is gone, recreate it next to
    /// `file_path` and point the handle there. Returns true if it moved.
    pub fn relocate(&self, file_path: &Path, id: FileId) -> Result<bool> {
        let current = self.path();
        if link_matches(&current, id) {
            return Ok(false);
        }

        let fresh = create(file_path, id)?;
        if fresh != current {
            if let Err(e) = remove(&current) {
                debug!(path = ?current, error = %e, "Unable to remove displaced track link");
            }
        }
        debug!(from = ?current, to = ?fresh, file_id = %id, "Relocated track link");
        self.set_path(fresh);
        Ok(true)
    }
}

/// Path of the track link directory for `dir`.
pub fn track_dir(dir: &Path) -> PathBuf {
    dir.join(TRACK_LINK_DIR)
}

/// True if `path` is a track link directory or lies inside one.
pub fn is_track_path(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == std::ffi::OsStr::new(TRACK_LINK_DIR))
}

/// Create the track link directory of `dir` if it does not exist yet.
pub fn ensure_track_dir(dir: &Path) -> Result<PathBuf> {
    let track = track_dir(dir);
    match fs::create_dir(&track) {
        Ok(()) => Ok(track),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(track),
        Err(source) => Err(Error::TrackLink {
            path: track,
            source,
        }),
    }
}

/// Link path for `id` inside the track directory of `dir`.
pub fn link_path(dir: &Path, id: FileId) -> PathBuf {
    track_dir(dir).join(id.to_string())
}

fn link_matches(link: &Path, id: FileId) -> bool {
    matches!(FileId::from_path(link), Ok(existing) if existing == id)
}

/// Create (or reuse) the track link for the file at `file_path`.
///
/// An existing link is reused only if it still resolves to `id`; anything
/// else under that name is replaced.
pub fn create(file_path: &Path, id: FileId) -> Result<PathBuf> {
    let dir = file_path.parent().ok_or_else(|| Error::TrackLink {
        path: file_path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
    })?;
    ensure_track_dir(dir)?;

    let link = link_path(dir, id);
    match FileId::from_path(&link) {
        Ok(existing) if existing == id => return Ok(link),
        Ok(existing) => {
            debug!(path = ?link, expected = %id, found = %existing, "Replacing mismatched track link");
            remove(&link)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(Error::TrackLink { path: link, source }),
    }

    if let Err(source) = fs::hard_link(file_path, &link) {
        return Err(Error::TrackLink { path: link, source });
    }

    // The visible name may have been swapped between the stat and the link.
    if !link_matches(&link, id) {
        let _ = fs::remove_file(&link);
        return Err(Error::TrackLink {
            path: link,
            source: io::Error::other(format!("{:?} no longer refers to {}", file_path, id)),
        });
    }

    Ok(link)
}

/// Remove a track link. A missing link is not an error.
pub fn remove(link: &Path) -> Result<()> {
    match fs::remove_file(link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::TrackLink {
            path: link.to_path_buf(),
            source,
        }),
    }
}

/// Remove links in `dir`'s track directory that `keep` rejects.
///
/// Entries whose names do not parse as an identity are left alone.
pub fn collect_stale(dir: &Path, keep: impl Fn(FileId) -> bool) -> Vec<PathBuf> {
    let track = track_dir(dir);
    let entries = match fs::read_dir(&track) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = ?track, error = %e, "Unable to list track link directory");
            }
            return Vec::new();
        }
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|s| s.parse::<FileId>().ok()) else {
            continue;
        };
        if keep(id) {
            continue;
        }
        let path = entry.path();
        match remove(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(error = %e, "Unable to remove stale track link"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_track_path() {
        assert!(is_track_path(Path::new("/d/.__track_link__")));
        assert!(is_track_path(Path::new("/d/.__track_link__/1:2")));
        assert!(!is_track_path(Path::new("/d/a.log")));
        assert!(!is_track_path(Path::new("/d/.__track_link__x")));
    }

    #[test]
    fn test_create_link_survives_unlink() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, b"hello\n").unwrap();
        let id = FileId::from_path(&file).unwrap();

        let link = create(&file, id).unwrap();
        assert_eq!(link, dir.path().join(TRACK_LINK_DIR).join(id.to_string()));

        fs::remove_file(&file).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"hello\n");
        assert_eq!(FileId::from_path(&link).unwrap(), id);
    }

    #[test]
    fn test_create_link_is_reused() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, b"").unwrap();
        let id = FileId::from_path(&file).unwrap();

        let first = create(&file, id).unwrap();
        let second = create(&file, id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_create_replaces_mismatched_link() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, b"real").unwrap();
        let id = FileId::from_path(&file).unwrap();

        ensure_track_dir(dir.path()).unwrap();
        let squatter = link_path(dir.path(), id);
        fs::write(&squatter, b"other inode").unwrap();

        let link = create(&file, id).unwrap();
        assert_eq!(link, squatter);
        assert_eq!(FileId::from_path(&link).unwrap(), id);
        assert_eq!(fs::read(&link).unwrap(), b"real");
    }

    #[test]
    fn test_remove_missing_link_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(remove(&dir.path().join("nope")).is_ok());
    }

    #[test]
    fn test_relocate_after_directory_move() {
        let root = TempDir::new().unwrap();
        let old_dir = root.path().join("old");
        fs::create_dir(&old_dir).unwrap();
        let file = old_dir.join("a.log");
        fs::write(&file, b"x\n").unwrap();
        let id = FileId::from_path(&file).unwrap();

        let handle = TrackLink::new(create(&file, id).unwrap());
        assert!(!handle.relocate(&file, id).unwrap());

        let new_dir = root.path().join("new");
        fs::rename(&old_dir, &new_dir).unwrap();
        let moved = new_dir.join("a.log");

        // The old link path vanished together with its directory name.
        assert!(handle.relocate(&moved, id).unwrap());
        assert_eq!(handle.path(), link_path(&new_dir, id));
        assert_eq!(fs::read(handle.path()).unwrap(), b"x\n");
    }

    #[test]
    fn test_collect_stale() {
        let dir = TempDir::new().unwrap();
        let keep_file = dir.path().join("keep.log");
        let drop_file = dir.path().join("drop.log");
        fs::write(&keep_file, b"").unwrap();
        fs::write(&drop_file, b"").unwrap();
        let keep_id = FileId::from_path(&keep_file).unwrap();
        let drop_id = FileId::from_path(&drop_file).unwrap();
        let keep_link = create(&keep_file, keep_id).unwrap();
        let drop_link = create(&drop_file, drop_id).unwrap();
        fs::write(track_dir(dir.path()).join("not-an-id"), b"").unwrap();

        let removed = collect_stale(dir.path(), |id| id == keep_id);

        assert_eq!(removed, vec![drop_link.clone()]);
        assert!(keep_link.exists());
        assert!(!drop_link.exists());
        assert!(track_dir(dir.path()).join("not-an-id").exists());
    }
}
