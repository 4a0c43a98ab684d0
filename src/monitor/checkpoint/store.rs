// SPDX-License-Identifier: Apache-2.0

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use portable_atomic::{AtomicU64, Ordering};

use super::Checkpoint;
use crate::monitor::error::{Error, Result};
use crate::monitor::file_id::FileId;

/// On-disk checkpoint records for a single handler namespace.
///
/// Each handler task owns its store exclusively, so there is only ever one
/// writer per record.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    fsync: bool,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path, namespace: &str, fsync: bool) -> Self {
        Self {
            dir: state_dir.join(sanitize(namespace)),
            fsync,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: FileId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Load the checkpoint for `id`, if one was ever saved.
    pub fn load(&self, id: FileId) -> Result<Option<Checkpoint>> {
        let path = self.record_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Checkpoint(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let cp = Checkpoint::decode(&data)?;
        if cp.file_id != id {
            return Err(Error::Checkpoint(format!(
                "{} holds a checkpoint for {}",
                path.display(),
                cp.file_id
            )));
        }
        Ok(Some(cp))
    }

    pub fn save(&self, cp: &Checkpoint) -> Result<()> {
        atomic_write(&self.record_path(cp.file_id), &cp.encode(), self.fsync)
    }

    /// Delete the record for `id`. A missing record is not an error.
    pub fn remove(&self, id: FileId) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Checkpoint(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Namespaces become directory names; keep them to a single path component.
fn sanitize(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn atomic_write(path: &Path, data: &[u8], fsync: bool) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let parent = path
        .parent()
        .ok_or_else(|| Error::Checkpoint(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| {
        Error::Checkpoint(format!("failed to create checkpoint directory: {}", e))
    })?;

    // Unique per process and write so concurrent writers never share a temp file
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let write = || -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.flush()?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&temp_path, path)?;

        if fsync {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Checkpoint(format!("failed to write {}: {}", path.display(), e))
    })
}
