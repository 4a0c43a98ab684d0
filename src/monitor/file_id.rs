// SPDX-License-Identifier: Apache-2.0

//! Stable file identity based on device and inode number.
//!
//! A file keeps its identity across renames, which is what lets the tracker
//! recognize a rotated log as the same file under a new name.

use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Identity of a live file: device ID + inode number.
///
/// The string form `dev:ino` names the file's track link and its checkpoint
/// records, so it must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> Self {
        compile_error!("logmon relies on device/inode identity and hard links; only unix targets are supported");
    }

    /// Stat `path` (following symlinks) and derive its identity.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

impl FromStr for FileId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dev, ino) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid file id '{}': expected dev:ino", s))?;
        let dev = dev
            .parse::<u64>()
            .map_err(|e| format!("invalid device in file id '{}': {}", s, e))?;
        let ino = ino
            .parse::<u64>()
            .map_err(|e| format!("invalid inode in file id '{}': {}", s, e))?;
        Ok(Self { dev, ino })
    }
}
