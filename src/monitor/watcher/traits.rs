// SPDX-License-Identifier: Apache-2.0

//! Traits and types for directory watchers.

use std::fmt;
use std::path::{Path, PathBuf};

/// Error type for watcher operations
#[derive(Debug)]
pub enum WatcherError {
    /// Failed to initialize the watcher
    Init(String),
    /// Failed to add or remove a watch
    Watch(String),
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::Init(msg) => write!(f, "watcher initialization failed: {}", msg),
            WatcherError::Watch(msg) => write!(f, "watch failed: {}", msg),
        }
    }
}

impl std::error::Error for WatcherError {}

/// Kind of raw directory-change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    /// A name appeared in the directory (new file, or the target of a rename)
    Create,
    /// File content changed
    Write,
    /// A name was unlinked
    Remove,
    /// A name was renamed away; the new name, if still visible, arrives as a Create
    Rename,
    /// Permissions, timestamps or other metadata changed
    AttributeChange,
    /// The backend lost events (queue overflow); the tree must be rescanned.
    /// Carries no path.
    Rescan,
}

/// A single event for a direct child of a watched directory
/// (or for the watched directory itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self::new(RawEventKind::Create, path)
    }

    pub fn write(path: impl Into<PathBuf>) -> Self {
        Self::new(RawEventKind::Write, path)
    }

    pub fn remove(path: impl Into<PathBuf>) -> Self {
        Self::new(RawEventKind::Remove, path)
    }

    pub fn rename(path: impl Into<PathBuf>) -> Self {
        Self::new(RawEventKind::Rename, path)
    }

    pub fn attribute_change(path: impl Into<PathBuf>) -> Self {
        Self::new(RawEventKind::AttributeChange, path)
    }

    pub fn rescan() -> Self {
        Self::new(RawEventKind::Rescan, PathBuf::new())
    }
}

/// Directory watcher seam.
///
/// Watches are non-recursive: a watched directory reports events for its
/// direct children only. Recursion is the caller's job.
pub trait PathWatcher: Send {
    /// Begin receiving events for the direct children of `path`.
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError>;

    /// Stop receiving events for `path`.
    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError>;

    /// Get the name of the watcher backend for logging.
    fn backend_name(&self) -> &'static str;
}
