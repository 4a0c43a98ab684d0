// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

use crate::monitor::watcher::WatcherError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot resolve identity of {path:?}: {source}")]
    Identity {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Track link error for {path:?}: {source}")]
    TrackLink {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),
}

pub type Result<T> = std::result::Result<T, Error>;
