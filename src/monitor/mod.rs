// SPDX-License-Identifier: Apache-2.0

//! File lifecycle tracking and checkpointed tailing.
//!
//! The [`tracker::Tracker`] turns raw watcher notifications into per-file
//! lifecycle calls on the handlers bound by the [`rules::RuleTable`], and the
//! periodic [`sweep`] repairs whatever the notifications missed. Handlers read
//! through a [`checkpoint::CheckpointReader`] so that delivery resumes where
//! it left off across rotations and restarts.

pub mod checkpoint;
pub mod error;
pub mod file_id;
pub mod handler;
pub mod registry;
pub mod rules;
pub mod sweep;
pub mod tail;
pub mod track_link;
pub mod tracker;
pub mod watcher;

pub use error::{Error, Result};
