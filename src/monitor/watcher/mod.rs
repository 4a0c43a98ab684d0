// SPDX-License-Identifier: Apache-2.0

//! Directory watcher abstraction.
//!
//! The watcher only reports raw, best-effort events for the direct children of
//! each watched directory. Events may be coalesced or dropped under load, so
//! consumers must tolerate gaps.

mod native;
mod traits;

pub use native::NativeWatcher;
pub use traits::{PathWatcher, RawEvent, RawEventKind, WatcherError};
