// SPDX-License-Identifier: Apache-2.0

//! Native directory watcher using the `notify` crate.
//!
//! Uses OS-level file system notifications:
//! - Linux: inotify
//! - macOS: FSEvents
//! - Windows: ReadDirectoryChangesW

use std::path::Path;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::traits::{PathWatcher, RawEvent, RawEventKind, WatcherError};
use crate::bounded_channel::{BoundedReceiver, BoundedSender, TrySendError, bounded};

/// Native watcher backed by OS notifications.
///
/// Events are pushed from the notify callback thread into a bounded queue.
/// When the queue is full the event is dropped; the reconciliation sweep
/// repairs whatever was missed.
pub struct NativeWatcher {
    watcher: RecommendedWatcher,
}

impl NativeWatcher {
    pub fn new(queue_size: usize) -> Result<(Self, BoundedReceiver<RawEvent>), WatcherError> {
        let (tx, rx) = bounded(queue_size.max(1));

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => forward(&tx, event),
                Err(e) => warn!(error = %e, "Directory watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok((Self { watcher }, rx))
    }
}

fn forward(tx: &BoundedSender<RawEvent>, event: Event) {
    for raw in convert_event(event) {
        match tx.try_send(raw) {
            Ok(()) => {}
            Err(TrySendError::Full(raw)) => {
                warn!(path = ?raw.path, kind = ?raw.kind, "Event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Event queue closed, discarding watcher events");
                return;
            }
        }
    }
}

/// Convert a notify event into zero or more raw events.
pub(crate) fn convert_event(event: Event) -> Vec<RawEvent> {
    if event.need_rescan() {
        return vec![RawEvent::rescan()];
    }

    let kind = match event.kind {
        EventKind::Create(_) => RawEventKind::Create,
        EventKind::Remove(_) => RawEventKind::Remove,
        EventKind::Modify(ModifyKind::Metadata(_)) => RawEventKind::AttributeChange,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawEventKind::Rename,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawEventKind::Create,
        // The backend already delivered the From and To halves separately.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        // Backends that cannot tell the halves apart: decide by existence.
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .into_iter()
                .map(|path| {
                    if path.exists() {
                        RawEvent::create(path)
                    } else {
                        RawEvent::rename(path)
                    }
                })
                .collect();
        }
        EventKind::Modify(_) => RawEventKind::Write,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .map(|path| RawEvent::new(kind, path))
        .collect()
}

impl PathWatcher for NativeWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(format!("{}: {}", path.display(), e)))
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .unwatch(path)
            .map_err(|e| WatcherError::Watch(format!("{}: {}", path.display(), e)))
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            "native"
        }
    }
}
