// SPDX-License-Identifier: Apache-2.0

//! File identity tracker.
//!
//! Turns raw directory events into the lifecycle protocol delivered to
//! handlers. Files are keyed by device and inode so a rename is recognized as
//! the same file under a new name, and each tracked file keeps a hard link in
//! its directory's track link directory for as long as it is tracked.
//!
//! The event loop is the only task that processes watcher events. The
//! reconciliation sweep runs concurrently and calls into the same discovery
//! path. Every transition first claims the file by mutating the file table
//! under its lock, so exactly one party performs it. Lock order is watched
//! paths, then files, then the per-file state lock. No I/O happens while the
//! table locks are held.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::monitor::file_id::FileId;
use crate::monitor::handler::HandlerSet;
use crate::monitor::registry::HandlerRegistry;
use crate::monitor::rules::{Rule, RuleTable};
use crate::monitor::track_link::{self, TrackLink};
use crate::monitor::watcher::{PathWatcher, RawEvent, RawEventKind};

/// Upper bound on events handled per watcher wake-up.
const MAX_EVENT_BATCH: usize = 1024;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long a renamed-away file waits for its new name before it is
    /// treated as removed.
    pub rename_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            rename_timeout: Duration::from_secs(2),
        }
    }
}

/// A directory receiving events, and the configured root whose rule
/// governs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedPath {
    pub path: PathBuf,
    pub root: PathBuf,
}

/// How a file came to be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Already present when its directory was scanned.
    Found,
    /// Reported by a create event.
    Created,
}

pub(crate) struct FileState {
    pub(crate) dirty: bool,
    pub(crate) handlers: HandlerSet,
    pub(crate) removed: bool,
}

pub struct TrackedFile {
    id: FileId,
    root: PathBuf,
    path: RwLock<PathBuf>,
    track_link: TrackLink,
    pub(crate) state: Arc<AsyncMutex<FileState>>,
}

impl TrackedFile {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current path. Never blocks on lifecycle processing.
    pub fn path(&self) -> PathBuf {
        match self.path.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_path(&self, path: &Path) {
        match self.path.write() {
            Ok(mut p) => *p = path.to_path_buf(),
            Err(poisoned) => *poisoned.into_inner() = path.to_path_buf(),
        }
    }

    pub fn track_link(&self) -> &TrackLink {
        &self.track_link
    }
}

pub(crate) struct RenameInFlight {
    pub(crate) old_path: PathBuf,
    pub(crate) tracked: Arc<TrackedFile>,
    pub(crate) staged_at: Instant,
}

#[derive(Default)]
pub(crate) struct FileTable {
    pub(crate) by_path: HashMap<PathBuf, Arc<TrackedFile>>,
    pub(crate) by_id: HashMap<FileId, Arc<TrackedFile>>,
    pub(crate) renames: HashMap<FileId, RenameInFlight>,
}

impl FileTable {
    fn insert(&mut self, path: PathBuf, file: Arc<TrackedFile>) {
        self.by_id.insert(file.id, file.clone());
        self.by_path.insert(path, file);
    }

    /// Remove `file` from `path` if it is still the entry there.
    pub(crate) fn take(&mut self, path: &Path, file: &Arc<TrackedFile>) -> bool {
        match self.by_path.get(path) {
            Some(current) if Arc::ptr_eq(current, file) => {}
            _ => return false,
        }
        self.by_path.remove(path);
        if self
            .by_id
            .get(&file.id)
            .is_some_and(|f| Arc::ptr_eq(f, file))
        {
            self.by_id.remove(&file.id);
        }
        true
    }

    pub(crate) fn knows(&self, id: FileId) -> bool {
        self.by_id.contains_key(&id) || self.renames.contains_key(&id)
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Claim {
    Nothing,
    New(Arc<TrackedFile>, tokio::sync::OwnedMutexGuard<FileState>),
    Rename(Arc<TrackedFile>, PathBuf),
}

pub struct Tracker {
    pub(crate) rules: Arc<RuleTable>,
    pub(crate) registry: Arc<HandlerRegistry>,
    watcher: Mutex<Box<dyn PathWatcher>>,
    pub(crate) paths: Mutex<HashMap<PathBuf, WatchedPath>>,
    pub(crate) files: Mutex<FileTable>,
    pub(crate) config: TrackerConfig,
}

impl Tracker {
    pub fn new(
        rules: Arc<RuleTable>,
        registry: Arc<HandlerRegistry>,
        watcher: Box<dyn PathWatcher>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            rules,
            registry,
            watcher: Mutex::new(watcher),
            paths: Mutex::new(HashMap::new()),
            files: Mutex::new(FileTable::default()),
            config,
        }
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    /// Identities currently tracked, excluding pending renames.
    pub fn tracked_ids(&self) -> HashSet<FileId> {
        lock(&self.files).by_id.keys().copied().collect()
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.files).by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn tracked_file(&self, path: &Path) -> Option<Arc<TrackedFile>> {
        lock(&self.files).by_path.get(path).cloned()
    }

    pub fn pending_renames(&self) -> usize {
        lock(&self.files).renames.len()
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.paths).keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        lock(&self.paths).contains_key(dir)
    }

    /// Scan every configured root, reporting existing files as found.
    pub async fn scan(&self) {
        let snapshot = self.rules.snapshot();
        for root in snapshot.roots() {
            self.scan_root(root).await;
        }
    }

    pub(crate) async fn scan_root(&self, root: &Path) {
        match fs::metadata(root) {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                warn!(root = ?root, "Configured root is not a directory");
                return;
            }
            Err(e) => {
                debug!(root = ?root, error = %e, "Configured root is not available");
                return;
            }
        }
        self.add_watched_path(root, root);
        self.discover(root, root).await;
    }

    /// Start watching `dir` on behalf of `root`. Returns false if it was
    /// already watched or the watch could not be established.
    pub(crate) fn add_watched_path(&self, dir: &Path, root: &Path) -> bool {
        if track_link::is_track_path(dir) {
            return false;
        }
        {
            let mut paths = lock(&self.paths);
            if paths.contains_key(dir) {
                return false;
            }
            paths.insert(
                dir.to_path_buf(),
                WatchedPath {
                    path: dir.to_path_buf(),
                    root: root.to_path_buf(),
                },
            );
        }

        if let Err(e) = track_link::ensure_track_dir(dir) {
            warn!(error = %e, "Unable to create track link directory");
        }

        let watched = lock(&self.watcher).watch(dir);
        if let Err(e) = watched {
            warn!(path = ?dir, error = %e, "Unable to watch directory");
            lock(&self.paths).remove(dir);
            return false;
        }
        debug!(path = ?dir, root = ?root, "Watching directory");

        self.collect_stale_links(dir);
        true
    }

    /// Drop links whose identity is neither a child of `dir` nor tracked.
    fn collect_stale_links(&self, dir: &Path) {
        let children: HashSet<FileId> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| FileId::from_metadata(&m))
                .collect(),
            Err(_) => return,
        };
        let removed = track_link::collect_stale(dir, |id| {
            children.contains(&id) || lock(&self.files).knows(id)
        });
        if !removed.is_empty() {
            info!(path = ?dir, count = removed.len(), "Removed stale track links");
        }
    }

    fn remove_watched_tree(&self, dir: &Path) -> Vec<PathBuf> {
        let removed: Vec<PathBuf> = {
            let mut paths = lock(&self.paths);
            let gone: Vec<PathBuf> = paths
                .keys()
                .filter(|p| p.starts_with(dir))
                .cloned()
                .collect();
            for p in &gone {
                paths.remove(p);
            }
            gone
        };

        let mut watcher = lock(&self.watcher);
        for p in &removed {
            if let Err(e) = watcher.unwatch(p) {
                debug!(path = ?p, error = %e, "Unwatch failed");
            }
        }
        removed
    }

    pub(crate) fn remove_watched_path(&self, dir: &Path) {
        if lock(&self.paths).remove(dir).is_some() {
            if let Err(e) = lock(&self.watcher).unwatch(dir) {
                debug!(path = ?dir, error = %e, "Unwatch failed");
            }
        }
    }

    /// Walk `dir` and everything below it, watching subdirectories and
    /// admitting matching files as found.
    pub(crate) async fn discover(&self, dir: &Path, root: &Path) {
        let snapshot = self.rules.snapshot();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            let listing = {
                let current = current.clone();
                tokio::task::spawn_blocking(move || list_dir(&current)).await
            };
            let entries = match listing {
                Ok(Ok(entries)) => entries,
                Ok(Err(e)) => {
                    debug!(path = ?current, error = %e, "Unable to list directory");
                    continue;
                }
                Err(e) => {
                    warn!(path = ?current, error = %e, "Directory listing task failed");
                    continue;
                }
            };

            for entry in entries {
                if entry.is_dir {
                    if track_link::is_track_path(&entry.path) {
                        continue;
                    }
                    // A nested root is governed by its own rule.
                    if entry.path != root && snapshot.is_root(&entry.path) {
                        continue;
                    }
                    self.add_watched_path(&entry.path, root);
                    stack.push(entry.path);
                } else {
                    self.admit(&entry.path, Origin::Found).await;
                }
            }
        }
    }

    /// Root and rule governing a file's directory. The name pattern is not
    /// applied here: a tracked file keeps its identity under any name.
    fn rule_for_parent(&self, path: &Path) -> Option<(PathBuf, Arc<Rule>)> {
        if track_link::is_track_path(path) {
            return None;
        }
        let parent = path.parent()?;
        let root = lock(&self.paths).get(parent)?.root.clone();
        let rule = self.rules.snapshot().rule_for_root(&root)?;
        Some((root, rule))
    }

    /// Discovery and create handling for a single file path.
    ///
    /// A pending rename or a tracked identity completes as a rename whatever
    /// the new name is. Only new files must match the rule's pattern.
    pub(crate) async fn admit(&self, path: &Path, origin: Origin) {
        let Some((root, rule)) = self.rule_for_parent(path) else {
            return;
        };
        let id = match fs::symlink_metadata(path) {
            Ok(m) if m.is_file() => FileId::from_metadata(&m),
            Ok(_) => return,
            Err(e) => {
                debug!(path = ?path, error = %e, "Unable to resolve file identity");
                return;
            }
        };

        // A different file tracked under this name is gone.
        let replaced = {
            let mut files = lock(&self.files);
            match files.by_path.get(path).cloned() {
                Some(f) if f.id == id => return,
                Some(f) => files.take(path, &f).then_some(f),
                None => None,
            }
        };
        if let Some(old) = replaced {
            debug!(path = ?path, old = %old.id, new = %id, "Path now holds a different file");
            self.flush_modified(&old).await;
            self.retire(&old, path).await;
        }

        // Same identity tracked under another name.
        let elsewhere = lock(&self.files).by_id.get(&id).map(|f| f.path());
        if let Some(other) = &elsewhere {
            if FileId::from_path(other).ok() == Some(id) {
                debug!(path = ?path, tracked = ?other, file_id = %id, "Ignoring additional link to a tracked file");
                return;
            }
        }

        let claim = {
            let mut files = lock(&self.files);
            if files.by_path.contains_key(path) {
                Claim::Nothing
            } else if let Some(rif) = files.renames.remove(&id) {
                rif.tracked.set_path(path);
                files.insert(path.to_path_buf(), rif.tracked.clone());
                Claim::Rename(rif.tracked, rif.old_path)
            } else if let Some(f) = files.by_id.get(&id).cloned() {
                let old_path = f.path();
                if Some(&old_path) == elsewhere.as_ref() && files.take(&old_path, &f) {
                    f.set_path(path);
                    files.insert(path.to_path_buf(), f.clone());
                    Claim::Rename(f, old_path)
                } else {
                    Claim::Nothing
                }
            } else if !rule.matches(path) {
                Claim::Nothing
            } else {
                let dir = path.parent().unwrap_or(Path::new("/"));
                let file = Arc::new(TrackedFile {
                    id,
                    root: root.clone(),
                    path: RwLock::new(path.to_path_buf()),
                    track_link: TrackLink::new(track_link::link_path(dir, id)),
                    state: Arc::new(AsyncMutex::new(FileState {
                        dirty: false,
                        handlers: HandlerSet::new(),
                        removed: false,
                    })),
                });
                match file.state.clone().try_lock_owned() {
                    Ok(guard) => {
                        files.insert(path.to_path_buf(), file.clone());
                        Claim::New(file, guard)
                    }
                    Err(_) => Claim::Nothing,
                }
            }
        };

        match claim {
            Claim::Nothing => {}
            Claim::Rename(file, old_path) => self.complete_rename(&file, &old_path, path).await,
            Claim::New(file, mut state) => {
                let link = match track_link::create(path, id) {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(error = %e, "Unable to create track link");
                        state.removed = true;
                        lock(&self.files).take(path, &file);
                        return;
                    }
                };

                let indices: Vec<usize> = (0..rule.bindings.len()).collect();
                self.registry
                    .bind(&rule, &indices, path, &mut state.handlers);
                if state.handlers.is_empty() {
                    debug!(path = ?path, "No handler could be bound, leaving file untracked");
                    state.removed = true;
                    lock(&self.files).take(path, &file);
                    if let Err(e) = track_link::remove(&link) {
                        warn!(error = %e, "Unable to remove track link");
                    }
                    return;
                }

                match origin {
                    Origin::Found => {
                        info!(path = ?path, file_id = %id, "Found file");
                        state.handlers.found_file(path, id, &file.track_link);
                    }
                    Origin::Created => {
                        info!(path = ?path, file_id = %id, "Created file");
                        state.handlers.created_file(path, id, &file.track_link);
                    }
                }
            }
        }
    }

    async fn complete_rename(&self, file: &TrackedFile, old_path: &Path, new_path: &Path) {
        let state = file.state.lock().await;
        if state.removed {
            return;
        }
        if let Err(e) = file.track_link.relocate(new_path, file.id) {
            warn!(error = %e, "Unable to relocate track link");
        }
        info!(from = ?old_path, to = ?new_path, file_id = %file.id, "Renamed file");
        state.handlers.renamed_file(old_path, new_path, file.id);
    }

    /// Deliver a pending `ModifiedFile` if the file is dirty.
    pub(crate) async fn flush_modified(&self, file: &TrackedFile) {
        let mut state = file.state.lock().await;
        if state.dirty && !state.removed {
            state.dirty = false;
            let path = file.path();
            debug!(path = ?path, file_id = %file.id, "Modified file");
            state.handlers.modified_file(&path, file.id);
        }
    }

    /// Terminal transition: `RemovedFile`, stop the handlers, then drop the
    /// track link. The caller must already have claimed `file`.
    pub(crate) async fn retire(&self, file: &TrackedFile, path: &Path) {
        let mut state = file.state.lock().await;
        if state.removed {
            return;
        }
        state.removed = true;
        info!(path = ?path, file_id = %file.id, "Removed file");
        state.handlers.removed_file(path, file.id);
        state.handlers.shutdown().await;
        drop(state);

        if let Err(e) = track_link::remove(&file.track_link.path()) {
            warn!(error = %e, "Unable to remove track link");
        }
    }

    /// Park a tracked file until its new name shows up or the rename
    /// timeout expires.
    pub(crate) async fn stage_rename(&self, file: &Arc<TrackedFile>, path: &Path) {
        self.flush_modified(file).await;
        let mut files = lock(&self.files);
        if files.take(path, file) {
            debug!(path = ?path, file_id = %file.id, "Waiting for renamed file");
            files.renames.insert(
                file.id,
                RenameInFlight {
                    old_path: path.to_path_buf(),
                    tracked: file.clone(),
                    staged_at: Instant::now(),
                },
            );
        }
    }

    /// Retire renames whose new name never appeared.
    pub async fn expire_renames(&self) {
        self.expire_renames_at(Instant::now()).await
    }

    pub(crate) async fn expire_renames_at(&self, now: Instant) {
        let timeout = self.config.rename_timeout;
        let expired: Vec<RenameInFlight> = {
            let mut files = lock(&self.files);
            let ids: Vec<FileId> = files
                .renames
                .iter()
                .filter(|(_, r)| now.saturating_duration_since(r.staged_at) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| files.renames.remove(&id))
                .collect()
        };
        for rif in expired {
            debug!(path = ?rif.old_path, file_id = %rif.tracked.id, "Rename target never appeared");
            self.retire(&rif.tracked, &rif.old_path).await;
        }
    }

    async fn handle_event(&self, event: RawEvent, touched: &mut Vec<Arc<TrackedFile>>) {
        let path = event.path.as_path();
        if track_link::is_track_path(path) {
            return;
        }

        match event.kind {
            RawEventKind::Create => match fs::symlink_metadata(path) {
                Ok(m) if m.is_dir() => self.handle_dir_create(path).await,
                Ok(_) => self.admit(path, Origin::Created).await,
                Err(e) => debug!(path = ?path, error = %e, "Created path vanished"),
            },
            RawEventKind::Write => {
                let Some(file) = self.tracked_file(path) else {
                    return;
                };
                file.state.lock().await.dirty = true;
                if !touched.iter().any(|f| Arc::ptr_eq(f, &file)) {
                    touched.push(file);
                }
            }
            RawEventKind::Remove | RawEventKind::Rename => {
                if self.is_watched(path) {
                    self.handle_dir_gone(path).await;
                    return;
                }
                let Some(file) = self.tracked_file(path) else {
                    return;
                };
                // Stale event: the name still refers to this file.
                if FileId::from_path(path).ok() == Some(file.id) {
                    return;
                }
                if event.kind == RawEventKind::Remove {
                    self.flush_modified(&file).await;
                    let claimed = lock(&self.files).take(path, &file);
                    if claimed {
                        self.retire(&file, path).await;
                    }
                } else {
                    self.stage_rename(&file, path).await;
                }
            }
            RawEventKind::AttributeChange | RawEventKind::Rescan => {}
        }
    }

    async fn handle_dir_create(&self, dir: &Path) {
        let Some(parent) = dir.parent() else {
            return;
        };
        let Some(root) = lock(&self.paths).get(parent).map(|w| w.root.clone()) else {
            return;
        };
        if self.rules.snapshot().is_root(dir) {
            return;
        }
        self.add_watched_path(dir, &root);
        self.discover(dir, &root).await;
    }

    /// A watched directory was removed or renamed away. Its tracked files
    /// wait as renames: if the directory reappears elsewhere they complete
    /// as renames, otherwise they expire.
    pub(crate) async fn handle_dir_gone(&self, dir: &Path) {
        let removed = self.remove_watched_tree(dir);
        debug!(path = ?dir, directories = removed.len(), "Watched directory went away");

        let affected: Vec<(PathBuf, Arc<TrackedFile>)> = lock(&self.files)
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(dir))
            .map(|(p, f)| (p.clone(), f.clone()))
            .collect();
        for (path, file) in affected {
            self.stage_rename(&file, &path).await;
        }
    }

    /// Handle one watcher wake-up worth of events, then deliver
    /// `ModifiedFile` to every file they dirtied.
    ///
    /// A rescan request from the watcher runs a full sweep after the batch.
    pub async fn process_batch(&self, events: Vec<RawEvent>) {
        let mut touched = Vec::new();
        let mut rescan = false;
        for event in events {
            if event.kind == RawEventKind::Rescan {
                rescan = true;
                continue;
            }
            self.handle_event(event, &mut touched).await;
        }
        for file in touched {
            self.flush_modified(&file).await;
        }
        if rescan {
            info!("Watcher dropped events, sweeping now");
            self.sweep().await;
        }
    }

    /// Drain watcher events until cancelled or the watcher goes away.
    pub async fn run(self: Arc<Self>, mut events: BoundedReceiver<RawEvent>, cancel: CancellationToken) {
        let period = (self.config.rename_timeout / 2).max(Duration::from_millis(50));
        let mut expiry = tokio::time::interval(period);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.next() => {
                    let Some(event) = event else {
                        warn!("Watcher event stream closed");
                        break;
                    };
                    let mut batch = vec![event];
                    while batch.len() < MAX_EVENT_BATCH {
                        match events.try_recv() {
                            Some(event) => batch.push(event),
                            None => break,
                        }
                    }
                    self.process_batch(batch).await;
                }
                _ = expiry.tick() => self.expire_renames().await,
            }
        }
        debug!("Tracker event loop exiting");
    }

    /// Stop every handler without emitting `RemovedFile`. Track links and
    /// checkpoints stay in place for the next start.
    pub async fn shutdown(&self) {
        let files: Vec<Arc<TrackedFile>> = {
            let mut table = lock(&self.files);
            let mut files: Vec<Arc<TrackedFile>> = table.by_path.drain().map(|(_, f)| f).collect();
            files.extend(table.renames.drain().map(|(_, r)| r.tracked));
            table.by_id.clear();
            files
        };
        info!(files = files.len(), "Stopping file handlers");
        for file in files {
            let mut state = file.state.lock().await;
            if state.removed {
                continue;
            }
            state.removed = true;
            state.handlers.shutdown().await;
        }
    }
}

pub(crate) struct DirEntry {
    pub(crate) path: PathBuf,
    pub(crate) is_dir: bool,
}

/// Direct children of `dir`. Symlinks are skipped.
pub(crate) fn list_dir(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() || file_type.is_file() {
            entries.push(DirEntry {
                path: entry.path(),
                is_dir: file_type.is_dir(),
            });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
