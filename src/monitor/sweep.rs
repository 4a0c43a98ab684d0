// SPDX-License-Identifier: Apache-2.0

//! Reconciliation sweep.
//!
//! Notifications can be dropped or coalesced, so the tracker's view of the
//! tree drifts. The sweep re-walks every configured root on a fixed interval
//! and repairs what it finds: untracked files are discovered, tracked files
//! whose name no longer holds them are parked as renames, failed handler
//! bindings are retried, and roots dropped by a reload are retired.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::file_id::FileId;
use crate::monitor::tracker::{TrackedFile, Tracker, lock};

impl Tracker {
    /// Run one full reconciliation pass.
    pub async fn sweep(&self) {
        let snapshot = self.rules.snapshot();
        let roots: HashSet<PathBuf> = snapshot.roots().map(|r| r.to_path_buf()).collect();

        self.retire_dropped_roots(&roots).await;
        self.drop_vanished_dirs().await;

        for root in snapshot.roots() {
            self.scan_root(root).await;
        }

        self.prune_moved_files().await;
        self.retry_bindings().await;
        self.expire_renames().await;
    }

    async fn retire_dropped_roots(&self, roots: &HashSet<PathBuf>) {
        let dropped_dirs: Vec<PathBuf> = lock(&self.paths)
            .values()
            .filter(|w| !roots.contains(&w.root))
            .map(|w| w.path.clone())
            .collect();
        for dir in &dropped_dirs {
            self.remove_watched_path(dir);
        }

        let dropped_files: Vec<(PathBuf, Arc<TrackedFile>)> = lock(&self.files)
            .by_path
            .iter()
            .filter(|(_, f)| !roots.contains(f.root()))
            .map(|(p, f)| (p.clone(), f.clone()))
            .collect();
        if !dropped_dirs.is_empty() || !dropped_files.is_empty() {
            info!(
                directories = dropped_dirs.len(),
                files = dropped_files.len(),
                "Retiring roots no longer configured"
            );
        }
        for (path, file) in dropped_files {
            let claimed = lock(&self.files).take(&path, &file);
            if claimed {
                self.retire(&file, &path).await;
            }
        }
    }

    async fn drop_vanished_dirs(&self) {
        let watched: Vec<PathBuf> = lock(&self.paths).keys().cloned().collect();
        for dir in watched {
            if !dir.is_dir() {
                self.handle_dir_gone(&dir).await;
            }
        }
    }

    /// Park tracked files whose path no longer resolves to their identity,
    /// and move track links whose directory disappeared.
    async fn prune_moved_files(&self) {
        let tracked: Vec<(PathBuf, Arc<TrackedFile>)> = lock(&self.files)
            .by_path
            .iter()
            .map(|(p, f)| (p.clone(), f.clone()))
            .collect();

        for (path, file) in tracked {
            match FileId::from_path(&path) {
                Ok(id) if id == file.id() => {
                    if let Err(e) = file.track_link().relocate(&path, id) {
                        warn!(error = %e, "Unable to relocate track link");
                    }
                }
                _ => {
                    debug!(path = ?path, file_id = %file.id(), "Tracked path no longer holds its file");
                    self.stage_rename(&file, &path).await;
                }
            }
        }
    }

    /// Construct handlers whose earlier construction failed. A handler
    /// bound late receives `FoundFile`.
    async fn retry_bindings(&self) {
        let snapshot = self.rules.snapshot();
        let tracked: Vec<Arc<TrackedFile>> = lock(&self.files).by_path.values().cloned().collect();

        for file in tracked {
            let mut state = file.state.lock().await;
            if state.removed || state.handlers.missing().is_empty() {
                continue;
            }
            let Some(rule) = snapshot.rule_for_root(file.root()) else {
                continue;
            };
            let missing = state.handlers.missing().to_vec();
            let path = file.path();
            let added = self
                .registry
                .bind(&rule, &missing, &path, &mut state.handlers);
            if !added.is_empty() {
                state
                    .handlers
                    .found_file_for(&added, &path, file.id(), file.track_link());
            }
        }
    }
}

/// Sweep every `interval` until cancelled. The first pass runs one interval
/// after start; the agent performs the initial scan itself.
pub async fn run_sweep(tracker: Arc<Tracker>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!("Starting reconciliation sweep");
                tracker.sweep().await;
            }
        }
    }
    debug!("Sweep task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::handler::testing::Call;
    use crate::monitor::rules::{Rule, RuleSet};
    use crate::monitor::track_link::link_path;
    use crate::monitor::tracker::TrackerConfig;
    use crate::monitor::tracker::tests::{append, harness, harness_with};
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweep_heals_missed_rename() {
        let h = harness(r"\.log$");
        let a = h.path("a.log");
        append(&a, b"");
        h.tracker.scan().await;
        let id = FileId::from_path(&a).unwrap();
        h.log.clear();

        // Both halves of the rename were dropped.
        let b = h.path("b.log");
        fs::rename(&a, &b).unwrap();
        h.tracker.sweep().await;

        assert_eq!(h.log.calls(), vec![Call::Renamed(a.clone(), b.clone(), id)]);
        assert_eq!(h.tracker.tracked_paths(), vec![b]);
        assert_eq!(h.tracker.pending_renames(), 0);
    }

    #[tokio::test]
    async fn test_sweep_stages_missing_file_then_expires() {
        let h = harness_with(
            r"\.log$",
            &["recorder"],
            TrackerConfig {
                rename_timeout: Duration::ZERO,
            },
        );
        let a = h.path("a.log");
        append(&a, b"");
        h.tracker.scan().await;
        let id = FileId::from_path(&a).unwrap();
        h.log.clear();

        fs::remove_file(&a).unwrap();
        h.tracker.sweep().await;

        assert_eq!(h.log.calls(), vec![Call::Removed(a.clone(), id), Call::Shutdown]);
        assert!(h.tracker.tracked_ids().is_empty());
        assert!(!link_path(h.root(), id).exists());
    }

    #[tokio::test]
    async fn test_sweep_discovers_nested_directories() {
        let h = harness(r"\.log$");
        h.tracker.scan().await;

        let deep = h.path("one").join("two");
        fs::create_dir_all(&deep).unwrap();
        let x = deep.join("x.log");
        append(&x, b"");
        h.tracker.sweep().await;

        assert!(h.watcher.is_watched(&h.path("one")));
        assert!(h.watcher.is_watched(&deep));
        assert_eq!(
            h.log.calls(),
            vec![Call::Found(x.clone(), FileId::from_path(&x).unwrap())]
        );
    }

    #[tokio::test]
    async fn test_sweep_retires_dropped_root_and_scans_new_one() {
        let h = harness(r"\.log$");
        let a = h.path("a.log");
        append(&a, b"");
        h.tracker.scan().await;
        let a_id = FileId::from_path(&a).unwrap();

        let other = TempDir::new().unwrap();
        let c = other.path().join("c.log");
        append(&c, b"");
        let rule = Rule::new(
            other.path(),
            r"\.log$",
            vec![crate::monitor::rules::HandlerBinding::new(
                "recorder",
                "/etc/logmon/recorder.json",
            )],
        )
        .unwrap();
        assert!(h.tracker.rules().replace(RuleSet::new(vec![rule]).unwrap()));
        h.log.clear();

        h.tracker.sweep().await;

        assert_eq!(
            h.log.calls(),
            vec![
                Call::Removed(a.clone(), a_id),
                Call::Shutdown,
                Call::Found(c.clone(), FileId::from_path(&c).unwrap()),
            ]
        );
        assert!(!h.watcher.is_watched(h.root()));
        assert!(h.watcher.is_watched(other.path()));
    }

    #[tokio::test]
    async fn test_sweep_unwatches_vanished_directory() {
        let h = harness(r"\.log$");
        let sub = h.path("sub");
        fs::create_dir(&sub).unwrap();
        h.tracker.scan().await;
        assert!(h.watcher.is_watched(&sub));

        fs::remove_dir_all(&sub).unwrap();
        h.tracker.sweep().await;

        assert!(!h.watcher.is_watched(&sub));
        assert!(!h.tracker.is_watched(&sub));
    }

    #[tokio::test]
    async fn test_run_sweep_stops_on_cancel() {
        let h = harness(r"\.log$");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweep(
            h.tracker.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let a = h.path("a.log");
        append(&a, b"");
        for _ in 0..200 {
            if !h.log.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.log.calls(),
            vec![Call::Found(a.clone(), FileId::from_path(&a).unwrap())]
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
