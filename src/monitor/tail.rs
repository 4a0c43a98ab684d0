// SPDX-License-Identifier: Apache-2.0

//! Per-file tailing task.
//!
//! A `TailTask` owns a `CheckpointReader` for one file and drains newly
//! appended lines into a `LineSink` whenever it is woken. Wakeups go through a
//! single-slot channel, so any number of `wake` calls between two drains
//! collapse into one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::monitor::checkpoint::CheckpointReader;
use crate::monitor::file_id::FileId;
use crate::monitor::track_link::TrackLink;

/// Consumer of complete lines read from a tailed file.
pub trait LineSink: Send + 'static {
    /// Handle one batch of newline-terminated records. The checkpoint only
    /// advances past the batch when this returns `Ok`.
    fn deliver(&mut self, path: &Path, id: FileId, data: &[u8]) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Default)]
pub struct TailConfig {
    /// Also wake on this interval, not only on explicit wakeups.
    pub flush_interval: Option<Duration>,
}

struct TailState<S> {
    id: FileId,
    path: Arc<RwLock<PathBuf>>,
    track_link: TrackLink,
    reader: CheckpointReader,
    sink: S,
    cancel: CancellationToken,
}

impl<S: LineSink> TailState<S> {
    fn current_path(&self) -> PathBuf {
        read_path(&self.path)
    }

    /// Read and deliver until end of file, a failure, or cancellation.
    fn drain(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let link = self.track_link.path();
            let batch = match self.reader.read(self.id, &link) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(file_id = %self.id, track_link = ?link, error = %e, "Unable to read tracked file");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            let path = self.current_path();
            if let Err(e) = self.sink.deliver(&path, self.id, &batch.data) {
                warn!(file_id = %self.id, path = ?path, error = %e, "Line delivery failed, will retry");
                return;
            }
            self.reader.update_position(self.id, batch.consumed);

            if batch.eof {
                return;
            }
        }
    }
}

fn read_path(path: &RwLock<PathBuf>) -> PathBuf {
    match path.read() {
        Ok(p) => p.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Handle to a spawned tailing task.
pub struct TailTask {
    id: FileId,
    wake_tx: BoundedSender<()>,
    path: Arc<RwLock<PathBuf>>,
    cancel: CancellationToken,
    forget: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TailTask {
    /// Spawn the task on the current runtime. It performs a catch-up drain
    /// right away, then waits for wakeups.
    pub fn spawn<S: LineSink>(
        id: FileId,
        path: PathBuf,
        track_link: TrackLink,
        reader: CheckpointReader,
        sink: S,
        config: TailConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let path = Arc::new(RwLock::new(path));
        let cancel = CancellationToken::new();
        let forget = Arc::new(AtomicBool::new(false));

        let state = TailState {
            id,
            path: path.clone(),
            track_link,
            reader,
            sink,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(run(
            state,
            wake_rx,
            cancel.clone(),
            forget.clone(),
            config.flush_interval,
        ));

        Self {
            id,
            wake_tx,
            path,
            cancel,
            forget,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Request a drain. Never blocks; a pending wakeup already covers this one.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn set_path(&self, path: &Path) {
        match self.path.write() {
            Ok(mut p) => *p = path.to_path_buf(),
            Err(poisoned) => *poisoned.into_inner() = path.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        read_path(&self.path)
    }

    /// The file is gone for good: drop its checkpoint when the task exits.
    pub fn retire(&self) {
        self.forget.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Cancel the task and wait for it to finish its current batch.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = match self.handle.lock() {
            Ok(mut h) => h.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(file_id = %self.id, error = %e, "Tail task failed");
            }
        }
    }
}

impl Drop for TailTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

async fn run<S: LineSink>(
    mut state: TailState<S>,
    mut wake_rx: BoundedReceiver<()>,
    cancel: CancellationToken,
    forget: Arc<AtomicBool>,
    flush_interval: Option<Duration>,
) {
    let id = state.id;
    let mut flush = flush_interval.filter(|d| !d.is_zero()).map(|d| {
        let mut i = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
        i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        i
    });

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Reader I/O is blocking; keep it off the async workers.
        state = match tokio::task::spawn_blocking(move || {
            state.drain();
            state
        })
        .await
        {
            Ok(state) => state,
            Err(e) => {
                error!(file_id = %id, error = %e, "Tail drain panicked, stopping task");
                return;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            woke = wake_rx.next() => {
                if woke.is_none() {
                    break;
                }
            }
            _ = tick(&mut flush) => {}
        }
    }

    if forget.load(Ordering::SeqCst) {
        if let Err(e) = state.reader.forget(id) {
            warn!(file_id = %id, error = %e, "Unable to remove checkpoint");
        }
    }
    debug!(file_id = %id, "Tail task exiting");
}
