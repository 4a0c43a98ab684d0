// SPDX-License-Identifier: Apache-2.0

//! Pattern-matching handler.
//!
//! Tails its file through the checkpointed reader and raises a notification
//! for every line matching one of the configured patterns.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use tower::BoxError;
use tracing::warn;

use crate::monitor::checkpoint::{CheckpointReader, CheckpointStore, DEFAULT_MAX_BATCH_BYTES};
use crate::monitor::file_id::FileId;
use crate::monitor::handler::FileHandler;
use crate::monitor::tail::{LineSink, TailConfig, TailTask};
use crate::monitor::track_link::TrackLink;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatcherConfig {
    pub patterns: Vec<String>,
    #[serde(default, deserialize_with = "deser_duration_opt")]
    pub flush_interval: Option<Duration>,
    #[serde(default)]
    pub max_batch_bytes: Option<usize>,
    #[serde(default)]
    pub label: Option<String>,
}

fn deser_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

impl MatcherConfig {
    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let data = fs::read_to_string(path)
            .map_err(|e| format!("unable to read {}: {}", path.display(), e))?;
        let config: MatcherConfig = serde_json::from_str(&data)
            .map_err(|e| format!("invalid matcher config {}: {}", path.display(), e))?;
        if config.patterns.is_empty() {
            return Err(format!("{}: no patterns configured", path.display()).into());
        }
        if config.flush_interval == Some(Duration::ZERO) {
            return Err(format!("{}: flush_interval must be positive", path.display()).into());
        }
        Ok(config)
    }
}

/// A matched line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub label: String,
    pub path: PathBuf,
    pub file_id: FileId,
    pub pattern: String,
    pub line: String,
}

/// Destination for matches.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Reports matches as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: &Notification) {
        warn!(
            label = %n.label,
            path = ?n.path,
            file_id = %n.file_id,
            pattern = %n.pattern,
            line = %n.line,
            "Pattern matched"
        );
    }
}

struct MatchSink {
    label: String,
    patterns: Arc<Vec<Regex>>,
    notifier: Arc<dyn Notifier>,
}

impl LineSink for MatchSink {
    fn deliver(&mut self, path: &Path, id: FileId, data: &[u8]) -> Result<(), BoxError> {
        for line in data.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(line);
            if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(&text)) {
                self.notifier.notify(&Notification {
                    label: self.label.clone(),
                    path: path.to_path_buf(),
                    file_id: id,
                    pattern: pattern.as_str().to_string(),
                    line: text.into_owned(),
                });
            }
        }
        Ok(())
    }
}

pub struct MatcherHandler {
    label: String,
    patterns: Arc<Vec<Regex>>,
    notifier: Arc<dyn Notifier>,
    store: CheckpointStore,
    tail: TailConfig,
    max_batch_bytes: usize,
    task: Mutex<Option<TailTask>>,
}

impl MatcherHandler {
    pub fn new(
        namespace: &str,
        config: MatcherConfig,
        state_dir: &Path,
        fsync: bool,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, BoxError> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            label: config.label.unwrap_or_else(|| namespace.to_string()),
            patterns: Arc::new(patterns),
            notifier,
            store: CheckpointStore::new(state_dir, namespace, fsync),
            tail: TailConfig {
                flush_interval: config.flush_interval,
            },
            max_batch_bytes: config.max_batch_bytes.unwrap_or(DEFAULT_MAX_BATCH_BYTES),
            task: Mutex::new(None),
        })
    }

    fn with_task(&self, f: impl FnOnce(&mut Option<TailTask>)) {
        match self.task.lock() {
            Ok(mut task) => f(&mut task),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn start(&self, path: &Path, id: FileId, track_link: &TrackLink) {
        self.with_task(|task| {
            if task.is_some() {
                return;
            }
            let reader =
                CheckpointReader::new(self.store.clone()).with_max_batch_bytes(self.max_batch_bytes);
            let sink = MatchSink {
                label: self.label.clone(),
                patterns: self.patterns.clone(),
                notifier: self.notifier.clone(),
            };
            *task = Some(TailTask::spawn(
                id,
                path.to_path_buf(),
                track_link.clone(),
                reader,
                sink,
                self.tail.clone(),
            ));
        });
    }
}

impl FileHandler for MatcherHandler {
    fn found_file(&self, path: &Path, id: FileId, track_link: &TrackLink) {
        self.start(path, id, track_link);
    }

    fn created_file(&self, path: &Path, id: FileId, track_link: &TrackLink) {
        self.start(path, id, track_link);
    }

    fn removed_file(&self, _path: &Path, _id: FileId) {
        self.with_task(|task| {
            if let Some(task) = task {
                task.retire();
            }
        });
    }

    fn renamed_file(&self, _old_path: &Path, new_path: &Path, _id: FileId) {
        self.with_task(|task| {
            if let Some(task) = task {
                task.set_path(new_path);
            }
        });
    }

    fn modified_file(&self, _path: &Path, _id: FileId) {
        self.with_task(|task| {
            if let Some(task) = task {
                task.wake();
            }
        });
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let mut taken = None;
        self.with_task(|task| taken = task.take());
        Box::pin(async move {
            if let Some(task) = taken {
                task.stop().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Notification>>);

    impl Notifier for Collecting {
        fn notify(&self, n: &Notification) {
            self.0.lock().unwrap().push(n.clone());
        }
    }

    impl Collecting {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|n| n.line.clone()).collect()
        }
    }

    fn config(patterns: &[&str]) -> MatcherConfig {
        MatcherConfig {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            flush_interval: None,
            max_batch_bytes: None,
            label: Some("app".to_string()),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.json");
        fs::write(
            &path,
            r#"{"patterns": ["ERROR", "panic"], "flush_interval": "5s", "max_batch_bytes": 4096}"#,
        )
        .unwrap();
        let config = MatcherConfig::from_file(&path).unwrap();
        assert_eq!(config.patterns, vec!["ERROR", "panic"]);
        assert_eq!(config.flush_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.max_batch_bytes, Some(4096));
        assert_eq!(config.label, None);

        fs::write(&path, r#"{"patterns": []}"#).unwrap();
        assert!(MatcherConfig::from_file(&path).is_err());
        fs::write(&path, r#"{"patterns": ["x"], "flush_interval": "soon"}"#).unwrap();
        assert!(MatcherConfig::from_file(&path).is_err());
        fs::write(&path, r#"{"patterns": ["x"], "flush_interval": "0s"}"#).unwrap();
        assert!(MatcherConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_sink_matches_lines() {
        let notifier = Arc::new(Collecting::default());
        let mut sink = MatchSink {
            label: "app".to_string(),
            patterns: Arc::new(vec![Regex::new("ERROR").unwrap(), Regex::new("^fatal").unwrap()]),
            notifier: notifier.clone(),
        };

        sink.deliver(
            Path::new("/d/a.log"),
            FileId::new(1, 2),
            b"ok\nERROR disk full\r\nfatal: boom\nnot fatal\n",
        )
        .unwrap();

        let got = notifier.0.lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].line, "ERROR disk full");
        assert_eq!(got[0].pattern, "ERROR");
        assert_eq!(got[1].line, "fatal: boom");
        assert_eq!(got[1].label, "app");
    }

    #[test]
    fn test_bad_pattern_fails_construction() {
        let state = TempDir::new().unwrap();
        let result = MatcherHandler::new(
            "matcher.x",
            config(&["("]),
            state.path(),
            false,
            Arc::new(TracingNotifier),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handler_lifecycle() {
        let dir = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, b"ERROR before start\n").unwrap();
        let id = FileId::from_path(&file).unwrap();
        let link = TrackLink::new(crate::monitor::track_link::create(&file, id).unwrap());

        let notifier = Arc::new(Collecting::default());
        let handler =
            MatcherHandler::new("matcher.app", config(&["ERROR"]), state.path(), false, notifier.clone())
                .unwrap();

        handler.found_file(&file, id, &link);
        eventually(|| notifier.lines() == vec!["ERROR before start"]).await;

        let mut f = OpenOptions::new().append(true).open(&file).unwrap();
        f.write_all(b"fine\nERROR later\n").unwrap();
        handler.modified_file(&file, id);
        eventually(|| notifier.lines().len() == 2).await;

        let record = state.path().join("matcher.app").join(id.to_string());
        assert!(record.exists());

        handler.removed_file(&file, id);
        handler.shutdown().await;
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_restart_resumes_after_checkpoint() {
        let dir = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, b"ERROR one\n").unwrap();
        let id = FileId::from_path(&file).unwrap();
        let link = TrackLink::new(crate::monitor::track_link::create(&file, id).unwrap());

        let first = Arc::new(Collecting::default());
        let handler =
            MatcherHandler::new("matcher.app", config(&["ERROR"]), state.path(), false, first.clone())
                .unwrap();
        handler.found_file(&file, id, &link);
        eventually(|| first.lines().len() == 1).await;
        handler.shutdown().await;

        let mut f = OpenOptions::new().append(true).open(&file).unwrap();
        f.write_all(b"ERROR two\n").unwrap();

        let second = Arc::new(Collecting::default());
        let handler =
            MatcherHandler::new("matcher.app", config(&["ERROR"]), state.path(), false, second.clone())
                .unwrap();
        handler.found_file(&file, id, &link);
        eventually(|| second.lines() == vec!["ERROR two"]).await;
        handler.shutdown().await;
    }
}
