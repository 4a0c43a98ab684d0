// SPDX-License-Identifier: Apache-2.0

//! Lifecycle protocol delivered to file handlers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::error;

use crate::monitor::file_id::FileId;
use crate::monitor::track_link::TrackLink;

/// A handler bound to one tracked file.
///
/// Calls are fire-and-forget: failures are the handler's own concern. The
/// tracker never holds a registry lock while calling in, but it does hold the
/// file's own lock, so implementations should hand real work to their own task
/// rather than block here.
pub trait FileHandler: Send + Sync {
    /// The file was already present when it was discovered.
    fn found_file(&self, path: &Path, id: FileId, track_link: &TrackLink);

    /// The file appeared while being watched.
    fn created_file(&self, path: &Path, id: FileId, track_link: &TrackLink);

    /// The file is gone. This is the final call for this handler.
    fn removed_file(&self, path: &Path, id: FileId);

    fn renamed_file(&self, old_path: &Path, new_path: &Path, id: FileId);

    /// Content was appended since the last notification.
    fn modified_file(&self, path: &Path, id: FileId);

    /// Stop background work. Awaited before the track link is removed and on
    /// agent shutdown.
    fn shutdown(&self) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

pub(crate) struct BoundHandler {
    pub(crate) binding: usize,
    pub(crate) namespace: String,
    pub(crate) handler: Box<dyn FileHandler>,
}

/// Handlers bound to one file, kept in binding declaration order.
///
/// Every call is delivered to each handler in turn. A panicking handler is
/// logged and skipped; it never keeps the remaining handlers from running.
#[derive(Default)]
pub struct HandlerSet {
    handlers: Vec<BoundHandler>,
    missing: Vec<usize>,
}

impl HandlerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, bound: BoundHandler) {
        self.missing.retain(|b| *b != bound.binding);
        let pos = self
            .handlers
            .iter()
            .position(|h| h.binding > bound.binding)
            .unwrap_or(self.handlers.len());
        self.handlers.insert(pos, bound);
    }

    pub(crate) fn mark_missing(&mut self, binding: usize) {
        if !self.missing.contains(&binding) {
            self.missing.push(binding);
        }
    }

    pub(crate) fn clear_missing(&mut self, binding: usize) {
        self.missing.retain(|b| *b != binding);
    }

    /// Binding indices whose handler could not be constructed yet.
    pub(crate) fn missing(&self) -> &[usize] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.namespace.as_str())
    }

    fn each(&self, call: &str, f: impl Fn(&dyn FileHandler)) {
        self.each_where(call, |_| true, f)
    }

    fn each_where(&self, call: &str, filter: impl Fn(usize) -> bool, f: impl Fn(&dyn FileHandler)) {
        for bound in self.handlers.iter().filter(|b| filter(b.binding)) {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| f(bound.handler.as_ref()))) {
                error!(
                    handler = %bound.namespace,
                    call,
                    panic = panic_message(&panic),
                    "Handler panicked"
                );
            }
        }
    }

    pub fn found_file(&self, path: &Path, id: FileId, track_link: &TrackLink) {
        self.each("found_file", |h| h.found_file(path, id, track_link));
    }

    /// `found_file` for late-bound handlers only.
    pub(crate) fn found_file_for(&self, bindings: &[usize], path: &Path, id: FileId, track_link: &TrackLink) {
        self.each_where(
            "found_file",
            |b| bindings.contains(&b),
            |h| h.found_file(path, id, track_link),
        );
    }

    pub fn created_file(&self, path: &Path, id: FileId, track_link: &TrackLink) {
        self.each("created_file", |h| h.created_file(path, id, track_link));
    }

    pub fn removed_file(&self, path: &Path, id: FileId) {
        self.each("removed_file", |h| h.removed_file(path, id));
    }

    pub fn renamed_file(&self, old_path: &Path, new_path: &Path, id: FileId) {
        self.each("renamed_file", |h| h.renamed_file(old_path, new_path, id));
    }

    pub fn modified_file(&self, path: &Path, id: FileId) {
        self.each("modified_file", |h| h.modified_file(path, id));
    }

    /// Shut every handler down, in order.
    pub async fn shutdown(&self) {
        for bound in &self.handlers {
            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| bound.handler.shutdown())) {
                Ok(fut) => fut,
                Err(panic) => {
                    error!(handler = %bound.namespace, panic = panic_message(&panic), "Handler panicked on shutdown");
                    continue;
                }
            };
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!(handler = %bound.namespace, panic = panic_message(&panic), "Handler panicked on shutdown");
            }
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::path::PathBuf;

    fn bound(binding: usize, namespace: &str, handler: impl FileHandler + 'static) -> BoundHandler {
        BoundHandler {
            binding,
            namespace: namespace.to_string(),
            handler: Box::new(handler),
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_binding_order_despite_panics() {
        let log = CallLog::default();
        let mut set = HandlerSet::new();
        set.insert(bound(2, "c", RecordingHandler::new("c", log.clone())));
        set.insert(bound(1, "panicky", PanickingHandler));
        set.insert(bound(0, "a", RecordingHandler::new("a", log.clone())));
        assert_eq!(set.namespaces().collect::<Vec<_>>(), vec!["a", "panicky", "c"]);

        let id = FileId::new(1, 2);
        let path = PathBuf::from("/d/a.log");
        let link = TrackLink::new(PathBuf::from("/d/.__track_link__/1:2"));

        set.found_file(&path, id, &link);
        set.modified_file(&path, id);
        set.renamed_file(&path, Path::new("/d/b.log"), id);
        set.removed_file(Path::new("/d/b.log"), id);
        set.shutdown().await;

        let namespaces: Vec<String> = log.entries().into_iter().map(|(ns, _)| ns).collect();
        assert_eq!(namespaces, vec!["a", "c", "a", "c", "a", "c", "a", "c", "a", "c"]);
        assert_eq!(
            log.calls()[..2],
            [Call::Found(path.clone(), id), Call::Found(path.clone(), id)]
        );
        assert_eq!(log.calls()[8..], [Call::Shutdown, Call::Shutdown]);
    }

    #[test]
    fn test_missing_bindings_are_tracked() {
        let log = CallLog::default();
        let mut set = HandlerSet::new();
        set.mark_missing(1);
        set.mark_missing(1);
        assert_eq!(set.missing(), &[1]);

        set.insert(bound(1, "late", RecordingHandler::new("late", log)));
        assert!(set.missing().is_empty());
        assert_eq!(set.len(), 1);
    }
}
