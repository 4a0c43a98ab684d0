// SPDX-License-Identifier: Apache-2.0

//! Compiled-in handler implementations.

pub mod matcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::monitor::handler::FileHandler;
use crate::monitor::registry::HandlerRegistry;

use matcher::{MatcherConfig, MatcherHandler, Notifier, TracingNotifier};

/// Register every built-in handler. Handlers that keep checkpoints store them
/// under `state_dir`.
pub fn register_builtin(registry: &mut HandlerRegistry, state_dir: &Path, fsync: bool) {
    register_matcher(registry, state_dir.to_path_buf(), fsync, Arc::new(TracingNotifier));
}

pub fn register_matcher(
    registry: &mut HandlerRegistry,
    state_dir: PathBuf,
    fsync: bool,
    notifier: Arc<dyn Notifier>,
) {
    registry.register("matcher", move |namespace: &str, config: &Path| {
        let config = MatcherConfig::from_file(config)?;
        let handler = MatcherHandler::new(namespace, config, &state_dir, fsync, notifier.clone())?;
        Ok(Box::new(handler) as Box<dyn FileHandler>)
    });
}
