// SPDX-License-Identifier: Apache-2.0

//! Compiled-in registry of named handler factories.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tower::BoxError;
use tracing::{debug, error};

use crate::monitor::error::Error;
use crate::monitor::handler::{BoundHandler, FileHandler, HandlerSet, panic_message};
use crate::monitor::rules::{HandlerBinding, Rule};

const NAMESPACE_TAG_BYTES: usize = 4;

/// Builds a handler from its namespace and configuration file.
pub type HandlerFactory =
    Arc<dyn Fn(&str, &Path) -> Result<Box<dyn FileHandler>, BoxError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str, &Path) -> Result<Box<dyn FileHandler>, BoxError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Fail on the first binding that names no registered handler.
    pub fn check(&self, rules: &[Arc<Rule>]) -> Result<(), Error> {
        for rule in rules {
            for binding in &rule.bindings {
                if !self.contains(&binding.name) {
                    return Err(Error::UnknownHandler(binding.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Namespace of a binding: `name.stem-tag`, where the tag is taken from
    /// a SHA-256 of the full config path. Two bindings only share a
    /// namespace, and therefore checkpoints, when they name the same handler
    /// and the same config file.
    pub fn namespace(binding: &HandlerBinding) -> String {
        let config = binding.config.as_os_str();
        if config.is_empty() {
            return binding.name.clone();
        }
        let digest = Sha256::digest(config.as_encoded_bytes());
        let tag: String = digest[..NAMESPACE_TAG_BYTES]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        match binding.config.file_stem() {
            Some(stem) => format!("{}.{}-{}", binding.name, stem.to_string_lossy(), tag),
            None => format!("{}.{}", binding.name, tag),
        }
    }

    /// Construct the handler for one binding.
    pub fn instantiate(&self, binding: &HandlerBinding) -> Result<(String, Box<dyn FileHandler>), BoxError> {
        let factory = self
            .factories
            .get(&binding.name)
            .ok_or_else(|| Error::UnknownHandler(binding.name.clone()))?;
        let namespace = Self::namespace(binding);
        let built = std::panic::catch_unwind(AssertUnwindSafe(|| factory(&namespace, &binding.config)));
        let handler = match built {
            Ok(Ok(handler)) => handler,
            Ok(Err(e)) => return Err(Error::Handler(format!("{}: {}", namespace, e)).into()),
            Err(panic) => {
                return Err(Error::Handler(format!(
                    "{}: factory panicked: {}",
                    namespace,
                    panic_message(&panic)
                ))
                .into());
            }
        };
        Ok((namespace, handler))
    }

    /// Construct handlers for the given binding indices of `rule` into `set`.
    /// Failures are logged and recorded as missing so the next discovery pass
    /// can retry them.
    pub(crate) fn bind(&self, rule: &Rule, indices: &[usize], path: &Path, set: &mut HandlerSet) -> Vec<usize> {
        let mut added = Vec::new();
        for &index in indices {
            let Some(binding) = rule.bindings.get(index) else {
                // The rule changed under a reload; that binding is gone.
                set.clear_missing(index);
                continue;
            };
            match self.instantiate(binding) {
                Ok((namespace, handler)) => {
                    debug!(handler = %namespace, path = ?path, "Bound handler");
                    set.insert(BoundHandler {
                        binding: index,
                        namespace,
                        handler,
                    });
                    added.push(index);
                }
                Err(e) => {
                    error!(
                        handler = %binding.name,
                        config = ?binding.config,
                        path = ?path,
                        error = %e,
                        "Unable to construct handler"
                    );
                    set.mark_missing(index);
                }
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::checkpoint::{Checkpoint, CheckpointStore};
    use crate::monitor::file_id::FileId;
    use crate::monitor::handler::testing::{CallLog, RecordingHandler};
    use std::path::PathBuf;

    fn registry(log: CallLog) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("recorder", move |ns: &str, _config: &Path| {
            Ok(Box::new(RecordingHandler::new(ns, log.clone())) as Box<dyn FileHandler>)
        });
        registry.register("broken", |_ns: &str, config: &Path| {
            Err(format!("cannot read {}", config.display()).into())
        });
        registry
    }

    #[test]
    fn test_namespace() {
        let b = HandlerBinding::new("matcher", "/etc/logmon/app-errors.json");
        let ns = HandlerRegistry::namespace(&b);
        assert!(ns.starts_with("matcher.app-errors-"), "{}", ns);
        assert_eq!(ns.len(), "matcher.app-errors-".len() + 2 * NAMESPACE_TAG_BYTES);
        assert_eq!(ns, HandlerRegistry::namespace(&b.clone()));

        let b = HandlerBinding::new("matcher", PathBuf::new());
        assert_eq!(HandlerRegistry::namespace(&b), "matcher");
    }

    #[test]
    fn test_same_stem_in_different_directories_do_not_collide() {
        let a = HandlerBinding::new("matcher", "/etc/a/app.json");
        let b = HandlerBinding::new("matcher", "/etc/b/app.json");
        let other_kind = HandlerBinding::new("recorder", "/etc/a/app.json");
        let (ns_a, ns_b) = (HandlerRegistry::namespace(&a), HandlerRegistry::namespace(&b));
        assert_ne!(ns_a, ns_b);
        assert_ne!(ns_a, HandlerRegistry::namespace(&other_kind));

        let state = tempfile::TempDir::new().unwrap();
        let id = FileId::new(1, 2);
        let store_a = CheckpointStore::new(state.path(), &ns_a, false);
        let store_b = CheckpointStore::new(state.path(), &ns_b, false);
        store_a.save(&Checkpoint::new(id, PathBuf::from("/l/1:2"), 10)).unwrap();
        store_b.save(&Checkpoint::new(id, PathBuf::from("/l/1:2"), 99)).unwrap();
        assert_eq!(store_a.load(id).unwrap().unwrap().offset, 10);
        assert_eq!(store_b.load(id).unwrap().unwrap().offset, 99);
    }

    #[test]
    fn test_panicking_factory_is_a_construction_failure() {
        let mut reg = registry(CallLog::default());
        reg.register("panicky", |_ns: &str, _config: &Path| -> Result<Box<dyn FileHandler>, BoxError> {
            panic!("config parser blew up")
        });
        let rule = Rule::new(
            "/d",
            ".*",
            vec![
                HandlerBinding::new("panicky", "/c/p.json"),
                HandlerBinding::new("recorder", "/c/r.json"),
            ],
        )
        .unwrap();

        let err = reg.instantiate(&rule.bindings[0]).err().unwrap();
        assert!(err.to_string().contains("config parser blew up"), "{}", err);

        let mut set = HandlerSet::new();
        let added = reg.bind(&rule, &[0, 1], Path::new("/d/a.log"), &mut set);
        assert_eq!(added, vec![1]);
        assert_eq!(set.missing(), &[0]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_instantiate_unknown() {
        let reg = registry(CallLog::default());
        assert!(reg.contains("recorder"));
        assert!(reg.instantiate(&HandlerBinding::new("nope", "/x.json")).is_err());

        let known = Rule::new("/d", ".*", vec![HandlerBinding::new("recorder", "/c/a.json")]).unwrap();
        let unknown = Rule::new("/e", ".*", vec![HandlerBinding::new("nope", "/c/b.json")]).unwrap();
        assert!(reg.check(&[Arc::new(known.clone())]).is_ok());
        assert!(matches!(
            reg.check(&[Arc::new(known), Arc::new(unknown)]),
            Err(Error::UnknownHandler(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_bind_isolates_failures() {
        let reg = registry(CallLog::default());
        let rule = Rule::new(
            "/d",
            ".*",
            vec![
                HandlerBinding::new("recorder", "/c/one.json"),
                HandlerBinding::new("broken", "/c/two.json"),
                HandlerBinding::new("recorder", "/c/three.json"),
            ],
        )
        .unwrap();

        let mut set = HandlerSet::new();
        let added = reg.bind(&rule, &[0, 1, 2], Path::new("/d/a.log"), &mut set);

        assert_eq!(added, vec![0, 2]);
        assert_eq!(set.missing(), &[1]);
        assert_eq!(
            set.namespaces().collect::<Vec<_>>(),
            vec![
                HandlerRegistry::namespace(&rule.bindings[0]),
                HandlerRegistry::namespace(&rule.bindings[2]),
            ]
        );
    }
}
