// SPDX-License-Identifier: Apache-2.0

//! Rule table: which handlers govern which directory trees.
//!
//! The table is swapped wholesale on reload. Callers take a snapshot and
//! resolve everything for one operation against it, so a match never sees a
//! half-updated table.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::error::{Error, Result};
use crate::monitor::track_link;

/// A named handler plus its configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerBinding {
    pub name: String,
    pub config: PathBuf,
}

impl HandlerBinding {
    pub fn new(name: impl Into<String>, config: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            config: config.into(),
        }
    }
}

/// One watched root with its name pattern and ordered handler bindings.
#[derive(Debug, Clone)]
pub struct Rule {
    pub root: PathBuf,
    pub pattern: Regex,
    pub bindings: Vec<HandlerBinding>,
}

impl Rule {
    pub fn new(root: impl Into<PathBuf>, pattern: &str, bindings: Vec<HandlerBinding>) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            pattern: Regex::new(pattern)?,
            bindings,
        })
    }

    /// Pattern match over the full path. Track link paths never match.
    pub fn matches(&self, path: &Path) -> bool {
        if track_link::is_track_path(path) {
            return false;
        }
        self.pattern.is_match(&path.to_string_lossy())
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.pattern.as_str() == other.pattern.as_str()
            && self.bindings == other.bindings
    }
}

/// Immutable snapshot of all rules.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut seen: Vec<&Path> = Vec::new();
        for rule in &rules {
            if seen.contains(&rule.root.as_path()) {
                return Err(Error::Config(format!(
                    "root {} is configured more than once",
                    rule.root.display()
                )));
            }
            seen.push(&rule.root);
        }
        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.rules.iter().map(|r| r.root.as_path())
    }

    pub fn rule_for_root(&self, root: &Path) -> Option<Arc<Rule>> {
        self.rules.iter().find(|r| r.root == root).cloned()
    }

    pub fn is_root(&self, path: &Path) -> bool {
        self.rules.iter().any(|r| r.root == path)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Where rules come from. Reload calls `load` again.
pub trait RuleSource: Send + Sync {
    fn load(&self) -> Result<RuleSet>;

    fn describe(&self) -> String;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetConfig {
    path: String,
    #[serde(default = "default_pattern")]
    pattern: String,
    #[serde(default)]
    handlers: Vec<BindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BindingConfig {
    name: String,
    config: PathBuf,
}

fn default_pattern() -> String {
    ".*".to_string()
}

/// JSON rule file:
///
/// ```json
/// {"targets": [{"path": "/var/log/app", "pattern": "\\.log$",
///               "handlers": [{"name": "matcher", "config": "matcher.json"}]}]}
/// ```
///
/// Relative handler config paths resolve against the rule file's directory.
pub struct JsonRuleSource {
    path: PathBuf,
}

impl JsonRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(&self, data: &str) -> Result<RuleSet> {
        let file: RuleFile = serde_json::from_str(data)?;
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));

        let mut rules = Vec::with_capacity(file.targets.len());
        for target in file.targets {
            let root = expand_home(&target.path);
            if !root.is_absolute() {
                return Err(Error::Config(format!(
                    "target path {} must be absolute",
                    target.path
                )));
            }
            let bindings = target
                .handlers
                .into_iter()
                .map(|b| {
                    let config = if b.config.is_absolute() {
                        b.config
                    } else {
                        base.join(b.config)
                    };
                    HandlerBinding::new(b.name, config)
                })
                .collect();
            let rule = Rule::new(root, &target.pattern, bindings).map_err(|e| {
                Error::Config(format!("bad pattern for {}: {}", target.path, e))
            })?;
            rules.push(rule);
        }
        RuleSet::new(rules)
    }
}

impl RuleSource for JsonRuleSource {
    fn load(&self) -> Result<RuleSet> {
        let data = fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("unable to read {}: {}", self.path.display(), e))
        })?;
        self.parse(&data)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// The live rule table.
pub struct RuleTable {
    current: RwLock<Arc<RuleSet>>,
    source: Option<Box<dyn RuleSource>>,
}

impl RuleTable {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
            source: None,
        }
    }

    /// Load the initial table from `source`. Failure here is fatal to startup.
    pub fn from_source(source: Box<dyn RuleSource>) -> Result<Self> {
        let rules = source.load()?;
        info!(source = %source.describe(), rules = rules.len(), "Loaded rules");
        Ok(Self {
            current: RwLock::new(Arc::new(rules)),
            source: Some(source),
        })
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new table. Returns false if it equals the current one.
    pub fn replace(&self, rules: RuleSet) -> bool {
        let mut current = match self.current.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        if **current == rules {
            return false;
        }
        *current = Arc::new(rules);
        true
    }

    /// Re-read the source. On error the current table stays in place.
    pub fn reload(&self) -> Result<bool> {
        let Some(source) = &self.source else {
            return Ok(false);
        };
        let rules = source.load()?;
        let count = rules.len();
        let changed = self.replace(rules);
        if changed {
            info!(source = %source.describe(), rules = count, "Reloaded rules");
        } else {
            debug!(source = %source.describe(), "Rules unchanged");
        }
        Ok(changed)
    }

    /// Reload on a fixed interval until cancelled.
    pub async fn run_reload(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; the table was just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload() {
                        warn!(error = %e, "Rule reload failed, keeping current rules");
                    }
                }
            }
        }
        debug!("Rule reload task exiting");
    }
}
