// SPDX-License-Identifier: Apache-2.0

use crate::handlers;
use crate::init::args::AgentRun;
use crate::init::wait::{self, TaskSet};
use crate::monitor::error::Error;
use crate::monitor::registry::HandlerRegistry;
use crate::monitor::rules::{JsonRuleSource, RuleTable};
use crate::monitor::sweep::run_sweep;
use crate::monitor::tracker::{Tracker, TrackerConfig};
use crate::monitor::watcher::{NativeWatcher, PathWatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

pub struct Agent {
    config: Box<AgentRun>,
    registry: HandlerRegistry,
    reload_notify: Option<Arc<Notify>>,
}

impl Agent {
    pub fn new(config: Box<AgentRun>) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            reload_notify: None,
        }
    }

    /// Start from a registry that already holds extra handler factories.
    /// Built-in handlers are added on top when the agent runs.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Each notification forces a rule reload followed by a sweep.
    pub fn with_reload_notify(mut self, notify: Arc<Notify>) -> Self {
        self.reload_notify = Some(notify);
        self
    }

    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let config = self.config;
        info!(
            config = ?config.config,
            state_dir = ?config.state_dir,
            "Starting logmon agent."
        );

        if config.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be positive".into()).into());
        }
        if config.event_queue_size == 0 {
            return Err(Error::Config("event queue size must be positive".into()).into());
        }
        std::fs::create_dir_all(&config.state_dir)?;

        let rules = Arc::new(RuleTable::from_source(Box::new(JsonRuleSource::new(
            &config.config,
        )))?);

        let mut registry = self.registry;
        handlers::register_builtin(&mut registry, &config.state_dir, config.checkpoint_fsync);
        registry.check(rules.snapshot().rules())?;

        let (watcher, events) = NativeWatcher::new(config.event_queue_size).map_err(Error::Watcher)?;
        info!(backend = watcher.backend_name(), "Path watcher ready.");

        let tracker = Arc::new(Tracker::new(
            rules.clone(),
            Arc::new(registry),
            Box::new(watcher),
            TrackerConfig {
                rename_timeout: config.rename_timeout,
            },
        ));
        tracker.scan().await;

        let tasks_cancel = CancellationToken::new();
        let mut task_set = TaskSet::new();

        {
            let tracker = tracker.clone();
            let cancel = tasks_cancel.clone();
            task_set.spawn(async move {
                tracker.run(events, cancel).await;
                Ok(())
            });
        }
        {
            let tracker = tracker.clone();
            let cancel = tasks_cancel.clone();
            let interval = config.sweep_interval;
            task_set.spawn(async move {
                run_sweep(tracker, interval, cancel).await;
                Ok(())
            });
        }
        if config.reload_interval.is_zero() {
            debug!("Rule reloading disabled.");
        } else {
            let rules = rules.clone();
            let cancel = tasks_cancel.clone();
            let interval = config.reload_interval;
            task_set.spawn(async move {
                rules.run_reload(interval, cancel).await;
                Ok(())
            });
        }

        if let Some(notify) = self.reload_notify {
            let rules = rules.clone();
            let tracker = tracker.clone();
            let cancel = tasks_cancel.clone();
            task_set.spawn(async move {
                loop {
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = notify.notified() => {
                            info!("Forced reload requested.");
                            if let Err(e) = rules.reload() {
                                warn!(error = %e, "Rule reload failed, keeping current rules");
                            }
                            tracker.sweep().await;
                        }
                    }
                }
                Ok(())
            });
        }

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of task."),
                    Err(e) => result = Err(e),
                }
            }
        }

        tasks_cancel.cancel();
        let res = wait::wait_for_tasks_with_timeout(&mut task_set, Duration::from_secs(3)).await;

        // Handlers are stopped even when a task failed so checkpoints get
        // their final flush.
        tracker.shutdown().await;
        info!("Agent stopped.");

        result?;
        if let Err(e) = res {
            return Err(format!("timed out waiting for monitor tasks to exit: {}", e).into());
        }
        Ok(())
    }
}
