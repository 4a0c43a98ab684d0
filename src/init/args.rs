// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Rule file listing watched roots, their file pattern and handler bindings
    #[arg(long, env = "LOGMON_CONFIG", default_value = "/etc/logmon/rules.json")]
    pub config: PathBuf,

    /// Directory for handler checkpoints
    #[arg(long, env = "LOGMON_STATE_DIR", default_value = "/var/lib/logmon")]
    pub state_dir: PathBuf,

    /// Interval between reconciliation sweeps
    #[arg(long, env = "LOGMON_SWEEP_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,

    /// Interval between rule file reloads, 0s disables reloading
    #[arg(long, env = "LOGMON_RELOAD_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub reload_interval: Duration,

    /// How long a renamed-away file waits for its new name before it is removed
    #[arg(long, env = "LOGMON_RENAME_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    pub rename_timeout: Duration,

    /// Capacity of the watcher event queue, events beyond it are dropped
    #[arg(long, env = "LOGMON_EVENT_QUEUE_SIZE", default_value = "4096")]
    pub event_queue_size: usize,

    /// Fsync checkpoint records before renaming them into place
    #[arg(long, env = "LOGMON_CHECKPOINT_FSYNC", default_value = "false")]
    pub checkpoint_fsync: bool,
}

impl Default for AgentRun {
    fn default() -> Self {
        AgentRun {
            config: PathBuf::from("/etc/logmon/rules.json"),
            state_dir: PathBuf::from("/var/lib/logmon"),
            sweep_interval: Duration::from_secs(30),
            reload_interval: Duration::from_secs(60),
            rename_timeout: Duration::from_secs(2),
            event_queue_size: 4096,
            checkpoint_fsync: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        run: AgentRun,
    }

    #[test]
    fn test_defaults_match() {
        let cli = Cli::try_parse_from(["logmon"]).unwrap();
        let defaults = AgentRun::default();
        assert_eq!(cli.run.config, defaults.config);
        assert_eq!(cli.run.state_dir, defaults.state_dir);
        assert_eq!(cli.run.sweep_interval, defaults.sweep_interval);
        assert_eq!(cli.run.reload_interval, defaults.reload_interval);
        assert_eq!(cli.run.rename_timeout, defaults.rename_timeout);
        assert_eq!(cli.run.event_queue_size, defaults.event_queue_size);
        assert!(!cli.run.checkpoint_fsync);
    }

    #[test]
    fn test_durations() {
        let cli = Cli::try_parse_from([
            "logmon",
            "--sweep-interval",
            "1m 30s",
            "--reload-interval",
            "0s",
            "--rename-timeout",
            "500ms",
            "--checkpoint-fsync",
        ])
        .unwrap();
        assert_eq!(cli.run.sweep_interval, Duration::from_secs(90));
        assert_eq!(cli.run.reload_interval, Duration::ZERO);
        assert_eq!(cli.run.rename_timeout, Duration::from_millis(500));
        assert!(cli.run.checkpoint_fsync);

        assert!(Cli::try_parse_from(["logmon", "--sweep-interval", "often"]).is_err());
    }
}
