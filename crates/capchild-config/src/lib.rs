//! Shared configuration for capture-child controllers.
//!
//! Both the `capchild` library and the `capctl` binary need to agree on where
//! the capture worker lives, how it is put into child mode, how often idle
//! pipes are polled, and how a running capture is stopped. [`Config`] holds
//! those settings. `ortho_config` layers them: built-in defaults, then the
//! TOML file named by `--config-path` or `CAPCHILD_CONFIG_PATH`, then
//! `CAPCHILD_*` environment variables, then command-line flags.

mod defaults;
mod logging;
mod stop;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_CHILD_MODE_ARGS, DEFAULT_LINE_LIMIT, DEFAULT_LOG_FILTER, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_STOP_GRACE_MS, DEFAULT_WORKER, default_child_mode_args, default_log_filter,
    default_log_filter_string, default_log_format, default_stop_method, default_worker_path,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use stop::{StopMethod, StopMethodParseError};

/// Resolved controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[serde(default)]
#[ortho_config(prefix = "CAPCHILD")]
pub struct Config {
    /// Capture worker executable.
    #[ortho_config(default = default_worker_path())]
    pub worker_path: Utf8PathBuf,
    /// Arguments placed before every command-specific argument.
    #[ortho_config(default = default_child_mode_args(), merge_strategy = "replace")]
    pub child_mode_args: Vec<String>,
    /// Idle pipe poll interval in milliseconds.
    #[ortho_config(default = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
    /// Longest line accepted from the worker before it is split.
    #[ortho_config(default = DEFAULT_LINE_LIMIT)]
    pub line_limit: usize,
    /// Grace period between a graceful stop and a forced kill, in milliseconds.
    #[ortho_config(default = DEFAULT_STOP_GRACE_MS)]
    pub stop_grace_ms: u64,
    /// How a running capture is asked to stop.
    #[ortho_config(default = default_stop_method())]
    pub stop_method: StopMethod,
    /// Tracing filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Tracing output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_path: default_worker_path(),
            child_mode_args: default_child_mode_args(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            line_limit: DEFAULT_LINE_LIMIT,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            stop_method: default_stop_method(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Rejects values that parse but cannot drive a worker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first unusable
    /// setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_path.as_str().is_empty() {
            return Err(ConfigError::invalid("worker_path", "", "must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "0", "must be positive"));
        }
        if self.line_limit == 0 {
            return Err(ConfigError::invalid("line_limit", "0", "must be positive"));
        }
        Ok(())
    }

    /// Capture worker executable.
    #[must_use]
    pub fn worker_path(&self) -> &Utf8Path {
        self.worker_path.as_path()
    }

    /// Arguments placed before every command-specific argument.
    #[must_use]
    pub fn child_mode_args(&self) -> &[String] {
        &self.child_mode_args
    }

    /// Idle pipe poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Longest line accepted from the worker.
    #[must_use]
    pub const fn line_limit(&self) -> usize {
        self.line_limit
    }

    /// Grace period before a stopping worker is killed.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Graceful stop method.
    #[must_use]
    pub const fn stop_method(&self) -> StopMethod {
        self.stop_method
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Tracing output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// A loaded configuration that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value was syntactically valid but unusable.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Setting name.
        key: &'static str,
        /// Offending value.
        value: String,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: &'static str) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_owned(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.worker_path(), Utf8Path::new("dumpcap"));
        assert_eq!(config.child_mode_args(), ["-Z", "none"]);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.stop_method(), StopMethod::Interrupt);
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    #[case::empty_worker(Config { worker_path: Utf8PathBuf::new(), ..Config::default() }, "worker_path")]
    #[case::zero_poll(Config { poll_interval_ms: 0, ..Config::default() }, "poll_interval_ms")]
    #[case::zero_line_limit(Config { line_limit: 0, ..Config::default() }, "line_limit")]
    fn out_of_range_values_are_rejected(#[case] config: Config, #[case] expected: &str) {
        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, expected),
            other => panic!("expected invalid value, got {other:?}"),
        }
    }
}
