use camino::Utf8PathBuf;

use crate::logging::LogFormat;
use crate::stop::StopMethod;

/// Default capture worker executable, resolved through `PATH`.
pub const DEFAULT_WORKER: &str = "dumpcap";

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Interval between polls of an idle worker pipe, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Longest line accepted from a worker before it is split.
pub const DEFAULT_LINE_LIMIT: usize = 64 * 1024;

/// Time a worker is given to exit after a graceful stop, in milliseconds.
pub const DEFAULT_STOP_GRACE_MS: u64 = 5_000;

/// Arguments that put the worker into capture-child mode with its control
/// messages written to stderr.
pub const DEFAULT_CHILD_MODE_ARGS: &[&str] = &["-Z", "none"];

/// Default capture worker executable.
#[must_use]
pub fn default_worker_path() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_WORKER)
}

/// Default child-mode argument prefix.
#[must_use]
pub fn default_child_mode_args() -> Vec<String> {
    DEFAULT_CHILD_MODE_ARGS
        .iter()
        .map(|arg| (*arg).to_owned())
        .collect()
}

/// Default log filter expression used by the binaries.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default graceful stop method.
#[must_use]
pub fn default_stop_method() -> StopMethod {
    StopMethod::Interrupt
}
