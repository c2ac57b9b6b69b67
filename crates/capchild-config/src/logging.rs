//! How `capctl` renders its tracing output on stderr.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Rendering of `capctl` log records.
///
/// Parsed case-insensitively from configuration files, `CAPCHILD_LOG_FORMAT`
/// and `--log-format`.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per record with event fields flattened.
    #[default]
    Json,
    /// Single-line text for operators watching a terminal.
    Compact,
}

/// Error returned when text names no [`LogFormat`].
pub type LogFormatParseError = strum::ParseError;
