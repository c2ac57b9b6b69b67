//! How a capture worker is asked to finish its capture loop.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Graceful termination request delivered to a running capture worker.
///
/// Whichever method is chosen, the controller keeps draining the worker's
/// control stream afterwards so counters already written are not lost.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StopMethod {
    /// Send `SIGINT`, the signal capture workers treat as "finish up".
    #[default]
    Interrupt,
    /// Send `SIGTERM`.
    Terminate,
    /// Write `QUIT` to the worker's stdin and close it.
    SignalPipe,
}

/// Errors encountered while parsing a [`StopMethod`] from text.
pub type StopMethodParseError = strum::ParseError;
