//! Errors surfaced by `capctl` commands.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use capchild::{SessionState, SyncError};
use capchild_config::ConfigError;
use ortho_config::OrthoError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(Arc<OrthoError>),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("{}", .0.primary_message())]
    Worker(#[from] SyncError),
    #[error("capture session ended in state {0}")]
    CaptureFailed(SessionState),
    #[error("no statistics arrived within {} ms", .0.as_millis())]
    StatsTimeout(Duration),
    #[error("statistics worker exited")]
    StatsClosed,
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AppError {
    /// Supplementary line printed under the main message.
    pub(crate) fn detail(&self) -> Option<String> {
        match self {
            Self::Worker(error) => error.secondary_message(),
            _ => None,
        }
    }
}
