//! Test doubles shared by the unit and behaviour suites.

mod recorder;
mod scripted;
mod workers;

pub use recorder::{RecordedEvent, RecordingEvents};
pub use scripted::{Chunk, ScriptedReader};
pub use workers::{shell_config, wait_until};
