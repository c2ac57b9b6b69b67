//! Controller side of the capture-child protocol.
//!
//! A packet-capture analyzer hands the capture itself to a separate, possibly
//! privileged, worker process. This crate launches that worker, reads its
//! line-oriented control stream without blocking, and turns each message into
//! a typed callback. It covers three ways of running a worker:
//!
//! - [`start_session`] runs a capture in the background and reports new
//!   files, packet counts, drops and errors through [`CaptureEvents`];
//! - [`OneShotRunner`] asks a single question (interface list, capabilities,
//!   wireless channel) and returns the answer synchronously;
//! - [`StatsChannel`] keeps a statistics worker running and publishes
//!   per-interface counters.
//!
//! ## Control protocol
//!
//! The worker writes control messages to stderr, one per line. The first
//! byte is a tag and NUL bytes separate sub-fields:
//!
//! | Tag | Message | Fields |
//! |-----|---------|--------|
//! | `F` | new capture file | path |
//! | `P` | packet count | delta |
//! | `D` | drops | count, optional interface |
//! | `E` | error | primary, optional secondary |
//! | `C` | capture filter error | interface index, message |
//! | `S` | success | none |
//! | `B` | bad filter | message |
//! | `Z` | closed | optional diagnostic |
//!
//! Stdout carries free text: the result of one-shot queries, statistics
//! lines, or diagnostics during a capture.

mod dispatcher;
mod errors;
mod hook;
mod launcher;
mod line_reader;
mod message;
mod oneshot;
mod pipe;
mod session;
mod stats;

pub use dispatcher::{
    CaptureEvents, DispatchLimits, EventDispatcher, PROTOCOL_MISMATCH, Pump, SessionState,
    SessionStatus, StartOutcome,
};
pub use errors::{
    ChannelError, EncodeError, HookError, LaunchError, MalformedMessage, PREMATURE_CLOSE_MESSAGE,
    StatsLineError, SyncError,
};
pub use hook::set_worker_pid_hook;
pub use launcher::{LaunchSpec, ProcessId, StreamRequest, WorkerProcess, launch};
pub use line_reader::{Line, LineRead, LineReader, NonBlockingRead, read_line_nonblocking};
pub use message::{Message, MessageKind};
pub use oneshot::{OneShotRunner, QueryCommand};
pub use pipe::{PipeChannel, PipeWriter, ReadOutcome};
pub use session::{
    CaptureSession, SIGNAL_PIPE_QUIT, SessionOptions, capture_spec, kill_worker, start_session,
};
pub use stats::{InterfaceStats, STATS_ARGS, STATS_QUEUE_DEPTH, StatsChannel};

#[cfg(test)]
mod tests;
