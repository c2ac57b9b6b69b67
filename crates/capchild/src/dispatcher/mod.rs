//! Turning worker output into typed capture events.
//!
//! An [`EventDispatcher`] reads the worker's control stream line by line,
//! decodes each line into a [`Message`] and invokes the matching
//! [`CaptureEvents`] callback, in the order the worker wrote them. It also
//! drains the worker's free-text diagnostic stream so the worker never blocks
//! on a full pipe, keeping recent lines to explain a premature exit.
//!
//! The dispatcher owns the session's [`SessionStatus`] writes; observers only
//! read it.

mod state;

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use capchild_config::{DEFAULT_LINE_LIMIT, DEFAULT_POLL_INTERVAL_MS};
use tracing::{debug, info, warn};

pub use state::{SessionState, SessionStatus};

use crate::errors::{ChannelError, SyncError};
use crate::line_reader::{Line, LineRead, LineReader};
use crate::message::Message;
use crate::pipe::PipeChannel;

pub(crate) const DISPATCH_TARGET: &str = "capchild::dispatcher";

/// Error text reported once several control lines in a row fail to decode.
pub const PROTOCOL_MISMATCH: &str = "protocol mismatch with capture worker";

const DIAGNOSTIC_HISTORY: usize = 64;
const DIAGNOSTIC_DRAIN: Duration = Duration::from_millis(500);
const MAX_LINES_PER_PUMP: usize = 256;

/// Callbacks invoked for each control message of a running capture.
///
/// Callbacks run on the session's reader thread, one at a time, in the order
/// the worker wrote the messages.
pub trait CaptureEvents: Send {
    /// The worker started writing `path`. Returning `false` asks the session
    /// to stop.
    fn new_file(&mut self, path: &str) -> bool;

    /// `count` more packets were captured.
    fn new_packets(&mut self, count: u64);

    /// The worker's drop counter is now `count`.
    fn drops(&mut self, count: u64, interface: Option<&str>);

    /// The worker reported an error. The capture may still be running.
    fn error(&mut self, primary: &str, secondary: Option<&str>);

    /// The capture filter for interface `index` failed to compile.
    fn cfilter_error(&mut self, index: u32, message: &str);

    /// The session ended. Called exactly once per started session.
    fn closed(&mut self, diagnostic: Option<&str>);
}

/// Bounds applied while dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Longest control or diagnostic line accepted in one piece.
    pub line_limit: usize,
    /// Sleep between polls of idle pipes while waiting for start-up.
    pub poll_interval: Duration,
    /// Consecutive malformed control lines that raise a protocol error.
    pub malformed_escalation: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            line_limit: DEFAULT_LINE_LIMIT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            malformed_escalation: 3,
        }
    }
}

/// How start-up ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The first capture file was accepted.
    Running,
    /// The first capture file was rejected by [`CaptureEvents::new_file`];
    /// the caller should stop the worker.
    Rejected,
}

/// Result of one [`EventDispatcher::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// This many control lines were handled.
    Dispatched(usize),
    /// Nothing was available.
    Idle,
    /// The worker closed its control stream; `closed` has been called.
    Finished,
}

/// Reads, decodes and dispatches a worker's control stream.
pub struct EventDispatcher<E> {
    control: LineReader,
    diagnostics: Option<LineReader>,
    events: E,
    status: SessionStatus,
    limits: DispatchLimits,
    history: VecDeque<String>,
    malformed_streak: usize,
    discarding_long_line: bool,
    stop_wanted: bool,
    finished: bool,
}

impl<E: CaptureEvents> EventDispatcher<E> {
    /// Builds a dispatcher over the control stream and an optional
    /// diagnostic stream.
    #[must_use]
    pub fn new(
        control: PipeChannel,
        diagnostics: Option<PipeChannel>,
        events: E,
        status: SessionStatus,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            control: LineReader::new(control),
            diagnostics: diagnostics.map(LineReader::new),
            events,
            status,
            limits,
            history: VecDeque::new(),
            malformed_streak: 0,
            discarding_long_line: false,
            stop_wanted: false,
            finished: false,
        }
    }

    /// Shared status written by this dispatcher.
    #[must_use]
    pub const fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// The callback set.
    #[must_use]
    pub const fn events(&self) -> &E {
        &self.events
    }

    /// Whether a callback asked for the session to stop.
    #[must_use]
    pub const fn wants_stop(&self) -> bool {
        self.stop_wanted
    }

    /// Whether the control stream has ended.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Recent diagnostic text, oldest line first.
    #[must_use]
    pub fn diagnostics(&self) -> Option<String> {
        (!self.history.is_empty())
            .then(|| self.history.iter().cloned().collect::<Vec<_>>().join("\n"))
    }

    /// Waits for the worker to announce its first capture file.
    ///
    /// `progress` runs on every idle poll so a caller can keep a UI alive.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Worker`] or [`SyncError::CaptureFilter`] when the
    /// worker reports a failure, [`SyncError::PrematureClose`] when it exits
    /// first, and [`SyncError::Channel`] when the control stream fails. The
    /// session state is `Failed` in every case.
    pub fn await_start<P: FnMut()>(&mut self, mut progress: P) -> Result<StartOutcome, SyncError> {
        self.status.advance(SessionState::AwaitingFirstSignal);
        loop {
            self.drain_diagnostics();
            let read = match self.control.get_line(self.limits.line_limit) {
                Ok(read) => read,
                Err(error) => return Err(self.fail(error.into())),
            };
            match read {
                LineRead::Line(line) => {
                    if let Some(outcome) = self.start_line(&line)? {
                        return Ok(outcome);
                    }
                }
                LineRead::Incomplete => {
                    progress();
                    thread::sleep(self.limits.poll_interval);
                }
                LineRead::Closed => {
                    self.finish_diagnostics();
                    let diagnostic = self.diagnostics();
                    return Err(self.fail(SyncError::PrematureClose { diagnostic }));
                }
            }
        }
    }

    fn start_line(&mut self, line: &Line) -> Result<Option<StartOutcome>, SyncError> {
        let Some(message) = self.decode(line) else {
            return Ok(None);
        };
        if !matches!(
            message,
            Message::PacketCount { .. } | Message::Drops { .. } | Message::Success
        ) {
            self.malformed_streak = 0;
        }
        match message {
            Message::NewFile { path } => {
                self.status.advance(SessionState::Running);
                info!(target: DISPATCH_TARGET, path = %path, "capture started");
                if self.events.new_file(&path) {
                    Ok(Some(StartOutcome::Running))
                } else {
                    self.stop_wanted = true;
                    Ok(Some(StartOutcome::Rejected))
                }
            }
            Message::Error { primary, secondary } => {
                Err(self.fail(SyncError::Worker { primary, secondary }))
            }
            Message::BadFilter { message } => Err(self.fail(SyncError::Worker {
                primary: message,
                secondary: None,
            })),
            Message::CFilterError { index, message } => {
                Err(self.fail(SyncError::CaptureFilter { index, message }))
            }
            Message::Closed { diagnostic: trailing } => {
                self.finish_diagnostics();
                let diagnostic = trailing.or_else(|| self.diagnostics());
                Err(self.fail(SyncError::PrematureClose { diagnostic }))
            }
            unexpected @ (Message::PacketCount { .. } | Message::Drops { .. } | Message::Success) => {
                self.malformed(format!(
                    "{} message received before the capture started",
                    unexpected.kind()
                ));
                Ok(None)
            }
        }
    }

    /// Dispatches every control line currently available.
    ///
    /// # Errors
    ///
    /// Returns the [`ChannelError`] that ended the control stream, after
    /// calling [`CaptureEvents::closed`] with its text and moving the state to
    /// `Failed`.
    pub fn pump(&mut self) -> Result<Pump, ChannelError> {
        if self.finished {
            return Ok(Pump::Finished);
        }
        self.drain_diagnostics();
        let mut dispatched = 0;
        while dispatched < MAX_LINES_PER_PUMP {
            let read = match self.control.get_line(self.limits.line_limit) {
                Ok(read) => read,
                Err(error) => {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %error,
                        "control stream failed"
                    );
                    self.finished = true;
                    self.events.closed(Some(&error.to_string()));
                    self.status.advance(SessionState::Failed);
                    return Err(error);
                }
            };
            match read {
                LineRead::Line(line) => {
                    dispatched += 1;
                    if self.running_line(&line) {
                        return Ok(Pump::Finished);
                    }
                }
                LineRead::Incomplete => break,
                LineRead::Closed => {
                    self.finish_diagnostics();
                    let diagnostic = self.diagnostics();
                    self.close(diagnostic.as_deref());
                    return Ok(Pump::Finished);
                }
            }
        }
        Ok(if dispatched == 0 {
            Pump::Idle
        } else {
            Pump::Dispatched(dispatched)
        })
    }

    /// Marks the session as stopping. Dispatch continues unchanged.
    pub fn begin_stopping(&self) {
        self.status.advance(SessionState::Stopping);
    }

    fn running_line(&mut self, line: &Line) -> bool {
        let Some(message) = self.decode(line) else {
            return false;
        };
        self.malformed_streak = 0;
        match message {
            Message::NewFile { path } => {
                info!(target: DISPATCH_TARGET, path = %path, "capture file switched");
                if !self.events.new_file(&path) {
                    self.stop_wanted = true;
                }
            }
            Message::PacketCount { count } => {
                let total = self.status.add_packets(count);
                debug!(target: DISPATCH_TARGET, count, total, "packets captured");
                self.events.new_packets(count);
            }
            Message::Drops { count, interface } => {
                self.status.set_drops(count);
                self.events.drops(count, interface.as_deref());
            }
            Message::Error { primary, secondary } => {
                warn!(
                    target: DISPATCH_TARGET,
                    primary = %primary,
                    secondary = secondary.as_deref().unwrap_or_default(),
                    "capture worker reported an error"
                );
                self.events.error(&primary, secondary.as_deref());
            }
            Message::BadFilter { message } => {
                warn!(target: DISPATCH_TARGET, message = %message, "capture worker rejected a filter");
                self.events.error(&message, None);
            }
            Message::CFilterError { index, message } => {
                self.events.cfilter_error(index, &message);
            }
            Message::Success => {
                debug!(target: DISPATCH_TARGET, "capture worker acknowledged a request");
            }
            Message::Closed { diagnostic } => {
                self.finish_diagnostics();
                let text = diagnostic.or_else(|| self.diagnostics());
                self.close(text.as_deref());
                return true;
            }
        }
        false
    }

    fn close(&mut self, diagnostic: Option<&str>) {
        self.finished = true;
        info!(
            target: DISPATCH_TARGET,
            packets = self.status.packets(),
            "capture worker closed its control stream"
        );
        self.events.closed(diagnostic);
        self.status.advance(SessionState::Stopped);
    }

    fn fail(&mut self, error: SyncError) -> SyncError {
        self.finished = true;
        warn!(
            target: DISPATCH_TARGET,
            error = %error,
            "capture start-up failed"
        );
        self.status.advance(SessionState::Failed);
        error
    }

    fn decode(&mut self, line: &Line) -> Option<Message> {
        if line.truncated {
            if !self.discarding_long_line {
                self.discarding_long_line = true;
                self.malformed(format!(
                    "control line longer than {} bytes",
                    self.limits.line_limit
                ));
            }
            return None;
        }
        if self.discarding_long_line {
            self.discarding_long_line = false;
            return None;
        }
        match Message::decode(&line.bytes) {
            Ok(message) => Some(message),
            Err(error) => {
                self.malformed(error.to_string());
                None
            }
        }
    }

    fn malformed(&mut self, reason: String) {
        self.malformed_streak += 1;
        warn!(
            target: DISPATCH_TARGET,
            reason = %reason,
            streak = self.malformed_streak,
            "malformed control line from capture worker"
        );
        if self.malformed_streak >= self.limits.malformed_escalation.max(1) {
            let details = format!(
                "{} consecutive malformed control lines, last: {reason}",
                self.malformed_streak
            );
            self.malformed_streak = 0;
            self.events.error(PROTOCOL_MISMATCH, Some(&details));
        }
    }

    fn drain_diagnostics(&mut self) {
        let Some(reader) = self.diagnostics.as_mut() else {
            return;
        };
        let mut ended = false;
        loop {
            match reader.get_line(self.limits.line_limit) {
                Ok(LineRead::Line(line)) => {
                    let text = line.text().into_owned();
                    debug!(target: DISPATCH_TARGET, line = %text, "capture worker output");
                    if self.history.len() == DIAGNOSTIC_HISTORY {
                        self.history.pop_front();
                    }
                    self.history.push_back(text);
                }
                Ok(LineRead::Incomplete) => break,
                Ok(LineRead::Closed) => {
                    ended = true;
                    break;
                }
                Err(error) => {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %error,
                        "diagnostic stream failed, ignoring further output"
                    );
                    ended = true;
                    break;
                }
            }
        }
        if ended {
            self.diagnostics = None;
        }
    }

    /// Drains diagnostics after the control stream ended. The worker may
    /// close them slightly later, so this waits briefly for their end.
    fn finish_diagnostics(&mut self) {
        let deadline = Instant::now() + DIAGNOSTIC_DRAIN;
        loop {
            self.drain_diagnostics();
            if self.diagnostics.is_none() || Instant::now() >= deadline {
                return;
            }
            thread::sleep(self.limits.poll_interval.min(DIAGNOSTIC_DRAIN));
        }
    }
}

impl<E> std::fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("state", &self.status.state())
            .field("malformed_streak", &self.malformed_streak)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
