//! Running captures: start-up, the reader thread, graceful stop and kill.
//!
//! [`start_session`] launches the worker and waits on the caller's thread
//! until the worker announces its first capture file, so start-up failures
//! come back synchronously. The dispatcher and the worker then move to a
//! dedicated reader thread that delivers callbacks until the worker closes
//! its control stream. [`CaptureSession`] is the caller's handle to that
//! thread.

use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use capchild_config::{Config, StopMethod};
use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{
    CaptureEvents, DispatchLimits, EventDispatcher, Pump, SessionState, SessionStatus,
    StartOutcome,
};
use crate::errors::{LaunchError, SyncError};
use crate::launcher::{
    LaunchSpec, ProcessId, StreamRequest, WorkerHandle, WorkerProcess, launch, send_signal,
};
use crate::pipe::PipeWriter;

const SESSION_TARGET: &str = "capchild::session";

/// Line written to the worker's stdin by [`StopMethod::SignalPipe`].
pub const SIGNAL_PIPE_QUIT: &[u8] = b"QUIT\n";

/// Timing and bounds for a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Sleep between polls of idle pipes.
    pub poll_interval: Duration,
    /// Longest line accepted from the worker in one piece.
    pub line_limit: usize,
    /// Time a stopping worker gets before it is killed.
    pub stop_grace: Duration,
    /// How the worker is asked to stop.
    pub stop_method: StopMethod,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self::from_config(config)
    }
}

impl SessionOptions {
    /// Options taken from `config`.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            line_limit: config.line_limit(),
            stop_grace: config.stop_grace(),
            stop_method: config.stop_method(),
        }
    }

    fn limits(&self) -> DispatchLimits {
        DispatchLimits {
            line_limit: self.line_limit,
            poll_interval: self.poll_interval,
            ..DispatchLimits::default()
        }
    }
}

/// Builds the launch description for a capture with `capture_args`, using
/// the worker path and child-mode prefix from `config`.
#[must_use]
pub fn capture_spec<I, S>(config: &Config, capture_args: I) -> LaunchSpec
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    LaunchSpec::new(config.worker_path().as_std_path())
        .args(config.child_mode_args().iter().map(String::as_str))
        .args(capture_args)
}

/// Stop requests shared by the handle and the reader thread.
#[derive(Debug)]
struct SessionControl {
    worker: WorkerHandle,
    method: StopMethod,
    stdin: Mutex<Option<PipeWriter>>,
    stop_requested: AtomicBool,
}

impl SessionControl {
    fn request_stop(&self) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            target: SESSION_TARGET,
            pid = self.worker.pid().as_u32(),
            method = %self.method,
            "stopping capture"
        );
        match self.method {
            StopMethod::Interrupt => {
                self.worker.signal(Signal::SIGINT);
            }
            StopMethod::Terminate => {
                self.worker.signal(Signal::SIGTERM);
            }
            StopMethod::SignalPipe => self.quit_through_pipe(),
        }
    }

    fn quit_through_pipe(&self) {
        let writer = self
            .stdin
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut pipe) = writer else {
            warn!(
                target: SESSION_TARGET,
                pid = self.worker.pid().as_u32(),
                "no signal pipe to the capture worker, sending SIGTERM"
            );
            self.worker.signal(Signal::SIGTERM);
            return;
        };
        if let Err(error) = pipe.send(SIGNAL_PIPE_QUIT).and_then(|()| pipe.close()) {
            warn!(
                target: SESSION_TARGET,
                pid = self.worker.pid().as_u32(),
                error = %error,
                "failed to write to the signal pipe, sending SIGTERM"
            );
            self.worker.signal(Signal::SIGTERM);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Handle to a running capture.
///
/// Dropping the handle without calling [`CaptureSession::wait`] kills the
/// worker and joins the reader thread.
#[derive(Debug)]
pub struct CaptureSession {
    pid: ProcessId,
    control: Arc<SessionControl>,
    status: SessionStatus,
    reader: Option<JoinHandle<SessionState>>,
}

impl CaptureSession {
    /// Asks the worker to finish its capture. Messages already written keep
    /// arriving; the worker is killed if it has not exited within the stop
    /// grace period. Repeated calls do nothing.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Kills the worker immediately.
    pub fn kill(&self) {
        if self.control.worker.signal(Signal::SIGKILL) {
            info!(
                target: SESSION_TARGET,
                pid = self.pid.as_u32(),
                "capture worker killed"
            );
        }
    }

    /// Worker process id.
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Packets reported so far.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.status.packets()
    }

    /// Most recent drop count.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.status.drops()
    }

    /// Whether the reader thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.reader.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the reader thread and returns the final state.
    #[must_use]
    pub fn wait(mut self) -> SessionState {
        self.join()
    }

    fn join(&mut self) -> SessionState {
        let Some(reader) = self.reader.take() else {
            return self.status.state();
        };
        reader.join().unwrap_or_else(|_| {
            error!(
                target: SESSION_TARGET,
                pid = self.pid.as_u32(),
                "capture reader thread panicked"
            );
            self.status.advance(SessionState::Failed);
            SessionState::Failed
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.kill();
            self.join();
        }
    }
}

/// Starts a capture and waits until the worker announces its first file.
///
/// The worker's stderr carries control messages and its stdout carries
/// diagnostics; both are piped regardless of `spec`. Stdin is piped when the
/// stop method needs it. `progress` runs on every idle poll during start-up.
/// When the first file is rejected by [`CaptureEvents::new_file`], the
/// session is returned already stopping.
///
/// # Errors
///
/// Returns [`SyncError`] when the worker cannot be launched, reports an
/// error, or exits before starting. The worker is killed and reaped first.
pub fn start_session<E, P>(
    spec: LaunchSpec,
    events: E,
    options: &SessionOptions,
    progress: P,
) -> Result<CaptureSession, SyncError>
where
    E: CaptureEvents + 'static,
    P: FnMut(),
{
    let stdin = if options.stop_method == StopMethod::SignalPipe {
        StreamRequest::Pipe
    } else {
        spec.stdin_request()
    };
    let wired = spec
        .stdin(stdin)
        .stdout(StreamRequest::Pipe)
        .stderr(StreamRequest::Pipe);
    let mut worker = launch(&wired)?;
    let pid = worker.pid();
    let control_stream = worker
        .take_stderr()
        .ok_or(LaunchError::MissingStream { stream: "stderr" })?;
    let diagnostics = worker.take_stdout();
    let status = SessionStatus::new();
    let mut dispatcher =
        EventDispatcher::new(control_stream, diagnostics, events, status.clone(), options.limits());

    let outcome = dispatcher.await_start(progress)?;

    let control = Arc::new(SessionControl {
        worker: worker.handle(),
        method: options.stop_method,
        stdin: Mutex::new(worker.take_stdin()),
        stop_requested: AtomicBool::new(false),
    });
    let program = worker.program().to_path_buf();
    let thread_control = Arc::clone(&control);
    let thread_options = *options;
    let reader = thread::Builder::new()
        .name(format!("capchild-session-{pid}"))
        .spawn(move || run_reader(worker, dispatcher, &thread_control, &thread_options))
        .map_err(|source| LaunchError::from_spawn(program, source))?;

    let session = CaptureSession {
        pid,
        control,
        status,
        reader: Some(reader),
    };
    if outcome == StartOutcome::Rejected {
        session.stop();
    }
    Ok(session)
}

fn run_reader<E: CaptureEvents>(
    mut worker: WorkerProcess,
    mut dispatcher: EventDispatcher<E>,
    control: &SessionControl,
    options: &SessionOptions,
) -> SessionState {
    let pid = worker.pid().as_u32();
    debug!(target: SESSION_TARGET, pid, "capture reader started");
    let mut kill_deadline: Option<Instant> = None;
    loop {
        if dispatcher.wants_stop() {
            control.request_stop();
        }
        if kill_deadline.is_none() && control.stop_requested() {
            dispatcher.begin_stopping();
            kill_deadline = Some(Instant::now() + options.stop_grace);
        }
        let overdue = kill_deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if overdue && worker.is_alive() {
            warn!(
                target: SESSION_TARGET,
                pid,
                grace_ms = options.stop_grace.as_millis(),
                "capture worker ignored the stop request, killing it"
            );
            worker.kill();
        }
        match dispatcher.pump() {
            Ok(Pump::Finished) | Err(_) => break,
            Ok(Pump::Dispatched(_)) => {}
            Ok(Pump::Idle) => thread::sleep(options.poll_interval),
        }
    }
    reap(&mut worker, options);
    let state = dispatcher.status().state();
    info!(
        target: SESSION_TARGET,
        pid,
        state = %state,
        packets = dispatcher.status().packets(),
        "capture session ended"
    );
    state
}

/// Gives a worker that closed its control stream time to exit, then kills it.
fn reap(worker: &mut WorkerProcess, options: &SessionOptions) {
    let deadline = Instant::now() + options.stop_grace;
    while worker.is_alive() {
        match worker.try_reap() {
            Ok(Some(status)) => {
                debug!(
                    target: SESSION_TARGET,
                    pid = worker.pid().as_u32(),
                    ?status,
                    "capture worker exited"
                );
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(options.poll_interval),
            Ok(None) => {
                warn!(
                    target: SESSION_TARGET,
                    pid = worker.pid().as_u32(),
                    "capture worker lingered after closing its pipes, killing it"
                );
                worker.kill();
            }
            Err(error) => {
                warn!(
                    target: SESSION_TARGET,
                    pid = worker.pid().as_u32(),
                    error = %error,
                    "failed to reap capture worker, killing it"
                );
                worker.kill();
            }
        }
    }
}

/// Sends `SIGKILL` to `pid`. Unknown or already reaped processes are ignored,
/// so repeated kills never fail.
pub fn kill_worker(pid: ProcessId) {
    match send_signal(pid, Signal::SIGKILL) {
        Ok(true) => info!(target: SESSION_TARGET, pid = pid.as_u32(), "capture worker killed"),
        Ok(false) => debug!(
            target: SESSION_TARGET,
            pid = pid.as_u32(),
            "capture worker already gone"
        ),
        Err(errno) => debug!(
            target: SESSION_TARGET,
            pid = pid.as_u32(),
            error = %errno,
            "capture worker could not be killed"
        ),
    }
}
