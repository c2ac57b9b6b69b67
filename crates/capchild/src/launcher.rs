//! Spawning capture workers and owning them until they are reaped.
//!
//! [`launch`] starts the worker described by a [`LaunchSpec`] and wires only
//! the pipes it asks for. Pipes created by the standard library are
//! close-on-exec, so the worker inherits nothing beyond its standard streams.
//! The returned [`WorkerProcess`] kills and reaps the worker when dropped, so
//! a failure anywhere in the controller cannot leak a running capture.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::errors::LaunchError;
use crate::hook::notify_worker_spawned;
use crate::pipe::{PipeChannel, PipeWriter};

const LAUNCHER_TARGET: &str = "capchild::launcher";

/// Operating-system process id of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Wraps a raw process id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw process id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The id as a signal target. Zero and ids outside `pid_t` have none,
    /// since signalling them would reach a process group.
    fn as_target(self) -> Option<Pid> {
        i32::try_from(self.0)
            .ok()
            .filter(|raw| *raw > 0)
            .map(Pid::from_raw)
    }
}

impl From<u32> for ProcessId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sends `signal` to `pid`.
///
/// Returns `Ok(false)` when the id is not a valid target or the process no
/// longer exists.
pub(crate) fn send_signal(pid: ProcessId, signal: Signal) -> Result<bool, Errno> {
    let Some(target) = pid.as_target() else {
        return Ok(false);
    };
    match kill(target, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno),
    }
}

/// How one of the worker's standard streams is connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamRequest {
    /// Connect the stream to the null device.
    #[default]
    Null,
    /// Connect the stream to a pipe owned by the controller.
    Pipe,
}

impl StreamRequest {
    fn stdio(self) -> Stdio {
        match self {
            Self::Null => Stdio::null(),
            Self::Pipe => Stdio::piped(),
        }
    }
}

/// Description of a worker to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<OsString>,
    stdin: StreamRequest,
    stdout: StreamRequest,
    stderr: StreamRequest,
    working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Starts a description for `program` with every stream on the null device.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: StreamRequest::Null,
            stdout: StreamRequest::Null,
            stderr: StreamRequest::Null,
            working_dir: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Chooses how stdin is connected.
    #[must_use]
    pub const fn stdin(mut self, request: StreamRequest) -> Self {
        self.stdin = request;
        self
    }

    /// Chooses how stdout is connected.
    #[must_use]
    pub const fn stdout(mut self, request: StreamRequest) -> Self {
        self.stdout = request;
        self
    }

    /// Chooses how stderr is connected.
    #[must_use]
    pub const fn stderr(mut self, request: StreamRequest) -> Self {
        self.stderr = request;
        self
    }

    /// Runs the worker from `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Requested stdin connection.
    #[must_use]
    pub const fn stdin_request(&self) -> StreamRequest {
        self.stdin
    }
}

/// Shared view of a worker's liveness, used to signal it from other threads.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    pid: ProcessId,
    alive: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) const fn pid(&self) -> ProcessId {
        self.pid
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Signals the worker unless it has already been reaped, so a recycled
    /// pid is never targeted.
    pub(crate) fn signal(&self, signal: Signal) -> bool {
        if !self.is_alive() {
            return false;
        }
        match send_signal(self.pid, signal) {
            Ok(delivered) => delivered,
            Err(errno) => {
                warn!(
                    target: LAUNCHER_TARGET,
                    pid = self.pid.as_u32(),
                    signal = %signal,
                    error = %errno,
                    "failed to signal capture worker"
                );
                false
            }
        }
    }
}

/// A running (or exited but unreaped) worker.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: ProcessId,
    program: PathBuf,
    stdin: Option<PipeWriter>,
    stdout: Option<PipeChannel>,
    stderr: Option<PipeChannel>,
    alive: Arc<AtomicBool>,
}

impl WorkerProcess {
    /// Worker process id.
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Program the worker was started from.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether the worker has not been reaped yet.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Takes the write end of the worker's stdin, when it was piped.
    pub fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.stdin.take()
    }

    /// Takes the read end of the worker's stdout, when it was piped.
    pub fn take_stdout(&mut self) -> Option<PipeChannel> {
        self.stdout.take()
    }

    /// Takes the read end of the worker's stderr, when it was piped.
    pub fn take_stderr(&mut self) -> Option<PipeChannel> {
        self.stderr.take()
    }

    pub(crate) fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            pid: self.pid,
            alive: Arc::clone(&self.alive),
        }
    }

    /// Reaps the worker if it has exited, without blocking.
    ///
    /// # Errors
    ///
    /// Returns the error from the underlying `waitpid`.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if let Some(exit) = status {
            self.mark_reaped(exit);
        }
        Ok(status)
    }

    /// Blocks until the worker exits and reaps it.
    ///
    /// # Errors
    ///
    /// Returns the error from the underlying `waitpid`.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.mark_reaped(status);
        Ok(status)
    }

    /// Kills and reaps the worker. Calling this on a reaped worker does
    /// nothing.
    pub fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        if let Err(error) = self.child.kill() {
            debug!(
                target: LAUNCHER_TARGET,
                pid = self.pid.as_u32(),
                error = %error,
                "capture worker kill failed, it may already have exited"
            );
        }
        match self.child.wait() {
            Ok(status) => self.mark_reaped(status),
            Err(error) => {
                warn!(
                    target: LAUNCHER_TARGET,
                    pid = self.pid.as_u32(),
                    error = %error,
                    "failed to reap killed capture worker"
                );
                self.alive.store(false, Ordering::Release);
            }
        }
    }

    fn mark_reaped(&self, status: ExitStatus) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!(
                target: LAUNCHER_TARGET,
                pid = self.pid.as_u32(),
                ?status,
                "capture worker reaped"
            );
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            debug!(
                target: LAUNCHER_TARGET,
                pid = self.pid.as_u32(),
                "killing capture worker on drop"
            );
            self.kill();
        }
    }
}

/// Starts the worker described by `spec`.
///
/// Read pipes are switched to non-blocking mode. The process-wide pid hook
/// runs once the worker and its pipes are ready.
///
/// # Errors
///
/// Returns [`LaunchError`] when the process cannot be created or a requested
/// pipe cannot be prepared. The worker is killed before the error returns.
pub fn launch(spec: &LaunchSpec) -> Result<WorkerProcess, LaunchError> {
    debug!(
        target: LAUNCHER_TARGET,
        program = %spec.program.display(),
        args = ?spec.args,
        "launching capture worker"
    );

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(spec.stdin.stdio())
        .stdout(spec.stdout.stdio())
        .stderr(spec.stderr.stdio());
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    let child = command
        .spawn()
        .map_err(|source| LaunchError::from_spawn(spec.program.clone(), source))?;
    let pid = ProcessId::new(child.id());
    let mut worker = WorkerProcess {
        child,
        pid,
        program: spec.program.clone(),
        stdin: None,
        stdout: None,
        stderr: None,
        alive: Arc::new(AtomicBool::new(true)),
    };

    if spec.stdin == StreamRequest::Pipe {
        let stdin = worker
            .child
            .stdin
            .take()
            .ok_or(LaunchError::MissingStream { stream: "stdin" })?;
        worker.stdin = Some(PipeWriter::from_stdin(stdin));
    }
    if spec.stdout == StreamRequest::Pipe {
        let stdout = worker
            .child
            .stdout
            .take()
            .ok_or(LaunchError::MissingStream { stream: "stdout" })?;
        worker.stdout = Some(PipeChannel::from_stdout(stdout)?);
    }
    if spec.stderr == StreamRequest::Pipe {
        let stderr = worker
            .child
            .stderr
            .take()
            .ok_or(LaunchError::MissingStream { stream: "stderr" })?;
        worker.stderr = Some(PipeChannel::from_stderr(stderr)?);
    }

    info!(
        target: LAUNCHER_TARGET,
        pid = pid.as_u32(),
        program = %spec.program.display(),
        "capture worker started"
    );
    notify_worker_spawned(pid);
    Ok(worker)
}
