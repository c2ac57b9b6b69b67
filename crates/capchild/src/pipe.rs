//! Byte conduits between the controller and a worker's standard streams.
//!
//! [`PipeChannel`] is the read side. Channels built from a child's stdout or
//! stderr are switched to non-blocking mode so a reader can poll several of
//! them from one thread. [`PipeWriter`] is the write side, used for the
//! worker's stdin.

use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::process::{ChildStderr, ChildStdin, ChildStdout};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::trace;

use crate::errors::ChannelError;

const PIPE_TARGET: &str = "capchild::pipe";

/// Result of a single [`PipeChannel::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the buffer.
    Data(usize),
    /// No bytes are available right now.
    WouldBlock,
    /// The writer has gone away.
    Closed,
}

/// Read side of a pipe connected to a worker.
pub struct PipeChannel {
    name: &'static str,
    reader: Option<Box<dyn Read + Send>>,
}

impl PipeChannel {
    /// Wraps a worker's stdout, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configure`] when the descriptor flags cannot be
    /// changed.
    pub fn from_stdout(stdout: ChildStdout) -> Result<Self, ChannelError> {
        set_nonblocking("stdout", stdout.as_raw_fd())?;
        Ok(Self::from_reader("stdout", stdout))
    }

    /// Wraps a worker's stderr, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configure`] when the descriptor flags cannot be
    /// changed.
    pub fn from_stderr(stderr: ChildStderr) -> Result<Self, ChannelError> {
        set_nonblocking("stderr", stderr.as_raw_fd())?;
        Ok(Self::from_reader("stderr", stderr))
    }

    /// Wraps an arbitrary reader. The reader's own blocking behaviour is kept.
    #[must_use]
    pub fn from_reader(name: &'static str, reader: impl Read + Send + 'static) -> Self {
        Self {
            name,
            reader: Some(Box::new(reader)),
        }
    }

    /// Name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the channel has been closed, locally or by the writer.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Reads whatever is available into `buf`.
    ///
    /// Interrupted reads are retried. Once [`ReadOutcome::Closed`] has been
    /// returned, every later call returns it too. An empty `buf` reads nothing
    /// and reports [`ReadOutcome::WouldBlock`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] for any other read failure.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, ChannelError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };
        if buf.is_empty() {
            return Ok(ReadOutcome::WouldBlock);
        }
        let outcome = loop {
            match reader.read(buf) {
                Ok(0) => break ReadOutcome::Closed,
                Ok(count) => break ReadOutcome::Data(count),
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    break ReadOutcome::WouldBlock;
                }
                Err(error) => return Err(ChannelError::io(self.name, error)),
            }
        };
        if outcome == ReadOutcome::Closed {
            trace!(target: PIPE_TARGET, channel = self.name, "pipe reached end of stream");
            self.reader = None;
        }
        Ok(outcome)
    }

    /// Releases the underlying handle. Calling this again does nothing.
    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            trace!(target: PIPE_TARGET, channel = self.name, "pipe closed");
        }
    }
}

impl std::fmt::Debug for PipeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeChannel")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Write side of a pipe connected to a worker's stdin.
pub struct PipeWriter {
    name: &'static str,
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
}

impl PipeWriter {
    /// Wraps a worker's stdin.
    #[must_use]
    pub fn from_stdin(stdin: ChildStdin) -> Self {
        Self::from_writer("stdin", stdin)
    }

    /// Wraps an arbitrary writer.
    #[must_use]
    pub fn from_writer(name: &'static str, writer: impl Write + Send + 'static) -> Self {
        let boxed: Box<dyn Write + Send> = Box::new(writer);
        Self {
            name,
            writer: Some(BufWriter::new(boxed)),
        }
    }

    /// Writes `bytes` and flushes them, blocking until the pipe accepts them.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] when the write fails or the writer has
    /// already been closed.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let name = self.name;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ChannelError::io(name, io::Error::from(ErrorKind::BrokenPipe)))?;
        writer
            .write_all(bytes)
            .and_then(|()| writer.flush())
            .map_err(|error| ChannelError::io(name, error))
    }

    /// Flushes and releases the handle, signalling end of input to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] when buffered bytes cannot be flushed.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        match self.writer.take() {
            Some(mut writer) => writer
                .flush()
                .map_err(|error| ChannelError::io(self.name, error)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("name", &self.name)
            .field("closed", &self.writer.is_none())
            .finish()
    }
}

fn set_nonblocking(channel: &'static str, fd: RawFd) -> Result<(), ChannelError> {
    let configure = |source| ChannelError::Configure { channel, source };
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(configure)?;
    let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(configure)?;
    Ok(())
}
