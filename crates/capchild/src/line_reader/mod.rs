//! Incremental, non-blocking line assembly over a [`PipeChannel`].
//!
//! Workers write one record per line. A read may return any fragment of a
//! line, so [`LineReader`] keeps the unconsumed bytes between calls and hands
//! out complete lines only. Memory is bounded by the caller's limit: a line
//! longer than the limit is delivered in pieces marked as truncated.

use std::borrow::Cow;
use std::mem;

use crate::errors::ChannelError;
use crate::pipe::{PipeChannel, ReadOutcome};

const READ_CHUNK: usize = 4096;

/// One line read from a worker, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line content.
    pub bytes: Vec<u8>,
    /// Whether the line was split because it exceeded the limit. The rest of
    /// the line follows in later reads.
    pub truncated: bool,
}

impl Line {
    /// Line content decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Result of [`LineReader::get_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A line, or a piece of an over-long line.
    Line(Line),
    /// No line boundary is available yet.
    Incomplete,
    /// The channel ended and every buffered byte has been delivered.
    Closed,
}

/// Result of [`read_line_nonblocking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonBlockingRead {
    /// This many bytes of line content were copied into the buffer.
    Read(usize),
    /// No complete line is available yet.
    WouldBlock,
    /// The channel ended.
    Closed,
}

/// Retained-buffer line reader over one channel.
#[derive(Debug)]
pub struct LineReader {
    channel: PipeChannel,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    eof: bool,
}

impl LineReader {
    /// Wraps `channel`.
    #[must_use]
    pub fn new(channel: PipeChannel) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
            scratch: vec![0; READ_CHUNK],
            eof: false,
        }
    }

    /// Name of the underlying channel.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.channel.name()
    }

    /// Whether the channel ended and nothing is left to deliver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.eof && self.buffer.is_empty()
    }

    /// Number of bytes received but not yet delivered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next line, reading from the channel as needed.
    ///
    /// `limit` caps the content of a single returned line; zero is treated
    /// as one. At most `limit` bytes of content plus a line terminator are
    /// ever buffered.
    ///
    /// # Errors
    ///
    /// Propagates [`ChannelError`] from the channel. Buffered bytes are kept.
    pub fn get_line(&mut self, limit: usize) -> Result<LineRead, ChannelError> {
        let cap = limit.max(1);
        loop {
            if let Some(line) = self.take_buffered(cap) {
                return Ok(LineRead::Line(line));
            }
            if self.eof {
                return Ok(self.take_final(cap));
            }
            let room = (cap + 2)
                .saturating_sub(self.buffer.len())
                .clamp(1, READ_CHUNK);
            let Some(window) = self.scratch.get_mut(..room) else {
                return Ok(LineRead::Incomplete);
            };
            match self.channel.read(window)? {
                ReadOutcome::Data(count) => {
                    self.buffer
                        .extend_from_slice(window.get(..count).unwrap_or_default());
                }
                ReadOutcome::WouldBlock => return Ok(LineRead::Incomplete),
                ReadOutcome::Closed => self.eof = true,
            }
        }
    }

    /// Closes the underlying channel, discarding anything buffered.
    pub fn close(&mut self) {
        self.channel.close();
        self.buffer.clear();
        self.eof = true;
    }

    fn take_buffered(&mut self, cap: usize) -> Option<Line> {
        match self.buffer.iter().position(|byte| *byte == b'\n') {
            Some(newline) => {
                let content = if newline > 0 && self.buffer.get(newline - 1) == Some(&b'\r') {
                    newline - 1
                } else {
                    newline
                };
                if content > cap {
                    return Some(self.split_off_front(cap, true));
                }
                let mut line = self.split_off_front(newline + 1, false);
                line.bytes.truncate(content);
                Some(line)
            }
            None => {
                let len = self.buffer.len();
                let trailing_cr = self.buffer.last() == Some(&b'\r');
                let overflowing = len > cap + 1 || (len == cap + 1 && !trailing_cr);
                overflowing.then(|| self.split_off_front(cap, true))
            }
        }
    }

    fn take_final(&mut self, cap: usize) -> LineRead {
        if self.buffer.is_empty() {
            LineRead::Closed
        } else if self.buffer.len() > cap {
            LineRead::Line(self.split_off_front(cap, true))
        } else {
            LineRead::Line(Line {
                bytes: mem::take(&mut self.buffer),
                truncated: false,
            })
        }
    }

    fn split_off_front(&mut self, count: usize, truncated: bool) -> Line {
        let rest = self.buffer.split_off(count.min(self.buffer.len()));
        Line {
            bytes: mem::replace(&mut self.buffer, rest),
            truncated,
        }
    }
}

/// Copies the next available line into `buffer` without blocking.
///
/// At most `max_len` bytes, and never more than `buffer.len()`, are copied;
/// longer lines arrive over several calls. An empty destination reads
/// nothing and reports `Read(0)`.
///
/// # Errors
///
/// Propagates [`ChannelError`] from the channel.
pub fn read_line_nonblocking(
    reader: &mut LineReader,
    buffer: &mut [u8],
    max_len: usize,
) -> Result<NonBlockingRead, ChannelError> {
    let limit = max_len.min(buffer.len());
    if limit == 0 {
        return Ok(NonBlockingRead::Read(0));
    }
    match reader.get_line(limit)? {
        LineRead::Line(line) => {
            let count = line.bytes.len();
            let destination = buffer.get_mut(..count).unwrap_or_default();
            destination.copy_from_slice(&line.bytes);
            Ok(NonBlockingRead::Read(count))
        }
        LineRead::Incomplete => Ok(NonBlockingRead::WouldBlock),
        LineRead::Closed => Ok(NonBlockingRead::Closed),
    }
}

#[cfg(test)]
mod tests;
