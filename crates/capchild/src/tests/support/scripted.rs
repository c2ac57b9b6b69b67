//! In-memory reader that replays a fixed script of read results.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read};

/// One step of a [`ScriptedReader`] script.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Bytes handed out across as many reads as the caller's buffer needs.
    Data(Vec<u8>),
    /// A single `WouldBlock` error.
    WouldBlock,
    /// A single `Interrupted` error.
    Interrupted,
    /// A read failure of the given kind.
    Fail(ErrorKind),
    /// End of stream.
    Eof,
}

impl Chunk {
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(bytes.to_vec())
    }
}

/// Replays chunks in order, then reports end of stream forever.
#[derive(Debug, Default)]
pub struct ScriptedReader {
    script: VecDeque<Chunk>,
}

impl ScriptedReader {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            script: chunks.into_iter().collect(),
        }
    }
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.pop_front() {
            None | Some(Chunk::Eof) => Ok(0),
            Some(Chunk::WouldBlock) => Err(io::Error::from(ErrorKind::WouldBlock)),
            Some(Chunk::Interrupted) => Err(io::Error::from(ErrorKind::Interrupted)),
            Some(Chunk::Fail(kind)) => Err(io::Error::from(kind)),
            Some(Chunk::Data(mut bytes)) => {
                let count = bytes.len().min(buf.len());
                let rest = bytes.split_off(count);
                buf.get_mut(..count)
                    .expect("count fits the buffer")
                    .copy_from_slice(&bytes);
                if !rest.is_empty() {
                    self.script.push_front(Chunk::Data(rest));
                }
                Ok(count)
            }
        }
    }
}
