//! Incremental AT command line framer.
//!
//! The control channel delivers bytes in arbitrary chunks. [`LineFramer`]
//! buffers them and yields one command line per carriage return. Bytes
//! after the last CR are kept for the next chunk.
//!
//! The buffer is bounded: a chunk that would grow it past its capacity is a
//! protocol violation and the caller is expected to drop the connection.
//! No resynchronization is attempted.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

/// Default input buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bounded line reassembly buffer for one control channel.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    capacity: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a received chunk.
    ///
    /// Fails with [`Error::ProtocolOverflow`] without buffering anything when
    /// the chunk does not fit.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() > self.capacity {
            return Err(Error::ProtocolOverflow {
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Extract the next complete line, without its terminator.
    ///
    /// Line feeds left over from a `\r\n` terminated peer are skipped, and a
    /// NUL byte ends the line early.
    pub fn next_line(&mut self) -> Option<String> {
        let leading = self.buf.iter().take_while(|&&b| b == b'\n').count();
        self.buf.advance(leading);

        let end = self.buf.iter().position(|&b| b == b'\r')?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);

        let raw = match raw.iter().position(|&b| b == 0) {
            Some(nul) => &raw[..nul],
            None => &raw[..],
        };
        Some(String::from_utf8_lossy(raw).into_owned())
    }

    /// Number of buffered bytes not yet returned as a line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop any partially received line.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
