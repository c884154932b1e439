//! Chunk reader: a two-state machine turning a stream of byte chunks
//! into discrete length-prefixed frames.
//!
//! States:
//! - `PendingLength`: waiting for the size prefix. A prefix of zero is
//!   reported as an error, the prefix is skipped, and the reader
//!   resynchronizes on the following bytes.
//! - `Seeking`: size known, waiting for the whole frame to buffer up.
//!
//! The reader consumes as many frames as the buffer permits per input
//! chunk. Emitted frame slices include the size prefix, so the frame
//! codec re-reads the full header from offset zero.
//!
//! The length-prefix width is configurable (1, 2, or 4 bytes) for
//! generality; this protocol frames with a 4-byte size.

use bytes::Bytes;

use super::parse_buffer::ParseBuffer;
use crate::error::{FramewireError, Result};

/// Default size-prefix width in bytes.
pub const DEFAULT_LENGTH_WIDTH: usize = 4;

/// State machine for frame extraction.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Expecting the size prefix.
    PendingLength,
    /// Size known, waiting for `size` total bytes.
    Seeking { size: usize },
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::PendingLength => "PendingLength",
            State::Seeking { .. } => "Seeking",
        }
    }
}

/// Reader turning appended chunks into whole frame slices.
///
/// Each extracted item is either a complete frame (including its size
/// prefix) or a framing error. Errors leave the reader resynchronized
/// where possible; the connection layer decides fatality.
#[derive(Debug)]
pub struct ChunkReader {
    buffer: ParseBuffer,
    width: usize,
    state: State,
}

impl ChunkReader {
    /// Create a reader with the protocol's 4-byte size prefix.
    pub fn new() -> Self {
        Self::with_width(DEFAULT_LENGTH_WIDTH)
    }

    /// Create a reader with a custom prefix width.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not 1, 2, or 4.
    pub fn with_width(width: usize) -> Self {
        assert!(matches!(width, 1 | 2 | 4), "length width must be 1, 2, or 4");
        Self {
            buffer: ParseBuffer::new(),
            width,
            state: State::PendingLength,
        }
    }

    /// Feed a chunk and extract every frame it completes.
    ///
    /// Returns one item per extracted frame or framing error, in wire
    /// order. Partial data stays buffered for the next push.
    pub fn push(&mut self, chunk: Bytes) -> Vec<Result<Bytes>> {
        self.buffer.append(chunk);

        let mut items = Vec::new();
        while let Some(item) = self.try_extract_one() {
            items.push(item);
        }
        items
    }

    /// Signal end-of-stream. Errors if bytes remain buffered.
    pub fn finish(&self) -> Result<()> {
        if self.buffer.avail() > 0 {
            return Err(FramewireError::TruncatedRead {
                residual: self.buffer.avail(),
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.avail()
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.state {
                State::PendingLength => {
                    let size = self.buffer.peek_uint_be(0, self.width)? as usize;
                    if size == 0 {
                        // Skip the prefix and resynchronize on what follows.
                        if let Err(err) = self.buffer.shift(self.width) {
                            return Some(Err(err));
                        }
                        return Some(Err(FramewireError::ZeroLengthFrame));
                    }
                    if size < self.width {
                        // The declared length cannot even cover its own
                        // prefix; skip it and report.
                        if let Err(err) = self.buffer.shift(self.width) {
                            return Some(Err(err));
                        }
                        return Some(Err(FramewireError::InvalidFrameLength(size as u32)));
                    }
                    self.state = State::Seeking { size };
                }
                State::Seeking { size } => {
                    if self.buffer.avail() < size {
                        return None;
                    }
                    let frame = match self.buffer.shift(size) {
                        Ok(frame) => frame,
                        Err(err) => return Some(Err(err)),
                    };
                    self.state = State::PendingLength;
                    return Some(Ok(frame));
                }
            }
        }
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}
