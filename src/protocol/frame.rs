//! Frame value: header identity plus a typed body.
//!
//! A frame on the wire is `header(16) · body(size-16)`. Encoding
//! computes the size from the body; decoding takes exactly the slice
//! the chunk reader shifted and re-reads the header from offset zero.

use bytes::{Bytes, BytesMut};

use super::messages::{BodyReader, FrameBody};
use super::wire_format::{FrameHeader, FrameType, HEADER_SIZE};
use crate::error::{FramewireError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Connection-scoped frame id.
    pub id: u32,
    /// Flags byte.
    pub flags: u8,
    /// Typed body.
    pub body: FrameBody,
}

impl Frame {
    /// Create a new frame with no flags set.
    pub fn new(id: u32, body: FrameBody) -> Self {
        Self { id, flags: 0, body }
    }

    /// The frame type, derived from the body.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    /// Encode to a single contiguous buffer (header then body).
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.resize(HEADER_SIZE, 0);
        self.body.encode_into(&mut buf)?;

        let size = buf.len() as u32;
        let header = FrameHeader::new(size, self.id, self.frame_type(), self.flags);
        header.encode_into(&mut buf[..HEADER_SIZE]);
        Ok(buf.freeze())
    }

    /// Decode a frame from the exact slice the chunk reader produced.
    ///
    /// The slice length must match the declared size. A body grammar
    /// that leaves trailing bytes unread fails with `ExtraFrameData`.
    pub fn decode(slice: Bytes) -> Result<Self> {
        let header = FrameHeader::decode(&slice)?;
        if header.size as usize != slice.len() {
            return Err(FramewireError::ShortRead {
                needed: header.size as usize,
                avail: slice.len(),
            });
        }

        let mut reader = BodyReader::new(slice.slice(HEADER_SIZE..));
        let body = FrameBody::decode(header.frame_type, &mut reader)?;
        if reader.remaining() > 0 {
            return Err(FramewireError::ExtraFrameData {
                trailing: reader.remaining(),
            });
        }
        Ok(Self {
            id: header.id,
            flags: header.flags,
            body,
        })
    }
}
