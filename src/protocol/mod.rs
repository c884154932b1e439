//! Protocol module - wire format, framing, and frame bodies.
//!
//! This module implements the binary protocol:
//! - 16-byte header encoding/decoding
//! - parse buffer and chunk reader for accumulating partial reads
//! - per-type body codecs (init, call, error)

mod chunk_reader;
mod frame;
mod messages;
mod parse_buffer;
mod wire_format;

pub use chunk_reader::{ChunkReader, DEFAULT_LENGTH_WIDTH};
pub use frame::Frame;
pub use messages::{
    BodyReader, CallHeaders, CallRequestBody, CallResponseBody, ErrorBody, FrameBody, InitBody,
    ResponseCode, INIT_KEY_HOST_PORT, INIT_KEY_PROCESS_NAME, TRACING_LEN,
};
pub use parse_buffer::ParseBuffer;
pub use wire_format::{flags, FrameHeader, FrameType, HEADER_SIZE, PROTOCOL_VERSION};
