//! Error types for framewire.

use thiserror::Error;

use crate::codec::WireError;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------
    /// A frame header declared a total length of zero.
    #[error("zero length frame")]
    ZeroLengthFrame,

    /// The parse buffer was asked for more bytes than it holds.
    ///
    /// Callers must gate `shift` on `avail()`; hitting this means the
    /// reader state machine is broken.
    #[error("broken reader state: needed {needed} bytes, {avail} available")]
    BrokenReaderState { needed: usize, avail: usize },

    /// End-of-stream with bytes still buffered.
    #[error("truncated read: {residual} residual bytes in state {state}")]
    TruncatedRead { residual: usize, state: &'static str },

    /// A body grammar needed more bytes than the frame slice holds.
    #[error("short read: needed {needed} bytes, {avail} available")]
    ShortRead { needed: usize, avail: usize },

    /// Body decoding consumed fewer bytes than the frame declared.
    #[error("extra frame data: {trailing} trailing bytes")]
    ExtraFrameData { trailing: usize },

    // ------------------------------------------------------------------
    // Header / body
    // ------------------------------------------------------------------
    /// Unknown frame type byte.
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidFrameType(u8),

    /// Frame size smaller than the fixed header.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(u32),

    /// Init body missing a required key.
    #[error("missing init header: {0}")]
    MissingInitHeader(&'static str),

    /// Init body repeated a key.
    #[error("duplicate init header: {0}")]
    DuplicateInitHeader(String),

    /// Init body carried a key this protocol does not define.
    #[error("invalid init header: {0}")]
    InvalidInitHeader(String),

    /// Init body announced a protocol version other than ours.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Call body repeated a transport header key.
    #[error("duplicate transport header: {0}")]
    DuplicateHeaderKey(String),

    /// Unknown response code byte in a call response.
    #[error("invalid response code: 0x{0:02x}")]
    InvalidResponseCode(u8),

    /// A length-prefixed field exceeds what its prefix can express.
    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------
    /// A second InitRequest arrived on an already-identified connection.
    #[error("duplicate init request")]
    DuplicateInitRequest,

    /// A second InitResponse arrived on an already-identified connection.
    #[error("duplicate init response")]
    DuplicateInitResponse,

    /// A CallRequest arrived before the handshake completed.
    #[error("call request before init")]
    CallRequestBeforeInit,

    /// A CallResponse arrived before the handshake completed.
    #[error("call response before init")]
    CallResponseBeforeInit,

    /// Arg checksum did not match the wire value.
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Checksum type byte with no registered implementation.
    #[error("unsupported checksum type: {0}")]
    UnsupportedChecksum(u8),

    // ------------------------------------------------------------------
    // Operation
    // ------------------------------------------------------------------
    /// The operation outlived its ttl.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// No connection could be located or dialed for the service address.
    #[error("no such service: {0}")]
    NoSuchService(String),

    /// No handler registered under the requested endpoint name.
    #[error("no such endpoint: {0}")]
    NoSuchEndpoint(String),

    /// An endpoint name was registered twice.
    #[error("endpoint already defined: {0}")]
    EndpointAlreadyDefined(String),

    /// The remote handler failed; carries the deserialized envelope.
    #[error("application error: {0}")]
    Application(WireError),

    /// The remote completed the operation with a non-ok response code.
    #[error("remote error (code {code}): {message}")]
    Remote { code: u8, message: String },

    /// Outbound ttl of zero is not a valid deadline.
    #[error("invalid ttl: must be nonzero")]
    InvalidTtl,

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// I/O error on the underlying byte-duplex.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying byte-duplex closed.
    #[error("socket closed")]
    SocketClosed,

    /// The connection was torn down; carries the reset reason.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The channel has been destroyed by `quit`.
    #[error("channel destroyed")]
    ChannelDestroyed,

    /// A peer address naming this node itself.
    #[error("cannot peer with self: {0}")]
    SelfPeer(String),

    /// JSON error while encoding or decoding the application-error envelope.
    #[error("envelope error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;
