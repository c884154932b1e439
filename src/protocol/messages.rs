//! Per-type frame body codecs.
//!
//! Length-prefixed fields are written as `~k`: a k-byte big-endian
//! length followed by that many raw bytes. Call bodies share the
//! header/arg/checksum grammar:
//!
//! ```text
//! service~2 · nh:u8 · (hk~1 hv~1){nh} · arg1~2 · arg2~2 · arg3~2
//!   · csumtype:u8 · (csum:u32be){0,1}
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::{Checksum, ChecksumType};
use crate::error::{FramewireError, Result};
use crate::protocol::wire_format::{FrameType, PROTOCOL_VERSION};

/// Length of the opaque tracing field in call requests.
pub const TRACING_LEN: usize = 24;

/// Required init key: the sender's listener address (`host:port`).
pub const INIT_KEY_HOST_PORT: &str = "host_port";

/// Required init key: free-form sender identifier.
pub const INIT_KEY_PROCESS_NAME: &str = "process_name";

// ----------------------------------------------------------------------
// Body reader
// ----------------------------------------------------------------------

/// Cursor over a frame body slice.
///
/// All reads are gated; running short yields a `ShortRead` carrying
/// what was needed and what was left.
pub struct BodyReader {
    buf: Bytes,
    pos: usize,
}

impl BodyReader {
    /// Wrap a body slice.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    /// Unconsumed bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(FramewireError::ShortRead {
                needed: n,
                avail: self.remaining(),
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Read exactly `n` raw bytes (zero-copy slice of the body).
    fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    /// Read a `~1` field.
    fn read_prefixed1(&mut self) -> Result<Bytes> {
        let len = self.read_u8()? as usize;
        self.read_exact(len)
    }

    /// Read a `~2` field.
    fn read_prefixed2(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        self.read_exact(len)
    }
}

fn put_prefixed1(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<()> {
    if value.len() > u8::MAX as usize {
        return Err(FramewireError::FieldTooLong {
            field,
            len: value.len(),
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
    Ok(())
}

fn put_prefixed2(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(FramewireError::FieldTooLong {
            field,
            len: value.len(),
            max: u16::MAX as usize,
        });
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    Ok(())
}

// ----------------------------------------------------------------------
// Response codes
// ----------------------------------------------------------------------

/// Call response code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// Success; args carry the handler result.
    Ok = 0x00,
    /// The server gave up on the operation.
    Timeout = 0x01,
    /// The operation was cancelled.
    Cancelled = 0x02,
    /// The server refused the operation under load.
    Busy = 0x03,
    /// Transport failure; do not retry.
    SocketErrorNoRetries = 0x04,
    /// Transport failure.
    SocketError = 0x05,
    /// The handler failed; `arg1` carries the serialized error envelope.
    AppError = 0x06,
}

impl ResponseCode {
    /// Decode a response code byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ResponseCode::Ok),
            0x01 => Ok(ResponseCode::Timeout),
            0x02 => Ok(ResponseCode::Cancelled),
            0x03 => Ok(ResponseCode::Busy),
            0x04 => Ok(ResponseCode::SocketErrorNoRetries),
            0x05 => Ok(ResponseCode::SocketError),
            0x06 => Ok(ResponseCode::AppError),
            other => Err(FramewireError::InvalidResponseCode(other)),
        }
    }

    /// The wire byte for this code.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------
// Transport headers
// ----------------------------------------------------------------------

/// Ordered transport header pairs for call bodies.
///
/// The wire permits duplicate keys but leaves their semantics
/// undefined; decode rejects them so header maps stay well-defined.
pub type CallHeaders = Vec<(Bytes, Bytes)>;

fn read_call_headers(reader: &mut BodyReader) -> Result<CallHeaders> {
    let nh = reader.read_u8()? as usize;
    let mut headers: CallHeaders = Vec::with_capacity(nh);
    for _ in 0..nh {
        let key = reader.read_prefixed1()?;
        let value = reader.read_prefixed1()?;
        if headers.iter().any(|(k, _)| k == &key) {
            return Err(FramewireError::DuplicateHeaderKey(
                String::from_utf8_lossy(&key).into_owned(),
            ));
        }
        headers.push((key, value));
    }
    Ok(headers)
}

fn write_call_headers(buf: &mut BytesMut, headers: &CallHeaders) -> Result<()> {
    if headers.len() > u8::MAX as usize {
        return Err(FramewireError::FieldTooLong {
            field: "headers",
            len: headers.len(),
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(headers.len() as u8);
    for (key, value) in headers {
        put_prefixed1(buf, "header key", key)?;
        put_prefixed1(buf, "header value", value)?;
    }
    Ok(())
}

fn read_checksum(reader: &mut BodyReader) -> Result<Checksum> {
    let checksum_type = ChecksumType::from_u8(reader.read_u8()?)?;
    let value = if checksum_type.carries_value() {
        reader.read_u32()?
    } else {
        0
    };
    Ok(Checksum::from_wire(checksum_type, value))
}

// ----------------------------------------------------------------------
// Init bodies
// ----------------------------------------------------------------------

/// Handshake body shared by InitRequest and InitResponse.
///
/// `version:u16be · nh:u16be · (hk~2 hv~2){nh}` with exactly the two
/// required keys. Decode accepts the general nh-prefixed form but
/// rejects unknown keys, duplicates, and missing required keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBody {
    /// Protocol version; always [`PROTOCOL_VERSION`] on encode.
    pub version: u16,
    /// The sender's listener address, `host:port`.
    pub host_port: String,
    /// Free-form sender identifier.
    pub process_name: String,
}

impl InitBody {
    /// Build an init body announcing this node.
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            host_port: host_port.into(),
            process_name: process_name.into(),
        }
    }

    /// Encode into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.version);
        buf.put_u16(2);
        put_prefixed2(buf, "init key", INIT_KEY_HOST_PORT.as_bytes())?;
        put_prefixed2(buf, "init value", self.host_port.as_bytes())?;
        put_prefixed2(buf, "init key", INIT_KEY_PROCESS_NAME.as_bytes())?;
        put_prefixed2(buf, "init value", self.process_name.as_bytes())?;
        Ok(())
    }

    /// Decode from a body reader.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        let version = reader.read_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(FramewireError::UnsupportedVersion(version));
        }

        let nh = reader.read_u16()? as usize;
        let mut host_port: Option<String> = None;
        let mut process_name: Option<String> = None;
        for _ in 0..nh {
            let key = reader.read_prefixed2()?;
            let value = reader.read_prefixed2()?;
            let slot = match &key[..] {
                k if k == INIT_KEY_HOST_PORT.as_bytes() => &mut host_port,
                k if k == INIT_KEY_PROCESS_NAME.as_bytes() => &mut process_name,
                _ => {
                    return Err(FramewireError::InvalidInitHeader(
                        String::from_utf8_lossy(&key).into_owned(),
                    ));
                }
            };
            if slot.is_some() {
                return Err(FramewireError::DuplicateInitHeader(
                    String::from_utf8_lossy(&key).into_owned(),
                ));
            }
            *slot = Some(String::from_utf8_lossy(&value).into_owned());
        }

        Ok(Self {
            version,
            host_port: host_port
                .ok_or(FramewireError::MissingInitHeader(INIT_KEY_HOST_PORT))?,
            process_name: process_name
                .ok_or(FramewireError::MissingInitHeader(INIT_KEY_PROCESS_NAME))?,
        })
    }
}

// ----------------------------------------------------------------------
// Call bodies
// ----------------------------------------------------------------------

/// CallRequest body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequestBody {
    /// Deadline for the operation, in milliseconds.
    pub ttl_ms: u32,
    /// Opaque tracing bytes, carried through untouched.
    pub tracing: [u8; TRACING_LEN],
    /// Logical service name; carried but not used for dispatch.
    pub service: Bytes,
    /// Transport headers.
    pub headers: CallHeaders,
    /// Endpoint name.
    pub arg1: Bytes,
    /// Application headers.
    pub arg2: Bytes,
    /// Application body.
    pub arg3: Bytes,
    /// Arg checksum.
    pub checksum: Checksum,
}

impl CallRequestBody {
    /// Build a call request, computing the arg checksum.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ttl_ms: u32,
        tracing: [u8; TRACING_LEN],
        service: Bytes,
        headers: CallHeaders,
        arg1: Bytes,
        arg2: Bytes,
        arg3: Bytes,
        checksum_type: ChecksumType,
    ) -> Result<Self> {
        let checksum = Checksum::compute(checksum_type, &arg1, &arg2, &arg3)?;
        Ok(Self {
            ttl_ms,
            tracing,
            service,
            headers,
            arg1,
            arg2,
            arg3,
            checksum,
        })
    }

    /// Encode into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.ttl_ms);
        buf.put_slice(&self.tracing);
        put_prefixed2(buf, "service", &self.service)?;
        write_call_headers(buf, &self.headers)?;
        put_prefixed2(buf, "arg1", &self.arg1)?;
        put_prefixed2(buf, "arg2", &self.arg2)?;
        put_prefixed2(buf, "arg3", &self.arg3)?;
        self.checksum.write(buf);
        Ok(())
    }

    /// Decode from a body reader, verifying the arg checksum.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        let ttl_ms = reader.read_u32()?;
        let tracing_bytes = reader.read_exact(TRACING_LEN)?;
        let mut tracing = [0u8; TRACING_LEN];
        tracing.copy_from_slice(&tracing_bytes);
        let service = reader.read_prefixed2()?;
        let headers = read_call_headers(reader)?;
        let arg1 = reader.read_prefixed2()?;
        let arg2 = reader.read_prefixed2()?;
        let arg3 = reader.read_prefixed2()?;
        let checksum = read_checksum(reader)?;
        checksum.verify(&arg1, &arg2, &arg3)?;
        Ok(Self {
            ttl_ms,
            tracing,
            service,
            headers,
            arg1,
            arg2,
            arg3,
            checksum,
        })
    }
}

/// CallResponse body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponseBody {
    /// Outcome code.
    pub code: ResponseCode,
    /// Transport headers.
    pub headers: CallHeaders,
    /// Echoed endpoint name on success; serialized error envelope on
    /// application failure.
    pub arg1: Bytes,
    /// Application headers.
    pub arg2: Bytes,
    /// Application body.
    pub arg3: Bytes,
    /// Arg checksum.
    pub checksum: Checksum,
}

impl CallResponseBody {
    /// Build a call response, computing the arg checksum.
    pub fn new(
        code: ResponseCode,
        headers: CallHeaders,
        arg1: Bytes,
        arg2: Bytes,
        arg3: Bytes,
        checksum_type: ChecksumType,
    ) -> Result<Self> {
        let checksum = Checksum::compute(checksum_type, &arg1, &arg2, &arg3)?;
        Ok(Self {
            code,
            headers,
            arg1,
            arg2,
            arg3,
            checksum,
        })
    }

    /// Encode into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.code.as_u8());
        write_call_headers(buf, &self.headers)?;
        put_prefixed2(buf, "arg1", &self.arg1)?;
        put_prefixed2(buf, "arg2", &self.arg2)?;
        put_prefixed2(buf, "arg3", &self.arg3)?;
        self.checksum.write(buf);
        Ok(())
    }

    /// Decode from a body reader, verifying the arg checksum.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        let code = ResponseCode::from_u8(reader.read_u8()?)?;
        let headers = read_call_headers(reader)?;
        let arg1 = reader.read_prefixed2()?;
        let arg2 = reader.read_prefixed2()?;
        let arg3 = reader.read_prefixed2()?;
        let checksum = read_checksum(reader)?;
        checksum.verify(&arg1, &arg2, &arg3)?;
        Ok(Self {
            code,
            headers,
            arg1,
            arg2,
            arg3,
            checksum,
        })
    }
}

// ----------------------------------------------------------------------
// Error body
// ----------------------------------------------------------------------

/// Protocol-level error frame body: `code:u8 · message~2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    /// Error code; mirrors [`ResponseCode`] values.
    pub code: u8,
    /// Human-readable message.
    pub message: String,
}

impl ErrorBody {
    /// Build an error body.
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Encode into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.code);
        put_prefixed2(buf, "error message", self.message.as_bytes())?;
        Ok(())
    }

    /// Decode from a body reader.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        let code = reader.read_u8()?;
        let message = reader.read_prefixed2()?;
        Ok(Self {
            code,
            message: String::from_utf8_lossy(&message).into_owned(),
        })
    }
}

// ----------------------------------------------------------------------
// Body dispatch
// ----------------------------------------------------------------------

/// A typed frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    InitRequest(InitBody),
    InitResponse(InitBody),
    CallRequest(CallRequestBody),
    CallResponse(CallResponseBody),
    Error(ErrorBody),
}

impl FrameBody {
    /// The frame type this body encodes as.
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::InitRequest(_) => FrameType::InitRequest,
            FrameBody::InitResponse(_) => FrameType::InitResponse,
            FrameBody::CallRequest(_) => FrameType::CallRequest,
            FrameBody::CallResponse(_) => FrameType::CallResponse,
            FrameBody::Error(_) => FrameType::Error,
        }
    }

    /// Encode into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            FrameBody::InitRequest(body) | FrameBody::InitResponse(body) => {
                body.encode_into(buf)
            }
            FrameBody::CallRequest(body) => body.encode_into(buf),
            FrameBody::CallResponse(body) => body.encode_into(buf),
            FrameBody::Error(body) => body.encode_into(buf),
        }
    }

    /// Decode the body for `frame_type` from a reader.
    pub fn decode(frame_type: FrameType, reader: &mut BodyReader) -> Result<Self> {
        match frame_type {
            FrameType::InitRequest => Ok(FrameBody::InitRequest(InitBody::decode(reader)?)),
            FrameType::InitResponse => Ok(FrameBody::InitResponse(InitBody::decode(reader)?)),
            FrameType::CallRequest => {
                Ok(FrameBody::CallRequest(CallRequestBody::decode(reader)?))
            }
            FrameType::CallResponse => {
                Ok(FrameBody::CallResponse(CallResponseBody::decode(reader)?))
            }
            FrameType::Error => Ok(FrameBody::Error(ErrorBody::decode(reader)?)),
        }
    }
}
