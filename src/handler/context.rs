//! Response context for endpoint handlers.
//!
//! A context is minted per inbound call and handed to the handler.
//! `respond` is idempotent: the first invocation builds and writes the
//! CallResponse; any further invocation is a no-op with a warning. A
//! response for an operation the sweeper already evicted is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::checksum::ChecksumType;
use crate::codec::{ErrorEnvelope, WireError};
use crate::connection::InboundOps;
use crate::error::Result;
use crate::protocol::{CallResponseBody, Frame, FrameBody, ResponseCode};
use crate::writer::WriterHandle;

/// What a handler produced: response args, or an application error.
pub type HandlerOutcome = std::result::Result<(Bytes, Bytes), WireError>;

/// Context passed to endpoint handlers for responding.
///
/// Cloneable; clones share the one-shot respond state.
#[derive(Clone)]
pub struct ResponseContext {
    /// Frame id of the request; the response echoes it.
    frame_id: u32,
    /// The request's `arg1`, echoed on success.
    request_arg1: Bytes,
    /// Checksum type reused from the request.
    checksum_type: ChecksumType,
    /// Writer handle for the owning connection.
    writer: WriterHandle,
    /// The connection's inbound op table.
    in_ops: InboundOps,
    /// The connection's closing flag.
    closing: Arc<AtomicBool>,
    /// Set once a response has been emitted through any clone.
    responded: Arc<AtomicBool>,
}

impl ResponseContext {
    pub(crate) fn new(
        frame_id: u32,
        request_arg1: Bytes,
        checksum_type: ChecksumType,
        writer: WriterHandle,
        in_ops: InboundOps,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            frame_id,
            request_arg1,
            checksum_type,
            writer,
            in_ops,
            closing,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Frame id of the request being served.
    #[inline]
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Build and write the CallResponse.
    ///
    /// `Ok((arg2, arg3))` responds with code ok and the request's
    /// `arg1` echoed; `Err` responds with code app-error and the
    /// serialized error envelope in `arg1`. The request's checksum
    /// type is reused either way.
    pub async fn respond(&self, outcome: HandlerOutcome) -> Result<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            tracing::warn!(frame_id = self.frame_id, "response already sent, ignoring");
            return Ok(());
        }
        if self.in_ops.lock().remove(&self.frame_id).is_none() {
            // Evicted by the sweeper or a reset.
            tracing::warn!(frame_id = self.frame_id, "operation evicted, response discarded");
            return Ok(());
        }
        if self.closing.load(Ordering::Acquire) {
            tracing::debug!(frame_id = self.frame_id, "connection closing, response discarded");
            return Ok(());
        }

        let body = match outcome {
            Ok((arg2, arg3)) => CallResponseBody::new(
                ResponseCode::Ok,
                Vec::new(),
                self.request_arg1.clone(),
                arg2,
                arg3,
                self.checksum_type,
            )?,
            Err(err) => {
                let arg1 = ErrorEnvelope::Error(err).encode()?;
                CallResponseBody::new(
                    ResponseCode::AppError,
                    Vec::new(),
                    arg1,
                    Bytes::new(),
                    Bytes::new(),
                    self.checksum_type,
                )?
            }
        };
        let frame = Frame::new(self.frame_id, FrameBody::CallResponse(body));
        self.writer.send(frame.encode()?).await
    }

    /// Shorthand for failing with an application error.
    pub async fn fail(&self, err: WireError) -> Result<()> {
        self.respond(Err(err)).await
    }
}
