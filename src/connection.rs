//! Per-link connection state machine.
//!
//! A connection owns one byte-duplex and multiplexes many in-flight
//! operations over it, keyed by frame id. The read loop is the only
//! frame decoder; handlers run on their own scheduler turns; writes
//! funnel through the dedicated writer task. Shared state sits behind
//! per-connection locks, so parsing, timer fires, and handler
//! completions never race.
//!
//! Lifecycle: outbound connections emit an InitRequest immediately;
//! call traffic in either direction is rejected until the handshake
//! names the remote. `reset_all` is the single terminal cleanup, fed
//! by socket errors, protocol violations, sweeper escalation, and
//! channel shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::channel::{ChannelConfig, ChannelEvent, ChannelInner};
use crate::codec::{ErrorEnvelope, WireError};
use crate::error::{FramewireError, Result};
use crate::handler::{InboundCall, ResponseContext};
use crate::protocol::{
    CallRequestBody, CallResponseBody, ChunkReader, ErrorBody, Frame, FrameBody, InitBody,
    ResponseCode,
};
use crate::transport::BoxedDuplex;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Result delivered to an outbound call's sink: `(arg2, arg3)` on
/// success, or the error that completed the operation.
pub type CallOutcome = Result<(Bytes, Bytes)>;

/// Handshake progress, observed through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Pending,
    Identified,
    Closed,
}

/// An in-flight outbound operation.
#[derive(Debug)]
struct OutboundOp {
    start: Instant,
    ttl: Duration,
    sink: oneshot::Sender<CallOutcome>,
}

/// Bookkeeping for a call being served.
#[derive(Debug)]
pub(crate) struct InboundOp {
    pub(crate) start: Instant,
}

/// The inbound op table, shared with response contexts.
pub(crate) type InboundOps = Arc<Mutex<HashMap<u32, InboundOp>>>;

/// A live link to one peer.
#[derive(Debug)]
pub struct Connection {
    self_ref: Weak<Connection>,
    channel: Weak<ChannelInner>,
    config: ChannelConfig,
    direction: Direction,
    remote_addr: String,
    writer: WriterHandle,
    /// Set once; no frame emission afterwards.
    closing: Arc<AtomicBool>,
    /// Last issued frame id; the allocator wraps at 2^32.
    last_frame_id: AtomicU32,
    /// Set when a sweep timed out at least one op; cleared by any
    /// received frame. A second sweep seeing it set escalates to reset.
    last_timeout_witness: Mutex<Option<Instant>>,
    /// The remote's `host:port`, filled by the handshake.
    remote_name: Mutex<Option<String>>,
    phase: watch::Sender<ConnPhase>,
    out_ops: Mutex<HashMap<u32, OutboundOp>>,
    in_ops: InboundOps,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Connection {
    /// Create a connection over a duplex and start its tasks.
    ///
    /// Outbound connections immediately emit an InitRequest with frame
    /// id 1 and no flags.
    pub(crate) fn spawn(
        channel: &Arc<ChannelInner>,
        duplex: BoxedDuplex,
        direction: Direction,
        remote_addr: String,
    ) -> Arc<Connection> {
        let (read_half, write_half) = tokio::io::split(duplex);
        let (writer, writer_task) = spawn_writer_task(write_half);
        let (phase_tx, _) = watch::channel(ConnPhase::Pending);

        let conn = Arc::new_cyclic(|weak| Connection {
            self_ref: weak.clone(),
            channel: Arc::downgrade(channel),
            config: channel.config().clone(),
            direction,
            remote_addr,
            writer,
            closing: Arc::new(AtomicBool::new(false)),
            last_frame_id: AtomicU32::new(0),
            last_timeout_witness: Mutex::new(None),
            remote_name: Mutex::new(None),
            phase: phase_tx,
            out_ops: Mutex::new(HashMap::new()),
            in_ops: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        });

        if direction == Direction::Outbound {
            let init = InitBody::new(&conn.config.host_port, &conn.config.process_name);
            let id = conn.next_frame_id();
            match Frame::new(id, FrameBody::InitRequest(init)).encode() {
                Ok(bytes) => {
                    if let Err(err) = conn.writer.try_send(bytes) {
                        tracing::warn!(remote = %conn.remote_addr, %err, "init request not queued");
                    }
                }
                Err(err) => {
                    tracing::warn!(remote = %conn.remote_addr, %err, "init request encode failed");
                }
            }
        }

        let writer_abort = writer_task.abort_handle();
        let reader = {
            let conn = conn.clone();
            tokio::spawn(read_loop(conn, read_half))
        };
        let watchdog = {
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Ok(Err(err)) = writer_task.await {
                    conn.reset_all(err.to_string());
                }
            })
        };
        let sweeper = {
            let conn = conn.clone();
            tokio::spawn(sweeper_loop(conn))
        };

        conn.tasks.lock().extend([
            writer_abort,
            reader.abort_handle(),
            watchdog.abort_handle(),
            sweeper.abort_handle(),
        ]);
        conn
    }

    /// Which side opened this connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The address this connection was dialed to or accepted from.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// The remote's advertised `host:port`, once identified.
    pub fn remote_name(&self) -> Option<String> {
        self.remote_name.lock().clone()
    }

    /// True once teardown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of in-flight outbound operations (diagnostics).
    pub fn pending_outbound(&self) -> usize {
        self.out_ops.lock().len()
    }

    /// Number of calls currently being served (diagnostics).
    pub fn pending_inbound(&self) -> usize {
        self.in_ops.lock().len()
    }

    /// Wait for the handshake to complete.
    pub async fn await_identified(&self) -> Result<()> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                ConnPhase::Identified => return Ok(()),
                ConnPhase::Closed => {
                    return Err(FramewireError::ConnectionReset(
                        "connection closed before identification".to_string(),
                    ));
                }
                ConnPhase::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(FramewireError::ConnectionReset(
                            "connection dropped".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Allocate the next frame id: monotonic, wrapping, first id 1.
    fn next_frame_id(&self) -> u32 {
        self.last_frame_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Send a call request and enrol its operation.
    ///
    /// The returned receiver resolves with the matching response, a
    /// timeout, or the connection's reset error.
    pub(crate) async fn send_call(
        &self,
        body: CallRequestBody,
    ) -> Result<oneshot::Receiver<CallOutcome>> {
        if self.is_closing() {
            return Err(FramewireError::ConnectionReset(
                "connection closing".to_string(),
            ));
        }
        let ttl = Duration::from_millis(u64::from(body.ttl_ms));
        let id = self.next_frame_id();
        let bytes = Frame::new(id, FrameBody::CallRequest(body)).encode()?;

        let (tx, rx) = oneshot::channel();
        self.out_ops.lock().insert(
            id,
            OutboundOp {
                start: Instant::now(),
                ttl,
                sink: tx,
            },
        );
        if let Err(err) = self.writer.send(bytes).await {
            self.out_ops.lock().remove(&id);
            return Err(err);
        }
        Ok(rx)
    }

    /// Dispatch one decoded frame.
    async fn on_frame(&self, frame: Frame) {
        if self.is_closing() {
            return;
        }
        // Any received frame clears the sweeper's escalation witness.
        *self.last_timeout_witness.lock() = None;

        match frame.body {
            FrameBody::InitRequest(init) => self.on_init_request(frame.id, init).await,
            FrameBody::InitResponse(init) => self.on_init_response(init),
            FrameBody::CallRequest(body) => self.on_call_request(frame.id, body),
            FrameBody::CallResponse(body) => self.on_call_response(frame.id, body),
            FrameBody::Error(body) => self.on_error(frame.id, body),
        }
    }

    async fn on_init_request(&self, frame_id: u32, init: InitBody) {
        {
            let mut remote_name = self.remote_name.lock();
            if remote_name.is_some() {
                drop(remote_name);
                self.reset_all(FramewireError::DuplicateInitRequest.to_string());
                return;
            }
            *remote_name = Some(init.host_port.clone());
        }

        if let (Some(channel), Some(me)) = (self.channel.upgrade(), self.self_ref.upgrade()) {
            channel.register_peer(&init.host_port, &me, self.direction);
            channel.emit(ChannelEvent::Identified {
                remote_addr: self.remote_addr.clone(),
                host_port: init.host_port.clone(),
                process_name: init.process_name.clone(),
            });
        }
        let _ = self.phase.send(ConnPhase::Identified);

        let reply = InitBody::new(&self.config.host_port, &self.config.process_name);
        match Frame::new(frame_id, FrameBody::InitResponse(reply)).encode() {
            Ok(bytes) => {
                if let Err(err) = self.writer.send(bytes).await {
                    self.reset_all(err.to_string());
                }
            }
            Err(err) => self.reset_all(err.to_string()),
        }
    }

    fn on_init_response(&self, init: InitBody) {
        {
            let mut remote_name = self.remote_name.lock();
            if remote_name.is_some() {
                drop(remote_name);
                self.reset_all(FramewireError::DuplicateInitResponse.to_string());
                return;
            }
            *remote_name = Some(init.host_port.clone());
        }

        if let Some(channel) = self.channel.upgrade() {
            channel.emit(ChannelEvent::Identified {
                remote_addr: self.remote_addr.clone(),
                host_port: init.host_port,
                process_name: init.process_name,
            });
        }
        let _ = self.phase.send(ConnPhase::Identified);
    }

    fn on_call_request(&self, frame_id: u32, body: CallRequestBody) {
        let caller = self.remote_name.lock().clone();
        let Some(caller) = caller else {
            self.reset_all(FramewireError::CallRequestBeforeInit.to_string());
            return;
        };

        self.in_ops.lock().insert(
            frame_id,
            InboundOp {
                start: Instant::now(),
            },
        );
        let ctx = ResponseContext::new(
            frame_id,
            body.arg1.clone(),
            body.checksum.checksum_type(),
            self.writer.clone(),
            self.in_ops.clone(),
            self.closing.clone(),
        );
        let call = InboundCall {
            arg2: body.arg2,
            arg3: body.arg3,
            caller,
        };

        // Handlers run on their own scheduler turn; frame decode never
        // observes a synchronous response.
        let handler = self.channel.upgrade().and_then(|ch| ch.endpoint(&body.arg1));
        match handler {
            Some(handler) => {
                tokio::spawn(handler.call(call, ctx));
            }
            None => {
                let op = String::from_utf8_lossy(&body.arg1).into_owned();
                tracing::debug!(endpoint = %op, "no handler registered");
                tokio::spawn(async move {
                    let err = WireError::new("no such operation")
                        .with_property("op", serde_json::Value::String(op));
                    let _ = ctx.fail(err).await;
                });
            }
        }
    }

    fn on_call_response(&self, frame_id: u32, body: CallResponseBody) {
        if self.remote_name.lock().is_none() {
            self.reset_all(FramewireError::CallResponseBeforeInit.to_string());
            return;
        }

        let op = self.out_ops.lock().remove(&frame_id);
        let Some(op) = op else {
            // Timed out or never ours; late responses are dropped.
            tracing::debug!(frame_id, "response for unknown operation dropped");
            return;
        };

        let outcome = match body.code {
            ResponseCode::Ok => Ok((body.arg2, body.arg3)),
            ResponseCode::AppError => match ErrorEnvelope::decode(&body.arg1) {
                Ok(envelope) => Err(FramewireError::Application(envelope.into_wire_error())),
                Err(err) => Err(err),
            },
            code => Err(FramewireError::Remote {
                code: code.as_u8(),
                message: String::from_utf8_lossy(&body.arg1).into_owned(),
            }),
        };
        let _ = op.sink.send(outcome);
    }

    fn on_error(&self, frame_id: u32, body: ErrorBody) {
        // Completes an operation exactly like a CallResponse, so the
        // same handshake guard applies.
        if self.remote_name.lock().is_none() {
            self.reset_all(FramewireError::CallResponseBeforeInit.to_string());
            return;
        }

        let op = self.out_ops.lock().remove(&frame_id);
        let Some(op) = op else {
            tracing::debug!(frame_id, code = body.code, "error frame for unknown operation");
            return;
        };
        let _ = op.sink.send(Err(FramewireError::Remote {
            code: body.code,
            message: body.message,
        }));
    }

    /// Interval to the next sweep: base plus uniform fuzz.
    fn sweep_interval(&self) -> Duration {
        let base = self.config.timeout_check_interval_ms;
        let fuzz = self.config.timeout_fuzz_ms;
        if fuzz == 0 {
            return Duration::from_millis(base);
        }
        let offset = rand::thread_rng().gen_range(0..=fuzz) as i64 - (fuzz / 2) as i64;
        Duration::from_millis(base.saturating_add_signed(offset).max(1))
    }

    /// One sweeper tick. Returns false when sweeping should stop.
    fn sweep_tick(&self) -> bool {
        if self.is_closing() {
            return false;
        }

        // A prior sweep timed out an op and no frame has arrived since:
        // the link itself is stuck.
        if self.last_timeout_witness.lock().is_some() {
            self.reset_all("destroying socket from timeouts".to_string());
            return false;
        }

        let now = Instant::now();
        let expired: Vec<(u32, OutboundOp)> = {
            let mut out_ops = self.out_ops.lock();
            let ids: Vec<u32> = out_ops
                .iter()
                .filter(|(_, op)| now.duration_since(op.start) > op.ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| out_ops.remove(&id).map(|op| (id, op)))
                .collect()
        };
        if !expired.is_empty() {
            *self.last_timeout_witness.lock() = Some(now);
        }
        for (id, op) in expired {
            tracing::debug!(frame_id = id, ttl_ms = op.ttl.as_millis() as u64, "operation timed out");
            let _ = op
                .sink
                .send(Err(FramewireError::Timeout(op.ttl.as_millis() as u64)));
        }

        // Served calls whose handlers never responded are pruned
        // without invoking anything.
        let server_timeout = Duration::from_millis(self.config.server_timeout_ms);
        self.in_ops
            .lock()
            .retain(|_, op| now.duration_since(op.start) <= server_timeout);

        true
    }

    /// Terminal cleanup. Idempotent.
    ///
    /// Marks the connection closing, cancels its tasks, drops served
    /// calls, fails every pending outbound op with the reset reason,
    /// and tells the channel to splice this connection out.
    pub fn reset_all(&self, reason: String) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(remote = %self.remote_addr, %reason, "connection reset");

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let _ = self.phase.send(ConnPhase::Closed);

        self.in_ops.lock().clear();
        let pending: Vec<OutboundOp> = {
            let mut out_ops = self.out_ops.lock();
            out_ops.drain().map(|(_, op)| op).collect()
        };
        for op in pending {
            let _ = op
                .sink
                .send(Err(FramewireError::ConnectionReset(reason.clone())));
        }

        if let (Some(channel), Some(me)) = (self.channel.upgrade(), self.self_ref.upgrade()) {
            channel.unregister_connection(&me);
            channel.emit(ChannelEvent::ConnectionClosed {
                remote_addr: self.remote_addr.clone(),
                remote_name: self.remote_name.lock().clone(),
                reason,
            });
        }
    }
}

/// Read side: chunks in, frames out, strictly in wire order.
async fn read_loop(conn: Arc<Connection>, mut reader: ReadHalf<BoxedDuplex>) {
    let mut chunks = ChunkReader::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let reason = match chunks.finish() {
                    Err(err) => err.to_string(),
                    Ok(()) => FramewireError::SocketClosed.to_string(),
                };
                conn.reset_all(reason);
                return;
            }
            Ok(n) => {
                for item in chunks.push(Bytes::copy_from_slice(&buf[..n])) {
                    match item.and_then(Frame::decode) {
                        Ok(frame) => conn.on_frame(frame).await,
                        Err(err) => {
                            // Any decode error is fatal at this layer.
                            tracing::warn!(remote = %conn.remote_addr, %err, "protocol violation");
                            conn.reset_all(err.to_string());
                            return;
                        }
                    }
                    if conn.is_closing() {
                        return;
                    }
                }
            }
            Err(err) => {
                conn.reset_all(FramewireError::Io(err).to_string());
                return;
            }
        }
    }
}

/// Timer side: fire, sweep, re-arm.
async fn sweeper_loop(conn: Arc<Connection>) {
    loop {
        tokio::time::sleep(conn.sweep_interval()).await;
        if !conn.sweep_tick() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_allocator_starts_at_one() {
        let last = AtomicU32::new(0);
        let next = |last: &AtomicU32| last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        assert_eq!(next(&last), 1);
        assert_eq!(next(&last), 2);
        assert_eq!(next(&last), 3);
    }

    #[test]
    fn test_frame_id_allocator_wraps() {
        let last = AtomicU32::new(u32::MAX - 1);
        let next = |last: &AtomicU32| last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        assert_eq!(next(&last), u32::MAX);
        assert_eq!(next(&last), 0);
        assert_eq!(next(&last), 1);
    }
}
