//! End-to-end scenarios over in-memory duplex links.
//!
//! Two channels are wired together with a dialer that hands the far
//! end of a `tokio::io::duplex` pair to the target channel's `accept`.
//! Timeout scenarios run under paused time so the sweeper is
//! deterministic.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use framewire::protocol::{
    CallRequestBody, ChunkReader, Frame, FrameBody, InitBody, ResponseCode, TRACING_LEN,
};
use framewire::transport::{BoxedDuplex, DialFuture, Dialer};
use framewire::{
    Channel, ChannelConfig, ChannelEvent, ChecksumType, FramewireError, SendOptions,
};

const A_HOST: &str = "127.0.0.1:4040";
const B_HOST: &str = "127.0.0.1:4041";

/// Dialer that routes to other channels by their `host:port`.
fn mesh_dialer(targets: &[&Channel]) -> Box<dyn Dialer> {
    let targets: HashMap<String, Channel> = targets
        .iter()
        .map(|ch| (ch.host_port().to_string(), (*ch).clone()))
        .collect();
    Box::new(move |addr: &str| -> DialFuture {
        let target = targets.get(addr).cloned();
        let addr = addr.to_string();
        Box::pin(async move {
            let target = target
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, addr.clone()))?;
            let (near, far) = tokio::io::duplex(64 * 1024);
            target
                .accept(Box::new(far), "inbound")
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok(Box::new(near) as BoxedDuplex)
        })
    })
}

fn node_a(peers: &[&Channel]) -> Channel {
    Channel::with_dialer(ChannelConfig::new(A_HOST, "A[1]"), mesh_dialer(peers))
}

fn node_b() -> Channel {
    Channel::new(ChannelConfig::new(B_HOST, "B[1]"))
}

fn register_echo(channel: &Channel) {
    channel
        .register("echo", |call, ctx| async move {
            let _ = ctx.respond(Ok((call.arg2, call.arg3))).await;
        })
        .unwrap();
}

/// Wait for a specific event, failing the test on timeout.
async fn expect_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<ChannelEvent>,
    mut matches: F,
) -> ChannelEvent
where
    F: FnMut(&ChannelEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Read one frame off a raw duplex end.
async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> Frame {
    let mut reader = ChunkReader::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream closed before a frame arrived");
        let mut items = reader.push(Bytes::copy_from_slice(&buf[..n]));
        if let Some(item) = items.pop() {
            return Frame::decode(item.unwrap()).unwrap();
        }
    }
}

// ----------------------------------------------------------------------
// Scenario 1: handshake
// ----------------------------------------------------------------------

#[tokio::test]
async fn handshake_identifies_both_sides() {
    let b = node_b();
    let a = node_a(&[&b]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let conn = a.connect(B_HOST).await.unwrap();
    conn.await_identified().await.unwrap();
    assert_eq!(conn.remote_name().as_deref(), Some(B_HOST));

    let identified = expect_event(&mut a_events, |e| {
        matches!(e, ChannelEvent::Identified { .. })
    })
    .await;
    let ChannelEvent::Identified {
        host_port,
        process_name,
        ..
    } = identified
    else {
        unreachable!();
    };
    assert_eq!(host_port, B_HOST);
    assert_eq!(process_name, "B[1]");

    expect_event(&mut b_events, |e| {
        matches!(e, ChannelEvent::Identified { host_port, .. } if host_port == A_HOST)
    })
    .await;

    // B registered the inbound connection under A's advertised name.
    let b_conn = b.get_peer(A_HOST).expect("inbound peer registered");
    assert_eq!(b_conn.remote_name().as_deref(), Some(A_HOST));
}

#[tokio::test]
async fn raw_handshake_wire_shape() {
    let b = node_b();
    let (mut raw, far) = tokio::io::duplex(4096);
    b.accept(Box::new(far), "inbound").unwrap();

    // InitRequest with frame id 1, flags 0.
    let init = Frame::new(1, FrameBody::InitRequest(InitBody::new(A_HOST, "A[1]")));
    raw.write_all(&init.encode().unwrap()).await.unwrap();

    let reply = read_frame(&mut raw).await;
    assert_eq!(reply.id, 1);
    assert_eq!(reply.flags, 0);
    let FrameBody::InitResponse(body) = reply.body else {
        panic!("expected init response, got {:?}", reply.body);
    };
    assert_eq!(body.host_port, B_HOST);
    assert_eq!(body.process_name, "B[1]");
}

// ----------------------------------------------------------------------
// Scenario 2: echo call
// ----------------------------------------------------------------------

#[tokio::test]
async fn echo_call_roundtrips_args() {
    let b = node_b();
    register_echo(&b);
    let a = node_a(&[&b]);

    let (arg2, arg3) = a
        .send(
            SendOptions::to(B_HOST).timeout_ms(1000),
            "echo",
            "h",
            "hello",
        )
        .await
        .unwrap();

    assert_eq!(&arg2[..], b"h");
    assert_eq!(&arg3[..], b"hello");
}

#[tokio::test]
async fn response_echoes_request_arg1_on_the_wire() {
    let b = node_b();
    register_echo(&b);

    let (mut raw, far) = tokio::io::duplex(4096);
    b.accept(Box::new(far), "inbound").unwrap();

    let init = Frame::new(1, FrameBody::InitRequest(InitBody::new(A_HOST, "A[1]")));
    raw.write_all(&init.encode().unwrap()).await.unwrap();
    read_frame(&mut raw).await;

    let call = CallRequestBody::new(
        1000,
        [0u8; TRACING_LEN],
        Bytes::from_static(b"svc"),
        Vec::new(),
        Bytes::from_static(b"echo"),
        Bytes::from_static(b"h"),
        Bytes::from_static(b"hello"),
        ChecksumType::Crc32,
    )
    .unwrap();
    let frame = Frame::new(2, FrameBody::CallRequest(call));
    raw.write_all(&frame.encode().unwrap()).await.unwrap();

    let response = read_frame(&mut raw).await;
    assert_eq!(response.id, 2);
    let FrameBody::CallResponse(body) = response.body else {
        panic!("expected call response");
    };
    assert_eq!(body.code, ResponseCode::Ok);
    assert_eq!(&body.arg1[..], b"echo");
    assert_eq!(&body.arg2[..], b"h");
    assert_eq!(&body.arg3[..], b"hello");
    // The response reuses the request's checksum type.
    assert_eq!(body.checksum.checksum_type(), ChecksumType::Crc32);
}

#[tokio::test]
async fn concurrent_calls_demultiplex_by_id() {
    let b = node_b();
    register_echo(&b);
    let a = Arc::new(node_a(&[&b]));

    let mut joins = Vec::new();
    for i in 0..10u32 {
        let a = a.clone();
        joins.push(tokio::spawn(async move {
            let payload = format!("payload-{i}");
            let (_, arg3) = a
                .send(
                    SendOptions::to(B_HOST).timeout_ms(1000),
                    "echo",
                    "",
                    payload.clone(),
                )
                .await
                .unwrap();
            assert_eq!(&arg3[..], payload.as_bytes());
        }));
    }
    for join in joins {
        join.await.unwrap();
    }
}

// ----------------------------------------------------------------------
// Scenario 3: unknown endpoint
// ----------------------------------------------------------------------

#[tokio::test]
async fn unknown_endpoint_yields_application_error() {
    let b = node_b();
    let a = node_a(&[&b]);

    let err = a
        .send(SendOptions::to(B_HOST).timeout_ms(1000), "missing", "", "")
        .await
        .unwrap_err();

    let FramewireError::Application(wire_err) = err else {
        panic!("expected application error, got {err}");
    };
    assert_eq!(wire_err.name, "Error");
    assert_eq!(wire_err.message, "no such operation");
    assert_eq!(wire_err.properties["op"], "missing");
}

// ----------------------------------------------------------------------
// Scenario 4: timeout
// ----------------------------------------------------------------------

fn register_black_hole(channel: &Channel) {
    channel
        .register("never", |_call, _ctx| async move {
            // Deliberately never responds; the context is dropped.
        })
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn timed_out_call_fails_and_is_evicted() {
    let b = node_b();
    register_black_hole(&b);
    register_echo(&b);
    let a = node_a(&[&b]);

    let err = a
        .send(SendOptions::to(B_HOST).timeout_ms(50), "never", "", "")
        .await
        .unwrap_err();
    assert!(matches!(err, FramewireError::Timeout(50)), "got {err}");

    let a_conn = a.get_peer(B_HOST).unwrap();
    assert_eq!(a_conn.pending_outbound(), 0);

    // A successful call clears the escalation witness before the next
    // sweep can tear the link down.
    a.send(SendOptions::to(B_HOST).timeout_ms(1000), "echo", "", "ok")
        .await
        .unwrap();

    // The served-but-never-answered call on B is pruned by B's own
    // sweeper once it outlives the server timeout.
    let b_conn = b.get_peer(A_HOST).unwrap();
    assert_eq!(b_conn.pending_inbound(), 1);
    tokio::time::sleep(Duration::from_millis(7000)).await;
    assert_eq!(b_conn.pending_inbound(), 0);
    assert!(!b_conn.is_closing());
}

#[tokio::test(start_paused = true)]
async fn persistent_timeouts_escalate_to_reset() {
    let b = node_b();
    register_black_hole(&b);
    let a = node_a(&[&b]);
    let mut a_events = a.subscribe();

    let err = a
        .send(SendOptions::to(B_HOST).timeout_ms(50), "never", "", "")
        .await
        .unwrap_err();
    assert!(matches!(err, FramewireError::Timeout(_)));

    // No frame arrives to clear the witness; the next sweep destroys
    // the socket.
    let event = expect_event(&mut a_events, |e| {
        matches!(e, ChannelEvent::ConnectionClosed { .. })
    })
    .await;
    let ChannelEvent::ConnectionClosed { reason, .. } = event else {
        unreachable!();
    };
    assert!(reason.contains("timeouts"), "reason: {reason}");
    assert!(a.get_peer(B_HOST).is_none());
}

// ----------------------------------------------------------------------
// Scenario 5: premature call
// ----------------------------------------------------------------------

#[tokio::test]
async fn call_before_init_resets_connection() {
    let b = node_b();
    register_echo(&b);
    let mut b_events = b.subscribe();

    let (mut raw, far) = tokio::io::duplex(4096);
    b.accept(Box::new(far), "inbound").unwrap();

    // A call request with no init first.
    let call = CallRequestBody::new(
        1000,
        [0u8; TRACING_LEN],
        Bytes::new(),
        Vec::new(),
        Bytes::from_static(b"echo"),
        Bytes::new(),
        Bytes::new(),
        ChecksumType::None,
    )
    .unwrap();
    let frame = Frame::new(1, FrameBody::CallRequest(call));
    raw.write_all(&frame.encode().unwrap()).await.unwrap();

    let event = expect_event(&mut b_events, |e| {
        matches!(e, ChannelEvent::ConnectionClosed { .. })
    })
    .await;
    let ChannelEvent::ConnectionClosed { reason, .. } = event else {
        unreachable!();
    };
    assert!(reason.contains("call request before init"), "reason: {reason}");

    // The caller observes the socket closing.
    let mut probe = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut probe))
        .await
        .expect("socket close not observed")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn error_frame_before_init_resets_connection() {
    let b = node_b();
    let mut b_events = b.subscribe();

    let (mut raw, far) = tokio::io::duplex(4096);
    b.accept(Box::new(far), "inbound").unwrap();

    // An error frame with no init first; it completes an operation the
    // way a call response does, so the same guard applies.
    let frame = Frame::new(
        1,
        FrameBody::Error(framewire::protocol::ErrorBody::new(0x03, "busy")),
    );
    raw.write_all(&frame.encode().unwrap()).await.unwrap();

    let event = expect_event(&mut b_events, |e| {
        matches!(e, ChannelEvent::ConnectionClosed { .. })
    })
    .await;
    let ChannelEvent::ConnectionClosed { reason, .. } = event else {
        unreachable!();
    };
    assert!(
        reason.contains("call response before init"),
        "reason: {reason}"
    );

    // The sender observes the socket closing.
    let mut probe = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut probe))
        .await
        .expect("socket close not observed")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn duplicate_init_request_resets_connection() {
    let b = node_b();
    let mut b_events = b.subscribe();

    let (mut raw, far) = tokio::io::duplex(4096);
    b.accept(Box::new(far), "inbound").unwrap();

    let init = Frame::new(1, FrameBody::InitRequest(InitBody::new(A_HOST, "A[1]")));
    raw.write_all(&init.encode().unwrap()).await.unwrap();
    read_frame(&mut raw).await;

    let again = Frame::new(2, FrameBody::InitRequest(InitBody::new(A_HOST, "A[1]")));
    raw.write_all(&again.encode().unwrap()).await.unwrap();

    let event = expect_event(&mut b_events, |e| {
        matches!(e, ChannelEvent::ConnectionClosed { .. })
    })
    .await;
    let ChannelEvent::ConnectionClosed { reason, .. } = event else {
        unreachable!();
    };
    assert!(reason.contains("duplicate init request"), "reason: {reason}");
    assert!(b.get_peer(A_HOST).is_none(), "peer spliced out after reset");
}

#[tokio::test]
async fn peer_shutdown_fails_pending_operations() {
    let b = node_b();
    register_black_hole(&b);
    let a = node_a(&[&b]);

    let pending = {
        let a = a.clone();
        tokio::spawn(async move {
            a.send(SendOptions::to(B_HOST).timeout_ms(60_000), "never", "", "")
                .await
        })
    };

    // Let the call reach B, then tear B down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.quit().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    let err = outcome.unwrap_err();
    assert!(
        matches!(err, FramewireError::ConnectionReset(_)),
        "got {err}"
    );
}

// ----------------------------------------------------------------------
// Scenario 6: frame partition invariance
// ----------------------------------------------------------------------

#[tokio::test]
async fn recorded_conversation_is_partition_invariant() {
    // The byte stream of a handshake plus an echo call, as one side
    // would observe interleaved traffic.
    let frames = vec![
        Frame::new(1, FrameBody::InitRequest(InitBody::new(A_HOST, "A[1]"))),
        Frame::new(1, FrameBody::InitResponse(InitBody::new(B_HOST, "B[1]"))),
        Frame::new(
            2,
            FrameBody::CallRequest(
                CallRequestBody::new(
                    1000,
                    [0u8; TRACING_LEN],
                    Bytes::from_static(b"svc"),
                    Vec::new(),
                    Bytes::from_static(b"echo"),
                    Bytes::from_static(b"h"),
                    Bytes::from_static(b"hello"),
                    ChecksumType::Crc32,
                )
                .unwrap(),
            ),
        ),
        Frame::new(
            2,
            FrameBody::CallResponse(
                framewire::protocol::CallResponseBody::new(
                    ResponseCode::Ok,
                    Vec::new(),
                    Bytes::from_static(b"echo"),
                    Bytes::from_static(b"h"),
                    Bytes::from_static(b"hello"),
                    ChecksumType::Crc32,
                )
                .unwrap(),
            ),
        ),
    ];
    let mut wire = Vec::new();
    for frame in &frames {
        wire.extend_from_slice(&frame.encode().unwrap());
    }

    // All at once.
    let mut reader = ChunkReader::new();
    let whole: Vec<Frame> = reader
        .push(Bytes::from(wire.clone()))
        .into_iter()
        .map(|item| Frame::decode(item.unwrap()).unwrap())
        .collect();
    assert_eq!(whole, frames);

    // One byte at a time.
    let mut reader = ChunkReader::new();
    let mut trickled = Vec::new();
    for byte in &wire {
        for item in reader.push(Bytes::copy_from_slice(&[*byte])) {
            trickled.push(Frame::decode(item.unwrap()).unwrap());
        }
    }
    assert_eq!(trickled, frames);
}
