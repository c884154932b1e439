//! Channel hub: peer table, endpoint registry, dispatch, lifecycle.
//!
//! A channel is one symmetric node. It owns the endpoint registry
//! that serves inbound calls, the per-host connection lists, and the
//! configuration every connection inherits. Hosts hand accepted
//! sockets to [`Channel::accept`] and inject a [`Dialer`] for
//! outbound links; the channel itself never touches sockets.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::checksum::ChecksumType;
use crate::connection::{Connection, Direction};
use crate::error::{FramewireError, Result};
use crate::handler::{EndpointHandler, EndpointRegistry, InboundCall, ResponseContext};
use crate::protocol::{CallHeaders, CallRequestBody, TRACING_LEN};
use crate::transport::{BoxedDuplex, Dialer};

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// This node's listener address, announced in init bodies.
    pub host_port: String,
    /// Free-form identifier announced in init bodies.
    pub process_name: String,
    /// Default ttl for outbound calls, in milliseconds.
    pub default_ttl_ms: u32,
    /// Age after which served calls are pruned from the inbound table.
    pub server_timeout_ms: u64,
    /// Base interval between sweeper ticks.
    pub timeout_check_interval_ms: u64,
    /// Total uniform fuzz applied around the base interval.
    pub timeout_fuzz_ms: u64,
}

impl ChannelConfig {
    /// Configuration with the default timing knobs.
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            process_name: process_name.into(),
            default_ttl_ms: 5000,
            server_timeout_ms: 5000,
            timeout_check_interval_ms: 1000,
            timeout_fuzz_ms: 100,
        }
    }
}

/// Lifecycle events observable through [`Channel::subscribe`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A connection completed its handshake.
    Identified {
        /// Address the socket was dialed to or accepted from.
        remote_addr: String,
        /// The remote's advertised listener address.
        host_port: String,
        /// The remote's advertised process name.
        process_name: String,
    },
    /// A connection was torn down.
    ConnectionClosed {
        remote_addr: String,
        remote_name: Option<String>,
        reason: String,
    },
}

/// Options for an outbound call.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Target peer address. Required.
    pub host: String,
    /// Logical service name carried in the request.
    pub service: Bytes,
    /// Per-call ttl override; the channel default applies otherwise.
    pub timeout_ms: Option<u32>,
    /// Transport headers.
    pub headers: CallHeaders,
    /// Checksum algorithm for the args.
    pub checksum_type: ChecksumType,
    /// Opaque tracing bytes.
    pub tracing: [u8; TRACING_LEN],
}

impl SendOptions {
    /// Options targeting `host` with defaults everywhere else.
    pub fn to(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: Bytes::new(),
            timeout_ms: None,
            headers: Vec::new(),
            checksum_type: ChecksumType::Crc32,
            tracing: [0u8; TRACING_LEN],
        }
    }

    /// Set the logical service name.
    pub fn service(mut self, service: impl Into<Bytes>) -> Self {
        self.service = service.into();
        self
    }

    /// Set a per-call ttl in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Append a transport header.
    pub fn header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the checksum algorithm.
    pub fn checksum(mut self, checksum_type: ChecksumType) -> Self {
        self.checksum_type = checksum_type;
        self
    }
}

/// Shared hub state; connections hold a weak reference to it.
pub(crate) struct ChannelInner {
    config: ChannelConfig,
    dialer: Option<Box<dyn Dialer>>,
    /// `host:port` → ordered connections, outbound at the head.
    peers: Mutex<HashMap<String, VecDeque<Arc<Connection>>>>,
    endpoints: Mutex<EndpointRegistry>,
    events: broadcast::Sender<ChannelEvent>,
    destroyed: AtomicBool,
}

impl ChannelInner {
    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Resolve a handler for an `arg1` value.
    pub(crate) fn endpoint(&self, name: &[u8]) -> Option<Arc<dyn EndpointHandler>> {
        self.endpoints.lock().get(name)
    }

    /// Insert a connection into the per-host list: outbound at the
    /// head, inbound at the tail.
    pub(crate) fn register_peer(
        &self,
        host_port: &str,
        conn: &Arc<Connection>,
        direction: Direction,
    ) {
        let mut peers = self.peers.lock();
        let list = peers.entry(host_port.to_string()).or_default();
        match direction {
            Direction::Outbound => list.push_front(conn.clone()),
            Direction::Inbound => list.push_back(conn.clone()),
        }
    }

    /// Splice a connection out of every per-host list. No promotion.
    pub(crate) fn unregister_connection(&self, conn: &Arc<Connection>) {
        let mut peers = self.peers.lock();
        peers.retain(|_, list| {
            list.retain(|candidate| !Arc::ptr_eq(candidate, conn));
            !list.is_empty()
        });
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

/// One symmetric node: register endpoints, accept and dial links,
/// send calls.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel that can only accept inbound connections.
    pub fn new(config: ChannelConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a channel with a dialer for outbound connections.
    pub fn with_dialer(config: ChannelConfig, dialer: Box<dyn Dialer>) -> Self {
        Self::build(config, Some(dialer))
    }

    fn build(config: ChannelConfig, dialer: Option<Box<dyn Dialer>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                dialer,
                peers: Mutex::new(HashMap::new()),
                endpoints: Mutex::new(EndpointRegistry::new()),
                events,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// This node's configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// This node's listener address.
    pub fn host_port(&self) -> &str {
        &self.inner.config.host_port
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// True once [`quit`](Self::quit) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Register an endpoint handler. Redefinition is an error.
    pub fn register<F, Fut>(&self, name: impl AsRef<[u8]>, handler: F) -> Result<()>
    where
        F: Fn(InboundCall, ResponseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_destroyed() {
            return Err(FramewireError::ChannelDestroyed);
        }
        self.inner.endpoints.lock().register(name, handler)
    }

    /// Head of the peer's connection list, preferring outbound links.
    pub fn get_peer(&self, host_port: &str) -> Option<Arc<Connection>> {
        self.inner
            .peers
            .lock()
            .get(host_port)
            .and_then(|list| list.front())
            .cloned()
    }

    /// Adopt an accepted socket as an inbound connection.
    ///
    /// The connection joins the peer table once its handshake names
    /// the remote.
    pub fn accept(
        &self,
        duplex: BoxedDuplex,
        remote_addr: impl Into<String>,
    ) -> Result<Arc<Connection>> {
        if self.is_destroyed() {
            return Err(FramewireError::ChannelDestroyed);
        }
        Ok(Connection::spawn(
            &self.inner,
            duplex,
            Direction::Inbound,
            remote_addr.into(),
        ))
    }

    /// Register an externally created connection under a peer address.
    pub fn add_peer(&self, host_port: &str, conn: &Arc<Connection>) {
        self.inner.register_peer(host_port, conn, conn.direction());
    }

    /// Locate or dial the connection for a peer address.
    pub async fn connect(&self, host_port: &str) -> Result<Arc<Connection>> {
        if self.is_destroyed() {
            return Err(FramewireError::ChannelDestroyed);
        }
        if host_port == self.inner.config.host_port {
            return Err(FramewireError::SelfPeer(host_port.to_string()));
        }
        if let Some(conn) = self.get_peer(host_port) {
            return Ok(conn);
        }

        let dialer = self
            .inner
            .dialer
            .as_ref()
            .ok_or_else(|| FramewireError::NoSuchService(host_port.to_string()))?;
        let duplex = dialer.dial(host_port).await?;
        let conn = Connection::spawn(
            &self.inner,
            duplex,
            Direction::Outbound,
            host_port.to_string(),
        );
        self.inner
            .register_peer(host_port, &conn, Direction::Outbound);
        if conn.is_closing() {
            // Reset raced the registration; do not leave a dead entry.
            self.inner.unregister_connection(&conn);
        }
        Ok(conn)
    }

    /// Send a call and wait for its completion.
    ///
    /// Locates or dials the peer, waits for the link to identify,
    /// then emits one CallRequest. Resolves with `(arg2, arg3)` of
    /// the response, or the error that completed the operation
    /// (application error, timeout, or connection reset).
    pub async fn send(
        &self,
        options: SendOptions,
        arg1: impl Into<Bytes>,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> Result<(Bytes, Bytes)> {
        if self.is_destroyed() {
            return Err(FramewireError::ChannelDestroyed);
        }
        let ttl_ms = options.timeout_ms.unwrap_or(self.inner.config.default_ttl_ms);
        if ttl_ms == 0 {
            return Err(FramewireError::InvalidTtl);
        }

        let conn = self.connect(&options.host).await?;
        conn.await_identified().await?;

        let body = CallRequestBody::new(
            ttl_ms,
            options.tracing,
            options.service,
            options.headers,
            arg1.into(),
            arg2.into(),
            arg3.into(),
            options.checksum_type,
        )?;
        let rx = conn.send_call(body).await?;
        rx.await.map_err(|_| {
            FramewireError::ConnectionReset("operation abandoned".to_string())
        })?
    }

    /// Destroy the channel: reset every connection and clear the
    /// peer table. Idempotent.
    pub async fn quit(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(host = %self.inner.config.host_port, "channel shutting down");

        let conns: Vec<Arc<Connection>> = {
            let peers = self.inner.peers.lock();
            peers.values().flatten().cloned().collect()
        };
        for conn in conns {
            conn.reset_all("shutdown from quit".to_string());
        }
        self.inner.peers.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DialFuture;

    fn test_channel(host: &str) -> Channel {
        Channel::new(ChannelConfig::new(host, "test[1]"))
    }

    /// Dialer yielding fresh duplex pairs whose far ends go nowhere.
    fn sink_dialer() -> Box<dyn Dialer> {
        Box::new(|_addr: &str| -> DialFuture {
            Box::pin(async {
                let (near, far) = tokio::io::duplex(4096);
                // Keep the far end alive so writes do not fail.
                tokio::spawn(async move {
                    let mut far = far;
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = tokio::io::AsyncReadExt::read(&mut far, &mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
                Ok(Box::new(near) as BoxedDuplex)
            })
        })
    }

    #[test]
    fn test_register_rejects_redefinition() {
        let channel = test_channel("127.0.0.1:4040");
        channel.register("echo", |_call, _ctx| async {}).unwrap();

        let err = channel.register("echo", |_call, _ctx| async {}).unwrap_err();
        assert!(matches!(err, FramewireError::EndpointAlreadyDefined(_)));
    }

    #[tokio::test]
    async fn test_self_peering_forbidden() {
        let channel = test_channel("127.0.0.1:4040");
        let err = channel.connect("127.0.0.1:4040").await.unwrap_err();
        assert!(matches!(err, FramewireError::SelfPeer(_)));
    }

    #[tokio::test]
    async fn test_connect_without_dialer_fails() {
        let channel = test_channel("127.0.0.1:4040");
        let err = channel.connect("127.0.0.1:9999").await.unwrap_err();
        assert!(matches!(err, FramewireError::NoSuchService(_)));
    }

    #[tokio::test]
    async fn test_connect_reuses_existing_connection() {
        let channel = Channel::with_dialer(
            ChannelConfig::new("127.0.0.1:4040", "test[1]"),
            sink_dialer(),
        );

        let first = channel.connect("127.0.0.1:4041").await.unwrap();
        let second = channel.connect("127.0.0.1:4041").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_get_peer_prefers_outbound_head() {
        let channel = Channel::with_dialer(
            ChannelConfig::new("127.0.0.1:4040", "test[1]"),
            sink_dialer(),
        );

        // Inbound connection registered first; it sits at the tail.
        let (near, _far) = tokio::io::duplex(4096);
        let inbound = channel.accept(Box::new(near), "127.0.0.1:50000").unwrap();
        channel.add_peer("127.0.0.1:4041", &inbound);
        assert!(Arc::ptr_eq(
            &channel.get_peer("127.0.0.1:4041").unwrap(),
            &inbound
        ));

        // An outbound connection to the same peer lands at the head.
        let outbound = channel.connect("127.0.0.1:4042").await.unwrap();
        assert_eq!(outbound.direction(), Direction::Outbound);
        channel.add_peer("127.0.0.1:4041", &outbound);

        let head = channel.get_peer("127.0.0.1:4041").unwrap();
        assert!(Arc::ptr_eq(&head, &outbound));
    }

    #[tokio::test]
    async fn test_quit_marks_destroyed_and_clears_peers() {
        let channel = Channel::with_dialer(
            ChannelConfig::new("127.0.0.1:4040", "test[1]"),
            sink_dialer(),
        );
        let conn = channel.connect("127.0.0.1:4041").await.unwrap();

        channel.quit().await.unwrap();

        assert!(channel.is_destroyed());
        assert!(conn.is_closing());
        assert!(channel.get_peer("127.0.0.1:4041").is_none());
        assert!(matches!(
            channel.connect("127.0.0.1:4041").await,
            Err(FramewireError::ChannelDestroyed)
        ));
        // Quit is idempotent.
        channel.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejects_zero_ttl() {
        let channel = test_channel("127.0.0.1:4040");
        let err = channel
            .send(
                SendOptions::to("127.0.0.1:4041").timeout_ms(0),
                "echo",
                "",
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FramewireError::InvalidTtl));
    }
}
