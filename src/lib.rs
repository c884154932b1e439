//! # framewire
//!
//! Core of a bidirectional, framed, multiplexed RPC transport.
//!
//! A node is symmetric: every [`Channel`] both accepts inbound
//! connections and dials outbound ones. On each link, many in-flight
//! request/response operations are multiplexed by a per-link frame id.
//! Payloads are opaque byte triples `(arg1, arg2, arg3)`, typically
//! used as `(endpoint-name, application-headers, body)`.
//!
//! ## Architecture
//!
//! - **Framing** (`protocol`): 16-byte headers, a chunk reader turning
//!   socket reads into whole frames, and per-type body codecs
//! - **Connection** (`connection`): handshake, operation tables,
//!   timeout sweeper, teardown
//! - **Channel** (`channel`): peer table, endpoint registry, dispatch
//!
//! Socket I/O stays outside the core: hosts hand accepted sockets to
//! [`Channel::accept`] and inject a [`Dialer`](transport::Dialer) for
//! outbound links.
//!
//! ## Example
//!
//! ```ignore
//! use framewire::{Channel, ChannelConfig, SendOptions};
//!
//! #[tokio::main]
//! async fn main() -> framewire::Result<()> {
//!     let server = Channel::new(ChannelConfig::new("127.0.0.1:4041", "b[1]"));
//!     server.register("echo", |call, ctx| async move {
//!         let _ = ctx.respond(Ok((call.arg2, call.arg3))).await;
//!     })?;
//!     // hand accepted sockets to `server.accept(..)`
//!
//!     let client = Channel::with_dialer(
//!         ChannelConfig::new("127.0.0.1:4040", "a[1]"),
//!         my_dialer(),
//!     );
//!     let (headers, body) = client
//!         .send(
//!             SendOptions::to("127.0.0.1:4041").timeout_ms(1000),
//!             "echo",
//!             "h",
//!             "hello",
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod checksum;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod writer;

pub use channel::{Channel, ChannelConfig, ChannelEvent, SendOptions};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumType};
pub use codec::{ErrorEnvelope, WireError};
pub use connection::{CallOutcome, Connection, Direction};
pub use error::{FramewireError, Result};
pub use handler::{HandlerOutcome, InboundCall, ResponseContext};
