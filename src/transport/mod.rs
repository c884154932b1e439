//! Transport abstraction.
//!
//! Socket I/O is the host's concern. The core sees a connection as an
//! abstract byte-duplex and reaches new peers through an injected
//! [`Dialer`]. Any `AsyncRead + AsyncWrite` value qualifies: a TCP
//! stream, a Unix socket, or an in-memory `tokio::io::duplex` pair in
//! tests.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// An owned, type-erased byte-duplex.
pub type BoxedDuplex = Box<dyn Duplex>;

/// Future resolving to a freshly connected duplex.
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxedDuplex>> + Send>>;

/// Connects to peers by `host:port` address.
pub trait Dialer: Send + Sync {
    /// Open a new byte-duplex to the given address.
    fn dial(&self, host_port: &str) -> DialFuture;
}

impl<F> Dialer for F
where
    F: Fn(&str) -> DialFuture + Send + Sync,
{
    fn dial(&self, host_port: &str) -> DialFuture {
        self(host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_boxed_duplex_reads_and_writes() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut boxed: BoxedDuplex = Box::new(a);

        boxed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_fn_dialer() {
        let dialer = |_addr: &str| -> DialFuture {
            Box::pin(async {
                let (a, _b) = tokio::io::duplex(64);
                // The far end is dropped; good enough to prove dispatch.
                Ok(Box::new(a) as BoxedDuplex)
            })
        };
        let duplex = Dialer::dial(&dialer, "127.0.0.1:4040").await;
        assert!(duplex.is_ok());
    }
}
