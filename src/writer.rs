//! Dedicated writer task for outbound frames.
//!
//! Frames are encoded to contiguous buffers before they reach this
//! module, so one `send` is one contiguous write unit. A per-connection
//! task receives frames via an mpsc channel and batches whatever is
//! ready into a single vectored write.
//!
//! ```text
//! read loop  ─┐
//! handlers   ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► byte-duplex
//! sweeper    ─┘
//! ```
//!
//! A write failure is fatal for the connection; the task exits with the
//! error and the connection tears down.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{FramewireError, Result};

/// Default channel capacity for the frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending encoded frames to the writer task.
///
/// Cheaply cloneable; shared by the read loop, handlers, and the
/// sweeper.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue an encoded frame for writing.
    ///
    /// Fails with `SocketClosed` once the writer task has exited.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| FramewireError::SocketClosed)
    }

    /// Queue without waiting for channel capacity.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FramewireError::SocketClosed,
            mpsc::error::TrySendError::Closed(_) => FramewireError::SocketClosed,
        })
    }
}

/// Spawn the writer task over the write half of a byte-duplex.
///
/// Returns the sending handle and the task's join handle; the task
/// resolves with the write error that killed it, or `Ok` on clean
/// shutdown (all handles dropped).
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them out.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            // Channel closed, clean shutdown.
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of frames with a single vectored write when possible.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch.iter().map(|f| IoSlice::new(f)).collect();
    let total: usize = batch.iter().map(|f| f.len()).sum();

    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 && total > 0 {
        return Err(FramewireError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write: finish the remainder frame by frame.
    while written < total {
        let mut skip = written;
        for frame in batch {
            if skip >= frame.len() {
                skip -= frame.len();
                continue;
            }
            writer.write_all(&frame[skip..]).await?;
            written += frame.len() - skip;
            skip = 0;
        }
    }

    writer.flush().await?;
    Ok(())
}
