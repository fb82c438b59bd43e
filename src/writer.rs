//! Dedicated writer task for the connection's write half.
//!
//! Every exchange on a connection shares one byte stream. Instead of an
//! `Arc<Mutex<Writer>>`, frames are queued on an mpsc channel and a single
//! task writes them, so a frame is always written completely before the next
//! one starts.
//!
//! # Architecture
//!
//! ```text
//! Caller 1  ─┐
//! Handler 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Stream
//! Stream N  ─┘
//! ```
//!
//! Ready frames are batched into single vectored writes, and the
//! [`BackpressureController`] bounds how many frames may be queued.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{RelayError, Result};
use crate::protocol::{Frame, FrameKind, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = DEFAULT_MAX_PENDING;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = DEFAULT_TIMEOUT;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame encoded and ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Credits, route and metadata section (often empty).
    pub prefix: Bytes,
    /// Payload bytes, shared with the caller.
    pub payload: Bytes,
    /// Stream the frame belongs to, for logging.
    pub stream_id: u32,
    /// Kind, for logging.
    pub kind: FrameKind,
}

impl OutboundFrame {
    /// Encode a frame for the writer.
    pub fn encode(frame: &Frame) -> Result<Self> {
        let (header, prefix, payload) = frame.encode_parts()?;
        Ok(Self {
            header,
            prefix,
            payload,
            stream_id: frame.stream_id,
            kind: frame.kind,
        })
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.prefix.len() + self.payload.len()
    }

    fn parts(&self) -> [&[u8]; 3] {
        [&self.header, &self.prefix, &self.payload]
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and shared by every exchange on the connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Queue a frame, waiting while backpressure is active.
    ///
    /// Returns once the frame is accepted for transmission, not once it is
    /// on the wire.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let outbound = OutboundFrame::encode(frame)?;
        self.backpressure.reserve().await?;

        self.tx.send(outbound).await.map_err(|_| {
            self.backpressure.release();
            RelayError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    ///
    /// Used for best-effort control frames from synchronous contexts such as
    /// `Drop`.
    pub fn try_send(&self, frame: &Frame) -> Result<()> {
        let outbound = OutboundFrame::encode(frame)?;
        self.backpressure.try_reserve()?;

        self.tx.try_send(outbound).map_err(|e| {
            self.backpressure.release();
            match e {
                mpsc::error::TrySendError::Full(_) => RelayError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => RelayError::ConnectionClosed,
            }
        })
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Whether the writer task has gone away.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// the stream fails.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        let Some(first) = rx.recv().await else {
            let _ = writer.shutdown().await;
            return Ok(());
        };
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        for frame in &batch {
            tracing::trace!(stream_id = frame.stream_id, kind = ?frame.kind, size = frame.size(), "writing frame");
        }

        let written = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch.len());
        batch.clear();
        if let Err(e) = written {
            tracing::error!("Writer error: {}", e);
            rx.close();
            return Err(e);
        }
    }
}

/// Write a batch of frames using scatter/gather I/O, resuming after partial
/// writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for part in batch.iter().flat_map(OutboundFrame::parts) {
        let end = offset + part.len();
        if !part.is_empty() && skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start..]));
        }
        offset = end;
    }

    slices
}
