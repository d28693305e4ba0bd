//! Dedicated writer task for outbound dialog frames.
//!
//! Each endpoint owns one writer task fed through an mpsc channel, so
//! concurrently running dialog handlers never contend on a lock around
//! the socket and ready frames can be batched into a single vectored
//! write.
//!
//! ```text
//! Dialog 1 ─┐
//! Dialog 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Dialog N ─┘
//! ```
//!
//! A shared atomic pending-frame counter provides backpressure: senders
//! wait (bounded by a timeout) when the queue is at capacity.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MeshwireError, Result};
use crate::protocol::{DialogHeader, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between backpressure re-checks.
const BACKPRESSURE_CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (11 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (may be empty for dialog-end frames).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &DialogHeader, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Create a new outbound frame with empty payload.
    #[inline]
    pub fn empty(header: &DialogHeader) -> Self {
        Self {
            header: header.encode(),
            payload: Bytes::new(),
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
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
/// Cheaply cloneable; shared by every dialog running on the endpoint.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Send a frame to the writer task.
    ///
    /// Waits if backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            MeshwireError::ConnectionClosed
        })
    }

    /// Try to send a frame without waiting for backpressure.
    ///
    /// # Errors
    ///
    /// `BackpressureTimeout` immediately if at capacity,
    /// `ConnectionClosed` if the writer task is gone.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(MeshwireError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => MeshwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => MeshwireError::ConnectionClosed,
            }
        })
    }

    /// Wait for backpressure to clear, bounded by the timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(MeshwireError::BackpressureTimeout);
            }
            tokio::time::sleep(BACKPRESSURE_CHECK_INTERVAL).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get the current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
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

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(MeshwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for data at and after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_outbound_frame_creation() {
        let header = DialogHeader::new(1, flags::RESPONSE, 42, 5);
        let frame = OutboundFrame::new(&header, Bytes::from_static(b"hello"));

        assert_eq!(frame.header.len(), HEADER_SIZE);
        assert_eq!(frame.payload.len(), 5);
        assert_eq!(frame.size(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_outbound_frame_empty() {
        let header = DialogHeader::new(1, flags::FINAL_RESPONSE, 42, 0);
        let frame = OutboundFrame::empty(&header);

        assert!(frame.payload.is_empty());
        assert_eq!(frame.size(), HEADER_SIZE);
    }

    #[test]
    fn test_build_remaining_slices_skip_mid_header() {
        let header = DialogHeader::new(1, 0, 1, 3);
        let batch = vec![OutboundFrame::new(&header, Bytes::from_static(b"abc"))];

        let slices = build_remaining_slices(&batch, 4);

        let total: usize = slices.iter().map(|s| s.len()).sum();
        assert_eq!(total, HEADER_SIZE - 4 + 3);
    }

    #[test]
    fn test_build_remaining_slices_skip_into_payload() {
        let header = DialogHeader::new(1, 0, 1, 5);
        let batch = vec![OutboundFrame::new(&header, Bytes::from_static(b"hello"))];

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 2);

        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"llo");
    }

    #[tokio::test]
    async fn test_frames_reach_the_wire() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        let header = DialogHeader::new(3, flags::RESPONSE, 7, 4);
        handle
            .send(OutboundFrame::new(&header, Bytes::from_static(b"ping")))
            .await
            .unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 4];
        server.read_exact(&mut buf).await.unwrap();

        let decoded = DialogHeader::decode(&buf).unwrap();
        assert_eq!(decoded.dialog_type, 3);
        assert_eq!(decoded.dialog_id, 7);
        assert_eq!(&buf[HEADER_SIZE..], b"ping");

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_try_send_backpressure() {
        let (client, _server) = tokio::io::duplex(16);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 1,
            backpressure_timeout: Duration::from_millis(10),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        let header = DialogHeader::new(1, 0, 1, 1024);
        let payload = Bytes::from(vec![0u8; 1024]);

        // First frame fills the tiny duplex buffer and stalls the task.
        handle
            .try_send(OutboundFrame::new(&header, payload.clone()))
            .unwrap();

        let mut saw_backpressure = false;
        for _ in 0..100 {
            match handle.try_send(OutboundFrame::new(&header, payload.clone())) {
                Err(MeshwireError::BackpressureTimeout) => {
                    saw_backpressure = true;
                    break;
                }
                Ok(()) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_backpressure);
    }
}
