//! Dedicated writer task for stream transports.
//!
//! Frames are handed to the task over a bounded channel; the task batches
//! whatever is ready and writes it with `write_vectored`. The session side
//! never waits: a full backlog is reported as [`TransportError::Backlogged`]
//! and the session treats the connection as lost.
//!
//! ```text
//! Session ─► WriterHandle::try_send ─► mpsc ─► Writer Task ─► AsyncWrite
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::TransportError;

/// Frames accepted but not yet written before the writer refuses more.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Writer task limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<Bytes>, pending: Arc<AtomicUsize>, max_pending: usize) -> Self {
        Self {
            tx,
            pending,
            max_pending,
        }
    }

    /// Hand a frame to the writer task without waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_backlogged() {
            return Err(TransportError::Backlogged);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backlogged,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            }
        })
    }

    #[inline]
    pub fn is_backlogged(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames accepted but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<(), TransportError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone(), config.max_pending_frames);
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!(error = %e, "Writer task stopping after write failure");
            rx.close();
            return Err(e);
        }
        pending.fetch_sub(batch_size, Ordering::Release);
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with as few `write_vectored` calls as possible.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip_bytes` of the batch.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }
    slices
}
