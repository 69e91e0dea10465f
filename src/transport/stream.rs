//! Transport over any async byte stream.
//!
//! Outbound frames go through a dedicated writer task; inbound bytes are cut
//! into frames by a [`FrameBuffer`] on a read task and handed to the
//! session's [`DeliveryHandle`].

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;

use super::writer::{spawn_writer_task, WriterConfig, WriterHandle};
use super::{DeliveryHandle, Transport, TransportError};
use crate::protocol::FrameBuffer;

/// Read buffer size for a single `read` call.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// [`Transport`] over an `AsyncRead + AsyncWrite` stream.
pub struct StreamTransport {
    writer: Mutex<Option<WriterHandle>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StreamTransport {
    /// Split `stream` and start its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        delivery: DeliveryHandle,
        config: WriterConfig,
        max_payload_size: u32,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(write_half, config);
        let reader_task = tokio::spawn(read_loop(read_half, delivery, max_payload_size));

        Self {
            writer: Mutex::new(Some(writer)),
            reader_task: Mutex::new(Some(reader_task)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames accepted but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.writer
            .lock()
            .as_ref()
            .map(WriterHandle::pending_count)
            .unwrap_or(0)
    }
}

impl Transport for StreamTransport {
    fn transmit(&self, frame: Bytes) -> Result<(), TransportError> {
        match self.writer.lock().as_ref() {
            Some(writer) => writer.try_send(frame),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the last handle lets the writer drain and shut down.
        self.writer.lock().take();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(mut reader: R, delivery: DeliveryHandle, max_payload_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read failed: {}", e),
        };

        match frames.push(&buf[..n]) {
            Ok(complete) => {
                for frame in complete {
                    delivery.deliver(frame);
                }
            }
            Err(e) => {
                tracing::error!(epoch = delivery.epoch(), error = %e, "Unframeable input");
                delivery.protocol_error(e.to_string());
                return;
            }
        }

        if delivery.is_closed() {
            return;
        }
    };

    tracing::debug!(epoch = delivery.epoch(), %reason, "Stream read loop finished");
    delivery.disconnected(reason);
}
