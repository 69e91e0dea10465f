//! Transport boundary.
//!
//! The session never touches sockets. A [`Connector`] produces a
//! [`Connection`] whose [`Transport`] accepts whole outbound frames, and the
//! connector feeds inbound frames back through the [`DeliveryHandle`] it was
//! given. [`StreamTransport`] adapts any `AsyncRead + AsyncWrite` stream,
//! and [`TcpConnector`] uses it over TCP.

mod stream;
mod tcp;
mod writer;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::Inbound;

pub use stream::StreamTransport;
pub use tcp::TcpConnector;
pub use writer::{
    spawn_writer_task, WriterConfig, WriterHandle, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Boxed future for connector results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is gone.
    #[error("connection closed")]
    Closed,

    /// A connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer has too many frames it could not write yet.
    #[error("outbound backlog full")]
    Backlogged,
}

/// Outbound half of a connection.
pub trait Transport: Send + Sync + 'static {
    /// Queue one encoded frame. Must not block.
    ///
    /// A failure is treated by the session as a disconnection.
    fn transmit(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

/// Establishes connections on behalf of a session.
///
/// Called once at start and again for every reconnection attempt. Each call
/// gets a fresh [`DeliveryHandle`]; frames delivered through an older handle
/// are ignored by the session.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        delivery: DeliveryHandle,
    ) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

/// An established connection.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    /// Session id assigned by the server during the handshake, if any.
    pub session_id: Option<String>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Inbound half of a connection, held by the connector.
///
/// Delivery never blocks; frames are queued for the session's delivery task
/// in the order they are delivered.
#[derive(Clone)]
pub struct DeliveryHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    epoch: u64,
}

impl DeliveryHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Inbound>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    /// Hand one complete frame (header included) to the session.
    pub fn deliver(&self, frame: Bytes) {
        if self.tx.send(Inbound::Frame { epoch: self.epoch, frame }).is_err() {
            tracing::debug!(epoch = self.epoch, "Frame delivered to a finished session");
        }
    }

    /// Report that the connection was lost.
    pub fn disconnected(&self, reason: impl Into<String>) {
        let event = Inbound::Disconnected {
            epoch: self.epoch,
            reason: reason.into(),
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(epoch = self.epoch, "Disconnect reported to a finished session");
        }
    }

    /// Report that the peer broke the framing rules. The session closes
    /// instead of reconnecting.
    pub fn protocol_error(&self, reason: impl Into<String>) {
        let event = Inbound::ProtocolViolation {
            epoch: self.epoch,
            reason: reason.into(),
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(epoch = self.epoch, "Framing error reported to a finished session");
        }
    }

    /// Connection generation this handle belongs to.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True once the session has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("epoch", &self.epoch)
            .finish()
    }
}
