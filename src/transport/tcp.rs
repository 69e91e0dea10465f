//! TCP connector.

use std::sync::Arc;

use tokio::net::TcpStream;

use super::stream::StreamTransport;
use super::writer::WriterConfig;
use super::{BoxFuture, Connection, Connector, DeliveryHandle, TransportError};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Connects to `host:port` and frames the stream with [`StreamTransport`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    writer_config: WriterConfig,
    max_payload_size: u32,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            writer_config: WriterConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        delivery: DeliveryHandle,
    ) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let addr = self.addr.clone();
        let config = self.writer_config.clone();
        let max_payload_size = self.max_payload_size;

        Box::pin(async move {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;
            stream.set_nodelay(true)?;
            tracing::debug!(%addr, epoch = delivery.epoch(), "TCP connection established");

            let transport = StreamTransport::spawn(stream, delivery, config, max_payload_size);
            Ok(Connection::new(Arc::new(transport)))
        })
    }
}
