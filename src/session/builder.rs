//! Session builder.
//!
//! # Example
//!
//! ```ignore
//! use topicwire_client::session::Session;
//! use topicwire_client::transport::TcpConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::builder()
//!         .connector(TcpConnector::new("127.0.0.1:8090"))
//!         .reconnection_interval(std::time::Duration::from_secs(2))
//!         .start()
//!         .await?;
//!
//!     session.closed().await;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use super::config::{ReconnectionConfig, SessionConfig};
use super::runtime::Session;
use super::state::SessionListener;
use crate::error::{Result, SessionError};
use crate::handler::{ServiceHandler, ServiceHandlerRegistry};
use crate::protocol::ServiceType;
use crate::transport::Connector;

/// Builder for configuring and starting a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    handlers: ServiceHandlerRegistry,
    listeners: Vec<Weak<dyn SessionListener>>,
}

impl SessionBuilder {
    /// Create a new session builder.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            connector: None,
            handlers: ServiceHandlerRegistry::new(),
            listeners: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how connections are established. Required.
    pub fn connector<C: Connector>(self, connector: C) -> Self {
        self.connector_arc(Arc::new(connector))
    }

    pub fn connector_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.config.reconnection = reconnection;
        self
    }

    /// Close the session on connection loss instead of recovering.
    pub fn no_reconnection(mut self) -> Self {
        self.config.reconnection.enabled = false;
        self
    }

    /// Default: 5 seconds
    pub fn reconnection_interval(mut self, interval: Duration) -> Self {
        self.config.reconnection.interval = interval;
        self
    }

    /// Default: 60 seconds
    pub fn reconnection_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnection.timeout = timeout;
        self
    }

    /// Set the number of frames held while recovering.
    ///
    /// Default: 1024
    pub fn max_outbound_queue(mut self, limit: usize) -> Self {
        self.config.max_outbound_queue = limit;
        self
    }

    /// Default: 16 MB
    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.config.max_payload_size = limit;
        self
    }

    /// Observe state changes from the start, including the first
    /// `Connecting -> Connected`. Held weakly.
    pub fn listener<L: SessionListener>(mut self, listener: &Arc<L>) -> Self {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn SessionListener> = weak;
        self.listeners.push(weak);
        self
    }

    /// Register a handler for server-initiated requests.
    ///
    /// A later call for the same service replaces the earlier handler.
    pub fn handler<H: ServiceHandler>(mut self, service_type: ServiceType, handler: H) -> Self {
        self.handlers.deregister(service_type);
        if let Err(e) = self.handlers.register(service_type, handler) {
            tracing::warn!(service = %service_type, error = %e, "Handler not registered");
        }
        self
    }

    /// Connect and start the session.
    ///
    /// Fails with a transport error when the first connection attempt
    /// fails; no reconnection is attempted for it.
    pub async fn start(self) -> Result<Session> {
        let connector = self
            .connector
            .ok_or_else(|| SessionError::InvalidArgument("no connector configured".to_string()))?;
        Session::start(self.config, connector, self.handlers, self.listeners).await
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
