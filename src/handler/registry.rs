//! Per-session table of handlers for server-initiated requests.
//!
//! Each session owns its own registry; nothing is shared between sessions.
//! Lookups use [`ServiceType::canonical`], so a handler registered for one
//! versioned id also receives the other.
//!
//! # Example
//!
//! ```ignore
//! use topicwire_client::handler::{ServiceHandlerRegistry, RequestContext};
//! use topicwire_client::protocol::ServiceType;
//!
//! let registry = ServiceHandlerRegistry::new();
//! registry.register(ServiceType::PingSystem, |_request, ctx: RequestContext| {
//!     ctx.respond_empty()
//! })?;
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use super::RequestContext;
use crate::codec::MsgPackCodec;
use crate::error::{Result, SessionError};
use crate::protocol::{ServiceEnvelope, ServiceType};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Handles one inbound request.
///
/// Runs on the session's delivery task and must not block. A fatal `Err`
/// ([`SessionError::is_fatal`]: a malformed request or a service with no
/// handler) closes the session as a protocol violation. Any other `Err` is
/// logged and the session carries on.
pub trait ServiceHandler: Send + Sync + 'static {
    fn handle(&self, request: ServiceEnvelope, ctx: RequestContext) -> HandlerResult;
}

impl<F> ServiceHandler for F
where
    F: Fn(ServiceEnvelope, RequestContext) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, request: ServiceEnvelope, ctx: RequestContext) -> HandlerResult {
        self(request, ctx)
    }
}

/// Wrapper that deserializes the payload before calling the handler.
pub struct TypedHandler<F, T>
where
    F: Fn(T, RequestContext) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> TypedHandler<F, T>
where
    F: Fn(T, RequestContext) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T> ServiceHandler for TypedHandler<F, T>
where
    F: Fn(T, RequestContext) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    fn handle(&self, request: ServiceEnvelope, ctx: RequestContext) -> HandlerResult {
        let parsed: T = MsgPackCodec::decode(&request.payload)?;
        (self.handler)(parsed, ctx)
    }
}

/// Maps canonical service types to handlers.
pub struct ServiceHandlerRegistry {
    handlers: RwLock<HashMap<ServiceType, Arc<dyn ServiceHandler>>>,
}

impl ServiceHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler for `service_type`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the service already has a handler.
    pub fn register<H: ServiceHandler>(&self, service_type: ServiceType, handler: H) -> Result<()> {
        let key = service_type.canonical();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&key) {
            return Err(SessionError::InvalidArgument(format!(
                "A handler for {} is already registered",
                key
            )));
        }
        handlers.insert(key, Arc::new(handler));
        Ok(())
    }

    /// Register a handler taking a decoded MessagePack payload.
    pub fn register_typed<T, F>(&self, service_type: ServiceType, handler: F) -> Result<()>
    where
        F: Fn(T, RequestContext) -> HandlerResult + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        self.register(service_type, TypedHandler::new(handler))
    }

    /// Remove the handler for `service_type`. Returns whether one existed.
    pub fn deregister(&self, service_type: ServiceType) -> bool {
        self.handlers
            .write()
            .remove(&service_type.canonical())
            .is_some()
    }

    pub fn contains(&self, service_type: ServiceType) -> bool {
        self.handlers
            .read()
            .contains_key(&service_type.canonical())
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Dispatch a request to its handler.
    ///
    /// The lock is released before the handler runs, so handlers may
    /// register or deregister other services.
    pub fn dispatch(&self, request: ServiceEnvelope, ctx: RequestContext) -> HandlerResult {
        let handler = self
            .handlers
            .read()
            .get(&request.service_type.canonical())
            .cloned();

        match handler {
            Some(handler) => handler.handle(request, ctx),
            None => Err(SessionError::HandlerNotFound(request.service_type)),
        }
    }
}

impl Default for ServiceHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
