//! Request context for server-initiated requests.
//!
//! Provides methods for answering the server:
//! - `respond` - send a MessagePack Response
//! - `respond_empty` / `respond_bytes` - send a raw Response
//! - `error` - send an Error reply
//!
//! Every reply echoes the server's conversation id.

use std::sync::Weak;

use bytes::Bytes;

use crate::codec::MsgPackCodec;
use crate::conversation::ConversationId;
use crate::error::{Result, ServiceError, SessionError};
use crate::protocol::{ServiceEnvelope, ServiceMode, ServiceType};

/// Where a context sends its reply frames.
pub(crate) trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Bytes) -> Result<()>;
}

/// Context passed to request handlers.
#[derive(Clone)]
pub struct RequestContext {
    service_type: ServiceType,
    conversation_id: ConversationId,
    sink: Option<Weak<dyn FrameSink>>,
}

impl RequestContext {
    /// Create a context with no session behind it (for testing).
    /// Replies are accepted and dropped.
    pub fn new(service_type: ServiceType, conversation_id: ConversationId) -> Self {
        Self {
            service_type,
            conversation_id,
            sink: None,
        }
    }

    pub(crate) fn with_sink(
        service_type: ServiceType,
        conversation_id: ConversationId,
        sink: Weak<dyn FrameSink>,
    ) -> Self {
        Self {
            service_type,
            conversation_id,
            sink: Some(sink),
        }
    }

    #[inline]
    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// The server's conversation id for this request.
    #[inline]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Send a Response with a MessagePack payload.
    pub fn respond<T: serde::Serialize>(&self, payload: &T) -> Result<()> {
        let data = MsgPackCodec::encode(payload)?;
        self.send(ServiceMode::Response, &data)
    }

    /// Send a Response with no payload.
    pub fn respond_empty(&self) -> Result<()> {
        self.send(ServiceMode::Response, &[])
    }

    /// Send a Response with pre-encoded bytes.
    pub fn respond_bytes(&self, payload: Bytes) -> Result<()> {
        self.send(ServiceMode::Response, &payload)
    }

    /// Send an Error reply.
    pub fn error(&self, error: &ServiceError) -> Result<()> {
        let data = MsgPackCodec::encode(error)?;
        self.send(ServiceMode::Error, &data)
    }

    fn send(&self, mode: ServiceMode, payload: &[u8]) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let sink = sink.upgrade().ok_or(SessionError::SessionClosed)?;
        let frame = ServiceEnvelope::encode(self.service_type, mode, self.conversation_id, payload);
        sink.send_frame(frame)
    }
}
