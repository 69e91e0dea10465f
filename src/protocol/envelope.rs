//! Service envelope: one decoded service message.
//!
//! Uses `bytes::Bytes` so the payload of a decoded envelope is a zero-copy
//! slice of the received frame.
//!
//! # Example
//!
//! ```
//! use topicwire_client::protocol::{ServiceEnvelope, ServiceMode, ServiceType};
//! use topicwire_client::conversation::ConversationId;
//!
//! let frame = ServiceEnvelope::encode(
//!     ServiceType::PingUser,
//!     ServiceMode::Request,
//!     ConversationId::new(7),
//!     b"",
//! );
//! let envelope = ServiceEnvelope::decode(frame).unwrap();
//! assert_eq!(envelope.service_type, ServiceType::PingUser);
//! assert_eq!(envelope.conversation_id.get(), 7);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::service_type::ServiceType;
use super::wire_format::{Header, ServiceMode, ABSOLUTE_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::conversation::ConversationId;
use crate::error::{Result, SessionError};

/// A complete service message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEnvelope {
    /// Service the message belongs to, as sent on the wire.
    pub service_type: ServiceType,
    /// Request, Response or Error.
    pub mode: ServiceMode,
    /// Correlation id. Server-initiated requests carry the server's id.
    pub conversation_id: ConversationId,
    /// Service-specific payload.
    pub payload: Bytes,
}

impl ServiceEnvelope {
    /// Create a new envelope.
    pub fn new(
        service_type: ServiceType,
        mode: ServiceMode,
        conversation_id: ConversationId,
        payload: Bytes,
    ) -> Self {
        Self {
            service_type,
            mode,
            conversation_id,
            payload,
        }
    }

    /// Encode a message into a single contiguous frame.
    pub fn encode(
        service_type: ServiceType,
        mode: ServiceMode,
        conversation_id: ConversationId,
        payload: &[u8],
    ) -> Bytes {
        let header = Header::new(
            service_type.id(),
            mode as u8,
            conversation_id.get(),
            payload.len() as u32,
        );
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&header.encode());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a received frame.
    ///
    /// The declared payload length must match the bytes that follow the
    /// header exactly.
    pub fn decode(frame: Bytes) -> Result<Self> {
        Self::decode_with_limit(frame, ABSOLUTE_MAX_PAYLOAD_SIZE)
    }

    /// Decode a received frame, rejecting payloads above `max_payload_size`.
    pub fn decode_with_limit(mut frame: Bytes, max_payload_size: u32) -> Result<Self> {
        let header = Header::decode(&frame).ok_or_else(|| {
            SessionError::Protocol(format!(
                "Frame of {} bytes is shorter than the header",
                frame.len()
            ))
        })?;
        let (service_type, mode) = header.validate(max_payload_size)?;

        let payload = frame.split_off(HEADER_SIZE);
        if payload.len() != header.payload_length as usize {
            return Err(SessionError::Protocol(format!(
                "Declared payload length {} but {} bytes follow the header",
                header.payload_length,
                payload.len()
            )));
        }

        Ok(Self {
            service_type,
            mode,
            conversation_id: ConversationId::new(header.conversation_id),
            payload,
        })
    }

    /// Re-encode this envelope.
    pub fn to_frame(&self) -> Bytes {
        Self::encode(
            self.service_type,
            self.mode,
            self.conversation_id,
            &self.payload,
        )
    }

    /// Build the Response to this request, echoing its conversation id.
    pub fn response(&self, payload: &[u8]) -> Bytes {
        Self::encode(
            self.service_type,
            ServiceMode::Response,
            self.conversation_id,
            payload,
        )
    }

    /// Build the Error reply to this request, echoing its conversation id.
    pub fn error(&self, payload: &[u8]) -> Bytes {
        Self::encode(
            self.service_type,
            ServiceMode::Error,
            self.conversation_id,
            payload,
        )
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.mode == ServiceMode::Request
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.mode == ServiceMode::Response
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.mode == ServiceMode::Error
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
