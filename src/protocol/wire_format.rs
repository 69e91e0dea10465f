//! Wire format encoding and decoding.
//!
//! Every service message starts with a 15-byte header:
//! ```text
//! ┌──────────────┬───────┬────────────────┬──────────┐
//! │ Service type │ Mode  │ Conversation   │ Length   │
//! │ 2 bytes      │ 1 byte│ 8 bytes        │ 4 bytes  │
//! │ uint16 BE    │       │ uint64 BE      │ uint32 BE│
//! └──────────────┴───────┴────────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, SessionError};

use super::service_type::{ServiceType, SERVICE_TYPE_MAX_VALUE};

/// Header size in bytes (fixed, exactly 15).
pub const HEADER_SIZE: usize = 15;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Absolute maximum payload size (~2 GB, max i32).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = 2_147_483_647;

/// Direction of a service message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceMode {
    /// Negative reply to a request.
    Error = 0,
    /// A request, from either side.
    Request = 1,
    /// Positive reply to a request.
    Response = 2,
}

impl ServiceMode {
    /// Decode a mode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ServiceMode::Error),
            1 => Some(ServiceMode::Request),
            2 => Some(ServiceMode::Response),
            _ => None,
        }
    }

    /// True for Response and Error, the two modes answering a request.
    #[inline]
    pub fn is_reply(self) -> bool {
        !matches!(self, ServiceMode::Request)
    }
}

/// Decoded header from wire format.
///
/// Fields hold raw wire values; [`Header::validate`] checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Service type identifier.
    pub service_type: u16,
    /// Mode byte (see [`ServiceMode`]).
    pub mode: u8,
    /// Conversation identifier.
    pub conversation_id: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(service_type: u16, mode: u8, conversation_id: u64, payload_length: u32) -> Self {
        Self {
            service_type,
            mode,
            conversation_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use topicwire_client::protocol::Header;
    ///
    /// let header = Header::new(1, 1, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 15);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (15 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.service_type.to_be_bytes());
        buf[2] = self.mode;
        buf[3..11].copy_from_slice(&self.conversation_id.to_be_bytes());
        buf[11..15].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut conversation = [0u8; 8];
        conversation.copy_from_slice(&buf[3..11]);
        Some(Self {
            service_type: u16::from_be_bytes([buf[0], buf[1]]),
            mode: buf[2],
            conversation_id: u64::from_be_bytes(conversation),
            payload_length: u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Service type is within 1..=0x100 and names a known service
    /// - Mode is Error, Request or Response
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<(ServiceType, ServiceMode)> {
        if self.service_type == 0 || self.service_type > SERVICE_TYPE_MAX_VALUE {
            return Err(SessionError::Protocol(format!(
                "Service type {} out of range",
                self.service_type
            )));
        }

        let service_type = ServiceType::from_id(self.service_type).ok_or_else(|| {
            SessionError::Protocol(format!("Unknown service type {}", self.service_type))
        })?;

        let mode = ServiceMode::from_u8(self.mode)
            .ok_or_else(|| SessionError::Protocol(format!("Invalid mode {}", self.mode)))?;

        if self.payload_length > max_payload_size {
            return Err(SessionError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok((service_type, mode))
    }
}
