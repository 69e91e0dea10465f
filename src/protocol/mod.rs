//! Protocol module - wire format, envelopes, and service numbering.
//!
//! - 15-byte header encoding/decoding
//! - [`ServiceEnvelope`] for decoded service messages
//! - [`FrameBuffer`] for cutting a byte stream into frames
//! - [`ServiceType`] numbering with alias and canonical forms

mod envelope;
mod frame_buffer;
mod service_type;
mod wire_format;

pub use envelope::ServiceEnvelope;
pub use frame_buffer::FrameBuffer;
pub use service_type::{ServiceType, SERVICE_TYPE_MAX_VALUE};
pub use wire_format::{
    Header, ServiceMode, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};
