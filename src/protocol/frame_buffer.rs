//! Frame buffer for accumulating partial reads.
//!
//! Stream transports receive arbitrary chunks; this state machine cuts them
//! back into whole frames:
//! - `WaitingForHeader`: need at least 15 bytes to learn the frame length
//! - `WaitingForFrame`: length known, need the rest of the frame
//!
//! Each extracted frame still carries its header so it can be handed to
//! [`DeliveryHandle::deliver`](crate::transport::DeliveryHandle::deliver)
//! unchanged.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    /// Total frame size (header included) is known.
    WaitingForFrame { frame_len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings (64KB capacity).
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(64 * 1024, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self::with_capacity_and_max_payload(64 * 1024, max_payload_size)
    }

    /// Create a new frame buffer with custom capacity and max payload.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a header declares a payload above the maximum. The
    /// stream cannot be resynchronised after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let Some(header) = Header::decode(&self.buffer) else {
                        return Ok(None);
                    };

                    if header.payload_length > self.max_payload_size {
                        return Err(SessionError::Protocol(format!(
                            "Payload size {} exceeds maximum {}",
                            header.payload_length, self.max_payload_size
                        )));
                    }

                    self.state = State::WaitingForFrame {
                        frame_len: HEADER_SIZE + header.payload_length as usize,
                    };
                }
                State::WaitingForFrame { frame_len } => {
                    if self.buffer.len() < frame_len {
                        return Ok(None);
                    }
                    let frame = self.buffer.split_to(frame_len).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationId;
    use crate::protocol::{ServiceEnvelope, ServiceMode, ServiceType};

    fn make_frame(conversation: u64, payload: &[u8]) -> Bytes {
        ServiceEnvelope::encode(
            ServiceType::Fetch,
            ServiceMode::Response,
            ConversationId::new(conversation),
            payload,
        )
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(42, b"hello");

        let frames = buffer.push(&frame).unwrap();

        assert_eq!(frames, vec![frame]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let first = make_frame(1, b"first");
        let second = make_frame(2, b"second");
        let third = make_frame(3, b"");

        let mut combined = Vec::new();
        combined.extend_from_slice(&first);
        combined.extend_from_slice(&second);
        combined.extend_from_slice(&third);

        let frames = buffer.push(&combined).unwrap();
        assert_eq!(frames, vec![first, second, third]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(42, b"test");

        assert!(buffer.push(&frame[..5]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&frame[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        let envelope = ServiceEnvelope::decode(frames[0].clone()).unwrap();
        assert_eq!(envelope.conversation_id.get(), 42);
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let frame = make_frame(42, payload);

        let partial = HEADER_SIZE + 10;
        assert!(buffer.push(&frame[..partial]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        let frames = buffer.push(&frame[partial..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][HEADER_SIZE..], payload);
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let header = Header::new(2, 2, 42, 1000);

        let err = buffer.push(&header.encode()).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = make_frame(1, b"first");
        let second = make_frame(2, b"second");

        let mut data = first.to_vec();
        data.extend_from_slice(&second[..5]);

        assert_eq!(buffer.push(&data).unwrap(), vec![first]);
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.push(&second[5..]).unwrap(), vec![second]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(42, b"hi");

        let mut all = Vec::new();
        for byte in frame.iter() {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all, vec![frame]);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(42, b"test");
        buffer.push(&frame[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());
    }
}
