//! Conversation correlation.
//!
//! Every request the client sends opens a conversation identified by a
//! [`ConversationId`]. The server's Response or Error envelope carries the
//! same id back and the [`ConversationRegistry`] hands it to the waiting
//! [`Continuation`]. Each opened conversation ends exactly once: response,
//! error, or discard.

mod continuation;
mod registry;

use std::fmt;

pub use continuation::{
    Continuation, Decoder, OneshotContinuation, ResponseCallback, ResponseFuture,
};
pub use registry::ConversationRegistry;

/// Conversation identifier. 0 is reserved and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(u64);

impl ConversationId {
    /// The reserved id.
    pub const RESERVED: ConversationId = ConversationId(0);

    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}", self.0)
    }
}

/// Why a conversation ended without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// The session was closed by the application.
    SessionClosed,
    /// The connection was lost and could not be recovered.
    ConnectionLost,
    /// The server broke the protocol and the session was closed.
    ProtocolViolation,
    /// The request could not be sent.
    Cancelled,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DiscardReason::SessionClosed => "session closed",
            DiscardReason::ConnectionLost => "connection lost",
            DiscardReason::ProtocolViolation => "protocol violation",
            DiscardReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}
