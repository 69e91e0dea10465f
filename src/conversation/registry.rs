//! Pending conversation table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Continuation, ConversationId, DiscardReason};
use crate::codec::MsgPackCodec;
use crate::error::{ErrorCode, Result, ServiceError, SessionError};
use crate::protocol::{ServiceEnvelope, ServiceMode, ServiceType};

struct PendingConversation {
    service_type: ServiceType,
    continuation: Box<dyn Continuation>,
}

struct RegistryInner {
    pending: HashMap<ConversationId, PendingConversation>,
    /// Set once by `discard_all`; no conversation opens afterwards.
    closed: Option<DiscardReason>,
}

/// Correlates outbound requests with inbound replies.
///
/// Ids come from an atomic counter so allocation never takes the lock.
/// The pending map lock is released before any continuation runs.
pub struct ConversationRegistry {
    next_id: AtomicU64,
    inner: Mutex<RegistryInner>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(RegistryInner {
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Reserve a fresh id without opening a conversation yet.
    pub fn allocate(&self) -> ConversationId {
        ConversationId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Open a conversation for `service_type`.
    ///
    /// # Errors
    ///
    /// `SessionClosed` once the registry has been swept. The continuation
    /// still ends exactly once: it is discarded with the sweep's reason.
    pub fn open(
        &self,
        service_type: ServiceType,
        continuation: Box<dyn Continuation>,
    ) -> Result<ConversationId> {
        let id = self.allocate();
        self.open_reserved(id, service_type, continuation)?;
        Ok(id)
    }

    /// Open a conversation under an id obtained from [`allocate`](Self::allocate).
    pub fn open_reserved(
        &self,
        id: ConversationId,
        service_type: ServiceType,
        continuation: Box<dyn Continuation>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.closed {
            drop(inner);
            continuation.on_discard(reason);
            return Err(SessionError::SessionClosed);
        }
        inner.pending.insert(
            id,
            PendingConversation {
                service_type,
                continuation,
            },
        );
        Ok(())
    }

    /// Complete the conversation named by a Response or Error envelope.
    ///
    /// Returns false when no conversation matched. That is not an error:
    /// the id may belong to a conversation already cancelled.
    pub fn resolve(&self, envelope: ServiceEnvelope) -> bool {
        if envelope.mode == ServiceMode::Request {
            tracing::warn!(
                service = %envelope.service_type,
                conversation = %envelope.conversation_id,
                "Request envelope passed to conversation registry"
            );
            return false;
        }

        let entry = self.inner.lock().pending.remove(&envelope.conversation_id);
        let Some(entry) = entry else {
            tracing::warn!(
                service = %envelope.service_type,
                conversation = %envelope.conversation_id,
                "Reply for unknown conversation discarded"
            );
            return false;
        };

        if entry.service_type.canonical() != envelope.service_type.canonical() {
            tracing::debug!(
                expected = %entry.service_type,
                actual = %envelope.service_type,
                conversation = %envelope.conversation_id,
                "Reply service type differs from request"
            );
        }

        match envelope.mode {
            ServiceMode::Response => entry.continuation.on_response(envelope.payload),
            _ => entry
                .continuation
                .on_error(decode_service_error(&envelope.payload)),
        }
        true
    }

    /// Remove one conversation and hand it `on_discard`.
    pub fn cancel(&self, id: ConversationId, reason: DiscardReason) -> bool {
        let entry = self.inner.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                entry.continuation.on_discard(reason);
                true
            }
            None => false,
        }
    }

    /// Discard every pending conversation and refuse new ones.
    ///
    /// Returns how many conversations were discarded. A second call finds
    /// the table empty and discards nothing.
    pub fn discard_all(&self, reason: DiscardReason) -> usize {
        let mut drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed.get_or_insert(reason);
            inner.pending.drain().collect()
        };
        drained.sort_by_key(|(id, _)| *id);

        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(
                service = %entry.service_type,
                conversation = %id,
                %reason,
                "Discarding conversation"
            );
            entry.continuation.on_discard(reason);
        }
        count
    }

    /// Number of conversations awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_pending(&self, id: ConversationId) -> bool {
        self.inner.lock().pending.contains_key(&id)
    }

    /// True once `discard_all` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Error envelopes carry a MessagePack `ServiceError`. Anything else is kept
/// as text under `Unknown`.
fn decode_service_error(payload: &[u8]) -> ServiceError {
    MsgPackCodec::decode::<ServiceError>(payload).unwrap_or_else(|_| {
        ServiceError::new(ErrorCode::Unknown, String::from_utf8_lossy(payload))
    })
}
