//! Capabilities a caller-supplied listener can implement.
//!
//! Push-style registrations are assembled from these pieces rather than from
//! one large callback table: a listener is an [`Observer`] of its event type,
//! plus optional [`ErrorSink`] and [`DiscardSink`] behaviour.
//!
//! The session keeps only `Weak` references to listeners. Dropping the last
//! `Arc` silently ends delivery.

use crate::conversation::DiscardReason;
use crate::error::ServiceError;

/// Receives events of type `E`, one at a time, in arrival order.
pub trait Observer<E>: Send + Sync + 'static {
    fn on_event(&self, event: E);
}

/// Receives failures that happen after a registration was accepted, such as
/// a rejected re-registration after reconnecting.
pub trait ErrorSink: Send + Sync + 'static {
    fn on_error(&self, error: &ServiceError) {
        tracing::debug!(%error, "Unobserved registration error");
    }
}

/// Told when a registration's pending request is discarded.
pub trait DiscardSink: Send + Sync + 'static {
    fn on_discard(&self, reason: DiscardReason) {
        tracing::debug!(%reason, "Unobserved registration discard");
    }
}
