//! Sessions: connection lifecycle, request routing, and recovery.

mod builder;
mod config;
mod runtime;
mod state;

pub use builder::SessionBuilder;
pub use config::{
    ReconnectionConfig, SessionConfig, DEFAULT_MAX_OUTBOUND_QUEUE, DEFAULT_RECONNECTION_INTERVAL,
    DEFAULT_RECONNECTION_TIMEOUT,
};
pub use runtime::Session;
pub use state::{SessionListener, SessionState, StateChange};

pub(crate) use runtime::{BoundPayload, Inbound, SessionInner};
