//! Handler module - server-initiated request handling.
//!
//! Provides:
//! - [`ServiceHandlerRegistry`] - maps service types to handlers, one per session
//! - [`RequestContext`] - lets a handler answer the server

mod context;
mod registry;

pub(crate) use context::FrameSink;
pub use context::RequestContext;
pub use registry::{HandlerResult, ServiceHandler, ServiceHandlerRegistry, TypedHandler};
