//! # topicwire-client
//!
//! Client-side protocol engine for a topic-based publish/subscribe server.
//!
//! A [`Session`] multiplexes many request/response conversations over one
//! connection. On top of it sit topic notification registrations, update
//! sources, and session-properties listeners, all of which survive
//! reconnection.
//!
//! ## Architecture
//!
//! - **Envelopes**: 15-byte big-endian header (service type, mode,
//!   conversation id, payload length) followed by a MessagePack payload
//! - **Conversations**: every request opens a conversation that ends
//!   exactly once, with a response, an error, or a discard
//! - **Delivery**: one task per session routes inbound frames in order
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use topicwire_client::features::notifications::NotificationEvent;
//! use topicwire_client::listener::{DiscardSink, ErrorSink, Observer};
//! use topicwire_client::transport::TcpConnector;
//! use topicwire_client::Session;
//!
//! struct Printer;
//!
//! impl Observer<NotificationEvent> for Printer {
//!     fn on_event(&self, event: NotificationEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//! impl ErrorSink for Printer {}
//! impl DiscardSink for Printer {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::builder()
//!         .connector(TcpConnector::new("127.0.0.1:8090"))
//!         .start()
//!         .await?;
//!
//!     let printer = Arc::new(Printer);
//!     let registration = session.add_topic_notification_listener(&printer).await?;
//!     registration.select("?sensors//").await?;
//!
//!     session.closed().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod conversation;
pub mod error;
pub mod features;
pub mod handler;
pub mod listener;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod transport;

pub use conversation::{ConversationId, DiscardReason};
pub use error::{ErrorCode, Result, ServiceError, SessionError};
pub use handler::RequestContext;
pub use session::{Session, SessionBuilder, SessionConfig, SessionState};
