//! Codec module - serialization of service payloads.
//!
//! Payload encoding is an implementation choice of this crate: every
//! service payload struct is MessagePack via [`MsgPackCodec`]. Topic values
//! themselves are opaque bytes and pass through untouched.

mod msgpack;

pub use msgpack::MsgPackCodec;
