//! MsgPack codec using `rmp-serde`.
//!
//! Service payloads are encoded with `to_vec_named`, so structs travel as
//! maps keyed by field name. Adding an optional field to a payload struct
//! therefore stays readable by peers that do not know it yet.
//!
//! # Example
//!
//! ```
//! use topicwire_client::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Selection {
//!     registration: u64,
//!     selector: String,
//! }
//!
//! let msg = Selection { registration: 3, selector: "?a//".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Selection = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for service payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Decode an acknowledgment. Any payload, including none, is accepted.
    #[inline]
    pub fn decode_ack(_bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}
