//! Codec module - serialization/deserialization for payloads.
//!
//! Frames carry opaque payload bytes. Typed handlers and stubs encode their
//! values with [`MsgPackCodec`], and ERROR frames carry an [`ErrorPayload`]
//! encoded the same way.
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//! This allows for compile-time codec selection.
//!
//! # Example
//!
//! ```
//! use relaywire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::{ErrorPayload, MsgPackCodec};
