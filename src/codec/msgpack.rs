//! MsgPack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named`: structs are written as maps keyed by field
//! name, so peers can add optional fields without breaking older decoders.
//!
//! # Example
//!
//! ```
//! use relaywire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Greeting {
//!     name: String,
//!     age: u32,
//! }
//!
//! let msg = Greeting { name: "jlong".to_string(), age: 36 };
//! let encoded = MsgPackCodec::encode_bytes(&msg).unwrap();
//! let decoded: Greeting = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, RelayError, Result};

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode a value straight into a frame payload.
    #[inline]
    pub fn encode_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Self::encode(value).map(Bytes::from)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Body of an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine readable error class.
    pub code: ErrorCode,
    /// Human readable description.
    pub message: String,
}

impl ErrorPayload {
    /// Build the wire body for a local error.
    pub fn from_error(err: &RelayError) -> Self {
        let message = match err {
            RelayError::Remote { message, .. } | RelayError::Application(message) => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: err.code(),
            message,
        }
    }

    /// Encode for an ERROR frame.
    ///
    /// Falls back to a bare message if encoding fails, so an error can always
    /// be reported.
    pub fn to_bytes(&self) -> Bytes {
        MsgPackCodec::encode_bytes(self).unwrap_or_else(|_| Bytes::from(self.message.clone()))
    }

    /// Decode an ERROR frame body into the error handed to the caller.
    ///
    /// Bodies that are not an `ErrorPayload` are kept as the message text.
    pub fn into_error(body: &[u8]) -> RelayError {
        match MsgPackCodec::decode::<ErrorPayload>(body) {
            Ok(payload) => RelayError::Remote {
                code: payload.code,
                message: payload.message,
            },
            Err(_) => RelayError::Remote {
                code: ErrorCode::Internal,
                message: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}
