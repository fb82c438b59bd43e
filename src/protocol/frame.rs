//! Frame struct with typed constructors and the body codec.
//!
//! Body layout after the header:
//!
//! ```text
//! [request_n: u32]                      REQUEST_STREAM, REQUEST_CHANNEL, REQUEST_N
//! [route_len: u16][route]               METADATA flag
//! [count: u16]([klen: u16][k][vlen: u16][v])*
//! payload...                            remainder
//! ```
//!
//! Payloads use `bytes::Bytes` so decoded frames share the read buffer.
//!
//! # Example
//!
//! ```
//! use relaywire::protocol::{Frame, FrameKind};
//! use bytes::Bytes;
//!
//! let frame = Frame::request(FrameKind::RequestResponse, 1, "/greet", Bytes::from_static(b"hi"));
//! let bytes = frame.encode().unwrap();
//! let decoded = Frame::decode(&bytes, 1024).unwrap();
//!
//! assert_eq!(decoded.route.as_deref(), Some("/greet"));
//! assert_eq!(&decoded.payload[..], b"hi");
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::{flags, FrameKind, Header, HEADER_SIZE};
use crate::error::CodecError;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to.
    pub stream_id: u32,
    /// Frame kind.
    pub kind: FrameKind,
    /// Terminal flag: the sender's direction ends with this frame.
    pub complete: bool,
    /// Credits, for kinds that carry them.
    pub request_n: u32,
    /// Destination, only on initiating frames.
    pub route: Option<String>,
    /// Free-form metadata, only on initiating frames.
    pub metadata: BTreeMap<String, String>,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    fn bare(kind: FrameKind, stream_id: u32) -> Self {
        Self {
            stream_id,
            kind,
            complete: false,
            request_n: 0,
            route: None,
            metadata: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    /// Initiating frame for the given request kind.
    pub fn request(kind: FrameKind, stream_id: u32, route: &str, payload: Bytes) -> Self {
        Self {
            route: Some(route.to_string()),
            payload,
            ..Self::bare(kind, stream_id)
        }
    }

    /// Attach metadata entries.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the initial credit count.
    pub fn with_request_n(mut self, n: u32) -> Self {
        self.request_n = n;
        self
    }

    /// A payload frame, optionally terminating the sender's direction.
    pub fn payload(stream_id: u32, payload: Bytes, complete: bool) -> Self {
        Self {
            complete,
            payload,
            ..Self::bare(FrameKind::Payload, stream_id)
        }
    }

    /// End of the sender's direction.
    pub fn complete(stream_id: u32) -> Self {
        Self {
            complete: true,
            ..Self::bare(FrameKind::Complete, stream_id)
        }
    }

    /// Terminal error with an already encoded error body.
    pub fn error(stream_id: u32, body: Bytes) -> Self {
        Self {
            complete: true,
            payload: body,
            ..Self::bare(FrameKind::Error, stream_id)
        }
    }

    /// Best-effort cancellation.
    pub fn cancel(stream_id: u32) -> Self {
        Self::bare(FrameKind::Cancel, stream_id)
    }

    /// Credit grant.
    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Self {
            request_n: n,
            ..Self::bare(FrameKind::RequestN, stream_id)
        }
    }

    /// Whether the route/metadata section is written.
    #[inline]
    pub fn has_metadata_section(&self) -> bool {
        self.route.is_some() || !self.metadata.is_empty()
    }

    fn flags(&self) -> u8 {
        let mut f = 0;
        if self.has_metadata_section() {
            f |= flags::METADATA;
        }
        if self.complete {
            f |= flags::COMPLETE;
        }
        f
    }

    /// Encode into header bytes, a prefix (credits/route/metadata) and the
    /// untouched payload, for vectored writes.
    pub fn encode_parts(&self) -> Result<([u8; HEADER_SIZE], Bytes, Bytes), CodecError> {
        if self.kind.is_initiating() && self.route.is_none() {
            return Err(CodecError::MissingRoute);
        }

        let mut prefix = BytesMut::new();
        if self.kind.carries_request_n() {
            prefix.put_u32(self.request_n);
        }
        if self.has_metadata_section() {
            put_str(&mut prefix, self.route.as_deref().unwrap_or(""), "route")?;
            let count = u16::try_from(self.metadata.len()).map_err(|_| CodecError::FieldTooLong {
                field: "metadata",
                len: self.metadata.len(),
            })?;
            prefix.put_u16(count);
            for (key, value) in &self.metadata {
                put_str(&mut prefix, key, "metadata key")?;
                put_str(&mut prefix, value, "metadata value")?;
            }
        }

        let body_len = prefix.len() + self.payload.len();
        let length = u32::try_from(body_len).map_err(|_| CodecError::FieldTooLong {
            field: "frame body",
            len: body_len,
        })?;
        let header = Header::new(length, self.stream_id, self.kind, self.flags());
        Ok((header.encode(), prefix.freeze(), self.payload.clone()))
    }

    /// Encode into one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let (header, prefix, payload) = self.encode_parts()?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + prefix.len() + payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&prefix);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode one complete frame (header + body) from `buf`.
    ///
    /// Rejects bodies larger than `max_frame_size` with
    /// [`CodecError::OversizedFrame`].
    pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<Frame, CodecError> {
        let header = Header::decode(buf).ok_or(CodecError::Truncated {
            field: "header",
            needed: HEADER_SIZE,
            available: buf.len(),
        })?;
        header.validate(max_frame_size)?;

        let body = &buf[HEADER_SIZE..];
        if body.len() != header.length as usize {
            return Err(CodecError::LengthMismatch {
                declared: header.length as usize,
                actual: body.len(),
            });
        }
        Self::decode_body(&header, Bytes::copy_from_slice(body))
    }

    /// Decode a body whose header has already been read and validated.
    pub fn decode_body(header: &Header, mut body: Bytes) -> Result<Frame, CodecError> {
        let kind = FrameKind::from_tag(header.kind)?;
        if header.flags & flags::RESERVED_MASK != 0 {
            return Err(CodecError::ReservedFlags(header.flags));
        }

        let request_n = if kind.carries_request_n() {
            need(&body, 4, "request_n")?;
            body.get_u32()
        } else {
            0
        };

        let mut route = None;
        let mut metadata = BTreeMap::new();
        if header.has(flags::METADATA) {
            route = Some(get_str(&mut body, "route")?);
            need(&body, 2, "metadata count")?;
            let count = body.get_u16();
            for _ in 0..count {
                let key = get_str(&mut body, "metadata key")?;
                let value = get_str(&mut body, "metadata value")?;
                metadata.insert(key, value);
            }
        }
        if kind.is_initiating() && route.is_none() {
            return Err(CodecError::MissingRoute);
        }

        Ok(Frame {
            stream_id: header.stream_id,
            kind,
            complete: header.has(flags::COMPLETE),
            request_n,
            route,
            metadata,
            payload: body,
        })
    }
}

fn need(body: &Bytes, needed: usize, field: &'static str) -> Result<(), CodecError> {
    if body.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            available: body.remaining(),
        });
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str, field: &'static str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_str(body: &mut Bytes, field: &'static str) -> Result<String, CodecError> {
    need(body, 2, field)?;
    let len = body.get_u16() as usize;
    need(body, len, field)?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
}
