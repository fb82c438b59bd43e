//! Wire format encoding and decoding.
//!
//! Implements the 10-byte frame header:
//! ```text
//! ┌──────────┬───────────┬──────┬───────┐
//! │ Length   │ Stream ID │ Kind │ Flags │
//! │ 4 bytes  │ 4 bytes   │ 1 B  │ 1 B   │
//! │ uint32 BE│ uint32 BE │      │       │
//! └──────────┴───────────┴──────┴───────┘
//! ```
//!
//! `Length` counts the body that follows the header, not the header itself.
//! All multi-byte integers are Big Endian.

use std::fmt;

use crate::error::CodecError;

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Default maximum frame body size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest stream ID (31 bits, the top bit is kept clear).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Flag constants for the protocol.
pub mod flags {
    /// Route and metadata section present in the body.
    pub const METADATA: u8 = 0b0000_0001;
    /// This frame also terminates the sender's direction of the stream.
    pub const COMPLETE: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Initiates a request-response exchange.
    RequestResponse = 0x01,
    /// Initiates a request-stream exchange.
    RequestStream = 0x02,
    /// Initiates a request-channel exchange.
    RequestChannel = 0x03,
    /// One-way request, never answered.
    FireAndForget = 0x04,
    /// One payload of a sequence.
    Payload = 0x05,
    /// End of the sender's direction.
    Complete = 0x06,
    /// Terminal failure of the exchange.
    Error = 0x07,
    /// Receiver no longer wants data on this stream.
    Cancel = 0x08,
    /// Credit grant for the opposite direction.
    RequestN = 0x09,
}

impl FrameKind {
    /// Parse a kind tag.
    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0x01 => Self::RequestResponse,
            0x02 => Self::RequestStream,
            0x03 => Self::RequestChannel,
            0x04 => Self::FireAndForget,
            0x05 => Self::Payload,
            0x06 => Self::Complete,
            0x07 => Self::Error,
            0x08 => Self::Cancel,
            0x09 => Self::RequestN,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }

    /// Tag byte on the wire.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether this kind opens a new exchange.
    #[inline]
    pub fn is_initiating(self) -> bool {
        matches!(
            self,
            Self::RequestResponse | Self::RequestStream | Self::RequestChannel | Self::FireAndForget
        )
    }

    /// Whether the body starts with a `request_n` credit count.
    #[inline]
    pub fn carries_request_n(self) -> bool {
        matches!(self, Self::RequestStream | Self::RequestChannel | Self::RequestN)
    }
}

/// The four ways an exchange can be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    /// One request, exactly one response.
    RequestResponse,
    /// One request, a finite sequence of responses.
    RequestStream,
    /// Independent sequences in both directions.
    RequestChannel,
    /// One request, no response.
    FireAndForget,
}

impl InteractionKind {
    /// Frame kind that initiates this interaction.
    pub fn frame_kind(self) -> FrameKind {
        match self {
            Self::RequestResponse => FrameKind::RequestResponse,
            Self::RequestStream => FrameKind::RequestStream,
            Self::RequestChannel => FrameKind::RequestChannel,
            Self::FireAndForget => FrameKind::FireAndForget,
        }
    }

    /// Interaction initiated by a frame kind, if it is an initiating kind.
    pub fn from_frame_kind(kind: FrameKind) -> Option<Self> {
        match kind {
            FrameKind::RequestResponse => Some(Self::RequestResponse),
            FrameKind::RequestStream => Some(Self::RequestStream),
            FrameKind::RequestChannel => Some(Self::RequestChannel),
            FrameKind::FireAndForget => Some(Self::FireAndForget),
            _ => None,
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestResponse => "request-response",
            Self::RequestStream => "request-stream",
            Self::RequestChannel => "request-channel",
            Self::FireAndForget => "fire-and-forget",
        };
        f.write_str(name)
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length in bytes.
    pub length: u32,
    /// Stream identifier.
    pub stream_id: u32,
    /// Raw kind tag (validated on body decode).
    pub kind: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
}

impl Header {
    /// Create a new header.
    pub fn new(length: u32, stream_id: u32, kind: FrameKind, flags: u8) -> Self {
        Self {
            length,
            stream_id,
            kind: kind.tag(),
            flags,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use relaywire::protocol::{FrameKind, Header, HEADER_SIZE};
    ///
    /// let header = Header::new(5, 1, FrameKind::Payload, 0);
    /// assert_eq!(header.encode().len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8] = self.kind;
        buf[9] = self.flags;
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            kind: buf[8],
            flags: buf[9],
        })
    }

    /// Check the header against the frame size limit and flag rules.
    ///
    /// The size check runs before any body byte is buffered.
    pub fn validate(&self, max_frame_size: usize) -> Result<(), CodecError> {
        let len = self.length as usize;
        if len > max_frame_size {
            return Err(CodecError::OversizedFrame {
                len,
                max: max_frame_size,
            });
        }
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(CodecError::ReservedFlags(self.flags));
        }
        FrameKind::from_tag(self.kind)?;
        Ok(())
    }

    /// Check if a flag is set.
    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        flags::has_flag(self.flags, flag)
    }
}
