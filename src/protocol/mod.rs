//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol spoken on a connection:
//! - 10-byte header encoding/decoding
//! - Frame body codec (credits, route, metadata, payload)
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, FrameKind, Header, InteractionKind, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, MAX_STREAM_ID,
};
