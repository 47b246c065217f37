//! Protocol module - wire format, framing and bodies.
//!
//! - 10-byte header encoding/decoding ([`Header`], [`CmdType`])
//! - [`FrameCodec`] turning [`Packet`]s into frames, with snappy compression
//! - [`FrameBuffer`] for accumulating partial reads
//! - JSON bodies for each command ([`Payload`], [`Request`], [`Response`])

mod frame;
mod frame_buffer;
mod payload;
mod wire_format;

pub use frame::{FrameCodec, Packet};
pub use frame_buffer::FrameBuffer;
pub use payload::{now_millis, ErrorCode, Heartbeat, OpaqueValue, Payload, Request, Response};
pub use wire_format::{extension, CmdType, Header, DEFAULT_MAX_FRAME_LENGTH, HEADER_SIZE};
