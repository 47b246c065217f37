//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 10 bytes
//! - `WaitingForBody`: Header validated, need N more body bytes
//!
//! The header is validated (known command, length within bounds) before any
//! body bytes are reserved, so a corrupt length field never drives an
//! allocation. Completed bodies go through [`FrameCodec`] and come out as
//! [`Packet`]s; any error returned from [`FrameBuffer::push`] means the stream
//! is desynchronized and the connection must be closed. Readers that answer
//! what they already received use [`FrameBuffer::push_partial`].
//!
//! # Example
//!
//! ```ignore
//! use meshwire::protocol::{FrameBuffer, FrameCodec};
//!
//! let mut buffer = FrameBuffer::new(FrameCodec::new());
//!
//! // Data arrives in chunks from socket
//! let packets = buffer.push(&chunk)?;
//! for packet in packets {
//!     println!("opaque {} command {:?}", packet.opaque, packet.command);
//! }
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, HEADER_SIZE};
use super::{FrameCodec, Packet};
use crate::error::Result;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    codec: FrameCodec,
}

impl FrameBuffer {
    /// Create a frame buffer with a 64KB initial capacity.
    pub fn new(codec: FrameCodec) -> Self {
        Self::with_capacity(64 * 1024, codec)
    }

    /// Create a frame buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize, codec: FrameCodec) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            codec,
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Unknown command, oversized length or a body that fails to decompress.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        let (packets, status) = self.push_partial(data);
        status.map(|()| packets)
    }

    /// Like [`push`](Self::push), but packets completed before a desync are
    /// returned alongside the error instead of being lost with it.
    pub fn push_partial(&mut self, data: &[u8]) -> (Vec<Packet>, Result<()>) {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => return (packets, Ok(())),
                Err(e) => return (packets, Err(e)),
            }
        }
    }

    fn try_extract_one(&mut self) -> Result<Option<Packet>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let Some(header) = Header::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    header.validate(self.codec.max_frame_length())?;

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.buffer.reserve(header.length as usize);
                    self.state = State::WaitingForBody { header };
                }
                State::WaitingForBody { header } => {
                    let needed = header.length as usize;
                    if self.buffer.len() < needed {
                        return Ok(None);
                    }

                    let header = *header;
                    let body = self.buffer.split_to(needed).freeze();
                    self.state = State::WaitingForHeader;

                    return self.codec.decode_body(header, body).map(Some);
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(FrameCodec::new())
    }
}
