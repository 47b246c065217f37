//! Packet type and the frame codec.
//!
//! A [`Packet`] is the decoded wire unit: correlation id, command, extension
//! flags and the *uncompressed* body. [`FrameCodec`] turns packets into frame
//! bytes and back, applying snappy block compression when the extension's
//! compression bit is set (or when the configured policy asks for it).
//!
//! # Example
//!
//! ```
//! use meshwire::protocol::{CmdType, FrameCodec, Packet};
//! use bytes::Bytes;
//!
//! let codec = FrameCodec::new().with_compression(true);
//! let packet = Packet::new(7, CmdType::Ping, Bytes::from_static(b"{\"timestamp\":1}"));
//!
//! let raw = codec.encode(&packet).unwrap();
//! let decoded = codec.decode(&raw).unwrap();
//! assert_eq!(decoded.opaque, 7);
//! assert!(decoded.is_compressed());
//! assert_eq!(decoded.payload(), packet.payload());
//! ```

use bytes::Bytes;

use super::wire_format::{extension, CmdType, Header, DEFAULT_MAX_FRAME_LENGTH, HEADER_SIZE};
use crate::codec::SnappyCodec;
use crate::error::{Result, WireError};

/// A complete, decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Caller-assigned correlation id.
    pub opaque: u32,
    /// Command carried by this packet.
    pub command: CmdType,
    /// Extension flags as seen on the wire.
    pub extension: u8,
    /// Body bytes, already decompressed.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet with no extension flags.
    pub fn new(opaque: u32, command: CmdType, payload: Bytes) -> Self {
        Self {
            opaque,
            command,
            extension: 0,
            payload,
        }
    }

    /// Set the extension flags.
    pub fn with_extension(mut self, extension: u8) -> Self {
        self.extension = extension;
        self
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check whether the body travelled snappy-compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        extension::has_flag(self.extension, extension::SNAPPY)
    }

    /// Build the reply packet for this one: same opaque, given command.
    pub fn reply(&self, command: CmdType, payload: Bytes) -> Self {
        Self::new(self.opaque, command, payload)
    }
}

/// Encodes and decodes frames, with optional snappy compression.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: u32,
    compress: bool,
}

impl FrameCodec {
    /// Codec with the default maximum frame length and no forced compression.
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            compress: false,
        }
    }

    /// Set the maximum accepted body length, compressed or not.
    pub fn with_max_frame_length(mut self, max_frame_length: u32) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Compress every outgoing body, regardless of the packet's own flag.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Maximum accepted body length.
    #[inline]
    pub fn max_frame_length(&self) -> u32 {
        self.max_frame_length
    }

    /// Whether outgoing bodies are always compressed.
    #[inline]
    pub fn compresses(&self) -> bool {
        self.compress
    }

    /// Decode a complete frame (header followed by exactly `length` body bytes).
    pub fn decode(&self, raw: &[u8]) -> Result<Packet> {
        let header = Header::decode(raw).ok_or_else(|| {
            WireError::Protocol(format!("Frame shorter than header: {} bytes", raw.len()))
        })?;
        header.validate(self.max_frame_length)?;

        let body = &raw[HEADER_SIZE..];
        if body.len() != header.length as usize {
            return Err(WireError::Protocol(format!(
                "Frame body is {} bytes, header declares {}",
                body.len(),
                header.length
            )));
        }
        self.decode_body(header, Bytes::copy_from_slice(body))
    }

    /// Turn an already framed body into a packet, decompressing if flagged.
    ///
    /// Used by [`FrameBuffer`](super::FrameBuffer) once it has collected the
    /// body bytes for a validated header.
    pub fn decode_body(&self, header: Header, body: Bytes) -> Result<Packet> {
        let command = CmdType::try_from(header.cmd_type)?;
        let payload = if header.is_compressed() {
            Bytes::from(SnappyCodec::decompress(&body, self.max_frame_length)?)
        } else {
            body
        };

        Ok(Packet {
            opaque: header.opaque,
            command,
            extension: header.extension,
            payload,
        })
    }

    /// Encode a packet into header and body parts, ready for vectored writes.
    pub fn encode_parts(&self, packet: &Packet) -> Result<([u8; HEADER_SIZE], Bytes)> {
        let mut ext = packet.extension;
        let body = if self.compress || packet.is_compressed() {
            ext |= extension::SNAPPY;
            Bytes::from(SnappyCodec::compress(&packet.payload)?)
        } else {
            packet.payload.clone()
        };

        let length = u32::try_from(body.len()).unwrap_or(u32::MAX);
        if length > self.max_frame_length {
            return Err(WireError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }

        let header = Header::new(packet.opaque, length, packet.command, ext);
        Ok((header.encode(), body))
    }

    /// Encode a packet into a single contiguous frame.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        let (header, body) = self.encode_parts(packet)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
