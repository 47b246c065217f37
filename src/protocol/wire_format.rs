//! Wire format encoding and decoding.
//!
//! Implements the 10-byte header format:
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────┐
//! │ Opaque   │ Length   │ Cmd Type │ Extension │
//! │ 4 bytes  │ 4 bytes  │ 1 byte   │ 1 byte    │
//! │ uint32 BE│ uint32 BE│          │ bit flags │
//! └──────────┴──────────┴──────────┴───────────┘
//! ```
//!
//! The body follows immediately and is exactly `length` bytes long.
//! All multi-byte integers are Big Endian.

use crate::error::{Result, WireError};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Default maximum frame body length (8 MB).
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 8 * 1024 * 1024;

/// Extension flag constants.
pub mod extension {
    /// Body is a snappy-compressed block.
    pub const SNAPPY: u8 = 0b0000_0001;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(extension: u8, flag: u8) -> bool {
        extension & flag != 0
    }
}

/// Command carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmdType {
    Request = 0x01,
    Response = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Info = 0x05,
}

impl CmdType {
    /// Wire byte for this command.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CmdType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(CmdType::Request),
            0x02 => Ok(CmdType::Response),
            0x03 => Ok(CmdType::Ping),
            0x04 => Ok(CmdType::Pong),
            0x05 => Ok(CmdType::Info),
            other => Err(WireError::Protocol(format!(
                "Unknown command type 0x{:02x}",
                other
            ))),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Caller-assigned correlation id, echoed verbatim in the reply.
    pub opaque: u32,
    /// Body length in bytes (after compression, if any).
    pub length: u32,
    /// Raw command byte (see [`CmdType`]).
    pub cmd_type: u8,
    /// Extension bit flags (see [`extension`]).
    pub extension: u8,
}

impl Header {
    /// Create a new header.
    pub fn new(opaque: u32, length: u32, cmd_type: CmdType, extension: u8) -> Self {
        Self {
            opaque,
            length,
            cmd_type: cmd_type.as_u8(),
            extension,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use meshwire::protocol::{CmdType, Header};
    ///
    /// let header = Header::new(42, 100, CmdType::Request, 0);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 10);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (10 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.opaque.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8] = self.cmd_type;
        buf[9] = self.extension;
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use meshwire::protocol::Header;
    ///
    /// let bytes = [0, 0, 0, 42, 0, 0, 0, 100, 0x01, 0];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.opaque, 42);
    /// assert_eq!(header.length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            opaque: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            cmd_type: buf[8],
            extension: buf[9],
        })
    }

    /// Validate the header before any body bytes are buffered.
    ///
    /// Checks:
    /// - Body length doesn't exceed max
    /// - Command byte is a known command
    pub fn validate(&self, max_frame_length: u32) -> Result<CmdType> {
        if self.length > max_frame_length {
            return Err(WireError::FrameTooLarge {
                length: self.length,
                max: max_frame_length,
            });
        }
        CmdType::try_from(self.cmd_type)
    }

    /// Check if the body is snappy-compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        extension::has_flag(self.extension, extension::SNAPPY)
    }
}
