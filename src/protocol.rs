//! The PureBasic debugger wire protocol.
//!
//! Every message on the debugger channel is a [Frame]: a fixed 20-byte
//! little-endian header followed by `data_size` payload bytes. The header
//! carries the command (or event) identifier and two opaque value words whose
//! meaning depends on the command; the timestamp word is preserved verbatim
//! and never interpreted.

pub mod command;
pub mod events;
pub mod location;
pub mod payload;
pub mod value;

mod error;

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub use command::*;
pub use error::*;
pub use events::*;
pub use location::*;
pub use value::*;

/// Debugger protocol version implemented by this library.
///
/// Debuggees announcing a different version in their `Init` event still work
/// for the most part; the mismatch is logged, not fatal.
pub const PROTOCOL_VERSION: u32 = 12;

/// Size of the fixed frame header, in bytes.
pub const HEADER_SIZE: usize = 5 * 4;

/// A single message on the debugger channel, in either direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Command or event identifier.
    pub command: u32,
    /// First opaque value word. Often a packed file/line location, an action
    /// code, or a count.
    pub value1: u32,
    /// Second opaque value word.
    pub value2: u32,
    /// Opaque timestamp set by the debuggee. Preserved verbatim.
    pub timestamp: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Creates a frame with no payload and zeroed value words.
    pub fn new(command: u32) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    /// Creates a frame with the given value words and no payload.
    pub fn with_values(command: u32, value1: u32, value2: u32) -> Self {
        Self {
            command,
            value1,
            value2,
            ..Default::default()
        }
    }

    /// The payload length as it appears in the header.
    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Total size of the frame on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Parses a frame from the start of `bytes`.
    ///
    /// The caller guarantees that `bytes` holds a complete frame, i.e. at
    /// least [HEADER_SIZE] header bytes plus the payload length the header
    /// declares. Handing over a short buffer is a programming error.
    pub fn parse(bytes: &[u8]) -> Frame {
        assert!(bytes.len() >= HEADER_SIZE, "frame header underflow");

        let command = LittleEndian::read_u32(&bytes[0..4]);
        let data_size = LittleEndian::read_u32(&bytes[4..8]) as usize;
        let value1 = LittleEndian::read_u32(&bytes[8..12]);
        let value2 = LittleEndian::read_u32(&bytes[12..16]);
        let timestamp = LittleEndian::read_u32(&bytes[16..20]);

        assert!(
            bytes.len() >= HEADER_SIZE + data_size,
            "frame payload underflow"
        );

        Frame {
            command,
            value1,
            value2,
            timestamp,
            data: bytes[HEADER_SIZE..HEADER_SIZE + data_size].to_vec(),
        }
    }

    /// Appends the serialised frame to `buf` and returns the number of bytes
    /// written, always exactly [`wire_size`](Self::wire_size).
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        buf.reserve(self.wire_size());
        buf.extend_from_slice(&self.command.to_le_bytes());
        buf.extend_from_slice(&self.data_size().to_le_bytes());
        buf.extend_from_slice(&self.value1.to_le_bytes());
        buf.extend_from_slice(&self.value2.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.data);

        self.wire_size()
    }

    /// Serialises the frame into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        self.encode(&mut buf);
        buf
    }
}

/// Returns the total wire size of the frame starting at `bytes`, or `None`
/// if not even the header has arrived yet.
pub fn pending_frame_size(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }

    Some(HEADER_SIZE + LittleEndian::read_u32(&bytes[4..8]) as usize)
}

/// Writes a frame to an output stream.
pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    w.write_u32::<LittleEndian>(frame.command)?;
    w.write_u32::<LittleEndian>(frame.data_size())?;
    w.write_u32::<LittleEndian>(frame.value1)?;
    w.write_u32::<LittleEndian>(frame.value2)?;
    w.write_u32::<LittleEndian>(frame.timestamp)?;
    w.write_all(&frame.data)?;

    Ok(())
}
