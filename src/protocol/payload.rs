//! A bounds-checked cursor over frame payloads.
//!
//! Debuggee payloads are untrusted: every read is validated against the
//! remaining length and yields [ProtocolError::Truncated] on underflow
//! instead of panicking. Strings come in three encodings depending on the
//! field: ASCII/UTF-8 with a single NUL terminator, and UTF-16LE with a
//! two-byte terminator.

use byteorder::{ByteOrder, LittleEndian};

use super::ProtocolError;

/// Streaming reader over a payload slice.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Creates a reader over the whole payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a reader starting at `pos`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos: pos.min(data.len()),
        }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once the payload is fully consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }

        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a signed byte.
    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.take(1)?[0] as i8)
    }

    /// Reads an unsigned 16-bit integer.
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    /// Reads a signed 16-bit integer.
    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    /// Reads an unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Reads a signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    /// Reads an unsigned 64-bit integer.
    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Reads a signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Reads a 32-bit float.
    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    /// Reads a 64-bit float.
    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Reads an unsigned platform integer: 8 bytes when `wide`, else 4.
    pub fn read_uint(&mut self, wide: bool) -> Result<u64, ProtocolError> {
        if wide {
            self.read_u64()
        } else {
            Ok(self.read_u32()? as u64)
        }
    }

    /// Reads a signed platform integer: 8 bytes when `wide`, else 4.
    pub fn read_int(&mut self, wide: bool) -> Result<i64, ProtocolError> {
        if wide {
            self.read_i64()
        } else {
            Ok(self.read_i32()? as i64)
        }
    }

    /// Reads a NUL-terminated byte string (without the terminator), decoded
    /// as UTF-8, lossily. Used for both the ASCII and UTF-8 string fields.
    pub fn read_utf8z(&mut self) -> Result<String, ProtocolError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Truncated {
                needed: 1,
                remaining: 0,
            })?;

        self.pos += nul + 1;
        Ok(String::from_utf8_lossy(&rest[..nul]).into_owned())
    }

    /// Reads a UTF-16LE string terminated by a two-byte NUL.
    pub fn read_utf16z(&mut self) -> Result<String, ProtocolError> {
        let mut units = Vec::new();
        loop {
            let unit = self.read_u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        Ok(String::from_utf16_lossy(&units))
    }

    /// Reads a debuggee string in the encoding the executable-mode flags
    /// dictate: UTF-16LE when `unicode`, UTF-8 otherwise.
    pub fn read_pb_string(&mut self, unicode: bool) -> Result<String, ProtocolError> {
        if unicode {
            self.read_utf16z()
        } else {
            self.read_utf8z()
        }
    }
}

/// Decodes an entire buffer as text in the encoding the executable-mode
/// flags dictate, stopping at the first terminator if one is present.
pub fn decode_text(data: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        String::from_utf8_lossy(&data[..end]).into_owned()
    }
}

/// Encodes text for the debuggee, appending the matching NUL terminator.
pub fn encode_text(text: &str, unicode: bool) -> Vec<u8> {
    if unicode {
        let mut out = Vec::with_capacity((text.len() + 1) * 2);
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
        out
    } else {
        let mut out = text.as_bytes().to_vec();
        out.push(0);
        out
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scalar_reads() {
        let data = [0x2a, 0x00, 0x00, 0x00, 0xff, 0x01, 0x02];
        let mut r = PayloadReader::new(&data);

        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_i8().unwrap(), -1);
        assert_eq!(r.read_u16().unwrap(), 0x0201);
        assert!(r.is_empty());
    }

    #[test]
    fn truncation_is_an_error() {
        let mut r = PayloadReader::new(&[1, 2]);
        assert_matches!(
            r.read_u32(),
            Err(ProtocolError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn platform_ints() {
        let data = 0x0102030405060708u64.to_le_bytes();

        let mut r = PayloadReader::new(&data);
        assert_eq!(r.read_uint(false).unwrap(), 0x05060708);

        let mut r = PayloadReader::new(&data);
        assert_eq!(r.read_uint(true).unwrap(), 0x0102030405060708);
    }

    #[test]
    fn utf8z() {
        let mut r = PayloadReader::new(b"first\0second\0");
        assert_eq!(r.read_utf8z().unwrap(), "first");
        assert_eq!(r.read_utf8z().unwrap(), "second");
        assert!(r.is_empty());
    }

    #[test]
    fn utf8z_without_terminator() {
        let mut r = PayloadReader::new(b"oops");
        assert_matches!(r.read_utf8z(), Err(ProtocolError::Truncated { .. }));
    }

    #[test]
    fn utf16z() {
        // "Hi" in UTF-16LE plus terminator, then a trailing byte.
        let data = [0x48, 0x00, 0x69, 0x00, 0x00, 0x00, 0x07];
        let mut r = PayloadReader::new(&data);

        assert_eq!(r.read_utf16z().unwrap(), "Hi");
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn text_roundtrip_both_encodings() {
        for unicode in [false, true] {
            let bytes = encode_text("x = Strings()", unicode);
            assert_eq!(decode_text(&bytes, unicode), "x = Strings()");
        }
    }
}
