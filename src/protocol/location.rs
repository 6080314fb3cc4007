//! Packed source locations.
//!
//! Both directions of the protocol describe source positions as a single u32
//! word: the upper 12 bits select a file from the session's file map (0 is
//! always the main source), the lower 20 bits hold a 0-based line number.

const FILE_SHIFT: u32 = 20;
const LINE_MASK: u32 = 0x000f_ffff;

/// Sentinel for "no location", e.g. in a `History` event with no current
/// frame.
pub const NO_LOCATION: u32 = u32::MAX;

/// A file index / line pair as packed into a protocol value word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLocation {
    /// Index into the session file map. 0 is the main source file.
    pub file: u32,
    /// 0-based line number.
    pub line: u32,
}

impl SourceLocation {
    /// Creates a location from a file index and a 0-based line.
    pub fn new(file: u32, line: u32) -> Self {
        Self { file, line }
    }

    /// Packs the location into a u32 value word.
    pub fn pack(self) -> u32 {
        (self.file << FILE_SHIFT) | (self.line & LINE_MASK)
    }

    /// Unpacks a value word into a location.
    pub fn unpack(raw: u32) -> Self {
        Self {
            file: raw >> FILE_SHIFT,
            line: raw & LINE_MASK,
        }
    }

    /// Unpacks a value word, mapping the [NO_LOCATION] sentinel to `None`.
    pub fn unpack_checked(raw: u32) -> Option<Self> {
        if raw == NO_LOCATION {
            None
        } else {
            Some(Self::unpack(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pack_bijection() {
        for file in [0u32, 1, 2, 17, 0x7ff, 0xfff] {
            for line in [0u32, 1, 41, 1000, 0x000f_fffe, 0x000f_ffff] {
                let loc = SourceLocation::new(file, line);
                assert_eq!(SourceLocation::unpack(loc.pack()), loc);
            }
        }
    }

    #[test]
    fn main_file_packs_to_plain_line() {
        assert_eq!(SourceLocation::new(0, 41).pack(), 41);
        assert_eq!(SourceLocation::unpack(41), SourceLocation::new(0, 41));
    }

    #[test]
    fn sentinel() {
        assert_eq!(SourceLocation::unpack_checked(NO_LOCATION), None);
        assert_eq!(
            SourceLocation::unpack_checked(0),
            Some(SourceLocation::new(0, 0))
        );
    }
}
