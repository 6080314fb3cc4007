//! Typed views over the events the debuggee sends.
//!
//! Each event is a thin parser from a [Frame] into a struct the session
//! controller can act on. Parsers never trust the payload: short or
//! malformed data surfaces as a [ProtocolError].

use bitflags::bitflags;

use super::{
    location::{SourceLocation, NO_LOCATION},
    payload::{decode_text, PayloadReader},
    value::{decode_value, DecodedValue},
    Frame, ProtocolError,
};

bitflags! {
    /// Executable-mode flag word from the `ExeMode` event.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ExeFlags: u32 {
        /// Strings are UTF-16LE; otherwise UTF-8.
        const UNICODE = 1 << 0;
        /// Pointers and platform integers are 8 bytes wide.
        const EXECUTABLE_64BIT = 1 << 2;
    }
}

impl ExeFlags {
    /// True when debuggee strings are UTF-16LE.
    pub fn is_unicode(self) -> bool {
        self.contains(ExeFlags::UNICODE)
    }

    /// True when the debuggee is a 64-bit executable.
    pub fn is_64bit(self) -> bool {
        self.contains(ExeFlags::EXECUTABLE_64BIT)
    }

    /// Parses the flag word out of an `ExeMode` event.
    pub fn from_event(frame: &Frame) -> Self {
        ExeFlags::from_bits_truncate(frame.value1)
    }
}

/// The unsolicited `Init` event sent right after the debuggee connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitEvent {
    /// Number of included files, from value1.
    pub included_files: u32,
    /// Protocol version the debuggee speaks, from value2.
    pub version: u32,
    /// Working directory of the debuggee.
    pub working_dir: String,
    /// Main source file, possibly relative to the working directory.
    pub main_source: String,
    /// Included source files, relative to the working directory.
    pub includes: Vec<String>,
}

impl InitEvent {
    /// Parses an `Init` event payload: a NUL-terminated UTF-8 path list.
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(&frame.data);

        let working_dir = r.read_utf8z()?;
        let main_source = r.read_utf8z()?;

        let mut includes = Vec::new();
        while !r.is_empty() {
            let path = r.read_utf8z()?;
            if path.is_empty() {
                break;
            }
            includes.push(path);
        }

        Ok(Self {
            included_files: frame.value1,
            version: frame.value2,
            working_dir,
            main_source,
            includes,
        })
    }
}

/// A `Stopped` event: the debuggee halted at a source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedEvent {
    /// Where execution halted.
    pub location: SourceLocation,
    /// Wire stop-reason code, see [StopCode](super::StopCode).
    pub code: u32,
}

impl StoppedEvent {
    /// Decodes the packed location and reason code.
    pub fn parse(frame: &Frame) -> Self {
        Self {
            location: SourceLocation::unpack(frame.value1),
            code: frame.value2,
        }
    }
}

/// One entry of a `History` event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Packed call-site location.
    pub location: SourceLocation,
    /// Procedure name as the debuggee reports it, possibly `Module::Name`.
    pub name: String,
}

/// A `History` event: the call history for the current stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    /// Location of the current frame, absent when value2 is the sentinel.
    pub current: Option<SourceLocation>,
    /// History entries in payload order, oldest caller first.
    pub entries: Vec<HistoryEntry>,
}

impl HistoryEvent {
    /// Parses a `History` event.
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let current = if frame.value2 == NO_LOCATION {
            None
        } else {
            Some(SourceLocation::unpack(frame.value2))
        };

        let mut entries = Vec::new();
        let mut r = PayloadReader::new(&frame.data);
        while !r.is_empty() {
            let location = SourceLocation::unpack(r.read_u32()?);
            let name = r.read_utf16z()?;
            entries.push(HistoryEntry { location, name });
        }

        Ok(Self { current, entries })
    }
}

/// Parses a `GlobalNames` payload into display keys.
///
/// Two layouts exist in the wild. The strict form is tried first: a u32
/// count followed by `{u32 type, utf16z name}` entries, accepted only when
/// every entry parses and the count matches exactly. Anything else falls
/// back to the stream form: `{u8 type, 6 prefix bytes, asciiz name, asciiz
/// module}` entries, where a non-empty module qualifies the key as
/// `module::name`.
pub fn parse_global_names(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    match parse_global_names_strict(data) {
        Ok(names) => Ok(names),
        Err(err) => {
            log::trace!("strict GlobalNames parse failed ({err}), trying stream form");
            parse_global_names_stream(data)
        }
    }
}

fn parse_global_names_strict(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let mut r = PayloadReader::new(data);
    let count = r.read_u32()? as usize;

    let mut names = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let _type_id = r.read_u32()?;
        names.push(r.read_utf16z()?);
    }

    if !r.is_empty() {
        return Err(ProtocolError::Invalid(format!(
            "{} trailing bytes after {count} global names",
            r.remaining()
        )));
    }

    Ok(names)
}

fn parse_global_names_stream(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let mut r = PayloadReader::new(data);

    let mut names = Vec::new();
    while !r.is_empty() {
        let _raw_type = r.read_u8()?;
        r.skip(6)?;
        let name = r.read_utf8z()?;
        let module = r.read_utf8z()?;

        if name.is_empty() {
            continue;
        }

        if module.is_empty() {
            names.push(name);
        } else {
            names.push(format!("{module}::{name}"));
        }
    }

    Ok(names)
}

/// Parses a `Globals` payload: one `{u8 raw_type, value}` per known name,
/// in name order. Stops early if a value fails to decode.
pub fn parse_globals(data: &[u8], names: &[String], flags: ExeFlags) -> Vec<(String, DecodedValue)> {
    let mut out = Vec::with_capacity(names.len());
    let mut offset = 0usize;

    for name in names {
        if offset >= data.len() {
            break;
        }

        let raw_type = data[offset];
        offset += 1;

        let value = decode_value(raw_type, data, offset, flags);
        if value.consumed == 0 && value.value == "<invalid>" {
            log::warn!("undecodable global value for {name}, dropping the rest");
            break;
        }

        offset += value.consumed;
        out.push((name.clone(), value));
    }

    out
}

/// One local variable from a `Locals` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    /// Variable name.
    pub name: String,
    /// Scope byte as reported by the debuggee.
    pub scope: u8,
    /// Nesting sub-level.
    pub sublevel: u32,
    /// Decoded value.
    pub value: DecodedValue,
}

/// Parses a `Locals` payload. The entry count is in value2; entries with an
/// empty or unparseable name are skipped.
pub fn parse_locals(frame: &Frame, flags: ExeFlags) -> Vec<LocalVariable> {
    let count = frame.value2 as usize;
    let mut r = PayloadReader::new(&frame.data);

    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let Ok(raw_type) = r.read_u8() else { break };
        let Ok(_dynamic_type) = r.read_u8() else {
            break;
        };
        let Ok(scope) = r.read_u8() else { break };
        let Ok(sublevel) = r.read_u32() else { break };
        let Ok(name) = r.read_utf8z() else { break };

        let value = decode_value(raw_type, &frame.data, r.position(), flags);
        if value.consumed == 0 && value.value == "<invalid>" {
            break;
        }
        let _ = r.skip(value.consumed);

        if name.is_empty() {
            continue;
        }

        out.push(LocalVariable {
            name,
            scope,
            sublevel,
            value,
        });
    }

    out
}

/// Renders an `Expression` event into display text.
///
/// The result shape is selected by value2; shapes carrying a name render as
/// `name = value`.
pub fn parse_expression(frame: &Frame, flags: ExeFlags) -> Result<String, ProtocolError> {
    let unicode = flags.is_unicode();
    let mut r = PayloadReader::new(&frame.data);

    let text = match frame.value2 {
        0 => decode_text(&frame.data, false),
        1 => String::new(),
        2 => {
            let value = r.read_i64()?;
            let name = r.read_pb_string(unicode)?;
            render_named(&name, &value.to_string())
        }
        3 => {
            let value = r.read_f64()?;
            let name = r.read_pb_string(unicode)?;
            render_named(&name, &value.to_string())
        }
        4 => {
            let value = r.read_pb_string(unicode)?;
            let name = r.read_pb_string(unicode)?;
            render_named(&name, &format!("\"{value}\""))
        }
        5 => "<structure>".to_string(),
        _ => decode_text(&frame.data, unicode),
    };

    Ok(text)
}

fn render_named(name: &str, value: &str) -> String {
    if name.is_empty() {
        value.to_string()
    } else {
        format!("{name} = {value}")
    }
}

/// Decodes the text carried by a `Debug`, `DebugDouble` or `DebugQuad`
/// event, per that event's sub-encoding.
pub fn parse_debug_output(frame: &Frame, flags: ExeFlags) -> String {
    use super::EventTag;

    match frame.command {
        c if c == EventTag::DebugDouble as u32 => {
            let mut r = PayloadReader::new(&frame.data);
            r.read_f64().map(|v| v.to_string()).unwrap_or_default()
        }
        c if c == EventTag::DebugQuad as u32 => {
            let mut r = PayloadReader::new(&frame.data);
            r.read_i64().map(|v| v.to_string()).unwrap_or_default()
        }
        _ => decode_text(&frame.data, flags.is_unicode()),
    }
}

/// Decodes an `Error` event: a packed location in value1 and a UTF-16LE
/// description in the payload.
pub fn parse_error_event(frame: &Frame) -> (SourceLocation, String) {
    let location = SourceLocation::unpack(frame.value1);
    let description = decode_text(&frame.data, true);

    (location, description)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::EventTag;
    use super::*;

    fn utf16z(s: &str) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn exe_flags() {
        let frame = Frame::with_values(EventTag::ExeMode as u32, 5, 0);
        let flags = ExeFlags::from_event(&frame);

        assert!(flags.is_unicode());
        assert!(flags.is_64bit());

        let frame = Frame::with_values(EventTag::ExeMode as u32, 1, 0);
        assert!(!ExeFlags::from_event(&frame).is_64bit());
    }

    #[test]
    fn init_event() {
        let mut data = Vec::new();
        data.extend_from_slice(b"/work\0");
        data.extend_from_slice(b"main.pb\0");
        data.extend_from_slice(b"inc/util.pb\0");

        let frame = Frame {
            command: EventTag::Init as u32,
            value1: 1,
            value2: 12,
            timestamp: 0,
            data,
        };

        let init = InitEvent::parse(&frame).unwrap();
        assert_eq!(init.working_dir, "/work");
        assert_eq!(init.main_source, "main.pb");
        assert_eq!(init.includes, vec!["inc/util.pb".to_string()]);
        assert_eq!(init.version, 12);
    }

    #[test]
    fn history_event() {
        let mut data = Vec::new();
        data.extend_from_slice(&SourceLocation::new(0, 10).pack().to_le_bytes());
        data.extend_from_slice(&utf16z("Outer"));
        data.extend_from_slice(&SourceLocation::new(1, 3).pack().to_le_bytes());
        data.extend_from_slice(&utf16z("M::Inner"));

        let frame = Frame {
            command: EventTag::History as u32,
            value1: 0,
            value2: SourceLocation::new(0, 20).pack(),
            timestamp: 0,
            data,
        };

        let history = HistoryEvent::parse(&frame).unwrap();
        assert_eq!(history.current, Some(SourceLocation::new(0, 20)));
        assert_eq!(history.entries.len(), 2);
        assert_eq!(history.entries[0].name, "Outer");
        assert_eq!(history.entries[1].location, SourceLocation::new(1, 3));
    }

    #[test]
    fn history_event_without_current() {
        let frame = Frame {
            command: EventTag::History as u32,
            value1: 0,
            value2: NO_LOCATION,
            timestamp: 0,
            data: Vec::new(),
        };

        let history = HistoryEvent::parse(&frame).unwrap();
        assert_eq!(history.current, None);
        assert!(history.entries.is_empty());
    }

    #[test]
    fn global_names_strict() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&13u32.to_le_bytes());
        data.extend_from_slice(&utf16z("counter"));
        data.extend_from_slice(&5u32.to_le_bytes());
        data.extend_from_slice(&utf16z("total"));

        let names = parse_global_names(&data).unwrap();
        assert_eq!(names, vec!["counter".to_string(), "total".to_string()]);
    }

    #[test]
    fn global_names_stream_fallback() {
        let mut data = Vec::new();
        data.push(13);
        data.extend_from_slice(&[0; 6]);
        data.extend_from_slice(b"counter\0\0");
        data.push(5);
        data.extend_from_slice(&[0; 6]);
        data.extend_from_slice(b"total\0Stats\0");

        let names = parse_global_names(&data).unwrap();
        assert_eq!(
            names,
            vec!["counter".to_string(), "Stats::total".to_string()]
        );
    }

    #[test]
    fn globals_values() {
        let names = vec!["a".to_string(), "b".to_string()];
        let mut data = Vec::new();
        data.push(5);
        data.extend_from_slice(&7i32.to_le_bytes());
        data.push(13);
        data.extend_from_slice(&(-1i64).to_le_bytes());

        let flags = ExeFlags::UNICODE | ExeFlags::EXECUTABLE_64BIT;
        let globals = parse_globals(&data, &names, flags);

        assert_eq!(globals.len(), 2);
        assert_eq!(globals[0].1.value, "7");
        assert_eq!(globals[1].1.value, "-1");
    }

    #[test]
    fn locals() {
        let mut data = Vec::new();
        data.push(0x0d); // Quad
        data.push(0); // dynamic type
        data.push(0); // scope
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"x\0");
        data.extend_from_slice(&42i64.to_le_bytes());

        let frame = Frame {
            command: EventTag::Locals as u32,
            value1: 0,
            value2: 1,
            timestamp: 0,
            data,
        };

        let flags = ExeFlags::UNICODE | ExeFlags::EXECUTABLE_64BIT;
        let locals = parse_locals(&frame, flags);

        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].name, "x");
        assert_eq!(locals[0].value.value, "42");
        assert_eq!(locals[0].value.type_name, "Quad");
    }

    #[test]
    fn locals_skips_unnamed_entries() {
        let mut data = Vec::new();
        data.push(5);
        data.push(0);
        data.push(0);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"\0");
        data.extend_from_slice(&1i32.to_le_bytes());
        data.push(5);
        data.push(0);
        data.push(0);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"kept\0");
        data.extend_from_slice(&2i32.to_le_bytes());

        let frame = Frame {
            command: EventTag::Locals as u32,
            value1: 0,
            value2: 2,
            timestamp: 0,
            data,
        };

        let locals = parse_locals(&frame, ExeFlags::UNICODE);
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].name, "kept");
    }

    #[test]
    fn expression_shapes() {
        let flags = ExeFlags::UNICODE;

        let mut data = 42i64.to_le_bytes().to_vec();
        data.extend_from_slice(&utf16z("x"));
        let frame = Frame {
            command: EventTag::Expression as u32,
            value1: 0,
            value2: 2,
            timestamp: 0,
            data,
        };
        assert_eq!(parse_expression(&frame, flags).unwrap(), "x = 42");

        let mut data = utf16z("hello");
        data.extend_from_slice(&utf16z("s"));
        let frame = Frame {
            command: EventTag::Expression as u32,
            value1: 0,
            value2: 4,
            timestamp: 0,
            data,
        };
        assert_eq!(parse_expression(&frame, flags).unwrap(), "s = \"hello\"");

        let frame = Frame {
            command: EventTag::Expression as u32,
            value1: 0,
            value2: 5,
            timestamp: 0,
            data: Vec::new(),
        };
        assert_eq!(parse_expression(&frame, flags).unwrap(), "<structure>");
    }

    #[test]
    fn debug_output() {
        let flags = ExeFlags::UNICODE;

        let frame = Frame {
            command: EventTag::DebugQuad as u32,
            value1: 0,
            value2: 0,
            timestamp: 0,
            data: 7i64.to_le_bytes().to_vec(),
        };
        assert_eq!(parse_debug_output(&frame, flags), "7");

        let frame = Frame {
            command: EventTag::Debug as u32,
            value1: 0,
            value2: 0,
            timestamp: 0,
            data: utf16z("trace line"),
        };
        assert_eq!(parse_debug_output(&frame, flags), "trace line");
    }
}
