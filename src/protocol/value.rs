//! Decoder for the debuggee's dynamically-typed variable payloads.
//!
//! Variable values arrive as a raw type byte followed by a type-dependent
//! encoding. Bit 7 of the type byte marks a pointer; the low bits select the
//! base type. Pointer, `Integer`, `List` and `Map` fields are sized by the
//! debuggee architecture, so the executable-mode flags are an explicit input.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive as _;

use super::{events::ExeFlags, payload::PayloadReader, ProtocolError};

/// Base variable types on the wire.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum ValueType {
    Byte = 1,
    Word = 3,
    Long = 5,
    Structure = 7,
    String = 8,
    Float = 9,
    FixedString = 10,
    Character = 11,
    Double = 12,
    Quad = 13,
    List = 14,
    Array = 15,
    Integer = 21,
    Map = 22,
    Ascii = 24,
    Unicode = 25,
}

/// Pointer marker in the raw type byte.
pub const POINTER_FLAG: u8 = 0x80;

const BASE_TYPE_MASK: u8 = 0x3f;

/// A decoded variable value, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedValue {
    /// Rendered value.
    pub value: String,
    /// Display type name.
    pub type_name: String,
    /// Payload bytes consumed, not counting the raw type byte itself.
    pub consumed: usize,
}

impl DecodedValue {
    fn new(value: impl Into<String>, type_name: impl Into<String>, consumed: usize) -> Self {
        Self {
            value: value.into(),
            type_name: type_name.into(),
            consumed,
        }
    }

    fn invalid(type_name: impl Into<String>) -> Self {
        Self::new("<invalid>", type_name, 0)
    }
}

/// Decodes one value of type `raw_type` from `data` starting at `offset`.
///
/// Short input never panics: the result is `<invalid>` with zero bytes
/// consumed, except for `Structure`, whose encoding is intentionally empty.
pub fn decode_value(raw_type: u8, data: &[u8], offset: usize, flags: ExeFlags) -> DecodedValue {
    if raw_type & POINTER_FLAG != 0 {
        return decode_pointer(data, offset, flags);
    }

    let base = raw_type & BASE_TYPE_MASK;
    let Some(ty) = ValueType::from_u8(base) else {
        return DecodedValue::new("<unknown>", format!("Type<{base}>"), 0);
    };

    match try_decode(ty, data, offset, flags) {
        Ok(v) => v,
        Err(_) => DecodedValue::invalid(type_name(ty)),
    }
}

fn decode_pointer(data: &[u8], offset: usize, flags: ExeFlags) -> DecodedValue {
    let mut r = PayloadReader::at(data, offset);
    let wide = flags.is_64bit();

    match r.read_uint(wide) {
        Ok(addr) if wide => DecodedValue::new(format!("0x{addr:016X}"), "Pointer", 8),
        Ok(addr) => DecodedValue::new(format!("0x{addr:08X}"), "Pointer", 4),
        Err(_) => DecodedValue::invalid("Pointer"),
    }
}

fn try_decode(
    ty: ValueType,
    data: &[u8],
    offset: usize,
    flags: ExeFlags,
) -> Result<DecodedValue, ProtocolError> {
    let mut r = PayloadReader::at(data, offset);
    let name = type_name(ty);

    let decoded = match ty {
        ValueType::Byte => DecodedValue::new(r.read_i8()?.to_string(), name, 1),
        ValueType::Ascii => DecodedValue::new(r.read_i8()?.to_string(), name, 1),
        ValueType::Word => DecodedValue::new(r.read_i16()?.to_string(), name, 2),
        ValueType::Unicode => DecodedValue::new(r.read_i16()?.to_string(), name, 2),
        ValueType::Long => DecodedValue::new(r.read_i32()?.to_string(), name, 4),
        ValueType::Character => DecodedValue::new(r.read_i32()?.to_string(), name, 4),
        ValueType::Quad => DecodedValue::new(r.read_i64()?.to_string(), name, 8),
        ValueType::Float => DecodedValue::new(r.read_f32()?.to_string(), name, 4),
        ValueType::Double => DecodedValue::new(r.read_f64()?.to_string(), name, 8),
        ValueType::Integer => {
            let wide = flags.is_64bit();
            let v = r.read_int(wide)?;
            DecodedValue::new(v.to_string(), name, if wide { 8 } else { 4 })
        }
        ValueType::Structure => DecodedValue::new("<structure>", name, 0),
        ValueType::String | ValueType::FixedString => {
            let s = r.read_utf16z()?;
            DecodedValue::new(format!("\"{s}\""), name, r.position() - offset)
        }
        ValueType::List => {
            let wide = flags.is_64bit();
            let size = r.read_int(wide)?;
            let current = r.read_int(wide)?;
            DecodedValue::new(
                format!("size {size}, current {current}"),
                name,
                r.position() - offset,
            )
        }
        ValueType::Array => {
            let dims = r.read_utf8z()?;
            DecodedValue::new(dims, name, r.position() - offset)
        }
        ValueType::Map => {
            let size = r.read_int(flags.is_64bit())?;
            let current_valid = r.read_u8()? != 0;
            let value = if current_valid {
                let key = r.read_utf16z()?;
                format!("size {size}, current key \"{key}\"")
            } else {
                format!("size {size}")
            };
            DecodedValue::new(value, name, r.position() - offset)
        }
    };

    Ok(decoded)
}

fn type_name(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Byte => "Byte",
        ValueType::Word => "Word",
        ValueType::Long => "Long",
        ValueType::Structure => "Structure",
        ValueType::String => "String",
        ValueType::Float => "Float",
        ValueType::FixedString => "FixedString",
        ValueType::Character => "Character",
        ValueType::Double => "Double",
        ValueType::Quad => "Quad",
        ValueType::List => "List",
        ValueType::Array => "Array",
        ValueType::Integer => "Integer",
        ValueType::Map => "Map",
        ValueType::Ascii => "Ascii",
        ValueType::Unicode => "Unicode",
    }
}
