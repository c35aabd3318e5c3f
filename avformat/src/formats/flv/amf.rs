//! AMF0 values as found in FLV script tags.

use crate::io::IoReader;
use crate::utils::errors::FormatError;

const TYPE_NUMBER: u8 = 0;
const TYPE_BOOLEAN: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_OBJECT: u8 = 3;
const TYPE_NULL: u8 = 5;
const TYPE_UNDEFINED: u8 = 6;
const TYPE_ECMA_ARRAY: u8 = 8;
const TYPE_OBJECT_END: u8 = 9;
const TYPE_STRICT_ARRAY: u8 = 10;
const TYPE_DATE: u8 = 11;
const TYPE_LONG_STRING: u8 = 12;

const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    /// Objects and ECMA arrays, in file order.
    Object(Vec<(String, AmfValue)>),
    Array(Vec<AmfValue>),
    /// Milliseconds since the epoch.
    Date(f64),
    Null,
}

impl AmfValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AmfValue]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Member `key` of an object.
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        match self {
            Self::Object(members) => members.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Scalar rendering for metadata tables, `None` for containers.
    pub fn to_metadata(&self) -> Option<String> {
        match self {
            Self::Number(n) => Some(n.to_string()),
            Self::Boolean(b) => Some(b.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Date(ms) => Some(format!("{ms}")),
            Self::Object(_) | Self::Array(_) | Self::Null => None,
        }
    }
}

fn read_short_string(io: &mut IoReader) -> Result<String, FormatError> {
    let len = io.read_u16_be()? as usize;
    Ok(io.read_string(len)?)
}

/// Object members up to the end marker or `end`.
fn read_members(io: &mut IoReader, end: u64, depth: usize) -> Result<Vec<(String, AmfValue)>, FormatError> {
    let mut members = Vec::new();
    while io.pos() + 3 <= end {
        let key = read_short_string(io)?;
        if key.is_empty() && io.peek(1)?.first() == Some(&TYPE_OBJECT_END) {
            io.skip(1)?;
            break;
        }
        let value = read_value_at(io, end, depth + 1)?;
        members.push((key, value));
    }
    Ok(members)
}

fn read_value_at(io: &mut IoReader, end: u64, depth: usize) -> Result<AmfValue, FormatError> {
    if depth > MAX_DEPTH {
        return Err(FormatError::invalid("amf: nesting too deep"));
    }
    let kind = io.read_u8()?;
    Ok(match kind {
        TYPE_NUMBER => AmfValue::Number(io.read_f64_be()?),
        TYPE_BOOLEAN => AmfValue::Boolean(io.read_u8()? != 0),
        TYPE_STRING => AmfValue::String(read_short_string(io)?),
        TYPE_OBJECT => AmfValue::Object(read_members(io, end, depth)?),
        TYPE_ECMA_ARRAY => {
            io.skip(4)?;
            AmfValue::Object(read_members(io, end, depth)?)
        }
        TYPE_STRICT_ARRAY => {
            let count = io.read_u32_be()?;
            let mut values = Vec::new();
            for _ in 0..count {
                if io.pos() >= end {
                    return Err(FormatError::invalid("amf: strict array overruns its tag"));
                }
                values.push(read_value_at(io, end, depth + 1)?);
            }
            AmfValue::Array(values)
        }
        TYPE_DATE => {
            let ms = io.read_f64_be()?;
            let offset_min = io.read_i16_be()?;
            AmfValue::Date(ms + offset_min as f64 * 60_000.0)
        }
        TYPE_LONG_STRING => {
            let len = io.read_u32_be()? as usize;
            AmfValue::String(io.read_string(len)?)
        }
        TYPE_NULL | TYPE_UNDEFINED | TYPE_OBJECT_END => AmfValue::Null,
        other => return Err(FormatError::unsupported(format!("amf: value type {other}"))),
    })
}

/// Reads one value that must end at or before byte `end`.
pub fn read_value(io: &mut IoReader, end: u64) -> Result<AmfValue, FormatError> {
    read_value_at(io, end, 0)
}

/// Object member name, or any string without its type marker.
pub fn write_key(out: &mut Vec<u8>, key: &str) {
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    match u16::try_from(s.len()) {
        Ok(len) => {
            out.push(TYPE_STRING);
            out.extend_from_slice(&len.to_be_bytes());
        }
        Err(_) => {
            out.push(TYPE_LONG_STRING);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        }
    }
    out.extend_from_slice(s.as_bytes());
}

pub fn write_number(out: &mut Vec<u8>, n: f64) {
    out.push(TYPE_NUMBER);
    out.extend_from_slice(&n.to_be_bytes());
}

pub fn write_number_array(out: &mut Vec<u8>, values: &[f64]) {
    out.push(TYPE_STRICT_ARRAY);
    out.extend_from_slice(&(values.len() as u32).to_be_bytes());
    for &v in values {
        write_number(out, v);
    }
}

pub fn object_end(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0, 0, TYPE_OBJECT_END]);
}

/// Starts an ECMA array of `count` members; close it with [`object_end`].
pub fn ecma_array_start(out: &mut Vec<u8>, count: u32) {
    out.push(TYPE_ECMA_ARRAY);
    out.extend_from_slice(&count.to_be_bytes());
}

impl AmfValue {
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Number(n) => write_number(out, *n),
            Self::Boolean(b) => out.extend_from_slice(&[TYPE_BOOLEAN, u8::from(*b)]),
            Self::String(s) => write_string(out, s),
            Self::Object(members) => {
                out.push(TYPE_OBJECT);
                for (key, value) in members {
                    write_key(out, key);
                    value.write(out);
                }
                object_end(out);
            }
            Self::Array(values) => {
                out.push(TYPE_STRICT_ARRAY);
                out.extend_from_slice(&(values.len() as u32).to_be_bytes());
                for value in values {
                    value.write(out);
                }
            }
            Self::Date(ms) => {
                out.push(TYPE_DATE);
                out.extend_from_slice(&ms.to_be_bytes());
                out.extend_from_slice(&0i16.to_be_bytes());
            }
            Self::Null => out.push(TYPE_NULL),
        }
    }
}
