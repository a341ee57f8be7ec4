//! Value decoding, conversion, and binary encoding shared by validation and indexing.
//!
//! Edges carry raw bytes tagged with a [`ValueType`]. [`decode`] interprets those
//! bytes, [`convert`] moves a decoded value to the schema's type, and [`marshal`]
//! produces the binary form that is stored in posting lists.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use super::{ConvertError, ValueType};

const PASSWORD_MIN_LEN: usize = 6;
const DATETIME_LEN: usize = 12;

/// Decoded value payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Text (default, string, and password types).
    Str(String),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Timestamp, normalised to UTC.
    DateTime(OffsetDateTime),
    /// Float vector.
    VFloat(Vec<f32>),
    /// Entity reference.
    Uid(u64),
}

/// A value together with its type tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Val {
    /// Type of the value.
    pub tid: ValueType,
    /// Payload.
    pub value: Value,
}

impl Val {
    /// Creates a typed value.
    pub fn new(tid: ValueType, value: Value) -> Self {
        Self { tid, value }
    }

    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }
}

/// Interprets raw edge or posting bytes as a value of type `tid`.
pub fn decode(tid: ValueType, raw: &[u8]) -> Result<Val, ConvertError> {
    let value = match tid {
        ValueType::Default | ValueType::String | ValueType::Password => {
            let text = std::str::from_utf8(raw).map_err(|_| ConvertError::Malformed {
                ty: tid,
                reason: "invalid utf-8",
            })?;
            Value::Str(text.to_owned())
        }
        ValueType::Binary => Value::Bytes(raw.to_vec()),
        ValueType::Int => Value::Int(i64::from_le_bytes(fixed::<8>(tid, raw)?)),
        ValueType::Float => Value::Float(f64::from_le_bytes(fixed::<8>(tid, raw)?)),
        ValueType::Uid => Value::Uid(u64::from_le_bytes(fixed::<8>(tid, raw)?)),
        ValueType::Bool => match raw {
            [0] => Value::Bool(false),
            [1] => Value::Bool(true),
            _ => {
                return Err(ConvertError::Malformed {
                    ty: tid,
                    reason: "bool payload must be a single 0 or 1 byte",
                })
            }
        },
        ValueType::DateTime => Value::DateTime(decode_datetime(raw)?),
        ValueType::VFloat => {
            if raw.len() % 4 != 0 {
                return Err(ConvertError::Malformed {
                    ty: tid,
                    reason: "vector payload not a multiple of 4 bytes",
                });
            }
            let floats = raw
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            Value::VFloat(floats)
        }
        ValueType::Object => {
            return Err(ConvertError::Unsupported {
                from: ValueType::Binary,
                to: ValueType::Object,
            })
        }
    };
    Ok(Val::new(tid, value))
}

/// Converts `src` to type `to`.
pub fn convert(src: &Val, to: ValueType) -> Result<Val, ConvertError> {
    let unsupported = || ConvertError::Unsupported { from: src.tid, to };
    if to == ValueType::Binary {
        return Ok(Val::new(to, Value::Bytes(marshal(src))));
    }
    if src.tid == ValueType::Password {
        return match (&src.value, to) {
            (Value::Str(s), ValueType::Password | ValueType::String | ValueType::Default) => {
                Ok(Val::new(to, Value::Str(s.clone())))
            }
            _ => Err(unsupported()),
        };
    }
    let value = match &src.value {
        Value::Bytes(bytes) => return decode(to, bytes),
        Value::Str(s) => from_str(s, to)?,
        Value::Int(i) => match to {
            ValueType::Int => Value::Int(*i),
            ValueType::Float => Value::Float(*i as f64),
            ValueType::Bool => Value::Bool(*i != 0),
            ValueType::Default | ValueType::String => Value::Str(i.to_string()),
            ValueType::DateTime => Value::DateTime(
                OffsetDateTime::from_unix_timestamp(*i)
                    .map_err(|_| ConvertError::OutOfRange { to })?,
            ),
            _ => return Err(unsupported()),
        },
        Value::Float(f) => match to {
            ValueType::Float => Value::Float(*f),
            ValueType::Int => {
                if !f.is_finite() || *f < i64::MIN as f64 || *f > i64::MAX as f64 {
                    return Err(ConvertError::OutOfRange { to });
                }
                Value::Int(f.trunc() as i64)
            }
            ValueType::Bool => Value::Bool(*f != 0.0),
            ValueType::Default | ValueType::String => Value::Str(f.to_string()),
            ValueType::DateTime => {
                if !f.is_finite() {
                    return Err(ConvertError::OutOfRange { to });
                }
                let nanos = (f * 1e9) as i128;
                Value::DateTime(
                    OffsetDateTime::from_unix_timestamp_nanos(nanos)
                        .map_err(|_| ConvertError::OutOfRange { to })?,
                )
            }
            _ => return Err(unsupported()),
        },
        Value::Bool(b) => match to {
            ValueType::Bool => Value::Bool(*b),
            ValueType::Int => Value::Int(i64::from(*b)),
            ValueType::Float => Value::Float(if *b { 1.0 } else { 0.0 }),
            ValueType::Default | ValueType::String => Value::Str(b.to_string()),
            _ => return Err(unsupported()),
        },
        Value::DateTime(dt) => match to {
            ValueType::DateTime => Value::DateTime(*dt),
            ValueType::Int => Value::Int(dt.unix_timestamp()),
            ValueType::Float => Value::Float(dt.unix_timestamp_nanos() as f64 / 1e9),
            ValueType::Default | ValueType::String => Value::Str(
                dt.format(&Rfc3339)
                    .map_err(|_| ConvertError::OutOfRange { to })?,
            ),
            _ => return Err(unsupported()),
        },
        Value::VFloat(v) => match to {
            ValueType::VFloat => Value::VFloat(v.clone()),
            ValueType::Default | ValueType::String => Value::Str(format_vector(v)),
            _ => return Err(unsupported()),
        },
        Value::Uid(uid) => match to {
            ValueType::Uid => Value::Uid(*uid),
            ValueType::Default | ValueType::String => Value::Str(format!("{uid:#x}")),
            _ => return Err(unsupported()),
        },
    };
    Ok(Val::new(to, value))
}

/// Encodes a value into its stored binary layout.
pub fn marshal(val: &Val) -> Vec<u8> {
    match &val.value {
        Value::Bytes(bytes) => bytes.clone(),
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::Int(i) => i.to_le_bytes().to_vec(),
        Value::Float(f) => f.to_le_bytes().to_vec(),
        Value::Bool(b) => vec![u8::from(*b)],
        Value::DateTime(dt) => {
            let mut out = Vec::with_capacity(DATETIME_LEN);
            out.extend_from_slice(&dt.unix_timestamp().to_le_bytes());
            out.extend_from_slice(&dt.nanosecond().to_le_bytes());
            out
        }
        Value::VFloat(v) => v.iter().flat_map(|f| f.to_le_bytes()).collect(),
        Value::Uid(uid) => uid.to_le_bytes().to_vec(),
    }
}

fn from_str(s: &str, to: ValueType) -> Result<Value, ConvertError> {
    let parse_err = || ConvertError::Parse {
        input: s.to_owned(),
        to,
    };
    let value = match to {
        ValueType::Default | ValueType::String => Value::Str(s.to_owned()),
        ValueType::Int => Value::Int(s.parse::<i64>().map_err(|_| parse_err())?),
        ValueType::Float => {
            let f = s.parse::<f64>().map_err(|_| parse_err())?;
            if !f.is_finite() {
                return Err(ConvertError::NonFinite(s.to_owned()));
            }
            Value::Float(f)
        }
        ValueType::Bool => Value::Bool(parse_bool(s).ok_or_else(parse_err)?),
        ValueType::DateTime => Value::DateTime(parse_datetime(s).ok_or_else(parse_err)?),
        ValueType::Password => {
            if s.chars().count() < PASSWORD_MIN_LEN {
                return Err(ConvertError::PasswordTooShort {
                    min: PASSWORD_MIN_LEN,
                });
            }
            Value::Str(s.to_owned())
        }
        ValueType::VFloat => Value::VFloat(parse_vector(s).ok_or_else(parse_err)?),
        ValueType::Uid => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse::<u64>(),
            };
            Value::Uid(parsed.map_err(|_| parse_err())?)
        }
        ValueType::Binary => Value::Bytes(s.as_bytes().to_vec()),
        ValueType::Object => {
            return Err(ConvertError::Unsupported {
                from: ValueType::String,
                to,
            })
        }
    };
    Ok(value)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<OffsetDateTime> {
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(dt.to_offset(time::UtcOffset::UTC));
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(dt) = PrimitiveDateTime::parse(s, naive) {
        return Some(dt.assume_utc());
    }
    let date_only = format_description!("[year]-[month]-[day]");
    Date::parse(s, date_only)
        .ok()
        .map(|date| date.midnight().assume_utc())
}

fn parse_vector(s: &str) -> Option<Vec<f32>> {
    let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
    inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<f32>().ok())
        .collect()
}

fn format_vector(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn fixed<const N: usize>(ty: ValueType, raw: &[u8]) -> Result<[u8; N], ConvertError> {
    raw.try_into().map_err(|_| ConvertError::Malformed {
        ty,
        reason: "unexpected payload length",
    })
}

fn decode_datetime(raw: &[u8]) -> Result<OffsetDateTime, ConvertError> {
    if raw.len() != DATETIME_LEN {
        return Err(ConvertError::Malformed {
            ty: ValueType::DateTime,
            reason: "datetime payload must be 12 bytes",
        });
    }
    let secs = i64::from_le_bytes(fixed::<8>(ValueType::DateTime, &raw[..8])?);
    let nanos = u32::from_le_bytes(fixed::<4>(ValueType::DateTime, &raw[8..])?);
    let total = i128::from(secs) * 1_000_000_000 + i128::from(nanos);
    OffsetDateTime::from_unix_timestamp_nanos(total).map_err(|_| ConvertError::OutOfRange {
        to: ValueType::DateTime,
    })
}
