//! Runtime casts and type checks (`CAST` / `CHECK_TYPE`)
//!
//! Casting converts between numeric kinds (truncating like the promotion
//! engine), parses strings into numerics, stringifies anything displayable
//! and reinterprets runes as their scalar value. A failed cast is a
//! catchable condition, reported through `CastError`.

use crate::alderstring::AlderString;
use crate::value::{TypeTag, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum CastError {
    Unsupported { from: &'static str, to: TypeTag },
    ParseFailed { text: String, to: TypeTag },
    CheckFailed { expected: TypeTag, got: &'static str },
}

impl std::fmt::Display for CastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CastError::Unsupported { from, to } => {
                write!(f, "cannot cast {} to {}", from, to.name())
            }
            CastError::ParseFailed { text, to } => {
                write!(f, "cannot parse '{}' as {}", text, to.name())
            }
            CastError::CheckFailed { expected, got } => {
                write!(f, "expected {}, got {}", expected.name(), got)
            }
        }
    }
}

impl std::error::Error for CastError {}

fn numeric_as_i128(value: &Value) -> Option<i128> {
    Some(match value {
        Value::I8(v) => *v as i128,
        Value::I16(v) => *v as i128,
        Value::I32(v) => *v as i128,
        Value::I64(v) => *v as i128,
        Value::U8(v) => *v as i128,
        Value::U16(v) => *v as i128,
        Value::U32(v) => *v as i128,
        Value::U64(v) => *v as i128,
        Value::F32(v) => *v as i128,
        Value::F64(v) => *v as i128,
        Value::Rune(c) => *c as u32 as i128,
        Value::Bool(b) => *b as i128,
        _ => return None,
    })
}

fn numeric_as_f64(value: &Value) -> Option<f64> {
    Some(match value {
        Value::F32(v) => *v as f64,
        Value::F64(v) => *v,
        other => numeric_as_i128(other)? as f64,
    })
}

fn parse_int(text: &str, to: TypeTag) -> Result<i128, CastError> {
    let trimmed = text.trim();
    // Accept a float spelling for integer targets by truncation.
    if let Ok(v) = trimmed.parse::<i128>() {
        return Ok(v);
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Ok(v as i128);
    }
    Err(CastError::ParseFailed {
        text: text.to_string(),
        to,
    })
}

fn int_cast(value: &Value, to: TypeTag) -> Result<i128, CastError> {
    if let Some(v) = numeric_as_i128(value) {
        return Ok(v);
    }
    match value {
        Value::Str(s) => s.with_str(|text| parse_int(text, to)),
        other => Err(CastError::Unsupported {
            from: other.type_name(),
            to,
        }),
    }
}

fn float_cast(value: &Value, to: TypeTag) -> Result<f64, CastError> {
    if let Some(v) = numeric_as_f64(value) {
        return Ok(v);
    }
    match value {
        Value::Str(s) => s.with_str(|text| {
            text.trim().parse::<f64>().map_err(|_| CastError::ParseFailed {
                text: text.to_string(),
                to,
            })
        }),
        other => Err(CastError::Unsupported {
            from: other.type_name(),
            to,
        }),
    }
}

/// Runtime conversion to `to`. Numeric narrowing truncates (the promotion
/// engine's wrapping discipline); string sources parse.
pub fn cast(value: &Value, to: TypeTag) -> Result<Value, CastError> {
    if value.type_tag() == to || to == TypeTag::Any {
        return Ok(value.clone());
    }
    Ok(match to {
        TypeTag::I8 => Value::I8(int_cast(value, to)? as i8),
        TypeTag::I16 => Value::I16(int_cast(value, to)? as i16),
        TypeTag::I32 => Value::I32(int_cast(value, to)? as i32),
        TypeTag::I64 => Value::I64(int_cast(value, to)? as i64),
        TypeTag::U8 => Value::U8(int_cast(value, to)? as u8),
        TypeTag::U16 => Value::U16(int_cast(value, to)? as u16),
        TypeTag::U32 => Value::U32(int_cast(value, to)? as u32),
        TypeTag::U64 => Value::U64(int_cast(value, to)? as u64),
        TypeTag::F32 => Value::F32(float_cast(value, to)? as f32),
        TypeTag::F64 => Value::F64(float_cast(value, to)?),
        TypeTag::Bool => Value::Bool(value.is_truthy()),
        TypeTag::Str => Value::Str(AlderString::from_string(crate::display::display_string(
            value,
        ))),
        TypeTag::Rune => {
            let scalar = int_cast(value, to)?;
            let scalar = u32::try_from(scalar).ok().and_then(char::from_u32).ok_or(
                CastError::Unsupported {
                    from: value.type_name(),
                    to,
                },
            )?;
            Value::Rune(scalar)
        }
        TypeTag::Null => Value::Null,
        _ => {
            return Err(CastError::Unsupported {
                from: value.type_name(),
                to,
            });
        }
    })
}

/// `CHECK_TYPE`: error on tag mismatch (`Any` admits everything).
pub fn check_type(value: &Value, expected: TypeTag) -> Result<(), CastError> {
    if expected == TypeTag::Any || value.type_tag() == expected {
        Ok(())
    } else {
        Err(CastError::CheckFailed {
            expected,
            got: value.type_name(),
        })
    }
}
