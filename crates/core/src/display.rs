//! Display conversion and string coercion
//!
//! Two jobs:
//!
//! 1. `display_string` renders any value for `print` and interpolation.
//! 2. `concat` implements `+` when either side is a string: numbers,
//!    booleans, runes and `null` coerce to their display form; arrays and
//!    objects serialize as JSON. A visited set of heap-cell addresses stops
//!    cyclic graphs; a back-edge renders as the string `"<cycle>"`.
//!
//! JSON rendering goes through `serde_json::Value` so quoting and escaping
//! match the ecosystem, with non-finite floats rendered as strings (JSON
//! has no NaN/Infinity).

use crate::alderstring::AlderString;
use crate::value::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum CoerceError {
    NotStringCoercible(&'static str),
}

impl std::fmt::Display for CoerceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoerceError::NotStringCoercible(got) => {
                write!(f, "cannot concatenate {} with a string", got)
            }
        }
    }
}

impl std::error::Error for CoerceError {}

/// Render a value for display. Containers render as JSON, handles as a
/// short bracketed description.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::I8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::F32(v) => format_float(*v as f64),
        Value::F64(v) => format_float(*v),
        Value::Rune(c) => c.to_string(),
        Value::Str(s) => s.to_owned_string(),
        Value::Array(_) | Value::Object(_) => {
            let mut seen = Vec::new();
            json_tree(value, &mut seen).to_string()
        }
        Value::Function(f) => format!("<fn {}>", f.meta.name),
        Value::NativePtr(p) => format!("<ptr {:#x}>", p),
        Value::Buffer(b) => format!("<buffer {} bytes>", b.len()),
        Value::File(f) => format!("<file {}>", f.path),
        Value::Task(t) => format!("<task {}>", t.id),
        Value::Channel(c) => format!("<channel cap {}>", c.capacity()),
        Value::Socket(s) => format!("<socket {}>", s.peer),
        Value::NativeFn(n) => format!("<native {}>", n.name),
    }
}

/// Shortest round-trip form; non-finite values use the language's spelling.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else {
        v.to_string()
    }
}

/// Build the JSON tree for a value, tracking visited heap cells.
fn json_tree(value: &Value, seen: &mut Vec<usize>) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I8(v) => (*v).into(),
        Value::I16(v) => (*v).into(),
        Value::I32(v) => (*v).into(),
        Value::I64(v) => (*v).into(),
        Value::U8(v) => (*v).into(),
        Value::U16(v) => (*v).into(),
        Value::U32(v) => (*v).into(),
        Value::U64(v) => (*v).into(),
        Value::F32(v) => json_float(*v as f64),
        Value::F64(v) => json_float(*v),
        Value::Rune(c) => serde_json::Value::String(c.to_string()),
        Value::Str(s) => serde_json::Value::String(s.to_owned_string()),
        Value::Array(cell) => {
            let addr = Arc::as_ptr(cell) as usize;
            if seen.contains(&addr) {
                return serde_json::Value::String("<cycle>".to_string());
            }
            seen.push(addr);
            let elems = cell
                .snapshot()
                .iter()
                .map(|v| json_tree(v, seen))
                .collect();
            seen.pop();
            serde_json::Value::Array(elems)
        }
        Value::Object(cell) => {
            let addr = Arc::as_ptr(cell) as usize;
            if seen.contains(&addr) {
                return serde_json::Value::String("<cycle>".to_string());
            }
            seen.push(addr);
            let mut map = serde_json::Map::new();
            for (name, field) in cell.entries() {
                map.insert(name, json_tree(&field, seen));
            }
            seen.pop();
            serde_json::Value::Object(map)
        }
        // Handles have no JSON form; fall back to their display string.
        other => serde_json::Value::String(display_string(other)),
    }
}

fn json_float(v: f64) -> serde_json::Value {
    match serde_json::Number::from_f64(v) {
        Some(n) => serde_json::Value::Number(n),
        None => serde_json::Value::String(format_float(v)),
    }
}

fn coerce_to_string(value: &Value) -> Result<String, CoerceError> {
    match value {
        Value::Null
        | Value::Bool(_)
        | Value::Rune(_)
        | Value::Str(_)
        | Value::Array(_)
        | Value::Object(_) => Ok(display_string(value)),
        v if v.is_numeric() => Ok(display_string(v)),
        other => Err(CoerceError::NotStringCoercible(other.type_name())),
    }
}

/// `+` with a string on either side: coerce both and produce a new string.
pub fn concat(a: &Value, b: &Value) -> Result<Value, CoerceError> {
    let mut text = coerce_to_string(a)?;
    text.push_str(&coerce_to_string(b)?);
    Ok(Value::Str(AlderString::from_string(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectCell;

    #[test]
    fn test_primitive_display() {
        assert_eq!(display_string(&Value::Null), "null");
        assert_eq!(display_string(&Value::Bool(true)), "true");
        assert_eq!(display_string(&Value::I32(55)), "55");
        assert_eq!(display_string(&Value::F64(2.5)), "2.5");
        assert_eq!(display_string(&Value::Rune('λ')), "λ");
        assert_eq!(display_string(&Value::F64(f64::NAN)), "NaN");
    }

    #[test]
    fn test_array_renders_json() {
        let arr = Value::array(vec![Value::I32(1), Value::string("a"), Value::Null]);
        assert_eq!(display_string(&arr), "[1,\"a\",null]");
    }

    #[test]
    fn test_object_renders_json_in_declaration_order() {
        let obj = Value::Object(Arc::new(ObjectCell::with_fields(
            None,
            vec![
                ("x".to_string(), Value::I32(3)),
                ("y".to_string(), Value::F64(2.5)),
            ],
        )));
        assert_eq!(display_string(&obj), "{\"x\":3,\"y\":2.5}");
    }

    #[test]
    fn test_cycle_detection() {
        let arr = Arc::new(crate::array::ArrayCell::new());
        arr.push(Value::Array(Arc::clone(&arr))).unwrap();
        let rendered = display_string(&Value::Array(arr));
        assert_eq!(rendered, "[\"<cycle>\"]");
    }

    #[test]
    fn test_concat_coercions() {
        let r = concat(&Value::string("n="), &Value::I32(4)).unwrap();
        assert_eq!(display_string(&r), "n=4");
        let r = concat(&Value::Bool(true), &Value::string("!")).unwrap();
        assert_eq!(display_string(&r), "true!");
        let r = concat(&Value::string(""), &Value::array(vec![Value::I32(1)])).unwrap();
        assert_eq!(display_string(&r), "[1]");
    }

    #[test]
    fn test_concat_rejects_handles() {
        let ch = Value::Channel(Arc::new(crate::channel::ChannelCell::new(1)));
        assert!(matches!(
            concat(&Value::string("x"), &ch),
            Err(CoerceError::NotStringCoercible("channel"))
        ));
    }

    #[test]
    fn test_concat_produces_new_string() {
        let a = Value::string("ab");
        let r = concat(&a, &Value::string("cd")).unwrap();
        match (&a, &r) {
            (Value::Str(sa), Value::Str(sr)) => {
                assert!(!sa.ptr_eq(sr));
                assert_eq!(sr.to_owned_string(), "abcd");
            }
            _ => unreachable!(),
        }
    }
}
