//! Builtin dispatch by numeric id
//!
//! `CALL_BUILTIN id16 argc8` lands here with the arguments already popped:
//! no constant-pool indirection on the hot path. The table below is the
//! seam the external standard library plugs into; the runtime ships only
//! the builtins the VM and its tests require. Ids are wire-stable.

use crate::vm::OutputSink;
use alder_core::{BufferCell, ChannelCell, Value, display_string};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable builtin ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BuiltinId {
    /// Write arguments space-separated, no newline.
    Print = 0,
    /// Write arguments space-separated with a newline.
    Println = 1,
    Len = 2,
    TypeOf = 3,
    ToString = 4,
    /// Seconds since the Unix epoch as f64.
    Clock = 5,
    SleepMs = 6,
    ArrayPush = 7,
    ArrayPop = 8,
    ObjectKeys = 9,
    Chan = 10,
    Buffer = 11,
    /// Read an i32 through a raw pointer (FFI callback support).
    PtrReadI32 = 12,
    /// Read an f64 through a raw pointer.
    PtrReadF64 = 13,
    /// Write an i32 through a raw pointer.
    PtrWriteI32 = 14,
}

impl BuiltinId {
    pub fn from_u16(id: u16) -> Option<BuiltinId> {
        use BuiltinId::*;
        Some(match id {
            0 => Print,
            1 => Println,
            2 => Len,
            3 => TypeOf,
            4 => ToString,
            5 => Clock,
            6 => SleepMs,
            7 => ArrayPush,
            8 => ArrayPop,
            9 => ObjectKeys,
            10 => Chan,
            11 => Buffer,
            12 => PtrReadI32,
            13 => PtrReadF64,
            14 => PtrWriteI32,
            _ => return None,
        })
    }
}

fn arity_error(name: &str, expected: usize, got: usize) -> String {
    format!("{} expects {} argument(s), got {}", name, expected, got)
}

fn join_display(args: &[Value]) -> String {
    args.iter()
        .map(display_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn integer_arg(name: &str, value: &Value) -> Result<i64, String> {
    match alder_core::cast(value, alder_core::TypeTag::I64) {
        Ok(Value::I64(v)) => Ok(v),
        _ => Err(format!(
            "{} expects an integer, got {}",
            name,
            value.type_name()
        )),
    }
}

/// Execute builtin `id`. `Err` carries the exception message.
pub fn dispatch(id: u16, args: Vec<Value>, sink: &OutputSink) -> Result<Value, String> {
    let Some(builtin) = BuiltinId::from_u16(id) else {
        return Err(format!("unknown builtin id {}", id));
    };
    match builtin {
        BuiltinId::Print => {
            sink.write(&join_display(&args));
            Ok(Value::Null)
        }
        BuiltinId::Println => {
            sink.write_line(&join_display(&args));
            Ok(Value::Null)
        }
        BuiltinId::Len => {
            let [value] = args.as_slice() else {
                return Err(arity_error("len", 1, args.len()));
            };
            let len = match value {
                Value::Str(s) => s.char_count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Buffer(b) => b.len(),
                other => {
                    return Err(format!("len: {} has no length", other.type_name()));
                }
            };
            Ok(Value::I64(len as i64))
        }
        BuiltinId::TypeOf => {
            let [value] = args.as_slice() else {
                return Err(arity_error("type_of", 1, args.len()));
            };
            Ok(Value::string(value.type_name()))
        }
        BuiltinId::ToString => {
            let [value] = args.as_slice() else {
                return Err(arity_error("to_string", 1, args.len()));
            };
            Ok(Value::string(display_string(value)))
        }
        BuiltinId::Clock => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Ok(Value::F64(now))
        }
        BuiltinId::SleepMs => {
            let [value] = args.as_slice() else {
                return Err(arity_error("sleep_ms", 1, args.len()));
            };
            let millis = integer_arg("sleep_ms", value)?;
            if millis > 0 {
                std::thread::sleep(std::time::Duration::from_millis(millis as u64));
            }
            Ok(Value::Null)
        }
        BuiltinId::ArrayPush => {
            let [array, value] = args.as_slice() else {
                return Err(arity_error("array_push", 2, args.len()));
            };
            match array {
                Value::Array(cell) => {
                    cell.push(value.clone()).map_err(|err| err.to_string())?;
                    Ok(array.clone())
                }
                other => Err(format!("array_push expects an array, got {}", other.type_name())),
            }
        }
        BuiltinId::ArrayPop => {
            let [array] = args.as_slice() else {
                return Err(arity_error("array_pop", 1, args.len()));
            };
            match array {
                Value::Array(cell) => Ok(cell.pop().unwrap_or(Value::Null)),
                other => Err(format!("array_pop expects an array, got {}", other.type_name())),
            }
        }
        BuiltinId::ObjectKeys => {
            let [object] = args.as_slice() else {
                return Err(arity_error("object_keys", 1, args.len()));
            };
            match object {
                Value::Object(cell) => Ok(Value::array(
                    cell.keys().into_iter().map(Value::string).collect(),
                )),
                other => Err(format!(
                    "object_keys expects an object, got {}",
                    other.type_name()
                )),
            }
        }
        BuiltinId::Chan => {
            let [capacity] = args.as_slice() else {
                return Err(arity_error("chan", 1, args.len()));
            };
            let capacity = integer_arg("chan", capacity)?;
            if capacity < 0 {
                return Err("chan: capacity cannot be negative".to_string());
            }
            Ok(Value::Channel(Arc::new(ChannelCell::new(capacity as usize))))
        }
        BuiltinId::Buffer => {
            let [len] = args.as_slice() else {
                return Err(arity_error("buffer", 1, args.len()));
            };
            let len = integer_arg("buffer", len)?;
            if len < 0 {
                return Err("buffer: length cannot be negative".to_string());
            }
            Ok(Value::Buffer(Arc::new(BufferCell::new(len as usize))))
        }
        BuiltinId::PtrReadI32 => {
            let addr = pointer_arg("ptr_read_i32", &args)?;
            Ok(Value::I32(unsafe { (addr as *const i32).read_unaligned() }))
        }
        BuiltinId::PtrReadF64 => {
            let addr = pointer_arg("ptr_read_f64", &args)?;
            Ok(Value::F64(unsafe { (addr as *const f64).read_unaligned() }))
        }
        BuiltinId::PtrWriteI32 => {
            let [ptr, value] = args.as_slice() else {
                return Err(arity_error("ptr_write_i32", 2, args.len()));
            };
            let addr = pointer_arg("ptr_write_i32", std::slice::from_ref(ptr))?;
            let value = integer_arg("ptr_write_i32", value)?;
            unsafe { (addr as *mut i32).write_unaligned(value as i32) };
            Ok(Value::Null)
        }
    }
}

/// Extract a non-null raw pointer argument (FFI pointer builtins).
fn pointer_arg(name: &str, args: &[Value]) -> Result<usize, String> {
    let Some(first) = args.first() else {
        return Err(arity_error(name, 1, 0));
    };
    match first {
        Value::NativePtr(addr) if *addr != 0 => Ok(*addr),
        Value::NativePtr(_) => Err(format!("{}: null pointer", name)),
        other => Err(format!("{} expects a pointer, got {}", name, other.type_name())),
    }
}
