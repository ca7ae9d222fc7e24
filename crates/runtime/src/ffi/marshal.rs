//! Value ↔ C storage marshaling
//!
//! Language value → argument storage and C return → language value, per the
//! type-code vocabulary:
//!
//! - integer codes accept any numeric value, booleans and runes (the
//!   runtime's integer coercion), truncating to the target width;
//! - float codes accept any numeric value;
//! - `ptr` accepts raw pointer values, the data address of a buffer, and
//!   `null`;
//! - `string` accepts a language string (a NUL-terminated copy is kept
//!   alive for the duration of the call) and `null`;
//! - `null` marshals to zero storage for any code.
//!
//! Returns invert the mapping; a returned `string` copies the C string
//! into a fresh language string, or yields `null` for a null pointer.

use super::FfiError;
use alder_core::{AlderString, FfiType, TypeTag, Value};
use std::ffi::{CStr, CString};

/// Coerce a language value to an integer payload.
fn to_i64(value: &Value, expected: &FfiType) -> Result<i64, FfiError> {
    match value {
        Value::Null => Ok(0),
        Value::Bool(b) => Ok(*b as i64),
        Value::Rune(c) => Ok(*c as u32 as i64),
        other => match alder_core::cast(other, TypeTag::I64) {
            Ok(Value::I64(v)) => Ok(v),
            _ => Err(FfiError::NotMarshalable {
                expected: expected.name(),
                got: other.type_name(),
            }),
        },
    }
}

fn to_f64(value: &Value, expected: &FfiType) -> Result<f64, FfiError> {
    match value {
        Value::Null => Ok(0.0),
        other => match alder_core::cast(other, TypeTag::F64) {
            Ok(Value::F64(v)) => Ok(v),
            _ => Err(FfiError::NotMarshalable {
                expected: expected.name(),
                got: other.type_name(),
            }),
        },
    }
}

fn to_pointer(value: &Value) -> Result<usize, FfiError> {
    match value {
        Value::Null => Ok(0),
        Value::NativePtr(p) => Ok(*p),
        // The raw data address of the byte buffer; the caller must not
        // resize the buffer while the native call runs.
        Value::Buffer(cell) => Ok(cell.with_bytes(|bytes| bytes.as_mut_ptr() as usize)),
        other => Err(FfiError::NotMarshalable {
            expected: FfiType::Pointer.name(),
            got: other.type_name(),
        }),
    }
}

/// Write a scalar (non-struct) value into `dst`.
///
/// # Safety
/// `dst` must point to at least `ty.size()` writable, suitably aligned
/// bytes.
pub unsafe fn write_scalar(ty: &FfiType, value: &Value, dst: *mut u8) -> Result<(), FfiError> {
    unsafe {
        match ty {
            FfiType::Void => {}
            FfiType::I8 => (dst as *mut i8).write(to_i64(value, ty)? as i8),
            FfiType::I16 => (dst as *mut i16).write(to_i64(value, ty)? as i16),
            FfiType::I32 => (dst as *mut i32).write(to_i64(value, ty)? as i32),
            FfiType::I64 => (dst as *mut i64).write(to_i64(value, ty)?),
            FfiType::U8 => (dst as *mut u8).write(to_i64(value, ty)? as u8),
            FfiType::U16 => (dst as *mut u16).write(to_i64(value, ty)? as u16),
            FfiType::U32 => (dst as *mut u32).write(to_i64(value, ty)? as u32),
            FfiType::U64 => (dst as *mut u64).write(to_i64(value, ty)? as u64),
            FfiType::F32 => (dst as *mut f32).write(to_f64(value, ty)? as f32),
            FfiType::F64 => (dst as *mut f64).write(to_f64(value, ty)?),
            FfiType::Pointer => (dst as *mut usize).write(to_pointer(value)?),
            FfiType::CString => {
                // Callers that need the string kept alive go through
                // `MarshaledArg`; a bare scalar write only supports null.
                match value {
                    Value::Null => (dst as *mut usize).write(0),
                    other => {
                        return Err(FfiError::NotMarshalable {
                            expected: ty.name(),
                            got: other.type_name(),
                        });
                    }
                }
            }
            FfiType::Struct(name) => {
                return Err(FfiError::UnsupportedType(format!(
                    "nested struct '{}' write",
                    name
                )));
            }
        }
    }
    Ok(())
}

/// Read a scalar (non-struct) value from `src`.
///
/// # Safety
/// `src` must point to at least `ty.size()` readable bytes holding a value
/// of the given type.
pub unsafe fn read_scalar(ty: &FfiType, src: *const u8) -> Value {
    unsafe {
        match ty {
            FfiType::Void => Value::Null,
            FfiType::I8 => Value::I8((src as *const i8).read()),
            FfiType::I16 => Value::I16((src as *const i16).read()),
            FfiType::I32 => Value::I32((src as *const i32).read()),
            FfiType::I64 => Value::I64((src as *const i64).read()),
            FfiType::U8 => Value::U8(src.read()),
            FfiType::U16 => Value::U16((src as *const u16).read()),
            FfiType::U32 => Value::U32((src as *const u32).read()),
            FfiType::U64 => Value::U64((src as *const u64).read()),
            FfiType::F32 => Value::F32((src as *const f32).read()),
            FfiType::F64 => Value::F64((src as *const f64).read()),
            FfiType::Pointer => Value::NativePtr((src as *const usize).read()),
            FfiType::CString => {
                let ptr = (src as *const *const libc::c_char).read();
                if ptr.is_null() {
                    Value::Null
                } else {
                    let text = CStr::from_ptr(ptr).to_string_lossy().into_owned();
                    Value::Str(AlderString::from_string(text))
                }
            }
            FfiType::Struct(_) => Value::Null,
        }
    }
}

/// Argument storage for one native call parameter: an 8-byte-aligned
/// buffer plus whatever owned data must outlive the call (C string
/// copies).
pub struct MarshaledArg {
    storage: Vec<u64>,
    /// NUL-terminated copy for `string` arguments.
    _keepalive: Option<CString>,
}

impl MarshaledArg {
    pub fn as_ptr(&self) -> *mut libc::c_void {
        self.storage.as_ptr() as *mut libc::c_void
    }

    /// Marshal `value` as `ty` into fresh storage of `size` bytes.
    pub fn new(
        ty: &FfiType,
        value: &Value,
        size: usize,
        structs: &super::structs::StructRegistry,
    ) -> Result<MarshaledArg, FfiError> {
        let words = size.div_ceil(8).max(1);
        let mut storage = vec![0u64; words];
        let dst = storage.as_mut_ptr() as *mut u8;
        let mut keepalive = None;

        match ty {
            FfiType::CString => match value {
                Value::Null => {}
                Value::Str(s) => {
                    let text = s.to_owned_string();
                    let cstring = CString::new(text).map_err(|_| FfiError::NotMarshalable {
                        expected: ty.name(),
                        got: "string with interior NUL",
                    })?;
                    unsafe {
                        (dst as *mut usize).write(cstring.as_ptr() as usize);
                    }
                    keepalive = Some(cstring);
                }
                other => {
                    return Err(FfiError::NotMarshalable {
                        expected: ty.name(),
                        got: other.type_name(),
                    });
                }
            },
            FfiType::Struct(name) => {
                let layout = structs
                    .layout(name)
                    .ok_or_else(|| FfiError::UnknownStruct(name.clone()))?;
                unsafe {
                    super::structs::object_to_struct(&layout, value, dst)?;
                }
            }
            scalar => unsafe {
                write_scalar(scalar, value, dst)?;
            },
        }

        Ok(MarshaledArg {
            storage,
            _keepalive: keepalive,
        })
    }
}
