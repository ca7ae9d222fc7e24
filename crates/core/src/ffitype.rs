//! FFI type codes
//!
//! The marshaling vocabulary shared between native function handles, the
//! struct registry and the call engine. These are pure codes plus a
//! size/alignment table; the host-ABI descriptors (libffi) are attached by
//! the runtime crate.

/// Wire-stable type codes for native signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfiType {
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Opaque pointer (also accepts buffer data addresses).
    Pointer,
    /// Null-terminated C string.
    CString,
    /// Registered struct, by nominal name.
    Struct(String),
}

impl FfiType {
    /// Parse the textual code used by `extern` declarations.
    pub fn parse(code: &str) -> Option<FfiType> {
        Some(match code {
            "void" => FfiType::Void,
            "i8" => FfiType::I8,
            "i16" => FfiType::I16,
            "i32" => FfiType::I32,
            "i64" => FfiType::I64,
            "u8" => FfiType::U8,
            "u16" => FfiType::U16,
            "u32" => FfiType::U32,
            "u64" => FfiType::U64,
            "f32" => FfiType::F32,
            "f64" => FfiType::F64,
            "ptr" | "pointer" => FfiType::Pointer,
            "string" | "cstring" => FfiType::CString,
            _ => {
                let name = code.strip_prefix("struct:")?;
                FfiType::Struct(name.to_string())
            }
        })
    }

    /// Storage size in bytes on the host; structs are resolved through the
    /// registry and report 0 here.
    pub fn size(&self) -> usize {
        match self {
            FfiType::Void => 0,
            FfiType::I8 | FfiType::U8 => 1,
            FfiType::I16 | FfiType::U16 => 2,
            FfiType::I32 | FfiType::U32 | FfiType::F32 => 4,
            FfiType::I64 | FfiType::U64 | FfiType::F64 => 8,
            FfiType::Pointer | FfiType::CString => size_of::<*const u8>(),
            FfiType::Struct(_) => 0,
        }
    }

    /// Natural alignment; equals size for scalars on the supported hosts.
    pub fn align(&self) -> usize {
        match self {
            FfiType::Void => 1,
            FfiType::Struct(_) => 1,
            other => other.size().max(1),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FfiType::I8
                | FfiType::I16
                | FfiType::I32
                | FfiType::I64
                | FfiType::U8
                | FfiType::U16
                | FfiType::U32
                | FfiType::U64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FfiType::F32 | FfiType::F64)
    }

    pub fn name(&self) -> String {
        match self {
            FfiType::Void => "void".to_string(),
            FfiType::I8 => "i8".to_string(),
            FfiType::I16 => "i16".to_string(),
            FfiType::I32 => "i32".to_string(),
            FfiType::I64 => "i64".to_string(),
            FfiType::U8 => "u8".to_string(),
            FfiType::U16 => "u16".to_string(),
            FfiType::U32 => "u32".to_string(),
            FfiType::U64 => "u64".to_string(),
            FfiType::F32 => "f32".to_string(),
            FfiType::F64 => "f64".to_string(),
            FfiType::Pointer => "ptr".to_string(),
            FfiType::CString => "string".to_string(),
            FfiType::Struct(name) => format!("struct:{}", name),
        }
    }
}
