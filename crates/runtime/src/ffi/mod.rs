//! FFI engine: dynamic native calls with boxed values
//!
//! Submodules:
//! - [`load`] — library loading (`dlopen`), cross-platform name
//!   translation, load-path validation, lazy symbol resolution;
//! - [`types`] — FFI type codes → host-ABI (libffi) descriptors;
//! - [`marshal`] — language value ↔ C storage conversion;
//! - [`call`] — CIF preparation and dynamic invocation;
//! - [`structs`] — the process-wide struct registry with computed offsets;
//! - [`callback`] — host-callable trampolines wrapping language functions.
//!
//! Every failure is a `FfiError`; the VM maps them onto catchable language
//! exceptions.

pub mod call;
pub mod callback;
pub mod load;
pub mod marshal;
pub mod structs;
pub mod types;

#[derive(Debug, Clone, PartialEq)]
pub enum FfiError {
    EmptyPath,
    /// Path rejected by validation (`..`, `/./`, `/../`).
    UnsafePath(String),
    LoadFailed { path: String, detail: String },
    NullFunctionPointer(String),
    CifPreparationFailed(String),
    UnknownStruct(String),
    StructFieldMissing { struct_name: String, field: String },
    NotMarshalable { expected: String, got: &'static str },
    CallbackAllocationFailed,
    CallbackNotFound,
    /// Struct types cannot appear in this position (e.g. callback args).
    UnsupportedType(String),
}

impl std::fmt::Display for FfiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FfiError::EmptyPath => write!(f, "ffi: empty library path"),
            FfiError::UnsafePath(path) => {
                write!(f, "ffi: path '{}' contains traversal components", path)
            }
            FfiError::LoadFailed { path, detail } => {
                write!(f, "ffi: failed to load '{}': {}", path, detail)
            }
            FfiError::NullFunctionPointer(name) => {
                write!(f, "ffi: symbol '{}' is unresolved (null)", name)
            }
            FfiError::CifPreparationFailed(detail) => {
                write!(f, "ffi: call interface preparation failed: {}", detail)
            }
            FfiError::UnknownStruct(name) => {
                write!(f, "ffi: struct type '{}' is not registered", name)
            }
            FfiError::StructFieldMissing { struct_name, field } => {
                write!(
                    f,
                    "ffi: object is missing field '{}' required by struct '{}'",
                    field, struct_name
                )
            }
            FfiError::NotMarshalable { expected, got } => {
                write!(f, "ffi: cannot marshal {} as {}", got, expected)
            }
            FfiError::CallbackAllocationFailed => {
                write!(f, "ffi: callback closure allocation failed")
            }
            FfiError::CallbackNotFound => write!(f, "ffi: callback handle not found"),
            FfiError::UnsupportedType(detail) => {
                write!(f, "ffi: unsupported type in this position: {}", detail)
            }
        }
    }
}

impl std::error::Error for FfiError {}
