//! Dynamic native calls
//!
//! `call_native(fn_ptr, args, types)`: `types[0]` is the return type,
//! `types[1..]` the argument types. Per-argument storage is allocated and
//! sized to the argument type, the marshaled value written, the call
//! interface prepared, the call made, the return marshaled back, and the
//! storage released when the frame-local buffers drop.

use super::marshal::{self, MarshaledArg};
use super::structs::StructRegistry;
use super::types::{libffi_type, storage_size};
use super::FfiError;
use alder_core::{FfiType, NativeFnCell, Value};
use libffi::middle::{Cif, CodePtr};

/// Minimum return-slot size: libffi widens small integral returns to a
/// full register word.
const RETURN_SLOT_MIN: usize = 8;

/// Invoke a native function with boxed arguments.
pub fn call_native(
    fn_ptr: usize,
    args: &[Value],
    param_types: &[FfiType],
    return_type: &FfiType,
    structs: &StructRegistry,
) -> Result<Value, FfiError> {
    if fn_ptr == 0 {
        return Err(FfiError::NullFunctionPointer("<fn>".to_string()));
    }
    if args.len() != param_types.len() {
        return Err(FfiError::NotMarshalable {
            expected: format!("{} arguments", param_types.len()),
            got: "wrong argument count",
        });
    }

    // Prepare the call interface. libffi panics on inconsistent
    // descriptors rather than returning status here; descriptor
    // construction above is the validated step.
    let arg_types = param_types
        .iter()
        .map(|ty| libffi_type(ty, structs))
        .collect::<Result<Vec<_>, _>>()?;
    let ret_type = libffi_type(return_type, structs)?;
    let cif = Cif::new(arg_types, ret_type);

    // Per-argument storage, marshaled in declaration order.
    let mut marshaled = Vec::with_capacity(args.len());
    for (value, ty) in args.iter().zip(param_types) {
        let size = storage_size(ty, structs)?;
        marshaled.push(MarshaledArg::new(ty, value, size, structs)?);
    }
    let mut arg_ptrs: Vec<*mut libc::c_void> =
        marshaled.iter().map(|arg| arg.as_ptr()).collect();

    let ret_size = storage_size(return_type, structs)?.max(RETURN_SLOT_MIN);
    let mut ret_storage = vec![0u64; ret_size.div_ceil(8)];

    unsafe {
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(std::mem::transmute::<usize, unsafe extern "C" fn()>(fn_ptr)),
            ret_storage.as_mut_ptr() as *mut libc::c_void,
            arg_ptrs.as_mut_ptr(),
        );
    }

    let ret_ptr = ret_storage.as_ptr() as *const u8;
    let result = match return_type {
        FfiType::Struct(name) => {
            let layout = structs
                .layout(name)
                .ok_or_else(|| FfiError::UnknownStruct(name.clone()))?;
            unsafe { super::structs::struct_to_object(&layout, ret_ptr) }
        }
        scalar => unsafe { marshal::read_scalar(scalar, ret_ptr) },
    };
    Ok(result)
}

/// Call through a resolved `NativeFn` handle (the VM's `CALL` path).
pub fn call_handle(
    handle: &NativeFnCell,
    args: &[Value],
    structs: &StructRegistry,
) -> Result<Value, FfiError> {
    if handle.code_ptr == 0 {
        return Err(FfiError::NullFunctionPointer(handle.name.clone()));
    }
    call_native(
        handle.code_ptr,
        args,
        &handle.param_types,
        &handle.return_type,
        structs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::load::Library;

    fn open_libm() -> Option<Library> {
        for name in ["libm.so.6", "libm.so", "libm.dylib"] {
            if let Ok(lib) = Library::open(name) {
                return Some(lib);
            }
        }
        None
    }

    #[test]
    fn test_null_fn_ptr_rejected() {
        let structs = StructRegistry::new();
        assert!(matches!(
            call_native(0, &[], &[], &FfiType::Void, &structs),
            Err(FfiError::NullFunctionPointer(_))
        ));
    }

    #[test]
    fn test_argument_count_mismatch() {
        let structs = StructRegistry::new();
        assert!(matches!(
            call_native(1, &[Value::I32(1)], &[], &FfiType::Void, &structs),
            Err(FfiError::NotMarshalable { .. })
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_call_cos() {
        let Some(lib) = open_libm() else { return };
        let Some(cos) = lib.sym("cos") else { return };
        let structs = StructRegistry::new();
        let result = call_native(
            cos as usize,
            &[Value::F64(0.0)],
            &[FfiType::F64],
            &FfiType::F64,
            &structs,
        )
        .unwrap();
        assert!(matches!(result, Value::F64(v) if (v - 1.0).abs() < 1e-12));
    }

    #[test]
    #[cfg(unix)]
    fn test_call_with_integer_promotion() {
        // labs(long) -> long, resolved from the C runtime.
        let lib = match Library::open("libc.so.6") {
            Ok(lib) => lib,
            Err(_) => return,
        };
        let Some(labs) = lib.sym("labs") else { return };
        let structs = StructRegistry::new();
        let result = call_native(
            labs as usize,
            &[Value::I32(-5)],
            &[FfiType::I64],
            &FfiType::I64,
            &structs,
        )
        .unwrap();
        assert!(matches!(result, Value::I64(5)));
    }

    #[test]
    #[cfg(unix)]
    fn test_string_argument_strlen() {
        let lib = match Library::open("libc.so.6") {
            Ok(lib) => lib,
            Err(_) => return,
        };
        let Some(strlen) = lib.sym("strlen") else { return };
        let structs = StructRegistry::new();
        let result = call_native(
            strlen as usize,
            &[Value::string("alder")],
            &[FfiType::CString],
            &FfiType::U64,
            &structs,
        )
        .unwrap();
        assert!(matches!(result, Value::U64(5)));
    }
}
