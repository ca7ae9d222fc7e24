//! Host-callable callback trampolines
//!
//! `create` allocates an executable closure from libffi's closure
//! allocator and binds it to the shared trampoline. When foreign code
//! calls the returned code pointer, the trampoline:
//!
//! 1. acquires the global callback lock,
//! 2. converts the native argument pointers into language values,
//! 3. invokes the language function on a fresh VM sharing the creator's
//!    globals and services,
//! 4. marshals the return value into the native return slot,
//! 5. releases intermediate references and the lock.
//!
//! The lock serializes every foreign→language call through the runtime by
//! design; foreign callbacks are expected to be rare. Freeing a callback
//! while native code still holds its pointer is the caller's hazard.

use super::marshal;
use super::types::libffi_type;
use super::FfiError;
use crate::globals::Globals;
use crate::services::Services;
use crate::vm::OutputSink;
use alder_core::{FfiType, Value};
use libffi::middle::Cif;
use libffi::raw;
use std::sync::{Arc, Mutex, Weak};

/// Serializes all foreign→language callback invocations.
static CALLBACK_LOCK: Mutex<()> = Mutex::new(());

struct CallbackData {
    function: Value,
    param_types: Vec<FfiType>,
    return_type: FfiType,
    globals: Globals,
    /// Weak: the services bundle owns the registry that owns this data.
    services: Weak<Services>,
    sink: OutputSink,
}

struct CallbackEntry {
    code_ptr: usize,
    closure: *mut raw::ffi_closure,
    data: *mut CallbackData,
    /// The CIF must outlive the closure; libffi keeps a pointer into it.
    _cif: Box<Cif>,
}

unsafe impl Send for CallbackEntry {}

#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<Vec<CallbackEntry>>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry::default()
    }

    /// Allocate an executable trampoline for `function`. Returns the
    /// native code pointer (usable directly as a C function pointer).
    pub fn create(
        &self,
        function: Value,
        param_types: Vec<FfiType>,
        return_type: FfiType,
        globals: Globals,
        services: &Arc<Services>,
        sink: OutputSink,
    ) -> Result<usize, FfiError> {
        if !matches!(function, Value::Function(_)) {
            return Err(FfiError::NotMarshalable {
                expected: "function".to_string(),
                got: function.type_name(),
            });
        }
        for ty in param_types.iter().chain(std::iter::once(&return_type)) {
            if matches!(ty, FfiType::Struct(_)) {
                return Err(FfiError::UnsupportedType(
                    "struct in callback signature".to_string(),
                ));
            }
        }

        let arg_types = param_types
            .iter()
            .map(|ty| libffi_type(ty, &services.structs))
            .collect::<Result<Vec<_>, _>>()?;
        let ret_type = libffi_type(&return_type, &services.structs)?;
        let cif = Box::new(Cif::new(arg_types, ret_type));

        let mut code: *mut libc::c_void = std::ptr::null_mut();
        let closure = unsafe {
            raw::ffi_closure_alloc(size_of::<raw::ffi_closure>(), &mut code)
        } as *mut raw::ffi_closure;
        if closure.is_null() || code.is_null() {
            return Err(FfiError::CallbackAllocationFailed);
        }

        let data = Box::into_raw(Box::new(CallbackData {
            function,
            param_types,
            return_type,
            globals,
            services: Arc::downgrade(services),
            sink,
        }));

        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                cif.as_raw_ptr(),
                Some(trampoline),
                data as *mut libc::c_void,
                code,
            )
        };
        if status != raw::ffi_status_FFI_OK {
            unsafe {
                raw::ffi_closure_free(closure as *mut libc::c_void);
                drop(Box::from_raw(data));
            }
            return Err(FfiError::CifPreparationFailed(format!(
                "ffi_prep_closure_loc status {status:?}"
            )));
        }

        let code_ptr = code as usize;
        self.entries
            .lock()
            .expect("callback registry poisoned")
            .push(CallbackEntry {
                code_ptr,
                closure,
                data,
                _cif: cif,
            });
        tracing::debug!(code_ptr, "ffi callback created");
        Ok(code_ptr)
    }

    /// Free a callback by its code pointer.
    pub fn free(&self, code_ptr: usize) -> Result<(), FfiError> {
        let mut entries = self.entries.lock().expect("callback registry poisoned");
        let index = entries
            .iter()
            .position(|entry| entry.code_ptr == code_ptr)
            .ok_or(FfiError::CallbackNotFound)?;
        let entry = entries.swap_remove(index);
        unsafe {
            raw::ffi_closure_free(entry.closure as *mut libc::c_void);
            drop(Box::from_raw(entry.data));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("callback registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free every live callback (runtime shutdown).
    pub fn free_all(&self) {
        let mut entries = self.entries.lock().expect("callback registry poisoned");
        for entry in entries.drain(..) {
            unsafe {
                raw::ffi_closure_free(entry.closure as *mut libc::c_void);
                drop(Box::from_raw(entry.data));
            }
        }
    }
}

impl Drop for CallbackRegistry {
    fn drop(&mut self) {
        self.free_all();
    }
}

/// The shared entry point foreign code lands in.
unsafe extern "C" fn trampoline(
    _cif: *mut raw::ffi_cif,
    result: *mut libc::c_void,
    args: *mut *mut libc::c_void,
    userdata: *mut libc::c_void,
) {
    // Step 1: serialize through the runtime.
    let _guard = CALLBACK_LOCK.lock().expect("callback lock poisoned");
    let data = unsafe { &*(userdata as *const CallbackData) };

    // Step 2: native argument pointers → language values.
    let mut values = Vec::with_capacity(data.param_types.len());
    for (index, ty) in data.param_types.iter().enumerate() {
        let src = unsafe { *args.add(index) } as *const u8;
        values.push(unsafe { marshal::read_scalar(ty, src) });
    }

    // Step 3: invoke the language function on a fresh VM.
    let outcome = match data.services.upgrade() {
        Some(services) => crate::vm::Vm::call_detached(
            data.globals.clone(),
            services,
            data.sink.clone(),
            &data.function,
            &values,
        ),
        None => {
            tracing::error!("ffi callback invoked after services shutdown");
            Ok(Value::Null)
        }
    };

    // Step 4: marshal the return into the native slot.
    let ret = match outcome {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "exception escaped ffi callback");
            Value::Null
        }
    };
    if !matches!(data.return_type, FfiType::Void) {
        let dst = result as *mut u8;
        if unsafe { marshal::write_scalar(&data.return_type, &ret, dst) }.is_err() {
            // A non-marshalable return degrades to zero.
            unsafe {
                std::ptr::write_bytes(dst, 0, data.return_type.size());
            }
        }
    }
    // Step 5/6: intermediate references drop here, then the lock.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_function_rejected() {
        let services = Services::init();
        let registry = CallbackRegistry::new();
        let err = registry
            .create(
                Value::I32(1),
                vec![],
                FfiType::Void,
                Globals::new(),
                &services,
                OutputSink::stdout(),
            )
            .unwrap_err();
        assert!(matches!(err, FfiError::NotMarshalable { .. }));
    }

    #[test]
    fn test_struct_signature_rejected() {
        let services = Services::init();
        let registry = CallbackRegistry::new();
        let function = crate::vm::tests_support::trivial_function();
        let err = registry
            .create(
                function,
                vec![FfiType::Struct("P".to_string())],
                FfiType::Void,
                Globals::new(),
                &services,
                OutputSink::stdout(),
            )
            .unwrap_err();
        assert!(matches!(err, FfiError::UnsupportedType(_)));
    }

    #[test]
    fn test_free_unknown_handle() {
        let registry = CallbackRegistry::new();
        assert_eq!(registry.free(0xdead), Err(FfiError::CallbackNotFound));
    }
}
