//! FFI engine end to end: struct marshaling round trips and the
//! qsort-with-language-comparator scenario.
//!
//! The callback test dynamically loads the host C runtime; on hosts
//! where no libc spelling resolves, those tests return early.

mod common;

use alder_core::opcode::Op;
use alder_core::{FfiType, ObjectCell, Value};
use alder_runtime::ffi::call::call_native;
use alder_runtime::ffi::load::Library;
use alder_runtime::vm::OutputSink;
use alder_runtime::{Globals, Services};
use common::Asm;
use serial_test::serial;
use std::sync::Arc;

fn open_libc() -> Option<Library> {
    for name in ["libc.so.6", "libc.so", "libSystem.B.dylib"] {
        if let Ok(lib) = Library::open(name) {
            return Some(lib);
        }
    }
    None
}

/// Seed scenario, first half: `{ int32 x; double y; }` round trip.
#[test]
fn test_struct_register_marshal_round_trip() {
    let services = Services::init();
    let layout = services
        .structs
        .register(
            "Pair",
            vec![
                ("x".to_string(), FfiType::I32),
                ("y".to_string(), FfiType::F64),
            ],
        )
        .unwrap();

    let object = ObjectCell::new(None);
    object.set("x", Value::I32(3));
    object.set("y", Value::F64(2.5));
    let value = Value::Object(Arc::new(object));

    let mut storage = vec![0u8; layout.size];
    unsafe {
        alder_runtime::ffi::structs::object_to_struct(&layout, &value, storage.as_mut_ptr())
            .unwrap();
    }
    let back = unsafe { alder_runtime::ffi::structs::struct_to_object(&layout, storage.as_ptr()) };
    let Value::Object(cell) = back else {
        panic!("expected object back")
    };
    assert!(matches!(cell.get("x").unwrap(), Value::I32(3)));
    assert!(matches!(cell.get("y").unwrap(), Value::F64(y) if y == 2.5));
    services.shutdown();
}

/// Unknown struct names fail loudly at marshal time.
#[test]
fn test_unknown_struct_name_raises() {
    let services = Services::init();
    let result = call_native(
        1, // non-null dummy; type preparation fails first
        &[Value::Null],
        &[FfiType::Struct("Missing".to_string())],
        &FfiType::Void,
        &services.structs,
    );
    assert!(matches!(
        result,
        Err(alder_runtime::FfiError::UnknownStruct(_))
    ));
}

/// Seed scenario, second half: qsort over 100 i32s with a language
/// comparator installed as a native callback.
#[test]
#[serial]
fn test_qsort_with_language_comparator() {
    let Some(libc_lib) = open_libc() else { return };
    let Some(qsort) = libc_lib.sym("qsort") else {
        return;
    };

    let services = Services::init();
    let globals = Globals::new();

    // fn cmp(p, q) { return ptr_read_i32(p) - ptr_read_i32(q); }
    let mut cmp = Asm::new("cmp");
    cmp.chunk.arity = 2;
    cmp.op(Op::GetLocal).byte(1);
    cmp.op(Op::CallBuiltin).u16(12).byte(1); // ptr_read_i32
    cmp.op(Op::GetLocal).byte(2);
    cmp.op(Op::CallBuiltin).u16(12).byte(1);
    cmp.op(Op::Sub);
    cmp.op(Op::Return);
    let comparator = alder_runtime::function_for_chunk(Arc::new(cmp.finish()));

    let code_ptr = services
        .callbacks
        .create(
            comparator,
            vec![FfiType::Pointer, FfiType::Pointer],
            FfiType::I32,
            globals.clone(),
            &services,
            OutputSink::stdout(),
        )
        .unwrap();
    assert_eq!(services.callbacks.len(), 1);

    // 100 integers, descending, in a byte buffer.
    let count = 100usize;
    let mut bytes = Vec::with_capacity(count * 4);
    for i in (0..count).rev() {
        bytes.extend_from_slice(&(i as i32).to_le_bytes());
    }
    let buffer = Arc::new(alder_core::BufferCell::from_bytes(bytes));

    call_native(
        qsort as usize,
        &[
            Value::Buffer(Arc::clone(&buffer)),
            Value::U64(count as u64),
            Value::U64(4),
            Value::NativePtr(code_ptr),
        ],
        &[FfiType::Pointer, FfiType::U64, FfiType::U64, FfiType::Pointer],
        &FfiType::Void,
        &services.structs,
    )
    .unwrap();

    let sorted = buffer.snapshot();
    let values: Vec<i32> = sorted
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    let expected: Vec<i32> = (0..count as i32).collect();
    assert_eq!(values, expected, "qsort through the trampoline must sort");

    // callback_free by code pointer, then shutdown idempotence.
    services.callbacks.free(code_ptr).unwrap();
    assert!(services.callbacks.is_empty());
    services.shutdown();
}

/// A language callback that closes over state observes it across calls.
#[test]
#[serial]
fn test_callback_counts_invocations() {
    let Some(libc_lib) = open_libc() else { return };
    let Some(qsort) = libc_lib.sym("qsort") else {
        return;
    };

    let services = Services::init();
    let globals = Globals::new();
    globals
        .define("calls", Value::I64(0), true, false)
        .unwrap();

    // fn cmp(p, q) { calls = calls + 1; return ptr_read_i32(p) - ptr_read_i32(q); }
    let mut cmp = Asm::new("counting_cmp");
    cmp.chunk.arity = 2;
    cmp.get_global("calls");
    cmp.small(1);
    cmp.op(Op::Add);
    cmp.set_global("calls");
    cmp.op(Op::Pop);
    cmp.op(Op::GetLocal).byte(1);
    cmp.op(Op::CallBuiltin).u16(12).byte(1);
    cmp.op(Op::GetLocal).byte(2);
    cmp.op(Op::CallBuiltin).u16(12).byte(1);
    cmp.op(Op::Sub);
    cmp.op(Op::Return);
    let comparator = alder_runtime::function_for_chunk(Arc::new(cmp.finish()));

    let code_ptr = services
        .callbacks
        .create(
            comparator,
            vec![FfiType::Pointer, FfiType::Pointer],
            FfiType::I32,
            globals.clone(),
            &services,
            OutputSink::stdout(),
        )
        .unwrap();

    let count = 16usize;
    let mut bytes = Vec::new();
    for i in (0..count).rev() {
        bytes.extend_from_slice(&(i as i32).to_le_bytes());
    }
    let buffer = Arc::new(alder_core::BufferCell::from_bytes(bytes));

    call_native(
        qsort as usize,
        &[
            Value::Buffer(buffer),
            Value::U64(count as u64),
            Value::U64(4),
            Value::NativePtr(code_ptr),
        ],
        &[FfiType::Pointer, FfiType::U64, FfiType::U64, FfiType::Pointer],
        &FfiType::Void,
        &services.structs,
    )
    .unwrap();

    match globals.get("calls").unwrap() {
        Value::I64(calls) => {
            assert!(calls >= (count - 1) as i64, "comparator ran {calls} times");
        }
        other => panic!("unexpected {other:?}"),
    }
    services.shutdown();
}

/// Struct arguments pass through a real native call: `hypot`-style check
/// is impossible with structs in libc, so verify via memcpy: copy a
/// struct image out of a buffer and read it back as an object.
#[test]
#[serial]
fn test_struct_through_memcpy() {
    let Some(libc_lib) = open_libc() else { return };
    let Some(memcpy) = libc_lib.sym("memcpy") else {
        return;
    };

    let services = Services::init();
    let layout = services
        .structs
        .register(
            "Pair",
            vec![
                ("x".to_string(), FfiType::I32),
                ("y".to_string(), FfiType::F64),
            ],
        )
        .unwrap();

    let object = ObjectCell::new(None);
    object.set("x", Value::I32(7));
    object.set("y", Value::F64(1.5));
    let source = Value::Object(Arc::new(object));

    let mut image = vec![0u8; layout.size];
    unsafe {
        alder_runtime::ffi::structs::object_to_struct(&layout, &source, image.as_mut_ptr())
            .unwrap();
    }

    let dest = Arc::new(alder_core::BufferCell::new(layout.size));
    let src_buffer = Arc::new(alder_core::BufferCell::from_bytes(image));
    call_native(
        memcpy as usize,
        &[
            Value::Buffer(Arc::clone(&dest)),
            Value::Buffer(src_buffer),
            Value::U64(layout.size as u64),
        ],
        &[FfiType::Pointer, FfiType::Pointer, FfiType::U64],
        &FfiType::Pointer,
        &services.structs,
    )
    .unwrap();

    let copied = dest.snapshot();
    let back =
        unsafe { alder_runtime::ffi::structs::struct_to_object(&layout, copied.as_ptr()) };
    let Value::Object(cell) = back else {
        panic!("expected object")
    };
    assert!(matches!(cell.get("x").unwrap(), Value::I32(7)));
    assert!(matches!(cell.get("y").unwrap(), Value::F64(y) if y == 1.5));
    services.shutdown();
}
