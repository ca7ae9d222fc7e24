//! FFI struct registry
//!
//! Process-wide registry of nominal struct layouts. Each entry records the
//! ordered fields (name, type code, size, computed offset), the overall
//! size and alignment, and the libffi descriptor retained for call
//! preparation. Offsets follow the host C layout rule: each field aligns
//! to its natural alignment, the struct size rounds up to the widest
//! alignment.
//!
//! Registration is append-only under the registry mutex; lookups clone the
//! `Arc`'d layout and read lock-free thereafter.

use super::FfiError;
use super::marshal;
use alder_core::{FfiType, ObjectCell, Value};
use libffi::middle::Type;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub ty: FfiType,
    pub size: usize,
    pub offset: usize,
}

/// The ABI descriptor is retained as the ordered element codes; the
/// `libffi` structure type is materialized from them at call-preparation
/// time (the prepared `Cif` owns its copy). Element codes rather than raw
/// `ffi_type` pointers keep the registry `Send + Sync`.
#[derive(Debug)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<StructField>,
    pub size: usize,
    pub align: usize,
}

impl StructLayout {
    /// Build the libffi structure descriptor for call preparation.
    pub fn libffi_type(&self) -> Type {
        Type::structure(self.fields.iter().map(|field| scalar_type(&field.ty)))
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

#[derive(Default)]
pub struct StructRegistry {
    entries: Mutex<HashMap<String, Arc<StructLayout>>>,
}

impl StructRegistry {
    pub fn new() -> StructRegistry {
        StructRegistry::default()
    }

    /// Register a struct. Nested structs are not supported as field types;
    /// scalar and pointer fields only.
    pub fn register(
        &self,
        name: &str,
        fields: Vec<(String, FfiType)>,
    ) -> Result<Arc<StructLayout>, FfiError> {
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut laid_out = Vec::with_capacity(fields.len());

        for (field_name, ty) in fields {
            if matches!(ty, FfiType::Struct(_) | FfiType::Void) {
                return Err(FfiError::UnsupportedType(format!(
                    "struct field '{}' of type {}",
                    field_name,
                    ty.name()
                )));
            }
            let field_align = ty.align();
            let field_size = ty.size();
            offset = align_up(offset, field_align);
            align = align.max(field_align);
            laid_out.push(StructField {
                name: field_name,
                size: field_size,
                offset,
                ty,
            });
            offset += field_size;
        }
        let size = align_up(offset.max(1), align);

        let layout = Arc::new(StructLayout {
            name: name.to_string(),
            fields: laid_out,
            size,
            align,
        });
        self.entries
            .lock()
            .expect("struct registry poisoned")
            .insert(name.to_string(), Arc::clone(&layout));
        tracing::debug!(name, size, align, "ffi struct registered");
        Ok(layout)
    }

    pub fn layout(&self, name: &str) -> Option<Arc<StructLayout>> {
        self.entries
            .lock()
            .expect("struct registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("struct registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry (runtime shutdown).
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("struct registry poisoned")
            .clear();
    }
}

fn scalar_type(ty: &FfiType) -> Type {
    match ty {
        FfiType::I8 => Type::i8(),
        FfiType::I16 => Type::i16(),
        FfiType::I32 => Type::i32(),
        FfiType::I64 => Type::i64(),
        FfiType::U8 => Type::u8(),
        FfiType::U16 => Type::u16(),
        FfiType::U32 => Type::u32(),
        FfiType::U64 => Type::u64(),
        FfiType::F32 => Type::f32(),
        FfiType::F64 => Type::f64(),
        _ => Type::pointer(),
    }
}

/// Marshal an object into struct memory: locate each field by name, write
/// at its offset; unset fields write zero.
///
/// # Safety
/// `dst` must point to at least `layout.size` writable bytes.
pub unsafe fn object_to_struct(
    layout: &StructLayout,
    value: &Value,
    dst: *mut u8,
) -> Result<(), FfiError> {
    let object = match value {
        Value::Object(cell) => cell,
        other => {
            return Err(FfiError::NotMarshalable {
                expected: format!("struct {}", layout.name),
                got: other.type_name(),
            });
        }
    };
    unsafe {
        std::ptr::write_bytes(dst, 0, layout.size);
    }
    for field in &layout.fields {
        match object.get(&field.name) {
            Some(field_value) => unsafe {
                marshal::write_scalar(&field.ty, &field_value, dst.add(field.offset))?;
            },
            None => {
                // Unset fields stay zeroed.
            }
        }
    }
    Ok(())
}

/// Struct memory → object: read each field at its offset.
///
/// # Safety
/// `src` must point to at least `layout.size` readable bytes laid out per
/// `layout`.
pub unsafe fn struct_to_object(layout: &StructLayout, src: *const u8) -> Value {
    let object = ObjectCell::new(Some(layout.name.clone()));
    for field in &layout.fields {
        let value = unsafe { marshal::read_scalar(&field.ty, src.add(field.offset)) };
        object.set(&field.name, value);
    }
    Value::Object(Arc::new(object))
}
