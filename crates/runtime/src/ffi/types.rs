//! FFI type codes → host-ABI descriptors
//!
//! Bridges the pure type codes of `alder_core::ffitype` to `libffi`
//! descriptors. Scalar lookups are table-driven; struct descriptors come
//! from the registry, which retains them for the lifetime of the entry.

use super::FfiError;
use super::structs::StructRegistry;
use alder_core::FfiType;
use libffi::middle::Type;

/// The libffi descriptor for a type code. Struct codes resolve through the
/// registry (their descriptors are built from field layouts at
/// registration time).
pub fn libffi_type(ty: &FfiType, structs: &StructRegistry) -> Result<Type, FfiError> {
    Ok(match ty {
        FfiType::Void => Type::void(),
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
        FfiType::Pointer | FfiType::CString => Type::pointer(),
        FfiType::Struct(name) => structs
            .layout(name)
            .ok_or_else(|| FfiError::UnknownStruct(name.clone()))?
            .libffi_type(),
    })
}

/// Host storage size for a type code; struct sizes come from the registry.
pub fn storage_size(ty: &FfiType, structs: &StructRegistry) -> Result<usize, FfiError> {
    match ty {
        FfiType::Struct(name) => structs
            .layout(name)
            .map(|layout| layout.size)
            .ok_or_else(|| FfiError::UnknownStruct(name.clone())),
        other => Ok(other.size()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes_match_core_table() {
        let structs = StructRegistry::new();
        for ty in [
            FfiType::I8,
            FfiType::U16,
            FfiType::I32,
            FfiType::U64,
            FfiType::F32,
            FfiType::F64,
            FfiType::Pointer,
        ] {
            assert_eq!(storage_size(&ty, &structs).unwrap(), ty.size());
        }
    }

    #[test]
    fn test_unknown_struct_errors() {
        let structs = StructRegistry::new();
        assert_eq!(
            storage_size(&FfiType::Struct("Nope".to_string()), &structs),
            Err(FfiError::UnknownStruct("Nope".to_string()))
        );
        assert!(libffi_type(&FfiType::Struct("Nope".to_string()), &structs).is_err());
    }
}
