//! Process-scoped services
//!
//! The nominal-type, enum, FFI-struct and callback registries are
//! process-wide abstractions of the language, but they are carried as an
//! explicit bundle with an `init`/`shutdown` lifecycle rather than bare
//! statics: each VM holds a handle, which keeps tests isolated and lets a
//! host embed several independent runtimes.
//!
//! Registries are append-only within a program's lifetime; appends hold
//! the registry mutex, reads clone out under it. Never hold a registry
//! lock across a call into user code.

use crate::ffi::callback::CallbackRegistry;
use crate::ffi::structs::StructRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    AlreadyDefined(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AlreadyDefined(name) => {
                write!(f, "type '{}' is already defined", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// A registered nominal type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub name: String,
}

/// A registered enum.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub name: String,
    pub variants: Vec<String>,
}

pub struct Services {
    types: Mutex<HashMap<String, TypeInfo>>,
    enums: Mutex<HashMap<String, EnumInfo>>,
    pub structs: StructRegistry,
    pub callbacks: CallbackRegistry,
}

impl Services {
    pub fn init() -> Arc<Services> {
        Arc::new(Services {
            types: Mutex::new(HashMap::new()),
            enums: Mutex::new(HashMap::new()),
            structs: StructRegistry::new(),
            callbacks: CallbackRegistry::new(),
        })
    }

    pub fn define_type(&self, name: &str) -> Result<(), RegistryError> {
        let mut types = self.types.lock().expect("type registry poisoned");
        if types.contains_key(name) {
            return Err(RegistryError::AlreadyDefined(name.to_string()));
        }
        types.insert(
            name.to_string(),
            TypeInfo {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types
            .lock()
            .expect("type registry poisoned")
            .contains_key(name)
    }

    pub fn define_enum(&self, name: &str, variants: Vec<String>) -> Result<(), RegistryError> {
        let mut enums = self.enums.lock().expect("enum registry poisoned");
        if enums.contains_key(name) {
            return Err(RegistryError::AlreadyDefined(name.to_string()));
        }
        enums.insert(
            name.to_string(),
            EnumInfo {
                name: name.to_string(),
                variants,
            },
        );
        Ok(())
    }

    pub fn enum_info(&self, name: &str) -> Option<EnumInfo> {
        self.enums
            .lock()
            .expect("enum registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn type_count(&self) -> usize {
        self.types.lock().expect("type registry poisoned").len()
    }

    /// Tear down everything with process lifetime: callbacks are freed,
    /// struct layouts dropped, name registries cleared.
    pub fn shutdown(&self) {
        self.callbacks.free_all();
        self.structs.clear();
        self.types.lock().expect("type registry poisoned").clear();
        self.enums.lock().expect("enum registry poisoned").clear();
        tracing::debug!("services shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_registry_append_only() {
        let services = Services::init();
        services.define_type("Point").unwrap();
        assert!(services.has_type("Point"));
        assert_eq!(
            services.define_type("Point"),
            Err(RegistryError::AlreadyDefined("Point".to_string()))
        );
    }

    #[test]
    fn test_enum_registry() {
        let services = Services::init();
        services
            .define_enum("Color", vec!["Red".to_string(), "Blue".to_string()])
            .unwrap();
        let info = services.enum_info("Color").unwrap();
        assert_eq!(info.variants, vec!["Red", "Blue"]);
        assert!(services.enum_info("Shape").is_none());
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let services = Services::init();
        services.define_type("T").unwrap();
        services
            .structs
            .register("S", vec![("a".to_string(), alder_core::FfiType::I32)])
            .unwrap();
        services.shutdown();
        assert_eq!(services.type_count(), 0);
        assert!(services.structs.is_empty());
        assert!(services.callbacks.is_empty());
    }

    #[test]
    fn test_independent_bundles() {
        let a = Services::init();
        let b = Services::init();
        a.define_type("OnlyInA").unwrap();
        assert!(!b.has_type("OnlyInA"));
    }
}
