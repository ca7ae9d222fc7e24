//! Global variable table
//!
//! Identifier → slot index, with per-slot mutability and `is_const` flags.
//! One table is shared (behind an `RwLock`) by the root VM and every task
//! it spawns; reads dominate, so lookups take the read lock only.

use alder_core::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalsError {
    Undefined(String),
    AssignToConst(String),
    Redefinition(String),
}

impl std::fmt::Display for GlobalsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlobalsError::Undefined(name) => write!(f, "undefined global '{}'", name),
            GlobalsError::AssignToConst(name) => {
                write!(f, "cannot assign to constant '{}'", name)
            }
            GlobalsError::Redefinition(name) => {
                write!(f, "constant '{}' cannot be redefined", name)
            }
        }
    }
}

impl std::error::Error for GlobalsError {}

#[derive(Debug)]
struct GlobalSlot {
    value: Value,
    mutable: bool,
    is_const: bool,
}

#[derive(Debug, Default)]
struct Table {
    names: HashMap<String, usize>,
    slots: Vec<GlobalSlot>,
}

/// Shared global table handle.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    table: Arc<RwLock<Table>>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or overwrite a global. Redefining a constant fails.
    pub fn define(
        &self,
        name: &str,
        value: Value,
        mutable: bool,
        is_const: bool,
    ) -> Result<usize, GlobalsError> {
        let mut table = self.table.write().expect("globals poisoned");
        if let Some(&slot) = table.names.get(name) {
            if table.slots[slot].is_const {
                return Err(GlobalsError::Redefinition(name.to_string()));
            }
            table.slots[slot] = GlobalSlot {
                value,
                mutable,
                is_const,
            };
            return Ok(slot);
        }
        let slot = table.slots.len();
        table.slots.push(GlobalSlot {
            value,
            mutable,
            is_const,
        });
        table.names.insert(name.to_string(), slot);
        Ok(slot)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let table = self.table.read().expect("globals poisoned");
        let slot = *table.names.get(name)?;
        Some(table.slots[slot].value.clone())
    }

    pub fn set(&self, name: &str, value: Value) -> Result<(), GlobalsError> {
        let mut table = self.table.write().expect("globals poisoned");
        let Some(&slot) = table.names.get(name) else {
            return Err(GlobalsError::Undefined(name.to_string()));
        };
        let entry = &mut table.slots[slot];
        if entry.is_const || !entry.mutable {
            return Err(GlobalsError::AssignToConst(name.to_string()));
        }
        entry.value = value;
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table
            .read()
            .expect("globals poisoned")
            .names
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.table.read().expect("globals poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
