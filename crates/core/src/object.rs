//! Object cell: open record with named fields
//!
//! Fields live in parallel `names`/`values` arrays preserving declaration
//! order. A `HashMap` index from name to slot is built on the first lookup
//! and discarded whenever the field *set* changes (adding a field); plain
//! value overwrites keep it. An optional nominal type name tags instances
//! of `DEFINE_TYPE`d records.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug)]
struct ObjectFields {
    names: Vec<String>,
    values: Vec<Value>,
    /// Lazily built name → slot index; `None` until the first lookup after
    /// a structural change.
    index: Option<HashMap<String, usize>>,
}

#[derive(Debug)]
pub struct ObjectCell {
    type_name: Option<String>,
    fields: Mutex<ObjectFields>,
}

impl ObjectCell {
    pub fn new(type_name: Option<String>) -> Self {
        Self {
            type_name,
            fields: Mutex::new(ObjectFields {
                names: Vec::new(),
                values: Vec::new(),
                index: None,
            }),
        }
    }

    /// Build from parallel name/value pairs (declaration order preserved).
    pub fn with_fields(type_name: Option<String>, pairs: Vec<(String, Value)>) -> Self {
        let mut names = Vec::with_capacity(pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        for (name, value) in pairs {
            names.push(name);
            values.push(value);
        }
        Self {
            type_name,
            fields: Mutex::new(ObjectFields {
                names,
                values,
                index: None,
            }),
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.fields.lock().expect("object cell poisoned").names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field lookup by name. Builds the index on first use.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut fields = self.fields.lock().expect("object cell poisoned");
        let slot = Self::slot_of(&mut fields, name)?;
        Some(fields.values[slot].clone())
    }

    /// Overwrite an existing field, or add a new one (structural change:
    /// the index is discarded and rebuilt on the next lookup).
    pub fn set(&self, name: &str, value: Value) {
        let mut fields = self.fields.lock().expect("object cell poisoned");
        if let Some(slot) = Self::slot_of(&mut fields, name) {
            fields.values[slot] = value;
        } else {
            fields.names.push(name.to_string());
            fields.values.push(value);
            fields.index = None;
        }
    }

    /// Overwrite only; `false` when the field does not exist.
    pub fn set_existing(&self, name: &str, value: Value) -> bool {
        let mut fields = self.fields.lock().expect("object cell poisoned");
        match Self::slot_of(&mut fields, name) {
            Some(slot) => {
                fields.values[slot] = value;
                true
            }
            None => false,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        let mut fields = self.fields.lock().expect("object cell poisoned");
        Self::slot_of(&mut fields, name).is_some()
    }

    /// Field names in declaration order.
    pub fn keys(&self) -> Vec<String> {
        self.fields.lock().expect("object cell poisoned").names.clone()
    }

    /// Snapshot of `(name, value)` pairs in declaration order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let fields = self.fields.lock().expect("object cell poisoned");
        fields
            .names
            .iter()
            .cloned()
            .zip(fields.values.iter().cloned())
            .collect()
    }

    fn slot_of(fields: &mut ObjectFields, name: &str) -> Option<usize> {
        if fields.index.is_none() {
            let map = fields
                .names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect();
            fields.index = Some(map);
        }
        fields.index.as_ref().expect("index just built").get(name).copied()
    }

    /// Whether the lookup index is currently materialized (test support for
    /// the build-on-lookup / drop-on-mutation invariant).
    pub fn has_index(&self) -> bool {
        self.fields.lock().expect("object cell poisoned").index.is_some()
    }
}
