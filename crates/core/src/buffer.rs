//! Buffer cell: a mutable byte array
//!
//! Distinct from strings: no UTF-8 assumption, no codepoint cache. Buffers
//! back FFI pointer arguments, so the raw data address is exposed to the
//! marshaling layer.

use std::sync::Mutex;

#[derive(Debug)]
pub struct BufferCell {
    bytes: Mutex<Vec<u8>>,
}

impl BufferCell {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().expect("buffer cell poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.bytes
            .lock()
            .expect("buffer cell poisoned")
            .get(index)
            .copied()
    }

    /// `false` when out of range.
    pub fn set(&self, index: usize, byte: u8) -> bool {
        let mut bytes = self.bytes.lock().expect("buffer cell poisoned");
        match bytes.get_mut(index) {
            Some(slot) => {
                *slot = byte;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().expect("buffer cell poisoned").clone()
    }

    /// Run `f` over the raw bytes. The FFI layer uses this to obtain the
    /// data address for pointer arguments; the lock is held for the call.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut bytes = self.bytes.lock().expect("buffer cell poisoned");
        f(&mut bytes)
    }
}
