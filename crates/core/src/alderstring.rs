//! AlderString - the runtime string cell
//!
//! Strings are heap cells shared by reference: cloning an `AlderString` bumps
//! the atomic strong count, so every stack slot, array element and object
//! field that names the same string observes in-place mutation. The byte
//! buffer is always valid UTF-8; mutation that resizes reallocates the
//! underlying `Vec`.
//!
//! ## Codepoint cache
//!
//! Character length is O(n) over UTF-8, so the cell caches the codepoint
//! count after the first query and invalidates the cache on any mutation.
//! The cache is a lock-free `AtomicUsize` with `usize::MAX` as the "dirty"
//! sentinel.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sentinel for "codepoint count not computed yet / invalidated".
const CHARS_DIRTY: usize = usize::MAX;

#[derive(Debug)]
struct StrCell {
    bytes: Mutex<Vec<u8>>,
    /// Cached codepoint count, `CHARS_DIRTY` when stale.
    chars: AtomicUsize,
}

/// Shared mutable UTF-8 string.
///
/// Equality (`PartialEq`) is by content; use [`AlderString::ptr_eq`] for
/// identity. There is no intern table: every load of a string literal
/// yields a fresh cell (so mutating one cannot corrupt the constant pool),
/// and separate loads never compare identical — only equal.
#[derive(Debug, Clone)]
pub struct AlderString {
    cell: Arc<StrCell>,
}

impl AlderString {
    pub fn new(text: &str) -> Self {
        Self::from_string(text.to_string())
    }

    pub fn from_string(text: String) -> Self {
        Self {
            cell: Arc::new(StrCell {
                bytes: Mutex::new(text.into_bytes()),
                chars: AtomicUsize::new(CHARS_DIRTY),
            }),
        }
    }

    /// Copy the current contents out as an owned `String`.
    pub fn to_owned_string(&self) -> String {
        let bytes = self.cell.bytes.lock().expect("string cell poisoned");
        // The cell invariant guarantees valid UTF-8.
        String::from_utf8(bytes.clone()).expect("string cell holds invalid UTF-8")
    }

    /// Byte length of the UTF-8 contents.
    pub fn byte_len(&self) -> usize {
        self.cell.bytes.lock().expect("string cell poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len() == 0
    }

    /// Codepoint count, computed lazily and cached until the next mutation.
    pub fn char_count(&self) -> usize {
        let cached = self.cell.chars.load(Ordering::Acquire);
        if cached != CHARS_DIRTY {
            return cached;
        }
        let bytes = self.cell.bytes.lock().expect("string cell poisoned");
        let count = bytes.iter().filter(|b| (**b & 0xC0) != 0x80).count();
        drop(bytes);
        self.cell.chars.store(count, Ordering::Release);
        count
    }

    /// Append text in place. Invalidates the codepoint cache.
    pub fn push_str(&self, text: &str) {
        let mut bytes = self.cell.bytes.lock().expect("string cell poisoned");
        bytes.extend_from_slice(text.as_bytes());
        self.cell.chars.store(CHARS_DIRTY, Ordering::Release);
    }

    /// Replace the contents wholesale. Invalidates the codepoint cache.
    pub fn set_text(&self, text: String) {
        let mut bytes = self.cell.bytes.lock().expect("string cell poisoned");
        *bytes = text.into_bytes();
        self.cell.chars.store(CHARS_DIRTY, Ordering::Release);
    }

    /// Run `f` over the contents without copying them out.
    pub fn with_str<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        let bytes = self.cell.bytes.lock().expect("string cell poisoned");
        let s = std::str::from_utf8(&bytes).expect("string cell holds invalid UTF-8");
        f(s)
    }

    /// Identity comparison (same heap cell).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Stable address of the heap cell, used as an identity key by the
    /// cycle detector and the object field index.
    pub fn cell_addr(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }

    /// Current strong count of the underlying cell (test support).
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }

    /// Iterate codepoints starting at a byte offset; returns the rune and
    /// the byte offset just past it, or `None` at the end.
    pub fn rune_at(&self, byte_offset: usize) -> Option<(char, usize)> {
        self.with_str(|s| {
            if byte_offset >= s.len() {
                return None;
            }
            let rest = &s[byte_offset..];
            let ch = rest.chars().next()?;
            Some((ch, byte_offset + ch.len_utf8()))
        })
    }
}

impl PartialEq for AlderString {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        // One lock at a time: concurrent cross-order comparisons must not
        // be able to deadlock.
        let a = self.cell.bytes.lock().expect("string cell poisoned").clone();
        let b = other.cell.bytes.lock().expect("string cell poisoned");
        a == *b
    }
}

impl Eq for AlderString {}

impl fmt::Display for AlderString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_str(|s| f.write_str(s))
    }
}

impl From<&str> for AlderString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for AlderString {
    fn from(text: String) -> Self {
        Self::from_string(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_equality() {
        let a = AlderString::new("hello");
        let b = AlderString::new("hello");
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_identity_after_clone() {
        let a = AlderString::new("hello");
        let b = a.clone();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_mutation_visible_through_clones() {
        let a = AlderString::new("ab");
        let b = a.clone();
        a.push_str("c");
        assert_eq!(b.to_owned_string(), "abc");
    }

    #[test]
    fn test_char_count_cached_and_invalidated() {
        let s = AlderString::new("héllo");
        assert_eq!(s.char_count(), 5);
        assert_eq!(s.byte_len(), 6);
        s.push_str("ß");
        assert_eq!(s.char_count(), 6);
    }

    #[test]
    fn test_empty() {
        let s = AlderString::new("");
        assert!(s.is_empty());
        assert_eq!(s.char_count(), 0);
    }

    #[test]
    fn test_rune_at_walks_codepoints() {
        let s = AlderString::new("aß");
        let (c0, next) = s.rune_at(0).unwrap();
        assert_eq!(c0, 'a');
        let (c1, end) = s.rune_at(next).unwrap();
        assert_eq!(c1, 'ß');
        assert!(s.rune_at(end).is_none());
    }
}
