//! Immutable UTF-8 string storage.
//!
//! Strings come in five storage variants: small (inline), normal
//! (heap-allocated), static (borrowed from program memory), sliced
//! (a view into a source string) and concatenated (a binary tree of two
//! strings). Lengths are tracked both in bytes and in code points. The
//! intern table maps byte content to a unique instance under a mutex so
//! that multiple contexts sharing an engine can intern safely.

use crate::{ErrorKind, JsError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum byte length stored inline in the small variant.
pub const SMALL_STRING_CAPACITY: usize = 14;

/// Handle to a string in a [`StringTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(pub u32);

/// Storage variant of a [`JsString`].
#[derive(Debug, Clone)]
pub enum StringRepr {
    /// Up to [`SMALL_STRING_CAPACITY`] bytes stored inline
    Small {
        /// Number of bytes used
        len: u8,
        /// Inline byte storage
        bytes: [u8; SMALL_STRING_CAPACITY],
    },
    /// Heap-allocated contents
    Normal(Box<str>),
    /// Borrowed from program memory
    Static(&'static str),
    /// View into a source string
    Sliced {
        /// The string this is a view into
        source: StringId,
        /// Byte offset of the view
        offset: u32,
        /// Byte length of the view
        len: u32,
    },
    /// Binary tree of two strings
    Concat {
        /// Left part
        left: StringId,
        /// Right part
        right: StringId,
    },
}

/// An immutable UTF-8 string value.
#[derive(Debug, Clone)]
pub struct JsString {
    repr: StringRepr,
    byte_len: u32,
    char_len: u32,
}

impl JsString {
    fn inline(text: &str) -> Self {
        debug_assert!(text.len() <= SMALL_STRING_CAPACITY);
        let mut bytes = [0u8; SMALL_STRING_CAPACITY];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        Self {
            repr: StringRepr::Small {
                len: text.len() as u8,
                bytes,
            },
            byte_len: text.len() as u32,
            char_len: text.chars().count() as u32,
        }
    }

    fn normal(text: String) -> Self {
        let byte_len = text.len() as u32;
        let char_len = text.chars().count() as u32;
        Self {
            repr: StringRepr::Normal(text.into_boxed_str()),
            byte_len,
            char_len,
        }
    }

    /// Byte length of the string.
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// Code-point length of the string.
    pub fn char_len(&self) -> u32 {
        self.char_len
    }

    /// The storage variant.
    pub fn repr(&self) -> &StringRepr {
        &self.repr
    }

    /// Whether the variant holds its contents directly (no table lookups
    /// needed to read it).
    pub fn is_flat(&self) -> bool {
        matches!(
            self.repr,
            StringRepr::Small { .. } | StringRepr::Normal(_) | StringRepr::Static(_)
        )
    }

    /// Direct contents for flat variants; `None` for sliced/concatenated.
    pub fn flat_str(&self) -> Option<&str> {
        match &self.repr {
            StringRepr::Small { len, bytes } => {
                // Invariant: inline bytes are valid UTF-8 by construction
                std::str::from_utf8(&bytes[..*len as usize]).ok()
            }
            StringRepr::Normal(text) => Some(text),
            StringRepr::Static(text) => Some(text),
            _ => None,
        }
    }
}

/// Engine-scoped string storage with an intern table.
///
/// Strings are owned by the table and referenced by [`StringId`]. Interned
/// strings are unique per byte content; sliced and concatenated strings
/// live outside the intern map until flattened.
pub struct StringTable {
    entries: RwLock<Vec<Arc<JsString>>>,
    interned: Mutex<HashMap<Box<[u8]>, StringId>>,
}

impl StringTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            interned: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, string: JsString) -> StringId {
        let mut entries = self.entries.write();
        let id = StringId(entries.len() as u32);
        entries.push(Arc::new(string));
        id
    }

    /// Number of stored strings.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fetch a string by handle.
    ///
    /// # Panics
    /// Panics if the handle does not belong to this table.
    pub fn get(&self, id: StringId) -> Arc<JsString> {
        self.entries.read()[id.0 as usize].clone()
    }

    /// Intern `text`, returning the unique handle for its byte content.
    pub fn intern(&self, text: &str) -> StringId {
        let mut interned = self.interned.lock();
        if let Some(&id) = interned.get(text.as_bytes()) {
            return id;
        }
        let string = if text.len() <= SMALL_STRING_CAPACITY {
            JsString::inline(text)
        } else {
            JsString::normal(text.to_string())
        };
        let id = self.push(string);
        interned.insert(text.as_bytes().into(), id);
        id
    }

    /// Intern a string borrowed from program memory without copying its
    /// contents.
    pub fn intern_static(&self, text: &'static str) -> StringId {
        let mut interned = self.interned.lock();
        if let Some(&id) = interned.get(text.as_bytes()) {
            return id;
        }
        let byte_len = text.len() as u32;
        let char_len = text.chars().count() as u32;
        let id = self.push(JsString {
            repr: StringRepr::Static(text),
            byte_len,
            char_len,
        });
        interned.insert(text.as_bytes().into(), id);
        id
    }

    /// Concatenate two strings, producing a concat-tree node.
    pub fn concat(&self, left: StringId, right: StringId) -> StringId {
        let l = self.get(left);
        let r = self.get(right);
        if l.byte_len == 0 {
            return right;
        }
        if r.byte_len == 0 {
            return left;
        }
        self.push(JsString {
            repr: StringRepr::Concat { left, right },
            byte_len: l.byte_len + r.byte_len,
            char_len: l.char_len + r.char_len,
        })
    }

    /// Create a sliced view of `source`. Offsets are in bytes and must
    /// land on code-point boundaries.
    pub fn slice(&self, source: StringId, offset: u32, len: u32) -> Result<StringId, JsError> {
        let text = self.to_string(source);
        let start = offset as usize;
        let end = start + len as usize;
        if end > text.len() || !text.is_char_boundary(start) || !text.is_char_boundary(end) {
            return Err(JsError::new(
                ErrorKind::RangeError,
                "String slice out of bounds",
            ));
        }
        let char_len = text[start..end].chars().count() as u32;
        Ok(self.push(JsString {
            repr: StringRepr::Sliced {
                source,
                offset,
                len,
            },
            byte_len: len,
            char_len,
        }))
    }

    /// Materialize the full contents of a string.
    pub fn to_string(&self, id: StringId) -> String {
        let mut out = String::new();
        self.collect_into(id, &mut out);
        out
    }

    fn collect_into(&self, id: StringId, out: &mut String) {
        let string = self.get(id);
        match &string.repr {
            StringRepr::Small { .. } | StringRepr::Normal(_) | StringRepr::Static(_) => {
                out.push_str(string.flat_str().unwrap_or(""));
            }
            StringRepr::Sliced {
                source,
                offset,
                len,
            } => {
                let full = self.to_string(*source);
                out.push_str(&full[*offset as usize..(*offset + *len) as usize]);
            }
            StringRepr::Concat { left, right } => {
                self.collect_into(*left, out);
                self.collect_into(*right, out);
            }
        }
    }

    /// Rewrite a sliced or concatenated string into a normal variant in
    /// place. Flat variants are left untouched.
    pub fn flatten(&self, id: StringId) {
        if self.get(id).is_flat() {
            return;
        }
        let text = self.to_string(id);
        let flattened = if text.len() <= SMALL_STRING_CAPACITY {
            JsString::inline(&text)
        } else {
            JsString::normal(text)
        };
        self.entries.write()[id.0 as usize] = Arc::new(flattened);
    }

    /// Byte-content equality of two strings.
    pub fn content_eq(&self, a: StringId, b: StringId) -> bool {
        if a == b {
            return true;
        }
        let sa = self.get(a);
        let sb = self.get(b);
        if sa.byte_len != sb.byte_len {
            return false;
        }
        match (sa.flat_str(), sb.flat_str()) {
            (Some(x), Some(y)) => x == y,
            _ => self.to_string(a) == self.to_string(b),
        }
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}
