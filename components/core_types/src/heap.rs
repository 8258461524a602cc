//! Engine-scoped primitive heap.
//!
//! Owns the string table, symbol registry and BigInt storage that NaN-boxed
//! values reference by index. One heap exists per engine instance and is
//! dropped with it; there is no hidden process-wide state.

use crate::{JsBigInt, StringTable, SymbolRegistry};
use parking_lot::RwLock;
use std::sync::Arc;

/// Handle to a BigInt stored in a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BigIntId(pub u32);

/// Handle to an object in the runtime's object heap.
///
/// Objects themselves live outside this crate; the id type is defined here
/// so that [`crate::Value`] can carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u32);

/// The primitive heap backing a single engine instance.
pub struct Heap {
    /// Interned string storage
    pub strings: StringTable,
    /// Symbol storage and global registry
    pub symbols: SymbolRegistry,
    bigints: RwLock<Vec<Arc<JsBigInt>>>,
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            strings: StringTable::new(),
            symbols: SymbolRegistry::new(),
            bigints: RwLock::new(Vec::new()),
        }
    }

    /// Store a BigInt and return its handle.
    pub fn alloc_bigint(&self, value: JsBigInt) -> BigIntId {
        let mut bigints = self.bigints.write();
        let id = BigIntId(bigints.len() as u32);
        bigints.push(Arc::new(value));
        id
    }

    /// Fetch a BigInt by handle.
    ///
    /// # Panics
    /// Panics if the handle does not belong to this heap.
    pub fn bigint(&self, id: BigIntId) -> Arc<JsBigInt> {
        self.bigints.read()[id.0 as usize].clone()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigint_storage() {
        let heap = Heap::new();
        let id = heap.alloc_bigint(JsBigInt::from_i64(99));
        assert_eq!(heap.bigint(id).to_string(), "99");
    }
}
