//! JavaScript symbols.
//!
//! A symbol is a unique identity with an optional description. Identity is
//! a monotonically increasing integer assigned by the registry; equality is
//! identity equality. The registry also backs `Symbol.for`/`Symbol.keyFor`
//! and the lazily created well-known symbols. Registries are engine-scoped,
//! never process-wide.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Handle to a symbol in a [`SymbolRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// The fixed set of well-known symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownSymbol {
    /// `Symbol.iterator`
    Iterator,
    /// `Symbol.asyncIterator`
    AsyncIterator,
    /// `Symbol.hasInstance`
    HasInstance,
    /// `Symbol.isConcatSpreadable`
    IsConcatSpreadable,
    /// `Symbol.toPrimitive`
    ToPrimitive,
    /// `Symbol.toStringTag`
    ToStringTag,
    /// `Symbol.species`
    Species,
    /// `Symbol.match`
    Match,
    /// `Symbol.matchAll`
    MatchAll,
    /// `Symbol.replace`
    Replace,
    /// `Symbol.search`
    Search,
    /// `Symbol.split`
    Split,
    /// `Symbol.unscopables`
    Unscopables,
}

const WELL_KNOWN_COUNT: usize = 13;

impl WellKnownSymbol {
    /// The canonical description string.
    pub fn description(&self) -> &'static str {
        match self {
            WellKnownSymbol::Iterator => "Symbol.iterator",
            WellKnownSymbol::AsyncIterator => "Symbol.asyncIterator",
            WellKnownSymbol::HasInstance => "Symbol.hasInstance",
            WellKnownSymbol::IsConcatSpreadable => "Symbol.isConcatSpreadable",
            WellKnownSymbol::ToPrimitive => "Symbol.toPrimitive",
            WellKnownSymbol::ToStringTag => "Symbol.toStringTag",
            WellKnownSymbol::Species => "Symbol.species",
            WellKnownSymbol::Match => "Symbol.match",
            WellKnownSymbol::MatchAll => "Symbol.matchAll",
            WellKnownSymbol::Replace => "Symbol.replace",
            WellKnownSymbol::Search => "Symbol.search",
            WellKnownSymbol::Split => "Symbol.split",
            WellKnownSymbol::Unscopables => "Symbol.unscopables",
        }
    }

    fn index(&self) -> usize {
        match self {
            WellKnownSymbol::Iterator => 0,
            WellKnownSymbol::AsyncIterator => 1,
            WellKnownSymbol::HasInstance => 2,
            WellKnownSymbol::IsConcatSpreadable => 3,
            WellKnownSymbol::ToPrimitive => 4,
            WellKnownSymbol::ToStringTag => 5,
            WellKnownSymbol::Species => 6,
            WellKnownSymbol::Match => 7,
            WellKnownSymbol::MatchAll => 8,
            WellKnownSymbol::Replace => 9,
            WellKnownSymbol::Search => 10,
            WellKnownSymbol::Split => 11,
            WellKnownSymbol::Unscopables => 12,
        }
    }
}

#[derive(Debug, Clone)]
struct SymbolRecord {
    description: Option<String>,
}

/// Engine-scoped symbol storage and global registry.
pub struct SymbolRegistry {
    symbols: RwLock<Vec<SymbolRecord>>,
    global: Mutex<HashMap<String, SymbolId>>,
    well_known: Mutex<[Option<SymbolId>; WELL_KNOWN_COUNT]>,
}

impl SymbolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(Vec::new()),
            global: Mutex::new(HashMap::new()),
            well_known: Mutex::new([None; WELL_KNOWN_COUNT]),
        }
    }

    /// Create a fresh symbol. Two calls with the same description still
    /// produce distinct symbols.
    pub fn create(&self, description: Option<&str>) -> SymbolId {
        let mut symbols = self.symbols.write();
        let id = SymbolId(symbols.len() as u32);
        symbols.push(SymbolRecord {
            description: description.map(str::to_string),
        });
        id
    }

    /// `Symbol.for`: the interned symbol for `key`, created on first use.
    pub fn for_key(&self, key: &str) -> SymbolId {
        let mut global = self.global.lock();
        if let Some(&id) = global.get(key) {
            return id;
        }
        let id = self.create(Some(key));
        global.insert(key.to_string(), id);
        id
    }

    /// `Symbol.keyFor`: reverse lookup into the global registry.
    pub fn key_for(&self, symbol: SymbolId) -> Option<String> {
        self.global
            .lock()
            .iter()
            .find(|(_, &id)| id == symbol)
            .map(|(key, _)| key.clone())
    }

    /// The description attached at creation, if any.
    pub fn description(&self, symbol: SymbolId) -> Option<String> {
        self.symbols.read()[symbol.0 as usize].description.clone()
    }

    /// A well-known symbol, created and registered on first request.
    pub fn well_known(&self, which: WellKnownSymbol) -> SymbolId {
        let mut slots = self.well_known.lock();
        if let Some(id) = slots[which.index()] {
            return id;
        }
        let id = self.create(Some(which.description()));
        slots[which.index()] = Some(id);
        id
    }

    /// Number of symbols created so far.
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    /// Whether no symbols exist yet.
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
