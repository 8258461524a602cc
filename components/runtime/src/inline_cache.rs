//! Inline-cache sites for property, method and type-check locations.
//!
//! Each site is a tagged state machine: uninitialized, monomorphic,
//! polymorphic with a bounded entry array, then megamorphic. Megamorphic
//! sites stop caching and route every access through the generic handler.

use crate::object::ShapeId;
use arrayvec::ArrayVec;
use bytecode_system::IcSiteKind;
use std::collections::HashMap;

/// Bound on polymorphic entries before a site goes megamorphic.
pub const POLYMORPHIC_CAPACITY: usize = 4;

/// What a cache entry is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
    /// A receiver shape, for property and method sites
    Shape(ShapeId),
    /// An observed value-type tag, for type-check sites
    TypeTag(u8),
}

/// One cached association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcEntry {
    /// What the entry matches on
    pub key: CacheKey,
    /// Property storage offset (0 for type-check entries)
    pub offset: u32,
    /// Address of the specialized handler generated for this entry
    pub handler: usize,
}

/// The state of one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcState {
    /// Nothing observed yet
    Uninitialized,
    /// Exactly one key observed - the common case
    Monomorphic(IcEntry),
    /// A bounded set of keys
    Polymorphic(ArrayVec<IcEntry, POLYMORPHIC_CAPACITY>),
    /// Too many keys; caching abandoned
    Megamorphic,
}

/// A single inline-cache site.
#[derive(Debug, Clone)]
pub struct IcSite {
    /// Stable site id (`function_id * 10000 + site_index`)
    pub site_id: u64,
    /// What kind of access the site caches
    pub kind: IcSiteKind,
    /// Current cache state
    pub state: IcState,
    /// Generic-handler code address used after megamorphic transition
    pub generic_handler: usize,
    /// Miss-handler code address installed by the baseline JIT
    pub miss_handler: usize,
    /// Cache hits observed
    pub hits: u64,
    /// Cache misses observed
    pub misses: u64,
}

impl IcSite {
    /// A fresh, uninitialized site.
    pub fn new(site_id: u64, kind: IcSiteKind) -> Self {
        Self {
            site_id,
            kind,
            state: IcState::Uninitialized,
            generic_handler: 0,
            miss_handler: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a key, recording a hit or miss.
    pub fn lookup(&mut self, key: CacheKey) -> Option<IcEntry> {
        let found = match &self.state {
            IcState::Uninitialized | IcState::Megamorphic => None,
            IcState::Monomorphic(entry) => (entry.key == key).then_some(*entry),
            IcState::Polymorphic(entries) => entries.iter().find(|e| e.key == key).copied(),
        };
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Whether the site has given up caching.
    pub fn is_megamorphic(&self) -> bool {
        matches!(self.state, IcState::Megamorphic)
    }

    /// Install an entry after a miss, following the explicit transition
    /// edges: Uninitialized → Monomorphic → Polymorphic → Megamorphic.
    /// Returns the handler address the caller should dispatch to: the
    /// entry's specialized handler, or the generic handler once the site
    /// is megamorphic.
    pub fn install(&mut self, entry: IcEntry) -> usize {
        match &mut self.state {
            IcState::Uninitialized => {
                self.state = IcState::Monomorphic(entry);
                entry.handler
            }
            IcState::Monomorphic(existing) => {
                if existing.key == entry.key {
                    *existing = entry;
                    entry.handler
                } else {
                    let mut entries = ArrayVec::new();
                    entries.push(*existing);
                    entries.push(entry);
                    self.state = IcState::Polymorphic(entries);
                    entry.handler
                }
            }
            IcState::Polymorphic(entries) => {
                if let Some(existing) = entries.iter_mut().find(|e| e.key == entry.key) {
                    *existing = entry;
                    entry.handler
                } else if entries.len() < POLYMORPHIC_CAPACITY {
                    entries.push(entry);
                    entry.handler
                } else {
                    tracing::trace!(site_id = self.site_id, "inline cache went megamorphic");
                    self.state = IcState::Megamorphic;
                    self.generic_handler
                }
            }
            IcState::Megamorphic => self.generic_handler,
        }
    }

    /// Number of cached entries.
    pub fn entry_count(&self) -> usize {
        match &self.state {
            IcState::Uninitialized | IcState::Megamorphic => 0,
            IcState::Monomorphic(_) => 1,
            IcState::Polymorphic(entries) => entries.len(),
        }
    }
}

/// All inline-cache sites of a realm, keyed by `(function_id, site_index)`.
#[derive(Debug, Default)]
pub struct IcSiteTable {
    sites: HashMap<(u32, u16), IcSite>,
}

impl IcSiteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The site for a code location, created on first touch.
    pub fn site(&mut self, function_id: u32, site_index: u16, kind: IcSiteKind) -> &mut IcSite {
        self.sites.entry((function_id, site_index)).or_insert_with(|| {
            IcSite::new(function_id as u64 * 10000 + site_index as u64, kind)
        })
    }

    /// The site for a code location, if it has been touched.
    pub fn existing(&self, function_id: u32, site_index: u16) -> Option<&IcSite> {
        self.sites.get(&(function_id, site_index))
    }

    /// Total hits and misses across all sites.
    pub fn totals(&self) -> (u64, u64) {
        self.sites
            .values()
            .fold((0, 0), |(h, m), s| (h + s.hits, m + s.misses))
    }
}
