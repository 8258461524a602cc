//! Executable memory for JIT output.
//!
//! Regions are mmap'd read-write, filled, then flipped to read-execute;
//! writable and executable are never set together. The cache enforces a
//! byte budget; allocation and release are mutually exclusive and may be
//! called from multiple threads.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Errors from the code cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The allocation would exceed the configured budget
    #[error("code cache budget exhausted: {requested} bytes requested, {available} available")]
    BudgetExhausted {
        /// Bytes requested
        requested: usize,
        /// Bytes still available
        available: usize,
    },
    /// The operating system refused the mapping
    #[error("executable mapping failed")]
    MapFailed,
    /// Code larger than the region it was installed into
    #[error("code of {code} bytes does not fit region of {region} bytes")]
    TooLarge {
        /// Code size
        code: usize,
        /// Region size
        region: usize,
    },
}

#[derive(Debug)]
struct CacheState {
    used: AtomicUsize,
    budget: usize,
    // Serializes budget checks against concurrent release
    lock: Mutex<()>,
}

/// Byte-budgeted allocator for executable regions.
pub struct CodeCache {
    state: Arc<CacheState>,
}

impl CodeCache {
    /// Create a cache with the given budget.
    pub fn new(budget: usize) -> Self {
        Self {
            state: Arc::new(CacheState {
                used: AtomicUsize::new(0),
                budget,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.state.used.load(Ordering::Relaxed)
    }

    /// The configured budget.
    pub fn budget(&self) -> usize {
        self.state.budget
    }

    /// Allocate a region of at least `size` bytes, rounded up to page
    /// granularity.
    pub fn alloc(&self, size: usize) -> Result<CodeRegion, CacheError> {
        let size = size.max(1).next_multiple_of(page_size());
        let _guard = self.state.lock.lock();
        let used = self.state.used.load(Ordering::Relaxed);
        if used + size > self.state.budget {
            return Err(CacheError::BudgetExhausted {
                requested: size,
                available: self.state.budget.saturating_sub(used),
            });
        }
        let mapping = Mapping::new(size).ok_or(CacheError::MapFailed)?;
        self.state.used.fetch_add(size, Ordering::Relaxed);
        Ok(CodeRegion {
            mapping,
            size,
            code_len: 0,
            state: self.state.clone(),
        })
    }
}

/// One executable region. Dropping it unmaps the memory and returns the
/// bytes to the cache's budget.
#[derive(Debug)]
pub struct CodeRegion {
    mapping: Mapping,
    size: usize,
    code_len: usize,
    state: Arc<CacheState>,
}

impl CodeRegion {
    /// Region capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of installed code.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Copy `code` into the region and flip it executable.
    pub fn install(&mut self, code: &[u8]) -> Result<(), CacheError> {
        if code.len() > self.size {
            return Err(CacheError::TooLarge {
                code: code.len(),
                region: self.size,
            });
        }
        self.mapping.write(code);
        if !self.mapping.make_executable() {
            return Err(CacheError::MapFailed);
        }
        self.code_len = code.len();
        Ok(())
    }

    /// Entry address of the installed code.
    pub fn entry(&self) -> usize {
        self.mapping.addr()
    }

    /// The installed bytes, for inspection and patching bookkeeping.
    pub fn bytes(&self) -> &[u8] {
        self.mapping.bytes(self.code_len)
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        let _guard = self.state.lock.lock();
        self.state.used.fetch_sub(self.size, Ordering::Relaxed);
    }
}

// SAFETY: the mapping is owned exclusively and the shared state is
// internally synchronized.
unsafe impl Send for CodeRegion {}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name has no preconditions
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if value > 0 {
            return value as usize;
        }
    }
    4096
}

#[cfg(unix)]
#[derive(Debug)]
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

#[cfg(unix)]
impl Mapping {
    fn new(len: usize) -> Option<Self> {
        // SAFETY: anonymous private mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn write(&mut self, code: &[u8]) {
        // SAFETY: the mapping is at least code.len() long (checked by the
        // caller) and currently writable
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr, code.len());
        }
    }

    fn make_executable(&mut self) -> bool {
        // SAFETY: ptr/len describe a live mapping owned by self
        unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.len,
                libc::PROT_READ | libc::PROT_EXEC,
            ) == 0
        }
    }

    fn addr(&self) -> usize {
        self.ptr as usize
    }

    fn bytes(&self, len: usize) -> &[u8] {
        // SAFETY: len <= self.len and the mapping stays readable
        unsafe { std::slice::from_raw_parts(self.ptr, len.min(self.len)) }
    }
}

#[cfg(unix)]
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from mmap and are unmapped exactly once
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// Hosts without mmap get plain heap memory; code is stored but not
// executable there.
#[cfg(not(unix))]
#[derive(Debug)]
struct Mapping {
    buffer: Vec<u8>,
}

#[cfg(not(unix))]
impl Mapping {
    fn new(len: usize) -> Option<Self> {
        Some(Self {
            buffer: vec![0; len],
        })
    }

    fn write(&mut self, code: &[u8]) {
        self.buffer[..code.len()].copy_from_slice(code);
    }

    fn make_executable(&mut self) -> bool {
        true
    }

    fn addr(&self) -> usize {
        self.buffer.as_ptr() as usize
    }

    fn bytes(&self, len: usize) -> &[u8] {
        &self.buffer[..len.min(self.buffer.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_install() {
        let cache = CodeCache::new(1 << 20);
        let mut region = cache.alloc(64).unwrap();
        assert!(cache.used_bytes() >= 64);
        region.install(&[0xC3]).unwrap(); // ret
        assert_eq!(region.bytes(), &[0xC3]);
        assert_ne!(region.entry(), 0);
    }

    #[test]
    fn test_budget_enforced() {
        let cache = CodeCache::new(page_size());
        let first = cache.alloc(1).unwrap();
        let err = cache.alloc(1).unwrap_err();
        assert!(matches!(err, CacheError::BudgetExhausted { .. }));
        drop(first);
        assert!(cache.alloc(1).is_ok());
    }

    #[test]
    fn test_drop_returns_bytes() {
        let cache = CodeCache::new(1 << 20);
        let region = cache.alloc(100).unwrap();
        assert!(cache.used_bytes() > 0);
        drop(region);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_install_too_large_rejected() {
        let cache = CodeCache::new(1 << 20);
        let mut region = cache.alloc(1).unwrap();
        let oversized = vec![0u8; region.size() + 1];
        assert!(matches!(
            region.install(&oversized),
            Err(CacheError::TooLarge { .. })
        ));
    }
}
