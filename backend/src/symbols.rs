//! Symbol source backed by the debug info of the running binary.

use std::{ffi::c_void, num::NonZeroUsize};

use backtrace::resolve;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_demangle::try_demangle;

use crate::allocator::SymbolSource;

const UNKNOWN_SYMBOL: &str = "??";

/// Entries kept by [`BacktraceSymbols::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Resolves instruction addresses in this process and caches the result.
///
/// Lines look like `0x55d0c3a1b2c0\tcore::ptr::drop_in_place<...>`; addresses
/// with no symbol get `??` as the name. Addresses come from clients, so the
/// cache is an LRU with a fixed number of entries.
#[derive(Debug)]
pub struct BacktraceSymbols {
    cache: Mutex<LruCache<u64, String>>,
}

impl Default for BacktraceSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktraceSymbols {
    /// Creates a resolver holding up to [`DEFAULT_CACHE_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Creates a resolver holding up to `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lookup(address: u64) -> String {
        let mut name = None;
        resolve(address as usize as *mut c_void, |symbol| {
            // Inlined frames are reported innermost first; keep the first name.
            if name.is_some() {
                return;
            }
            let Some(symbol_name) = symbol.name() else {
                return;
            };
            if let Some(raw) = symbol_name.as_str() {
                name = Some(demangle(raw));
            }
        });
        name.unwrap_or_else(|| UNKNOWN_SYMBOL.to_string())
    }
}

impl SymbolSource for BacktraceSymbols {
    fn resolve(&self, address: u64) -> String {
        if let Some(existing) = self.cache.lock().get(&address) {
            return existing.clone();
        }
        // resolved outside the lock; a racing lookup just overwrites
        let line = format!("{address:#x}\t{}", Self::lookup(address));
        self.cache.lock().put(address, line.clone());
        line
    }
}

fn demangle(raw: &str) -> String {
    match try_demangle(raw) {
        // alternate form drops the trailing `::h<hash>`
        Ok(symbol) => format!("{symbol:#}"),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn marker_function() -> u64 {
        7
    }

    #[test]
    fn demangle_strips_rust_hash() {
        assert_eq!(
            demangle("_ZN4core3ptr13drop_in_place17h0123456789abcdefE"),
            "core::ptr::drop_in_place"
        );
        assert_eq!(demangle("malloc"), "malloc");
    }

    #[test]
    fn unknown_address_formats_question_marks() {
        let symbols = BacktraceSymbols::new();
        assert_eq!(symbols.resolve(0x10), "0x10\t??");
    }

    #[test]
    fn resolves_functions_in_this_binary() {
        assert_eq!(marker_function(), 7);
        let symbols = BacktraceSymbols::new();
        let address = marker_function as usize as u64;

        let line = symbols.resolve(address);
        assert!(line.starts_with(&format!("{address:#x}\t")), "{line}");
        // stripped test binaries have no names; the format still holds
        if !line.ends_with(UNKNOWN_SYMBOL) {
            assert!(line.contains("marker_function"), "{line}");
        }
    }

    #[test]
    fn repeated_lookups_hit_the_cache() {
        let symbols = BacktraceSymbols::new();
        let first = symbols.resolve(0x20);
        assert_eq!(symbols.cache.lock().len(), 1);
        assert_eq!(symbols.resolve(0x20), first);
        assert_eq!(symbols.cache.lock().len(), 1);
    }

    #[test]
    fn cache_stays_bounded_under_many_distinct_addresses() {
        let symbols = BacktraceSymbols::with_capacity(16);
        for index in 1..=500_u64 {
            let address = index << 4;
            assert_eq!(symbols.resolve(address), format!("{address:#x}\t??"));
        }
        assert_eq!(symbols.cache.lock().len(), 16);
        // most recent entries survive, oldest were evicted
        assert!(symbols.cache.lock().contains(&(500_u64 << 4)));
        assert!(!symbols.cache.lock().contains(&(1_u64 << 4)));
    }

    #[test]
    fn zero_capacity_still_caches_one_entry() {
        let symbols = BacktraceSymbols::with_capacity(0);
        symbols.resolve(0x30);
        symbols.resolve(0x40);
        assert_eq!(symbols.cache.lock().len(), 1);
    }
}
