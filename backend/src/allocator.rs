//! Seams to the native collaborators: the allocator that owns the profiling
//! state and counters, and the symbolizer that names code addresses.

use std::{ffi::CStr, path::Path, sync::Arc};

/// Status code returned by a native allocator call. `0` is success; anything
/// else is passed through to the caller untouched.
pub type Status = i32;

/// Shared handle to the process allocator.
pub type SharedAllocator = Arc<dyn AllocatorControl>;

/// Shared handle to the symbolizer.
pub type SharedSymbols = Arc<dyn SymbolSource>;

/// One of the scalar allocator statistics exported as a gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorCounter {
    /// Bytes allocated by the application.
    Allocated,
    /// Bytes in active pages.
    Active,
    /// Bytes dedicated to allocator metadata.
    Metadata,
    /// Metadata bytes backed by transparent huge pages.
    MetadataThp,
    /// Bytes in physically resident data pages.
    Resident,
    /// Bytes in active extents mapped by the allocator.
    Mapped,
    /// Bytes in virtual memory retained rather than returned to the OS.
    Retained,
    /// Number of `realloc(ptr, 0)` calls.
    ZeroReallocs,
    /// Background threads running.
    BackgroundThreadNumThreads,
    /// Total runs of all background threads.
    BackgroundThreadNumRuns,
    /// Average background thread run interval, in nanoseconds.
    BackgroundThreadRunInterval,
}

impl AllocatorCounter {
    /// Every exported counter, in registration order.
    pub const ALL: [Self; 11] = [
        Self::Allocated,
        Self::Active,
        Self::Metadata,
        Self::MetadataThp,
        Self::Resident,
        Self::Mapped,
        Self::Retained,
        Self::ZeroReallocs,
        Self::BackgroundThreadNumThreads,
        Self::BackgroundThreadNumRuns,
        Self::BackgroundThreadRunInterval,
    ];

    /// Metric name suffix, e.g. `metadata_thp`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Active => "active",
            Self::Metadata => "metadata",
            Self::MetadataThp => "metadata_thp",
            Self::Resident => "resident",
            Self::Mapped => "mapped",
            Self::Retained => "retained",
            Self::ZeroReallocs => "zero_reallocs",
            Self::BackgroundThreadNumThreads => "background_thread_num_threads",
            Self::BackgroundThreadNumRuns => "background_thread_num_runs",
            Self::BackgroundThreadRunInterval => "background_thread_run_interval",
        }
    }

    /// Metric help text.
    pub fn help(self) -> &'static str {
        match self {
            Self::Allocated => "Bytes allocated by the application",
            Self::Active => "Bytes in active pages allocated by the application",
            Self::Metadata => "Bytes dedicated to allocator metadata",
            Self::MetadataThp => "Metadata bytes backed by transparent huge pages",
            Self::Resident => "Bytes in physically resident data pages mapped by the allocator",
            Self::Mapped => "Bytes in active extents mapped by the allocator",
            Self::Retained => "Bytes in virtual memory mappings retained by the allocator",
            Self::ZeroReallocs => "Number of times realloc was called with a size of zero",
            Self::BackgroundThreadNumThreads => "Number of background threads running",
            Self::BackgroundThreadNumRuns => "Total number of runs of all background threads",
            Self::BackgroundThreadRunInterval => {
                "Average run interval of background threads in nanoseconds"
            },
        }
    }

    /// The `mallctl` key this counter is read from.
    pub fn stat_key(self) -> &'static CStr {
        match self {
            Self::Allocated => c"stats.allocated",
            Self::Active => c"stats.active",
            Self::Metadata => c"stats.metadata",
            Self::MetadataThp => c"stats.metadata_thp",
            Self::Resident => c"stats.resident",
            Self::Mapped => c"stats.mapped",
            Self::Retained => c"stats.retained",
            Self::ZeroReallocs => c"stats.zero_reallocs",
            Self::BackgroundThreadNumThreads => c"stats.background_thread.num_threads",
            Self::BackgroundThreadNumRuns => c"stats.background_thread.num_runs",
            Self::BackgroundThreadRunInterval => c"stats.background_thread.run_interval",
        }
    }
}

/// Profiling and statistics primitives of the process allocator.
///
/// Implementations must be safe to call from any thread at any time; the
/// controller only serializes `enable`/`disable` against `dump`.
pub trait AllocatorControl: Send + Sync {
    /// Whether heap profiling support is compiled in and switched on
    /// (`opt.prof`).
    fn is_profiling_enabled(&self) -> bool;

    /// Whether statistics collection is compiled in (`config.stats`).
    fn is_stats_enabled(&self) -> bool;

    /// Current value of the sampling toggle (`prof.active`).
    fn is_active(&self) -> bool;

    /// Turns allocation sampling on.
    fn enable(&self) -> Status;

    /// Turns allocation sampling off.
    fn disable(&self) -> Status;

    /// Writes a heap profile to `path`.
    fn dump(&self, path: &Path) -> Status;

    /// Writes a human or JSON statistics report to `path`. `opts` holds
    /// `malloc_stats_print` option letters.
    fn dump_stats(&self, path: &Path, opts: &str) -> Status;

    /// Advances the stats epoch so later counter reads see current values.
    fn refresh_stats(&self) -> Status;

    /// Reads one counter as of the last [`refresh_stats`]. Failed reads
    /// report `0`.
    ///
    /// [`refresh_stats`]: AllocatorControl::refresh_stats
    fn read_counter(&self, counter: AllocatorCounter) -> u64;
}

/// Resolves a code address to a printable line.
pub trait SymbolSource: Send + Sync {
    /// Returns the resolved entry for `address`; never fails, unknown
    /// addresses get a placeholder name.
    fn resolve(&self, address: u64) -> String;
}

/// Allocator stand-in for builds without jemalloc: reports no profiling and no
/// statistics support, so nothing gets registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedAllocator;

impl AllocatorControl for UnsupportedAllocator {
    fn is_profiling_enabled(&self) -> bool {
        false
    }

    fn is_stats_enabled(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        false
    }

    fn enable(&self) -> Status {
        libc::ENOENT
    }

    fn disable(&self) -> Status {
        libc::ENOENT
    }

    fn dump(&self, _path: &Path) -> Status {
        libc::ENOENT
    }

    fn dump_stats(&self, _path: &Path, _opts: &str) -> Status {
        libc::ENOENT
    }

    fn refresh_stats(&self) -> Status {
        libc::ENOENT
    }

    fn read_counter(&self, _counter: AllocatorCounter) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn counter_names_are_unique_and_match_stat_keys() {
        let names = AllocatorCounter::ALL
            .iter()
            .map(|counter| counter.name())
            .collect::<HashSet<_>>();
        assert_eq!(names.len(), AllocatorCounter::ALL.len());

        for counter in AllocatorCounter::ALL {
            let key = counter.stat_key().to_str().expect("stat keys are ascii");
            assert!(key.starts_with("stats."), "{key}");
            assert_eq!(key.trim_start_matches("stats.").replace('.', "_"), counter.name());
        }
    }

    #[test]
    fn unsupported_allocator_refuses_everything() {
        let allocator = UnsupportedAllocator;
        assert!(!allocator.is_profiling_enabled());
        assert!(!allocator.is_stats_enabled());
        assert_ne!(allocator.enable(), 0);
        assert_ne!(allocator.dump(Path::new("/tmp/never")), 0);
        assert_ne!(allocator.refresh_stats(), 0);
        assert_eq!(allocator.read_counter(AllocatorCounter::Resident), 0);
    }
}
