//! Recording doubles for [`AllocatorControl`] and [`SymbolSource`], shared by
//! the unit tests and the router tests under `tests/`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::allocator::{AllocatorControl, AllocatorCounter, Status, SymbolSource};

/// Records every call and behaves like a jemalloc with profiling compiled in.
#[derive(Debug)]
pub struct FakeAllocator {
    profiling_enabled: bool,
    stats_enabled: bool,
    dump_delay: Option<Duration>,
    active: AtomicBool,
    toggle_status: AtomicI32,
    dump_status: AtomicI32,
    refresh_status: AtomicI32,
    stats_refreshes: AtomicUsize,
    toggle_calls: AtomicUsize,
    dumps_in_flight: AtomicUsize,
    toggles_during_dump: AtomicUsize,
    profile: Mutex<Vec<u8>>,
    counters: Mutex<HashMap<AllocatorCounter, u64>>,
    dump_paths: Mutex<Vec<PathBuf>>,
    stats_requests: Mutex<Vec<(PathBuf, String)>>,
}

impl Default for FakeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAllocator {
    /// Profiling and stats supported, sampling off, every call succeeds.
    pub fn new() -> Self {
        Self {
            profiling_enabled: true,
            stats_enabled: true,
            dump_delay: None,
            active: AtomicBool::new(false),
            toggle_status: AtomicI32::new(0),
            dump_status: AtomicI32::new(0),
            refresh_status: AtomicI32::new(0),
            stats_refreshes: AtomicUsize::new(0),
            toggle_calls: AtomicUsize::new(0),
            dumps_in_flight: AtomicUsize::new(0),
            toggles_during_dump: AtomicUsize::new(0),
            profile: Mutex::new(b"heap_v2/524288\n".to_vec()),
            counters: Mutex::new(HashMap::new()),
            dump_paths: Mutex::new(Vec::new()),
            stats_requests: Mutex::new(Vec::new()),
        }
    }

    /// Reports `opt.prof` as off.
    pub fn without_profiling(mut self) -> Self {
        self.profiling_enabled = false;
        self
    }

    /// Reports `config.stats` as off.
    pub fn without_stats(mut self) -> Self {
        self.stats_enabled = false;
        self
    }

    /// Makes each dump sleep before writing, to widen race windows.
    pub fn with_dump_delay(mut self, delay: Duration) -> Self {
        self.dump_delay = Some(delay);
        self
    }

    /// Bytes written by every successful dump.
    pub fn with_profile(self, profile: impl Into<Vec<u8>>) -> Self {
        *self.profile.lock() = profile.into();
        self
    }

    /// Status returned by `enable`/`disable`; `0` restores success.
    pub fn set_toggle_status(&self, status: Status) {
        self.toggle_status.store(status, Ordering::SeqCst);
    }

    /// Status returned by `dump`; `0` restores success.
    pub fn set_dump_status(&self, status: Status) {
        self.dump_status.store(status, Ordering::SeqCst);
    }

    /// Status returned by `refresh_stats`; `0` restores success.
    pub fn set_refresh_status(&self, status: Status) {
        self.refresh_status.store(status, Ordering::SeqCst);
    }

    /// Value returned for `counter`.
    pub fn set_counter(&self, counter: AllocatorCounter, value: u64) {
        self.counters.lock().insert(counter, value);
    }

    /// Number of `enable`/`disable` calls, successful or not.
    pub fn toggle_calls(&self) -> usize {
        self.toggle_calls.load(Ordering::SeqCst)
    }

    /// Number of `refresh_stats` calls.
    pub fn stats_refreshes(&self) -> usize {
        self.stats_refreshes.load(Ordering::SeqCst)
    }

    /// Paths handed to `dump`, in call order.
    pub fn dump_paths(&self) -> Vec<PathBuf> {
        self.dump_paths.lock().clone()
    }

    /// `(path, opts)` pairs handed to `dump_stats`.
    pub fn stats_requests(&self) -> Vec<(PathBuf, String)> {
        self.stats_requests.lock().clone()
    }

    /// Toggles observed while a dump was running.
    pub fn toggles_during_dump(&self) -> usize {
        self.toggles_during_dump.load(Ordering::SeqCst)
    }

    fn toggle(&self, active: bool) -> Status {
        self.toggle_calls.fetch_add(1, Ordering::SeqCst);
        if self.dumps_in_flight.load(Ordering::SeqCst) > 0 {
            self.toggles_during_dump.fetch_add(1, Ordering::SeqCst);
        }
        let status = self.toggle_status.load(Ordering::SeqCst);
        if status == 0 {
            self.active.store(active, Ordering::SeqCst);
        }
        status
    }
}

impl AllocatorControl for FakeAllocator {
    fn is_profiling_enabled(&self) -> bool {
        self.profiling_enabled
    }

    fn is_stats_enabled(&self) -> bool {
        self.stats_enabled
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn enable(&self) -> Status {
        self.toggle(true)
    }

    fn disable(&self) -> Status {
        self.toggle(false)
    }

    fn dump(&self, path: &Path) -> Status {
        self.dumps_in_flight.fetch_add(1, Ordering::SeqCst);
        self.dump_paths.lock().push(path.to_path_buf());
        if let Some(delay) = self.dump_delay {
            thread::sleep(delay);
        }
        let profile = self.profile.lock().clone();
        let status = match std::fs::write(path, profile) {
            Ok(()) => self.dump_status.load(Ordering::SeqCst),
            Err(_) => libc::EIO,
        };
        self.dumps_in_flight.fetch_sub(1, Ordering::SeqCst);
        status
    }

    fn dump_stats(&self, path: &Path, opts: &str) -> Status {
        self.stats_requests
            .lock()
            .push((path.to_path_buf(), opts.to_string()));
        let report = if opts.contains('J') {
            "{\"jemalloc\":{}}\n".to_string()
        } else {
            format!("___ Begin jemalloc statistics ___\nopts: {opts}\n")
        };
        match std::fs::write(path, report) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }

    fn refresh_stats(&self) -> Status {
        self.stats_refreshes.fetch_add(1, Ordering::SeqCst);
        self.refresh_status.load(Ordering::SeqCst)
    }

    fn read_counter(&self, counter: AllocatorCounter) -> u64 {
        self.counters.lock().get(&counter).copied().unwrap_or(0)
    }
}

/// Names every address `sym_<hex>` and records what was asked.
#[derive(Debug, Default)]
pub struct FakeSymbols {
    resolved: Mutex<Vec<u64>>,
}

impl FakeSymbols {
    /// Creates a symbolizer with an empty call log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses resolved so far, in call order.
    pub fn resolved(&self) -> Vec<u64> {
        self.resolved.lock().clone()
    }
}

impl SymbolSource for FakeSymbols {
    fn resolve(&self, address: u64) -> String {
        self.resolved.lock().push(address);
        format!("{address:#x}\tsym_{address:x}")
    }
}
