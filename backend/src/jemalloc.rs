//! `mallctl`-backed allocator control for processes running on jemalloc.
//!
//! Profiling has to be switched on at process start, e.g.
//! `_RJEM_MALLOC_CONF=prof:true,prof_active:false`; `prof.active` then toggles
//! sampling at runtime.

use std::{
    ffi::{CStr, CString},
    fs::File,
    io::Write,
    mem,
    os::unix::ffi::OsStrExt,
    path::Path,
    ptr,
};

use libc::{c_char, c_void, size_t};
use tikv_jemalloc_sys::{mallctl, malloc_stats_print};

use crate::allocator::{AllocatorControl, AllocatorCounter, Status};

const OPT_PROF: &CStr = c"opt.prof";
const CONFIG_STATS: &CStr = c"config.stats";
const PROF_ACTIVE: &CStr = c"prof.active";
const PROF_DUMP: &CStr = c"prof.dump";
const EPOCH: &CStr = c"epoch";

/// Status reported when a stats report cannot be written.
const STATS_WRITE_FAILED: Status = -1;

/// Talks to the jemalloc linked into this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct JemallocControl;

impl JemallocControl {
    fn read_flag(&self, name: &CStr) -> bool {
        match read_ctl::<bool>(name) {
            Ok(value) => value,
            Err(code) => {
                tracing::warn!("mallctl {} failed with code {code}", name.to_string_lossy());
                false
            },
        }
    }
}

impl AllocatorControl for JemallocControl {
    fn is_profiling_enabled(&self) -> bool {
        self.read_flag(OPT_PROF)
    }

    fn is_stats_enabled(&self) -> bool {
        self.read_flag(CONFIG_STATS)
    }

    fn is_active(&self) -> bool {
        read_ctl::<bool>(PROF_ACTIVE).unwrap_or(false)
    }

    fn enable(&self) -> Status {
        write_ctl(PROF_ACTIVE, true)
    }

    fn disable(&self) -> Status {
        write_ctl(PROF_ACTIVE, false)
    }

    fn dump(&self, path: &Path) -> Status {
        let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
            return libc::EINVAL;
        };
        write_ctl(PROF_DUMP, path.as_ptr())
    }

    fn dump_stats(&self, path: &Path, opts: &str) -> Status {
        let Ok(opts) = CString::new(opts) else {
            return libc::EINVAL;
        };
        let Ok(file) = File::create(path) else {
            return STATS_WRITE_FAILED;
        };
        let mut sink = StatsSink {
            file,
            failed: false,
        };
        let status = self.refresh_stats();
        if status != 0 {
            tracing::warn!("mallctl epoch failed with code {status}, stats report may be stale");
        }
        // SAFETY: `sink` outlives the call and is only touched by
        // `write_stats`, which jemalloc invokes synchronously; `opts` is a
        // valid NUL-terminated string.
        unsafe {
            malloc_stats_print(
                Some(write_stats),
                (&mut sink as *mut StatsSink).cast::<c_void>(),
                opts.as_ptr(),
            );
        }
        if sink.failed || sink.file.flush().is_err() {
            return STATS_WRITE_FAILED;
        }
        0
    }

    /// Stats are cached per epoch; bumping it makes the next reads current.
    fn refresh_stats(&self) -> Status {
        write_ctl(EPOCH, 1_u64)
    }

    fn read_counter(&self, counter: AllocatorCounter) -> u64 {
        let key = counter.stat_key();
        let value = match counter {
            // uint64_t in jemalloc, size_t for everything else
            AllocatorCounter::BackgroundThreadNumRuns
            | AllocatorCounter::BackgroundThreadRunInterval => read_ctl::<u64>(key),
            _ => read_ctl::<usize>(key).map(|value| value as u64),
        };
        value.unwrap_or(0)
    }
}

struct StatsSink {
    file: File,
    failed: bool,
}

unsafe extern "C" fn write_stats(opaque: *mut c_void, message: *const c_char) {
    // SAFETY: `opaque` is the `StatsSink` handed to `malloc_stats_print` and
    // `message` is a NUL-terminated string owned by jemalloc for this call.
    let sink = &mut *opaque.cast::<StatsSink>();
    let bytes = CStr::from_ptr(message).to_bytes();
    if sink.file.write_all(bytes).is_err() {
        sink.failed = true;
    }
}

fn read_ctl<T: Copy + Default>(name: &CStr) -> Result<T, Status> {
    let mut value = T::default();
    let mut len: size_t = mem::size_of::<T>();
    // SAFETY: `name` is NUL-terminated and `value`/`len` describe a writable
    // buffer of the size jemalloc documents for the keys used in this module.
    let code = unsafe {
        mallctl(
            name.as_ptr(),
            (&mut value as *mut T).cast::<c_void>(),
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if code == 0 {
        Ok(value)
    } else {
        Err(code)
    }
}

fn write_ctl<T>(name: &CStr, mut value: T) -> Status {
    // SAFETY: `name` is NUL-terminated and `value` has the type jemalloc
    // documents for the key; it lives until `mallctl` returns.
    unsafe {
        mallctl(
            name.as_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            (&mut value as *mut T).cast::<c_void>(),
            mem::size_of::<T>(),
        )
    }
}
