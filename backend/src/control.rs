//! Serializes profiling state transitions against heap dumps.
//!
//! The sampling flag lives inside the allocator and is never cached here.
//! `enable`/`disable` hold the state lock exclusively, dumps hold it shared,
//! so a dump never samples a profile halfway through a toggle. State reads and
//! counter reads go straight to the allocator without locking.

use std::{fmt, path::Path};

use parking_lot::RwLock;

use crate::allocator::{SharedAllocator, Status};

/// Direction of a sampling toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Turn sampling on.
    Enable,
    /// Turn sampling off.
    Disable,
}

impl Transition {
    /// Any non-zero value enables.
    pub fn from_flag(value: i64) -> Self {
        if value != 0 {
            Self::Enable
        } else {
            Self::Disable
        }
    }

    /// `enabled` or `disabled`.
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Enable => "enabled",
            Self::Disable => "disabled",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enable => f.write_str("enable"),
            Self::Disable => f.write_str("disable"),
        }
    }
}

/// A toggle the allocator refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{transition} memory profiling failed with code {code}")]
pub struct ControlError {
    /// The transition that was attempted.
    pub transition: Transition,
    /// Status returned by the allocator.
    pub code: Status,
}

/// Owns the state lock around the allocator's profiling flag.
pub struct ProfilingController {
    allocator: SharedAllocator,
    state_lock: RwLock<()>,
}

impl ProfilingController {
    /// Wraps `allocator`; tests pass a fake here.
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            allocator,
            state_lock: RwLock::new(()),
        }
    }

    /// Whether profiling support is available at all. Lock-free; used at
    /// startup to decide whether the endpoints are exposed.
    pub fn is_enabled(&self) -> bool {
        self.allocator.is_profiling_enabled()
    }

    /// Current sampling flag as reported by the allocator. Lock-free.
    pub fn is_active(&self) -> bool {
        self.allocator.is_active()
    }

    /// Turns sampling on.
    pub fn enable(&self) -> Result<(), ControlError> {
        self.apply(Transition::Enable)
    }

    /// Turns sampling off.
    pub fn disable(&self) -> Result<(), ControlError> {
        self.apply(Transition::Disable)
    }

    /// Runs `transition` under the exclusive lock. Whether repeating the
    /// current state succeeds is up to the allocator.
    pub fn apply(&self, transition: Transition) -> Result<(), ControlError> {
        let _guard = self.state_lock.write();
        let code = match transition {
            Transition::Enable => self.allocator.enable(),
            Transition::Disable => self.allocator.disable(),
        };
        if code != 0 {
            return Err(ControlError {
                transition,
                code,
            });
        }
        Ok(())
    }

    /// Dumps a heap profile to `path` under the shared lock.
    pub fn dump_profile(&self, path: &Path) -> Result<(), Status> {
        let _guard = self.state_lock.read();
        match self.allocator.dump(path) {
            0 => Ok(()),
            code => Err(code),
        }
    }

    /// The allocator this controller drives.
    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;
    use crate::fake::FakeAllocator;

    fn controller_with(fake: &Arc<FakeAllocator>) -> ProfilingController {
        ProfilingController::new(fake.clone())
    }

    #[test]
    fn transition_from_flag_treats_any_non_zero_as_enable() {
        assert_eq!(Transition::from_flag(1), Transition::Enable);
        assert_eq!(Transition::from_flag(-3), Transition::Enable);
        assert_eq!(Transition::from_flag(0), Transition::Disable);
    }

    #[test]
    fn state_follows_the_last_successful_transition() {
        let fake = Arc::new(FakeAllocator::new());
        let controller = controller_with(&fake);
        let sequence = [true, true, false, true, false, false, true];

        for enable in sequence {
            let result = if enable {
                controller.enable()
            } else {
                controller.disable()
            };
            assert_eq!(result, Ok(()));
            assert_eq!(controller.is_active(), enable);
        }
        assert_eq!(fake.toggle_calls(), sequence.len());
    }

    #[test]
    fn failed_transition_leaves_state_unchanged_and_carries_code() {
        let fake = Arc::new(FakeAllocator::new());
        let controller = controller_with(&fake);
        controller.enable().expect("enable");

        fake.set_toggle_status(libc::EAGAIN);
        let err = controller.disable().expect_err("disable must fail");
        assert_eq!(err, ControlError {
            transition: Transition::Disable,
            code: libc::EAGAIN,
        });
        assert_eq!(
            err.to_string(),
            format!("disable memory profiling failed with code {}", libc::EAGAIN)
        );
        assert!(controller.is_active());

        fake.set_toggle_status(0);
        controller.disable().expect("disable");
        assert!(!controller.is_active());
    }

    #[test]
    fn is_enabled_reports_profiling_support() {
        let supported = ProfilingController::new(Arc::new(FakeAllocator::new()));
        let unsupported =
            ProfilingController::new(Arc::new(FakeAllocator::new().without_profiling()));
        assert!(supported.is_enabled());
        assert!(!unsupported.is_enabled());
    }

    #[test]
    fn dump_failure_returns_allocator_status() {
        let fake = Arc::new(FakeAllocator::new());
        let controller = controller_with(&fake);
        let dir = tempfile::tempdir().expect("temp dir");
        fake.set_dump_status(libc::EFAULT);

        let path = dir.path().join("out.dump");
        assert_eq!(controller.dump_profile(&path), Err(libc::EFAULT));
    }

    #[test]
    fn toggles_never_overlap_running_dumps() {
        let fake = Arc::new(FakeAllocator::new().with_dump_delay(Duration::from_millis(20)));
        let controller = Arc::new(controller_with(&fake));
        let dir = tempfile::tempdir().expect("temp dir");

        let dumpers = (0..4)
            .map(|index| {
                let controller = Arc::clone(&controller);
                let path = dir.path().join(format!("dump-{index}"));
                thread::spawn(move || controller.dump_profile(&path))
            })
            .collect::<Vec<_>>();
        let togglers = (0..4)
            .map(|index| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    if index % 2 == 0 {
                        controller.enable()
                    } else {
                        controller.disable()
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in dumpers {
            assert_eq!(handle.join().expect("dump thread"), Ok(()));
        }
        for handle in togglers {
            assert_eq!(handle.join().expect("toggle thread"), Ok(()));
        }
        assert_eq!(fake.toggles_during_dump(), 0);
        assert_eq!(fake.toggle_calls(), 4);
    }
}
