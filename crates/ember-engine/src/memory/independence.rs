//! GC-independence accounting.
//!
//! A compile worker entering codegen declares itself GC-independent: the
//! collector may run a pause without waiting on this thread, because nothing
//! the backend touches while lowering is visible to heap scans. The
//! declaration is cooperative bookkeeping — the coordinator counts
//! independent threads so a pausing collector knows which ones to skip.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts threads currently in the GC-independent state.
///
/// Cumulative enter/exit totals are kept alongside the live count so the
/// balance (`enters == exits` when idle) is observable in stats and tests.
#[derive(Debug, Default)]
pub struct GcCoordinator {
    independent: AtomicUsize,
    enters: AtomicUsize,
    exits: AtomicUsize,
}

impl GcCoordinator {
    /// A coordinator with zeroed counters.
    pub fn new() -> Self {
        GcCoordinator::default()
    }

    /// Enters the GC-independent state, returning a guard that exits on
    /// drop.
    pub fn independent(&self) -> GcIndependentGuard<'_> {
        self.enter();
        GcIndependentGuard { coordinator: self }
    }

    /// Raw entry into GC-independence. Prefer [`GcCoordinator::independent`];
    /// every call must be matched by exactly one [`GcCoordinator::exit`].
    pub fn enter(&self) {
        self.independent.fetch_add(1, Ordering::SeqCst);
        self.enters.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw exit from GC-independence.
    pub fn exit(&self) {
        let prev = self.independent.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "gc-independence exit without matching enter");
        self.exits.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of threads currently independent.
    #[inline]
    pub fn independent_threads(&self) -> usize {
        self.independent.load(Ordering::SeqCst)
    }

    /// True when every thread is GC-dependent; a pausing collector must
    /// then wait for all of them.
    pub fn all_dependent(&self) -> bool {
        self.independent_threads() == 0
    }

    /// Cumulative entries.
    pub fn enters(&self) -> usize {
        self.enters.load(Ordering::Relaxed)
    }

    /// Cumulative exits.
    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::Relaxed)
    }
}

/// Scoped GC-independence.
///
/// Dropping the guard exits the state, so every entry is balanced on every
/// path, early aborts included.
#[must_use = "dropping the guard immediately returns the thread to GC-dependence"]
pub struct GcIndependentGuard<'a> {
    coordinator: &'a GcCoordinator,
}

impl Drop for GcIndependentGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_balances_counters() {
        let coordinator = GcCoordinator::new();
        assert!(coordinator.all_dependent());
        {
            let _guard = coordinator.independent();
            assert_eq!(coordinator.independent_threads(), 1);
            assert!(!coordinator.all_dependent());
        }
        assert_eq!(coordinator.independent_threads(), 0);
        assert_eq!(coordinator.enters(), 1);
        assert_eq!(coordinator.exits(), 1);
    }

    #[test]
    fn test_nested_guards() {
        let coordinator = GcCoordinator::new();
        {
            let _outer = coordinator.independent();
            {
                let _inner = coordinator.independent();
                assert_eq!(coordinator.independent_threads(), 2);
            }
            assert_eq!(coordinator.independent_threads(), 1);
        }
        assert!(coordinator.all_dependent());
        assert_eq!(coordinator.enters(), 2);
        assert_eq!(coordinator.exits(), 2);
    }

    #[test]
    fn test_raw_enter_exit() {
        let coordinator = GcCoordinator::new();
        coordinator.enter();
        assert_eq!(coordinator.independent_threads(), 1);
        coordinator.exit();
        assert_eq!(coordinator.independent_threads(), 0);
    }

    #[test]
    fn test_guard_released_on_early_return() {
        let coordinator = GcCoordinator::new();
        fn aborts_early(c: &GcCoordinator) -> Option<()> {
            let _guard = c.independent();
            let missing: Option<()> = None;
            missing?;
            Some(())
        }
        assert!(aborts_early(&coordinator).is_none());
        assert!(coordinator.all_dependent());
        assert_eq!(coordinator.enters(), coordinator.exits());
    }
}
