//! Critical sections around the free list.
//!
//! The heap is meant to sit at the bottom of a kernel, where the only way to
//! keep a timer interrupt from running another allocation in the middle of
//! ours is to turn preemption off. The [`Preemption`] trait is that hook:
//! the kernel implements it on top of its interrupt controller and the heap
//! only ever uses it through the scoped [`PreemptGuard`], so the previous
//! state is restored on every exit path.
//!
//! Preemption alone only protects a single core, so the free list also sits
//! behind a [`spin::Mutex`]. With preemption off the lock is never contended
//! on one core, and on several cores it is what keeps the list consistent.
//!
//! Preemption is disabled before the lock is taken, so its state has to be
//! per core. A flag shared between cores would let one core save the state
//! another core is holding and restore it after that core is done.

use std::{
    cell::Cell,
    ops::{Deref, DerefMut},
};

use spin::{Mutex, MutexGuard};

/// Suppression of preemption, provided by the surrounding system.
///
/// `disable` returns the state preemption was in before the call and
/// `restore` puts that state back. Implementations must compose, so that a
/// nested `disable`/`restore` pair leaves preemption disabled until the
/// outer pair restores it.
///
/// The state behind `disable` and `restore` must belong to the calling core.
/// A [`MemHeap`](crate::MemHeap) is only `Sync` when its preemption hook is,
/// so an implementation that is `Sync` promises exactly that.
pub trait Preemption {
    /// Saved preemption state.
    type State: Copy;

    /// Turns preemption off and returns the previous state.
    fn disable(&self) -> Self::State;

    /// Restores a state returned by [`Preemption::disable`].
    fn restore(&self, state: Self::State);
}

thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// A software interrupt-enable flag.
///
/// Behaves like the `disable()`/`restore(ps)` pair of a uniprocessor kernel:
/// `disable` clears the flag and hands back what it was, `restore` writes it
/// back. Every thread stands in for one core and has its own flag, so a heap
/// shared between threads only ever restores the state of the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptFlag {
    _private: (),
}

impl InterruptFlag {
    /// Creates a handle to the interrupt flag of the calling thread.
    ///
    /// Flags start out enabled.
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Whether interrupts are enabled on the calling thread.
    pub fn is_enabled(&self) -> bool {
        INTERRUPTS_ENABLED.get()
    }
}

impl Preemption for InterruptFlag {
    type State = bool;

    fn disable(&self) -> bool {
        INTERRUPTS_ENABLED.replace(false)
    }

    fn restore(&self, state: bool) {
        INTERRUPTS_ENABLED.set(state);
    }
}

/// For hosted environments, where nothing preempts the heap but the
/// scheduler and the spin lock is enough.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreemption;

impl Preemption for NoPreemption {
    type State = ();

    #[inline]
    fn disable(&self) {}

    #[inline]
    fn restore(&self, _state: ()) {}
}

/// Keeps preemption disabled for as long as it lives.
#[must_use = "preemption is restored as soon as the guard is dropped"]
pub struct PreemptGuard<'a, P: Preemption> {
    preemption: &'a P,
    state: P::State,
}

impl<'a, P: Preemption> PreemptGuard<'a, P> {
    pub fn new(preemption: &'a P) -> Self {
        let state = preemption.disable();

        Self { preemption, state }
    }
}

impl<P: Preemption> Drop for PreemptGuard<'_, P> {
    fn drop(&mut self) {
        self.preemption.restore(self.state);
    }
}

/// Exclusive access to `T` with preemption disabled.
///
/// Fields drop in declaration order: the lock is released first and then
/// preemption is restored.
pub(crate) struct CriticalSection<'a, P: Preemption, T> {
    data: MutexGuard<'a, T>,
    _preempt: PreemptGuard<'a, P>,
}

impl<'a, P: Preemption, T> CriticalSection<'a, P, T> {
    pub fn enter(preemption: &'a P, lock: &'a Mutex<T>) -> Self {
        let preempt = PreemptGuard::new(preemption);
        let data = lock.lock();

        Self {
            data,
            _preempt: preempt,
        }
    }
}

impl<P: Preemption, T> Deref for CriticalSection<'_, P, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<P: Preemption, T> DerefMut for CriticalSection<'_, P, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn guard_restores_on_drop() {
        let flag = InterruptFlag::new();

        {
            let _guard = PreemptGuard::new(&flag);
            assert!(!flag.is_enabled());
        }

        assert!(flag.is_enabled());
    }

    #[test]
    fn nested_guards_restore_outer_state() {
        let flag = InterruptFlag::new();

        let outer = PreemptGuard::new(&flag);
        {
            let _inner = PreemptGuard::new(&flag);
            assert!(!flag.is_enabled());
        }
        // Still inside the outer section.
        assert!(!flag.is_enabled());

        drop(outer);
        assert!(flag.is_enabled());
    }

    #[test]
    fn early_return_restores() {
        fn bail(flag: &InterruptFlag, fail: bool) -> Result<(), ()> {
            let _guard = PreemptGuard::new(flag);
            if fail {
                return Err(());
            }
            Ok(())
        }

        let flag = InterruptFlag::new();
        assert!(bail(&flag, true).is_err());
        assert!(flag.is_enabled());
        assert!(bail(&flag, false).is_ok());
        assert!(flag.is_enabled());
    }

    #[test]
    fn unwinding_restores_and_unlocks() {
        let flag = InterruptFlag::new();
        let lock = Mutex::new(0u32);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut section = CriticalSection::enter(&flag, &lock);
            *section += 1;
            panic!("boom");
        }));

        assert!(result.is_err());
        assert!(flag.is_enabled());
        assert_eq!(*lock.try_lock().unwrap(), 1);
    }

    #[test]
    fn section_holds_the_lock() {
        let flag = InterruptFlag::new();
        let lock = Mutex::new(());

        let section = CriticalSection::enter(&flag, &lock);
        assert!(lock.try_lock().is_none());
        assert!(!flag.is_enabled());

        drop(section);
        assert!(lock.try_lock().is_some());
        assert!(flag.is_enabled());
    }

    #[test]
    fn flags_are_per_thread() {
        let flag = InterruptFlag::new();
        let _guard = PreemptGuard::new(&flag);
        assert!(!flag.is_enabled());

        let other = std::thread::spawn(move || {
            let before = flag.is_enabled();
            let inner = PreemptGuard::new(&flag);
            let during = flag.is_enabled();
            drop(inner);
            (before, during, flag.is_enabled())
        })
        .join()
        .unwrap();

        assert_eq!(other, (true, false, true));
        // The other thread never touched ours.
        assert!(!flag.is_enabled());
    }
}
