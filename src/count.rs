//! Packed shared/weak reference counting for control blocks.

use std::process::abort;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// One reference to the associated value.
pub(crate) const VALUE_ONE: u64 = 1;
/// One reference to the control block alone, as held by a weak pointer.
pub(crate) const WEAK_ONE: u64 = 1 << 32;
/// One shared reference: a value reference plus a control reference, applied
/// with a single atomic add thanks to the packing.
pub(crate) const SHARED_ONE: u64 = WEAK_ONE | VALUE_ONE;

/// Past this many references in a half we abort rather than risk the halves
/// bleeding into each other.
const MAX_REFCOUNT: u32 = u32::MAX / 2;

/// Teardown entry points fixed when a control block is allocated. Plain
/// function pointers, so the control block itself carries no type
/// information and no vtable.
pub(crate) struct ControlOps {
    /// Drops the associated value in place without releasing memory.
    pub(crate) destruct: unsafe fn(*mut Control),
    /// Releases the backing memory of the control block and, depending on
    /// the layout, the value. Runs strictly after `destruct`.
    pub(crate) deallocate: unsafe fn(*mut Control),
    pub(crate) get_deleter: Option<unsafe fn(*mut Control) -> *mut ()>,
    pub(crate) element_count: Option<unsafe fn(*const Control) -> usize>,
}

/// Outcome of [`Control::shared_inc_if_nonzero`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PromoteResult {
    /// The value count was zero; the counter was left untouched.
    NoInc,
    /// A full shared reference was added; the value may be dereferenced
    /// until that reference is released.
    AddedSharedInc,
}

/// A control block: value count in the low half of `counter`, control count
/// in the high half. Every value reference is paired with a control
/// reference, so the value count never exceeds the control count.
///
/// All operations take a raw pointer receiver because the terminal ones free
/// the block out from under any borrow.
pub(crate) struct Control {
    counter: AtomicU64,
    ops: &'static ControlOps,
}

impl Control {
    pub(crate) fn new(counter: u64, ops: &'static ControlOps) -> Self {
        Control {
            counter: AtomicU64::new(counter),
            ops,
        }
    }

    fn value_count(counter: u64) -> u32 {
        counter as u32
    }

    fn control_count(counter: u64) -> u32 {
        (counter >> 32) as u32
    }

    /// Racy snapshot of the number of shared references.
    pub(crate) unsafe fn shared_count(this: *const Control) -> u32 {
        Self::value_count((*this).counter.load(Ordering::Relaxed))
    }

    /// True when exactly one shared reference and nothing else exists.
    pub(crate) unsafe fn is_unique(this: *const Control) -> bool {
        (*this).counter.load(Ordering::Acquire) == SHARED_ONE
    }

    pub(crate) unsafe fn shared_inc(this: *mut Control) {
        let previous = (*this).counter.fetch_add(SHARED_ONE, Ordering::Relaxed);
        if Self::value_count(previous) > MAX_REFCOUNT {
            abort();
        }
    }

    pub(crate) unsafe fn shared_dec(this: *mut Control) {
        let previous = (*this).counter.fetch_sub(SHARED_ONE, Ordering::Release);
        debug_assert!(
            Self::value_count(previous) > 0,
            "shared_dec without a live shared reference"
        );
        if previous == SHARED_ONE {
            // Last reference of any kind.
            fence(Ordering::Acquire);
            let ops = (*this).ops;
            (ops.destruct)(this);
            (ops.deallocate)(this);
        } else if Self::value_count(previous) == 1 {
            // Last shared reference; weak references keep the block alive.
            fence(Ordering::Acquire);
            ((*this).ops.destruct)(this);
        }
    }

    /// Adds `SHARED_ONE` only while the value count is nonzero. Never
    /// partially applies: the paired halves go in with one compare-exchange
    /// or not at all.
    pub(crate) unsafe fn shared_inc_if_nonzero(this: *mut Control) -> PromoteResult {
        let mut counter = (*this).counter.load(Ordering::Relaxed);
        while Self::value_count(counter) > 0 {
            if Self::value_count(counter) > MAX_REFCOUNT {
                abort();
            }
            match (*this).counter.compare_exchange_weak(
                counter,
                counter + SHARED_ONE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return PromoteResult::AddedSharedInc,
                Err(e) => counter = e,
            }
        }
        PromoteResult::NoInc
    }

    /// Releases the value half of a shared reference while keeping its
    /// control half: a shared-to-weak demotion in one decrement.
    pub(crate) unsafe fn value_dec(this: *mut Control) {
        let previous = (*this).counter.fetch_sub(VALUE_ONE, Ordering::Release);
        debug_assert!(
            Self::value_count(previous) > 0,
            "value_dec without a live shared reference"
        );
        if Self::value_count(previous) == 1 {
            fence(Ordering::Acquire);
            ((*this).ops.destruct)(this);
        }
    }

    pub(crate) unsafe fn weak_inc(this: *mut Control) {
        let previous = (*this).counter.fetch_add(WEAK_ONE, Ordering::Relaxed);
        if Self::control_count(previous) > MAX_REFCOUNT {
            abort();
        }
    }

    pub(crate) unsafe fn weak_dec(this: *mut Control) {
        // When this is already the only reference no other holder can
        // appear, so skip the decrement and deallocate outright.
        if (*this).counter.load(Ordering::Acquire) == WEAK_ONE {
            ((*this).ops.deallocate)(this);
        } else {
            let previous = (*this).counter.fetch_sub(WEAK_ONE, Ordering::Release);
            debug_assert!(
                Self::control_count(previous) > 0,
                "weak_dec without a live control reference"
            );
            if previous == WEAK_ONE {
                fence(Ordering::Acquire);
                // The value count hit zero earlier and destructed the value;
                // only the memory remains.
                ((*this).ops.deallocate)(this);
            }
        }
    }

    #[cfg(test)]
    pub(crate) unsafe fn deleter(this: *mut Control) -> Option<*mut ()> {
        (*this).ops.get_deleter.map(|f| f(this))
    }

    #[cfg(test)]
    pub(crate) unsafe fn element_count(this: *const Control) -> Option<usize> {
        (*this).ops.element_count.map(|f| f(this))
    }
}
