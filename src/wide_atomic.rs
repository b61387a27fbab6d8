//! Atomic cells over the wide pointers.
//!
//! A wide pointer is two words, so a cell cannot swap it with one atomic
//! operation. Instead the control word carries the spinlock bit and guards
//! the value word, which is plain memory only ever touched by the lock
//! holder. A second tag bit records value-only changes: when a store changes
//! the value but keeps the control block, the control word would come back
//! unchanged, so the bit is flipped and the published word never repeats
//! across a logical change.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::atomic::{
    assert_failure_order, assert_load_order, assert_store_order, CompareExchangeError,
    CountPolicy, SharedCount, WeakCount, LOCK_BIT,
};
use crate::count::Control;
use crate::futex::WaitCounter;
use crate::spin::SpinWait;
use crate::wide::{WideShared, WideWeak};

const NOTIFY_BIT: usize = 0b10;
const META_BITS: usize = LOCK_BIT | NOTIFY_BIT;

// Both tag bits must fit below the control block's alignment.
const _: () = assert!(std::mem::align_of::<Control>() >= 4);

fn ctrl_of(meta: usize) -> *mut Control {
    (meta & !META_BITS) as *mut Control
}

/// The locking CAS must at least acquire: the critical section reads the
/// value word, which the previous holder wrote as plain memory.
fn lock_order(order: Ordering) -> Ordering {
    match order {
        Ordering::Relaxed | Ordering::Acquire => Ordering::Acquire,
        Ordering::Release | Ordering::AcqRel => Ordering::AcqRel,
        _ => Ordering::SeqCst,
    }
}

/// The unlock store must at least release, publishing the value word to the
/// next lock holder.
fn unlock_order(order: Ordering) -> Ordering {
    match order {
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Release,
    }
}

/// The type erased pair cell: a tagged control word plus a value word that
/// only the lock holder may touch.
struct RawAtomicPair<P: CountPolicy> {
    ctrl: AtomicUsize,
    value: UnsafeCell<*mut ()>,
    waiters: WaitCounter,
    _marker: PhantomData<P>,
}

impl<P: CountPolicy> RawAtomicPair<P> {
    /// Assumes ownership of whatever count `ctrl` carries.
    fn new(ctrl: *mut Control, value: *mut ()) -> Self {
        debug_assert_eq!(ctrl as usize & META_BITS, 0);
        RawAtomicPair {
            ctrl: AtomicUsize::new(ctrl as usize),
            value: UnsafeCell::new(value),
            waiters: WaitCounter::new(),
            _marker: PhantomData,
        }
    }

    /// Takes the lock and returns the unlocked meta word, notify bit
    /// included.
    fn lock(&self, order: Ordering) -> usize {
        let mut spin = SpinWait::new();
        let mut current = self.ctrl.load(Ordering::Relaxed) & !LOCK_BIT;
        loop {
            match self.ctrl.compare_exchange_weak(
                current,
                current | LOCK_BIT,
                lock_order(order),
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(observed) => {
                    current = observed & !LOCK_BIT;
                    if observed & LOCK_BIT != 0 {
                        spin.wait();
                    }
                }
            }
        }
    }

    /// The meta word to publish after replacing the held pair. A changed
    /// control pointer changes the word on its own; a changed value under
    /// the same control block flips the notify bit instead, so the published
    /// word never repeats across a logical change.
    fn unlock_meta(
        meta: usize,
        prev: (*mut Control, *mut ()),
        desired: (*mut Control, *mut ()),
    ) -> usize {
        if prev.0 == desired.0 {
            if prev.1 == desired.1 {
                meta
            } else {
                meta ^ NOTIFY_BIT
            }
        } else {
            desired.0 as usize
        }
    }

    fn load(&self, order: Ordering) -> (*mut Control, *mut ()) {
        let meta = self.lock(order);
        let ctrl = ctrl_of(meta);
        unsafe { P::increment(ctrl) };
        let value = unsafe { *self.value.get() };
        // the count went on under the lock; republish so the next observer
        // cannot release the last reference before ours is registered
        self.ctrl.store(meta, Ordering::SeqCst);
        (ctrl, value)
    }

    fn store(&self, desired: (*mut Control, *mut ()), order: Ordering) {
        let (previous, _) = self.exchange(desired, order);
        unsafe { P::decrement(previous) };
    }

    fn exchange(&self, desired: (*mut Control, *mut ()), order: Ordering) -> (*mut Control, *mut ()) {
        debug_assert_eq!(desired.0 as usize & META_BITS, 0);
        let meta = self.lock(order);
        let previous = (ctrl_of(meta), unsafe { *self.value.get() });
        unsafe { *self.value.get() = desired.1 };
        self.ctrl
            .store(Self::unlock_meta(meta, previous, desired), unlock_order(order));
        self.waiters.bump();
        previous
    }

    fn compare_exchange(
        &self,
        expected: (*mut Control, *mut ()),
        desired: (*mut Control, *mut ()),
        success: Ordering,
        failure: Ordering,
    ) -> Result<(*mut Control, *mut ()), (*mut Control, *mut ())> {
        // the lock acquire covers the failure ordering's strongest load part
        let _ = failure;
        let meta = self.lock(success);
        let previous = (ctrl_of(meta), unsafe { *self.value.get() });
        if previous == expected {
            unsafe { *self.value.get() = desired.1 };
            self.ctrl.store(
                Self::unlock_meta(meta, previous, desired),
                unlock_order(success),
            );
            self.waiters.bump();
            Ok(previous)
        } else {
            unsafe { P::increment(previous.0) };
            self.ctrl.store(meta, Ordering::SeqCst);
            Err(previous)
        }
    }

    /// Blocks while the cell still holds `old`. Both words are compared
    /// under the lock on every iteration, and the counter snapshot precedes
    /// the comparison, so a replacement landing between validation and sleep
    /// keeps the sleep from blocking.
    fn wait(&self, old: (*mut Control, *mut ()), order: Ordering) {
        loop {
            let generation = self.waiters.current();
            let meta = self.lock(order);
            let current = (ctrl_of(meta), unsafe { *self.value.get() });
            self.ctrl.store(meta, unlock_order(order));
            if current != old {
                return;
            }
            self.waiters.sleep(generation);
        }
    }

    fn notify_one(&self) {
        self.waiters.wake_one();
    }

    fn notify_all(&self) {
        self.waiters.wake_all();
    }

    #[cfg(test)]
    fn meta(&self) -> usize {
        self.ctrl.load(Ordering::Relaxed)
    }
}

impl<P: CountPolicy> Drop for RawAtomicPair<P> {
    fn drop(&mut self) {
        let meta = self.ctrl.load(Ordering::Acquire);
        debug_assert_eq!(meta & LOCK_BIT, 0);
        unsafe { P::decrement(ctrl_of(meta)) };
    }
}

fn wide_into_raw<T>(value: Option<WideShared<T>>) -> (*mut Control, *mut ()) {
    match value {
        Some(value) => {
            let (ctrl, ptr) = WideShared::into_raw_parts(value);
            (ctrl, ptr as *mut ())
        }
        None => (ptr::null_mut(), ptr::null_mut()),
    }
}

fn wide_raw_parts<T>(value: Option<&WideShared<T>>) -> (*mut Control, *mut ()) {
    match value {
        Some(value) => {
            let (ctrl, ptr) = WideShared::raw_parts(value);
            (ctrl, ptr as *mut ())
        }
        None => (ptr::null_mut(), ptr::null_mut()),
    }
}

/// The pair must be null or carry one shared count for the result to assume.
unsafe fn wide_from_raw<T>(raw: (*mut Control, *mut ())) -> Option<WideShared<T>> {
    if raw.0.is_null() {
        None
    } else {
        Some(WideShared::from_raw_parts(raw.0, raw.1 as *mut T))
    }
}

fn weak_into_raw<T>(value: Option<WideWeak<T>>) -> (*mut Control, *mut ()) {
    match value {
        Some(value) => {
            let (ctrl, ptr) = WideWeak::into_raw_parts(value);
            (ctrl, ptr as *mut ())
        }
        None => (ptr::null_mut(), ptr::null_mut()),
    }
}

fn weak_raw_parts<T>(value: Option<&WideWeak<T>>) -> (*mut Control, *mut ()) {
    match value {
        Some(value) => {
            let (ctrl, ptr) = WideWeak::raw_parts(value);
            (ctrl, ptr as *mut ())
        }
        None => (ptr::null_mut(), ptr::null_mut()),
    }
}

/// The pair must be null or carry one control count for the result to
/// assume.
unsafe fn weak_from_raw<T>(raw: (*mut Control, *mut ())) -> Option<WideWeak<T>> {
    if raw.0.is_null() {
        None
    } else {
        Some(WideWeak::from_raw_parts(raw.0, raw.1 as *mut T))
    }
}

/// An atomic cell holding an optional [`WideShared`].
///
/// Same contract as [`AtomicShared`](crate::AtomicShared), except that
/// identity is the full (control, value) pair: a compare-exchange against a
/// reference aliasing the same allocation but a different value fails.
pub struct AtomicWideShared<T> {
    raw: RawAtomicPair<SharedCount>,
    _marker: PhantomData<WideShared<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicWideShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicWideShared<T> {}

impl<T> AtomicWideShared<T> {
    pub const IS_ALWAYS_LOCK_FREE: bool = false;

    pub fn new(value: Option<WideShared<T>>) -> Self {
        let (ctrl, ptr) = wide_into_raw(value);
        AtomicWideShared {
            raw: RawAtomicPair::new(ctrl, ptr),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free(&self) -> bool {
        Self::IS_ALWAYS_LOCK_FREE
    }

    pub fn load(&self, order: Ordering) -> Option<WideShared<T>> {
        assert_load_order(order);
        unsafe { wide_from_raw(self.raw.load(order)) }
    }

    pub fn store(&self, value: Option<WideShared<T>>, order: Ordering) {
        assert_store_order(order);
        self.raw.store(wide_into_raw(value), order);
    }

    pub fn swap(&self, value: Option<WideShared<T>>, order: Ordering) -> Option<WideShared<T>> {
        unsafe { wide_from_raw(self.raw.exchange(wide_into_raw(value), order)) }
    }

    /// On success returns the replaced value. On failure returns the value
    /// the cell held, freshly retained, together with the unconsumed `new`.
    pub fn compare_exchange(
        &self,
        current: Option<&WideShared<T>>,
        new: Option<WideShared<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<WideShared<T>>, CompareExchangeError<Option<WideShared<T>>>> {
        assert_failure_order(failure);
        let expected = wide_raw_parts(current);
        let desired = wide_into_raw(new);
        match self.raw.compare_exchange(expected, desired, success, failure) {
            Ok(previous) => Ok(unsafe { wide_from_raw(previous) }),
            Err(observed) => Err(CompareExchangeError {
                current: unsafe { wide_from_raw(observed) },
                new: unsafe { wide_from_raw(desired) },
            }),
        }
    }

    pub fn compare_exchange_weak(
        &self,
        current: Option<&WideShared<T>>,
        new: Option<WideShared<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<WideShared<T>>, CompareExchangeError<Option<WideShared<T>>>> {
        self.compare_exchange(current, new, success, failure)
    }

    /// Blocks while the cell still holds the same (control, value) pair as
    /// `current`. A store that only rebinds the value under the same
    /// allocation counts as a change.
    pub fn wait(&self, current: Option<&WideShared<T>>, order: Ordering) {
        assert_load_order(order);
        self.raw.wait(wide_raw_parts(current), order);
    }

    pub fn notify_one(&self) {
        self.raw.notify_one();
    }

    pub fn notify_all(&self) {
        self.raw.notify_all();
    }
}

impl<T> Default for AtomicWideShared<T> {
    fn default() -> Self {
        AtomicWideShared::new(None)
    }
}

impl<T> fmt::Debug for AtomicWideShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(AtomicWideShared)")
    }
}

/// An atomic cell holding an optional [`WideWeak`].
pub struct AtomicWideWeak<T> {
    raw: RawAtomicPair<WeakCount>,
    _marker: PhantomData<WideWeak<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicWideWeak<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicWideWeak<T> {}

impl<T> AtomicWideWeak<T> {
    pub const IS_ALWAYS_LOCK_FREE: bool = false;

    pub fn new(value: Option<WideWeak<T>>) -> Self {
        let (ctrl, ptr) = weak_into_raw(value);
        AtomicWideWeak {
            raw: RawAtomicPair::new(ctrl, ptr),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free(&self) -> bool {
        Self::IS_ALWAYS_LOCK_FREE
    }

    pub fn load(&self, order: Ordering) -> Option<WideWeak<T>> {
        assert_load_order(order);
        unsafe { weak_from_raw(self.raw.load(order)) }
    }

    pub fn store(&self, value: Option<WideWeak<T>>, order: Ordering) {
        assert_store_order(order);
        self.raw.store(weak_into_raw(value), order);
    }

    pub fn swap(&self, value: Option<WideWeak<T>>, order: Ordering) -> Option<WideWeak<T>> {
        unsafe { weak_from_raw(self.raw.exchange(weak_into_raw(value), order)) }
    }

    pub fn compare_exchange(
        &self,
        current: Option<&WideWeak<T>>,
        new: Option<WideWeak<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<WideWeak<T>>, CompareExchangeError<Option<WideWeak<T>>>> {
        assert_failure_order(failure);
        let expected = weak_raw_parts(current);
        let desired = weak_into_raw(new);
        match self.raw.compare_exchange(expected, desired, success, failure) {
            Ok(previous) => Ok(unsafe { weak_from_raw(previous) }),
            Err(observed) => Err(CompareExchangeError {
                current: unsafe { weak_from_raw(observed) },
                new: unsafe { weak_from_raw(desired) },
            }),
        }
    }

    pub fn compare_exchange_weak(
        &self,
        current: Option<&WideWeak<T>>,
        new: Option<WideWeak<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<WideWeak<T>>, CompareExchangeError<Option<WideWeak<T>>>> {
        self.compare_exchange(current, new, success, failure)
    }

    pub fn wait(&self, current: Option<&WideWeak<T>>, order: Ordering) {
        assert_load_order(order);
        self.raw.wait(weak_raw_parts(current), order);
    }

    pub fn notify_one(&self) {
        self.raw.notify_one();
    }

    pub fn notify_all(&self) {
        self.raw.notify_all();
    }
}

impl<T> Default for AtomicWideWeak<T> {
    fn default() -> Self {
        AtomicWideWeak::new(None)
    }
}

impl<T> fmt::Debug for AtomicWideWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(AtomicWideWeak)")
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicWideShared, AtomicWideWeak, NOTIFY_BIT};
    use crate::wide::WideShared;
    use std::ptr::addr_of_mut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn field_aliases(pair: &WideShared<(u32, u32)>) -> (WideShared<u32>, WideShared<u32>) {
        let base = WideShared::as_ptr(pair) as *mut (u32, u32);
        unsafe {
            (
                WideShared::alias(pair, addr_of_mut!((*base).0)),
                WideShared::alias(pair, addr_of_mut!((*base).1)),
            )
        }
    }

    #[test]
    fn pair_round_trip() {
        let boxed = WideShared::from_box(Box::new(1));
        let cell = AtomicWideShared::new(Some(boxed.clone()));

        let loaded = cell.load(Ordering::Acquire).unwrap();
        assert!(WideShared::ptr_eq(&loaded, &boxed));
        assert_eq!(*loaded, 1);

        let other = WideShared::new(2);
        let swapped = cell.swap(Some(other.clone()), Ordering::AcqRel).unwrap();
        assert!(WideShared::ptr_eq(&swapped, &boxed));

        cell.store(None, Ordering::Release);
        assert!(cell.load(Ordering::Acquire).is_none());
    }

    #[test]
    fn dropping_the_cell_releases_its_reference() {
        let x = WideShared::new(5);
        let cell = AtomicWideShared::new(Some(x.clone()));
        assert_eq!(WideShared::use_count(&x), 2);
        drop(cell);
        assert_eq!(WideShared::use_count(&x), 1);
    }

    #[test]
    fn compare_exchange_compares_both_words() {
        let pair = WideShared::new((1, 2));
        let (first, second) = field_aliases(&pair);

        let cell = AtomicWideShared::new(Some(first.clone()));

        // same control block, different value: the expectation must fail
        let err = cell
            .compare_exchange(
                Some(&second),
                Some(second.clone()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_err();
        assert!(WideShared::ptr_eq(err.current.as_ref().unwrap(), &first));
        assert!(WideShared::ptr_eq(err.new.as_ref().unwrap(), &second));

        // matching both words succeeds
        let replaced = cell
            .compare_exchange(
                Some(&first),
                Some(second.clone()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap()
            .unwrap();
        assert!(WideShared::ptr_eq(&replaced, &first));
        assert_eq!(*cell.load(Ordering::Acquire).unwrap(), 2);
    }

    #[test]
    fn value_only_store_toggles_the_notify_bit() {
        let pair = WideShared::new((1, 2));
        let (first, second) = field_aliases(&pair);

        let cell = AtomicWideShared::new(Some(first.clone()));
        assert_eq!(cell.raw.meta() & NOTIFY_BIT, 0);

        cell.store(Some(second.clone()), Ordering::Release);
        assert_eq!(cell.raw.meta() & NOTIFY_BIT, NOTIFY_BIT);

        // flipping back on the next value change under the same block
        cell.store(Some(first), Ordering::Release);
        assert_eq!(cell.raw.meta() & NOTIFY_BIT, 0);

        // a control pointer change publishes a clean word
        cell.store(Some(WideShared::new(9)), Ordering::Release);
        assert_eq!(cell.raw.meta() & NOTIFY_BIT, 0);
        drop(second);
    }

    #[test]
    fn waiter_wakes_on_a_pointer_change() {
        let first = WideShared::new(1);
        let second = WideShared::new(2);
        let cell = AtomicWideShared::new(Some(first.clone()));

        thread::scope(|s| {
            s.spawn(|| {
                cell.wait(Some(&first), Ordering::Acquire);
                let seen = cell.load(Ordering::Acquire).unwrap();
                assert!(WideShared::ptr_eq(&seen, &second));
            });

            thread::sleep(Duration::from_millis(100));
            cell.store(Some(second.clone()), Ordering::Release);
            cell.notify_all();
        });
    }

    #[test]
    fn waiter_survives_concurrent_and_no_op_stores() {
        let initial = WideShared::new(0);
        let first = WideShared::new(1);
        let second = WideShared::new(2);
        let cell = AtomicWideShared::new(Some(initial.clone()));

        thread::scope(|s| {
            s.spawn(|| {
                cell.wait(Some(&initial), Ordering::Acquire);
                let seen = cell.load(Ordering::Acquire).unwrap();
                assert!(
                    WideShared::ptr_eq(&seen, &first) || WideShared::ptr_eq(&seen, &second)
                );
            });

            thread::sleep(Duration::from_millis(50));
            // re-storing the held pair is not a change; the waiter re-checks
            // and goes back to sleep
            cell.store(Some(initial.clone()), Ordering::Release);
            cell.notify_all();
            thread::sleep(Duration::from_millis(50));

            for other in [&first, &second] {
                let cell = &cell;
                s.spawn(move || {
                    cell.store(Some(other.clone()), Ordering::Release);
                    cell.notify_all();
                });
            }
        });
    }

    #[test]
    fn waiter_wakes_on_a_value_only_change() {
        let pair = WideShared::new((1, 2));
        let (first, second) = field_aliases(&pair);
        let cell = AtomicWideShared::new(Some(first.clone()));

        thread::scope(|s| {
            s.spawn(|| {
                cell.wait(Some(&first), Ordering::Acquire);
                let seen = cell.load(Ordering::Acquire).unwrap();
                assert!(WideShared::ptr_eq(&seen, &second));
                assert_eq!(*seen, 2);
            });

            thread::sleep(Duration::from_millis(100));
            cell.store(Some(second.clone()), Ordering::Release);
            cell.notify_all();
        });
    }

    #[test]
    fn weak_pair_cell_round_trip() {
        let x = WideShared::new(7);
        let cell = AtomicWideWeak::new(Some(WideShared::downgrade(&x)));

        let w = cell.load(Ordering::Acquire).unwrap();
        assert_eq!(*w.upgrade().unwrap(), 7);

        drop(x);
        assert!(cell.load(Ordering::Acquire).unwrap().upgrade().is_none());

        let previous = cell.swap(None, Ordering::AcqRel);
        assert!(previous.is_some());
        assert!(cell.load(Ordering::Acquire).is_none());
    }

    #[test]
    fn concurrent_hammering_drops_every_value_once() {
        static ALLOCS: AtomicUsize = AtomicUsize::new(0);
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;

        impl Tracked {
            fn colocated() -> WideShared<Tracked> {
                ALLOCS.fetch_add(1, Ordering::Relaxed);
                WideShared::new(Tracked)
            }

            fn boxed() -> WideShared<Tracked> {
                ALLOCS.fetch_add(1, Ordering::Relaxed);
                WideShared::from_box(Box::new(Tracked))
            }
        }

        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let cell = AtomicWideShared::new(Some(Tracked::colocated()));

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..500 {
                        match i % 4 {
                            0 => drop(cell.load(Ordering::Acquire)),
                            1 => cell.store(Some(Tracked::boxed()), Ordering::Release),
                            2 => drop(cell.swap(Some(Tracked::colocated()), Ordering::AcqRel)),
                            _ => {
                                let observed = cell.load(Ordering::Acquire);
                                let _ = cell.compare_exchange(
                                    observed.as_ref(),
                                    Some(Tracked::boxed()),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                );
                            }
                        }
                    }
                });
            }
        });

        drop(cell);
        assert_eq!(
            ALLOCS.load(Ordering::Relaxed),
            DROPS.load(Ordering::Relaxed)
        );
    }
}
