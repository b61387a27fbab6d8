//! Atomic cells over the narrow pointers.
//!
//! The control pointer lives in one `AtomicUsize` whose lowest bit doubles
//! as a spinlock. Taking the lock and reading the pointer is a single
//! compare-exchange; releasing it is a plain store of an unlocked word. The
//! lock is held only across the count adjustment an operation needs before
//! the pointer can leave the cell, so these cells are never lock-free and
//! honestly report so.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::count::Control;
use crate::futex::WaitCounter;
use crate::shared::{Shared, Weak};
use crate::spin::SpinWait;

pub(crate) const LOCK_BIT: usize = 0b01;

/// How a cell adjusts the count of the pointers moving through it. Shared
/// cells hold full shared references, weak cells hold control references.
pub(crate) trait CountPolicy {
    unsafe fn increment(ctrl: *mut Control);
    unsafe fn decrement(ctrl: *mut Control);
}

pub(crate) struct SharedCount;

impl CountPolicy for SharedCount {
    unsafe fn increment(ctrl: *mut Control) {
        if !ctrl.is_null() {
            Control::shared_inc(ctrl);
        }
    }

    unsafe fn decrement(ctrl: *mut Control) {
        if !ctrl.is_null() {
            Control::shared_dec(ctrl);
        }
    }
}

pub(crate) struct WeakCount;

impl CountPolicy for WeakCount {
    unsafe fn increment(ctrl: *mut Control) {
        if !ctrl.is_null() {
            Control::weak_inc(ctrl);
        }
    }

    unsafe fn decrement(ctrl: *mut Control) {
        if !ctrl.is_null() {
            Control::weak_dec(ctrl);
        }
    }
}

/// Maps an operation's ordering to the part a plain unlock store can carry.
/// The acquire part, if any, was already applied by the locking CAS.
pub(crate) fn store_part(order: Ordering) -> Ordering {
    match order {
        Ordering::Acquire => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Release,
        order => order,
    }
}

/// A pointer word with the spinlock encoded in its lowest bit. Control
/// blocks are aligned well past two bytes, so the bit never collides with a
/// real pointer.
struct LockWord {
    word: AtomicUsize,
}

impl LockWord {
    fn new(ptr: usize) -> Self {
        debug_assert_eq!(ptr & LOCK_BIT, 0);
        LockWord {
            word: AtomicUsize::new(ptr),
        }
    }

    /// Takes the lock and returns the pointer it guards. `order` applies to
    /// the successful locking CAS.
    fn lock_load(&self, order: Ordering) -> usize {
        let mut spin = SpinWait::new();
        let mut current = self.word.load(Ordering::Relaxed) & !LOCK_BIT;
        loop {
            match self.word.compare_exchange_weak(
                current,
                current | LOCK_BIT,
                order,
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

    /// Takes the lock, keying the first attempts on `expected` so that
    /// `success` is the ordering applied exactly when the unlocked word
    /// matched; a mismatched word is locked with `failure` instead.
    fn lock_load_expected(&self, expected: usize, success: Ordering, failure: Ordering) -> usize {
        let mut spin = SpinWait::new();
        let mut current = expected;
        loop {
            let order = if current == expected { success } else { failure };
            match self.word.compare_exchange_weak(
                current,
                current | LOCK_BIT,
                order,
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

    /// Swaps the pointer without ever holding the lock: the CAS only
    /// matches unlocked words, so a locked cell simply makes it retry.
    fn lock_exchange(&self, desired: usize, order: Ordering) -> usize {
        debug_assert_eq!(desired & LOCK_BIT, 0);
        let mut spin = SpinWait::new();
        let mut current = self.word.load(Ordering::Relaxed) & !LOCK_BIT;
        loop {
            match self
                .word
                .compare_exchange_weak(current, desired, order, Ordering::Relaxed)
            {
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

    /// Releases the lock by publishing `value`. Only the lock holder may
    /// call this, which is what lets it be a plain store.
    fn unlock_store(&self, value: usize, order: Ordering) {
        debug_assert_eq!(value & LOCK_BIT, 0);
        debug_assert_ne!(self.word.load(Ordering::Relaxed) & LOCK_BIT, 0);
        self.word.store(value, order);
    }

    fn load_raw(&self, order: Ordering) -> usize {
        self.word.load(order)
    }
}

/// The type erased cell. The policy decides whether the counts moved on
/// load, drop and compare-exchange failure are shared or weak. The wait
/// counter is bumped by every mutation that replaces the held pointer, so
/// waiters never sleep keyed on the pointer word itself.
pub(crate) struct RawAtomicControl<P: CountPolicy> {
    word: LockWord,
    waiters: WaitCounter,
    _marker: PhantomData<P>,
}

impl<P: CountPolicy> RawAtomicControl<P> {
    /// Assumes ownership of whatever count `ctrl` carries.
    pub(crate) fn new(ctrl: *mut Control) -> Self {
        RawAtomicControl {
            word: LockWord::new(ctrl as usize),
            waiters: WaitCounter::new(),
            _marker: PhantomData,
        }
    }

    /// Returns the held pointer with a fresh count. The count is added
    /// while the lock pins the pointer, then the word is republished.
    pub(crate) fn load(&self, order: Ordering) -> *mut Control {
        let ptr = self.word.lock_load(order);
        unsafe { P::increment(ptr as *mut Control) };
        self.word.unlock_store(ptr, Ordering::SeqCst);
        ptr as *mut Control
    }

    /// Installs `desired`, consuming its count, and releases the count of
    /// the pointer it displaced.
    pub(crate) fn store(&self, desired: *mut Control, order: Ordering) {
        let previous = self.exchange(desired, order);
        unsafe { P::decrement(previous) };
    }

    /// Installs `desired`, handing the displaced pointer's count to the
    /// caller.
    pub(crate) fn exchange(&self, desired: *mut Control, order: Ordering) -> *mut Control {
        let previous = self.word.lock_exchange(desired as usize, order);
        self.waiters.bump();
        previous as *mut Control
    }

    /// On a match, installs `desired` (consuming its count) and hands the
    /// displaced count to the caller. On a mismatch, returns the witnessed
    /// pointer with a fresh count and leaves `desired`'s count untouched.
    pub(crate) fn compare_exchange(
        &self,
        expected: *mut Control,
        desired: *mut Control,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut Control, *mut Control> {
        let previous = self
            .word
            .lock_load_expected(expected as usize, success, failure);
        if previous == expected as usize {
            self.word.unlock_store(desired as usize, store_part(success));
            self.waiters.bump();
            Ok(previous as *mut Control)
        } else {
            unsafe { P::increment(previous as *mut Control) };
            self.word.unlock_store(previous, Ordering::SeqCst);
            Err(previous as *mut Control)
        }
    }

    /// Blocks while the cell still holds `old`. The counter snapshot is
    /// taken before the word is validated, so a replacement landing between
    /// validation and sleep keeps the sleep from blocking; a wakeup only
    /// returns to the caller once a re-read confirms the pointer changed.
    pub(crate) fn wait(&self, old: *mut Control, order: Ordering) {
        loop {
            let generation = self.waiters.current();
            if self.word.load_raw(order) & !LOCK_BIT != old as usize {
                return;
            }
            self.waiters.sleep(generation);
        }
    }

    pub(crate) fn notify_one(&self) {
        self.waiters.wake_one();
    }

    pub(crate) fn notify_all(&self) {
        self.waiters.wake_all();
    }
}

impl<P: CountPolicy> Drop for RawAtomicControl<P> {
    fn drop(&mut self) {
        let word = self.word.load_raw(Ordering::Acquire);
        debug_assert_eq!(word & LOCK_BIT, 0);
        unsafe { P::decrement(word as *mut Control) };
    }
}

/// Error of a failed compare-exchange: the pointer the cell actually held,
/// freshly retained, and the desired pointer handed back unconsumed.
#[derive(Debug)]
pub struct CompareExchangeError<P> {
    pub current: P,
    pub new: P,
}

pub(crate) fn assert_load_order(order: Ordering) {
    debug_assert!(
        matches!(
            order,
            Ordering::Relaxed | Ordering::Acquire | Ordering::SeqCst
        ),
        "invalid ordering for a load"
    );
}

pub(crate) fn assert_store_order(order: Ordering) {
    debug_assert!(
        matches!(
            order,
            Ordering::Relaxed | Ordering::Release | Ordering::SeqCst
        ),
        "invalid ordering for a store"
    );
}

pub(crate) fn assert_failure_order(order: Ordering) {
    assert_load_order(order);
}

/// An atomic cell holding an optional [`Shared`].
///
/// Loads hand out fully counted references; stores release the reference
/// they displace. Not lock-free: every operation may spin on the cell's
/// encoded lock bit.
pub struct AtomicShared<T> {
    raw: RawAtomicControl<SharedCount>,
    _marker: PhantomData<Shared<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicShared<T> {}

fn shared_into_ctrl<T>(value: Option<Shared<T>>) -> *mut Control {
    value.map_or(ptr::null_mut(), Shared::into_ctrl)
}

/// `ctrl` must be null or carry one shared count for the result to assume.
unsafe fn shared_from_ctrl<T>(ctrl: *mut Control) -> Option<Shared<T>> {
    if ctrl.is_null() {
        None
    } else {
        Some(Shared::from_ctrl(ctrl))
    }
}

impl<T> AtomicShared<T> {
    pub const IS_ALWAYS_LOCK_FREE: bool = false;

    pub fn new(value: Option<Shared<T>>) -> Self {
        AtomicShared {
            raw: RawAtomicControl::new(shared_into_ctrl(value)),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free(&self) -> bool {
        Self::IS_ALWAYS_LOCK_FREE
    }

    pub fn load(&self, order: Ordering) -> Option<Shared<T>> {
        assert_load_order(order);
        unsafe { shared_from_ctrl(self.raw.load(order)) }
    }

    pub fn store(&self, value: Option<Shared<T>>, order: Ordering) {
        assert_store_order(order);
        self.raw.store(shared_into_ctrl(value), order);
    }

    pub fn swap(&self, value: Option<Shared<T>>, order: Ordering) -> Option<Shared<T>> {
        unsafe { shared_from_ctrl(self.raw.exchange(shared_into_ctrl(value), order)) }
    }

    /// On success returns the replaced value. On failure returns the value
    /// the cell held, freshly retained, together with the unconsumed `new`.
    pub fn compare_exchange(
        &self,
        current: Option<&Shared<T>>,
        new: Option<Shared<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<Shared<T>>, CompareExchangeError<Option<Shared<T>>>> {
        assert_failure_order(failure);
        let expected = current.map_or(ptr::null_mut(), Shared::ctrl);
        let desired = shared_into_ctrl(new);
        match self.raw.compare_exchange(expected, desired, success, failure) {
            Ok(previous) => Ok(unsafe { shared_from_ctrl(previous) }),
            Err(observed) => Err(CompareExchangeError {
                current: unsafe { shared_from_ctrl(observed) },
                new: unsafe { shared_from_ctrl(desired) },
            }),
        }
    }

    /// Identical to [`compare_exchange`](Self::compare_exchange); the cell
    /// locks either way, so there is no cheaper weak form.
    pub fn compare_exchange_weak(
        &self,
        current: Option<&Shared<T>>,
        new: Option<Shared<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<Shared<T>>, CompareExchangeError<Option<Shared<T>>>> {
        self.compare_exchange(current, new, success, failure)
    }

    /// Blocks while the cell still holds the same pointer as `current`.
    /// Wake it with [`notify_one`](Self::notify_one) or
    /// [`notify_all`](Self::notify_all) after a modification.
    pub fn wait(&self, current: Option<&Shared<T>>, order: Ordering) {
        assert_load_order(order);
        self.raw
            .wait(current.map_or(ptr::null_mut(), Shared::ctrl), order);
    }

    pub fn notify_one(&self) {
        self.raw.notify_one();
    }

    pub fn notify_all(&self) {
        self.raw.notify_all();
    }
}

impl<T> Default for AtomicShared<T> {
    fn default() -> Self {
        AtomicShared::new(None)
    }
}

impl<T> fmt::Debug for AtomicShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(AtomicShared)")
    }
}

/// An atomic cell holding an optional [`Weak`]. Same protocol as
/// [`AtomicShared`], moving control counts instead of shared counts.
pub struct AtomicWeak<T> {
    raw: RawAtomicControl<WeakCount>,
    _marker: PhantomData<Weak<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicWeak<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicWeak<T> {}

fn weak_into_ctrl<T>(value: Option<Weak<T>>) -> *mut Control {
    value.map_or(ptr::null_mut(), Weak::into_ctrl)
}

/// `ctrl` must be null or carry one control count for the result to assume.
unsafe fn weak_from_ctrl<T>(ctrl: *mut Control) -> Option<Weak<T>> {
    if ctrl.is_null() {
        None
    } else {
        Some(Weak::from_ctrl(ctrl))
    }
}

impl<T> AtomicWeak<T> {
    pub const IS_ALWAYS_LOCK_FREE: bool = false;

    pub fn new(value: Option<Weak<T>>) -> Self {
        AtomicWeak {
            raw: RawAtomicControl::new(weak_into_ctrl(value)),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free(&self) -> bool {
        Self::IS_ALWAYS_LOCK_FREE
    }

    pub fn load(&self, order: Ordering) -> Option<Weak<T>> {
        assert_load_order(order);
        unsafe { weak_from_ctrl(self.raw.load(order)) }
    }

    pub fn store(&self, value: Option<Weak<T>>, order: Ordering) {
        assert_store_order(order);
        self.raw.store(weak_into_ctrl(value), order);
    }

    pub fn swap(&self, value: Option<Weak<T>>, order: Ordering) -> Option<Weak<T>> {
        unsafe { weak_from_ctrl(self.raw.exchange(weak_into_ctrl(value), order)) }
    }

    pub fn compare_exchange(
        &self,
        current: Option<&Weak<T>>,
        new: Option<Weak<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<Weak<T>>, CompareExchangeError<Option<Weak<T>>>> {
        assert_failure_order(failure);
        let expected = current.map_or(ptr::null_mut(), Weak::ctrl);
        let desired = weak_into_ctrl(new);
        match self.raw.compare_exchange(expected, desired, success, failure) {
            Ok(previous) => Ok(unsafe { weak_from_ctrl(previous) }),
            Err(observed) => Err(CompareExchangeError {
                current: unsafe { weak_from_ctrl(observed) },
                new: unsafe { weak_from_ctrl(desired) },
            }),
        }
    }

    pub fn compare_exchange_weak(
        &self,
        current: Option<&Weak<T>>,
        new: Option<Weak<T>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<Weak<T>>, CompareExchangeError<Option<Weak<T>>>> {
        self.compare_exchange(current, new, success, failure)
    }

    pub fn wait(&self, current: Option<&Weak<T>>, order: Ordering) {
        assert_load_order(order);
        self.raw
            .wait(current.map_or(ptr::null_mut(), Weak::ctrl), order);
    }

    pub fn notify_one(&self) {
        self.raw.notify_one();
    }

    pub fn notify_all(&self) {
        self.raw.notify_all();
    }
}

impl<T> Default for AtomicWeak<T> {
    fn default() -> Self {
        AtomicWeak::new(None)
    }
}

impl<T> fmt::Debug for AtomicWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(AtomicWeak)")
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicShared, AtomicWeak};
    use crate::shared::Shared;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn never_reports_lock_freedom() {
        assert!(!AtomicShared::<u32>::IS_ALWAYS_LOCK_FREE);
        assert!(!AtomicShared::new(Some(Shared::new(0))).is_lock_free());
        assert!(!AtomicWeak::<u32>::new(None).is_lock_free());
    }

    #[test]
    fn load_store_swap_keep_counts_balanced() {
        static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

        struct NumDrops;

        impl Drop for NumDrops {
            fn drop(&mut self) {
                NUM_DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let x = Shared::new(NumDrops);
        let cell = AtomicShared::new(Some(x.clone()));
        assert_eq!(Shared::use_count(&x), 2);

        let loaded = cell.load(Ordering::Acquire).unwrap();
        assert!(Shared::ptr_eq(&loaded, &x));
        assert_eq!(Shared::use_count(&x), 3);
        drop(loaded);

        let y = Shared::new(NumDrops);
        cell.store(Some(y.clone()), Ordering::Release);
        assert_eq!(Shared::use_count(&x), 1);

        let swapped = cell.swap(None, Ordering::AcqRel).unwrap();
        assert!(Shared::ptr_eq(&swapped, &y));
        assert!(cell.load(Ordering::Acquire).is_none());

        drop(swapped);
        drop(y);
        drop(x);
        assert_eq!(NUM_DROPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dropping_the_cell_releases_its_reference() {
        let x = Shared::new(5);
        let cell = AtomicShared::new(Some(x.clone()));
        assert_eq!(Shared::use_count(&x), 2);
        drop(cell);
        assert_eq!(Shared::use_count(&x), 1);
    }

    #[test]
    fn compare_exchange_success_and_failure() {
        let one = Shared::new(1);
        let two = Shared::new(2);
        let three = Shared::new(3);

        let cell = AtomicShared::new(Some(one.clone()));

        // matching expectation installs the new value and hands back the old
        let replaced = cell
            .compare_exchange(
                Some(&one),
                Some(two.clone()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap()
            .unwrap();
        assert!(Shared::ptr_eq(&replaced, &one));

        // stale expectation returns the witnessed value and the unconsumed
        // desired one
        let err = cell
            .compare_exchange(
                Some(&one),
                Some(three.clone()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_err();
        assert!(Shared::ptr_eq(err.current.as_ref().unwrap(), &two));
        assert!(Shared::ptr_eq(err.new.as_ref().unwrap(), &three));

        // an empty expectation only matches an empty cell
        let empty = AtomicShared::new(None);
        let replaced = empty
            .compare_exchange(None, Some(three), Ordering::AcqRel, Ordering::Acquire)
            .unwrap();
        assert!(replaced.is_none());
        assert_eq!(*empty.load(Ordering::Acquire).unwrap(), 3);
    }

    #[test]
    fn wait_returns_after_store() {
        let first = Shared::new(1);
        let second = Shared::new(2);
        let cell = AtomicShared::new(Some(first.clone()));

        thread::scope(|s| {
            s.spawn(|| {
                cell.wait(Some(&first), Ordering::Acquire);
                let seen = cell.load(Ordering::Acquire).unwrap();
                assert!(Shared::ptr_eq(&seen, &second));
            });

            thread::sleep(Duration::from_millis(100));
            cell.store(Some(second.clone()), Ordering::Release);
            cell.notify_all();
        });
    }

    #[test]
    fn wait_observes_a_store_that_already_happened() {
        let first = Shared::new(1);
        let second = Shared::new(2);
        let cell = AtomicShared::new(Some(first.clone()));

        cell.store(Some(second.clone()), Ordering::Release);
        cell.notify_all();

        // the change and its notification predate the wait; it must return
        // without any further notify
        cell.wait(Some(&first), Ordering::Acquire);
        let seen = cell.load(Ordering::Acquire).unwrap();
        assert!(Shared::ptr_eq(&seen, &second));
    }

    #[test]
    fn weak_cell_round_trip() {
        let x = Shared::new(7);
        let cell = AtomicWeak::new(Some(Shared::downgrade(&x)));

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
            fn shared() -> Shared<Tracked> {
                ALLOCS.fetch_add(1, Ordering::Relaxed);
                Shared::new(Tracked)
            }
        }

        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let cell = AtomicShared::new(Some(Tracked::shared()));

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..500 {
                        match i % 4 {
                            0 => drop(cell.load(Ordering::Acquire)),
                            1 => cell.store(Some(Tracked::shared()), Ordering::Release),
                            2 => drop(cell.swap(Some(Tracked::shared()), Ordering::AcqRel)),
                            _ => {
                                let observed = cell.load(Ordering::Acquire);
                                let _ = cell.compare_exchange(
                                    observed.as_ref(),
                                    Some(Tracked::shared()),
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
