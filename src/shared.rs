//! Narrow shared/weak pointers: one machine word wide, with the control
//! block colocated at a fixed offset directly in front of the value.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::count::{Control, ControlOps, PromoteResult, SHARED_ONE};

/// Largest value alignment the colocated layout supports. The control block
/// is padded to this, so the value sits at the same offset for every type.
pub(crate) const MAX_ALIGN: usize = 16;

/// Control block padded so that a value placed directly behind it lands at a
/// fixed, type independent offset. Alignment also guarantees the low pointer
/// bits stay zero for the atomic cells' tag bits.
#[repr(C, align(16))]
pub(crate) struct AlignedControl {
    pub(crate) ctrl: Control,
}

const CONTROL_OFFSET: usize = std::mem::size_of::<AlignedControl>();

/// Recovers the control block sitting directly in front of a value.
pub(crate) unsafe fn control_from_value(value: *mut u8) -> *mut Control {
    value.sub(CONTROL_OFFSET) as *mut Control
}

/// Recovers the value sitting directly behind a control block.
pub(crate) unsafe fn value_from_control(ctrl: *mut Control) -> *mut u8 {
    (ctrl as *mut u8).add(CONTROL_OFFSET)
}

#[repr(C)]
struct SharedInner<T> {
    ctrl: AlignedControl,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> SharedInner<T> {
    /// Evaluated at monomorphization; rejects value types whose alignment
    /// would move them off the fixed offset.
    const ALIGN_OK: () = assert!(
        std::mem::align_of::<T>() <= MAX_ALIGN,
        "value alignment exceeds the colocated control block padding"
    );

    const OPS: &'static ControlOps = &ControlOps {
        destruct: Self::destruct,
        deallocate: Self::deallocate,
        get_deleter: None,
        element_count: Some(Self::element_count),
    };

    unsafe fn destruct(ctrl: *mut Control) {
        let inner = ctrl as *mut SharedInner<T>;
        ManuallyDrop::drop(&mut *(*inner).value.get());
    }

    unsafe fn deallocate(ctrl: *mut Control) {
        // the value was already dropped by destruct; ManuallyDrop keeps the
        // box from dropping it a second time
        drop(Box::from_raw(ctrl as *mut SharedInner<T>));
    }

    unsafe fn element_count(_ctrl: *const Control) -> usize {
        1
    }
}

/// A strong reference to a heap value, one pointer wide.
///
/// Keeps the value alive. The last [`Shared`] to go destructs the value; the
/// backing memory lives on until the last [`Weak`] is gone too.
pub struct Shared<T> {
    value: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        let _ = SharedInner::<T>::ALIGN_OK;
        let inner = Box::leak(Box::new(SharedInner {
            ctrl: AlignedControl {
                ctrl: Control::new(SHARED_ONE, SharedInner::<T>::OPS),
            },
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        }));
        Shared {
            value: unsafe { NonNull::new_unchecked(inner.value.get() as *mut T) },
            _marker: PhantomData,
        }
    }

    pub(crate) fn ctrl(&self) -> *mut Control {
        unsafe { control_from_value(self.value.as_ptr() as *mut u8) }
    }

    pub fn as_ptr(this: &Self) -> *const T {
        this.value.as_ptr()
    }

    /// True when both point at the same value.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.value == other.value
    }

    /// Racy snapshot of the number of shared references.
    pub fn use_count(this: &Self) -> u32 {
        unsafe { Control::shared_count(this.ctrl()) }
    }

    /// Exclusive access to the value, granted only while no other shared or
    /// weak reference exists.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if unsafe { Control::is_unique(this.ctrl()) } {
            Some(unsafe { &mut *this.value.as_ptr() })
        } else {
            None
        }
    }

    pub fn downgrade(this: &Self) -> Weak<T> {
        let ctrl = this.ctrl();
        unsafe { Control::weak_inc(ctrl) };
        Weak {
            ctrl: unsafe { NonNull::new_unchecked(ctrl) },
            _marker: PhantomData,
        }
    }

    /// Consumes the reference, handing out its control pointer along with
    /// the one shared count it carries.
    pub(crate) fn into_ctrl(this: Self) -> *mut Control {
        let ctrl = this.ctrl();
        std::mem::forget(this);
        ctrl
    }

    /// `ctrl` must point at a narrow control block carrying one shared count
    /// for this reference to assume.
    pub(crate) unsafe fn from_ctrl(ctrl: *mut Control) -> Self {
        Shared {
            value: NonNull::new_unchecked(value_from_control(ctrl) as *mut T),
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        unsafe { Control::shared_inc(self.ctrl()) };
        Shared {
            value: self.value,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        unsafe { Control::shared_dec(self.ctrl()) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A weak reference: keeps the control block alive, not the value. Holds the
/// control pointer, from which the value is recovered on a successful
/// [`upgrade`](Weak::upgrade).
pub struct Weak<T> {
    ctrl: NonNull<Control>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for Weak<T> {}
unsafe impl<T: Send + Sync> Sync for Weak<T> {}

impl<T> Weak<T> {
    pub(crate) fn ctrl(&self) -> *mut Control {
        self.ctrl.as_ptr()
    }

    /// Attempts to promote to a shared reference; fails once the last shared
    /// reference has been released.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        match unsafe { Control::shared_inc_if_nonzero(self.ctrl.as_ptr()) } {
            PromoteResult::AddedSharedInc => {
                Some(unsafe { Shared::from_ctrl(self.ctrl.as_ptr()) })
            }
            PromoteResult::NoInc => None,
        }
    }

    pub fn use_count(&self) -> u32 {
        unsafe { Control::shared_count(self.ctrl.as_ptr()) }
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    pub(crate) fn into_ctrl(this: Self) -> *mut Control {
        let ctrl = this.ctrl.as_ptr();
        std::mem::forget(this);
        ctrl
    }

    /// `ctrl` must point at a narrow control block carrying one control
    /// count for this reference to assume.
    pub(crate) unsafe fn from_ctrl(ctrl: *mut Control) -> Self {
        Weak {
            ctrl: NonNull::new_unchecked(ctrl),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        unsafe { Control::weak_inc(self.ctrl.as_ptr()) };
        Weak {
            ctrl: self.ctrl,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Weak<T> {
    fn drop(&mut self) {
        unsafe { Control::weak_dec(self.ctrl.as_ptr()) };
    }
}

impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}
