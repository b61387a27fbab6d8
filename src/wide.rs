//! Wide shared/weak pointers: an independent (control, value) pointer pair,
//! allowing the control block and the value to live in separate allocations.

use std::alloc::{dealloc, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::count::{Control, ControlOps, PromoteResult, SHARED_ONE};

/// Single-allocation layout for [`WideShared::new`].
#[repr(C)]
struct WideInner<T> {
    ctrl: Control,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> WideInner<T> {
    const OPS: &'static ControlOps = &ControlOps {
        destruct: Self::destruct,
        deallocate: Self::deallocate,
        get_deleter: None,
        element_count: Some(Self::element_count),
    };

    unsafe fn destruct(ctrl: *mut Control) {
        let inner = ctrl as *mut WideInner<T>;
        ManuallyDrop::drop(&mut *(*inner).value.get());
    }

    unsafe fn deallocate(ctrl: *mut Control) {
        drop(Box::from_raw(ctrl as *mut WideInner<T>));
    }

    unsafe fn element_count(_ctrl: *const Control) -> usize {
        1
    }
}

/// Control block for [`WideShared::from_box`]: the value keeps its own
/// allocation, dropped in place by `destruct` and released by `deallocate`.
#[repr(C)]
struct BoxedInner<T> {
    ctrl: Control,
    value: *mut T,
}

impl<T> BoxedInner<T> {
    const OPS: &'static ControlOps = &ControlOps {
        destruct: Self::destruct,
        deallocate: Self::deallocate,
        get_deleter: None,
        element_count: Some(Self::element_count),
    };

    unsafe fn destruct(ctrl: *mut Control) {
        std::ptr::drop_in_place((*(ctrl as *mut BoxedInner<T>)).value);
    }

    unsafe fn deallocate(ctrl: *mut Control) {
        let inner = Box::from_raw(ctrl as *mut BoxedInner<T>);
        if std::mem::size_of::<T>() != 0 {
            dealloc(inner.value as *mut u8, Layout::new::<T>());
        }
    }

    unsafe fn element_count(_ctrl: *const Control) -> usize {
        1
    }
}

/// A strong reference carrying its control and value pointers separately.
///
/// Two words instead of one buys layout freedom: the value does not have to
/// sit behind the control block, so a boxed value can be adopted without
/// copying it.
pub struct WideShared<T> {
    ctrl: NonNull<Control>,
    value: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for WideShared<T> {}
unsafe impl<T: Send + Sync> Sync for WideShared<T> {}

impl<T> WideShared<T> {
    pub fn new(value: T) -> Self {
        let inner = Box::leak(Box::new(WideInner {
            ctrl: Control::new(SHARED_ONE, WideInner::<T>::OPS),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        }));
        WideShared {
            ctrl: unsafe { NonNull::new_unchecked(&mut inner.ctrl as *mut Control) },
            value: unsafe { NonNull::new_unchecked(inner.value.get() as *mut T) },
            _marker: PhantomData,
        }
    }

    /// Adopts an already boxed value. The control block is allocated on its
    /// own and the value stays at its current address.
    pub fn from_box(value: Box<T>) -> Self {
        let value = Box::into_raw(value);
        let inner = Box::leak(Box::new(BoxedInner {
            ctrl: Control::new(SHARED_ONE, BoxedInner::<T>::OPS),
            value,
        }));
        WideShared {
            ctrl: unsafe { NonNull::new_unchecked(&mut inner.ctrl as *mut Control) },
            value: unsafe { NonNull::new_unchecked(value) },
            _marker: PhantomData,
        }
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
        unsafe { Control::shared_count(this.ctrl.as_ptr()) }
    }

    /// Exclusive access to the value, granted only while no other shared or
    /// weak reference exists.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if unsafe { Control::is_unique(this.ctrl.as_ptr()) } {
            Some(unsafe { &mut *this.value.as_ptr() })
        } else {
            None
        }
    }

    pub fn downgrade(this: &Self) -> WideWeak<T> {
        unsafe { Control::weak_inc(this.ctrl.as_ptr()) };
        WideWeak {
            ctrl: this.ctrl,
            value: this.value,
            _marker: PhantomData,
        }
    }

    /// Demotes in place: keeps the control half of this reference's count
    /// and releases only its value half, a single decrement instead of a
    /// weak increment followed by a shared decrement.
    pub fn into_weak(this: Self) -> WideWeak<T> {
        let (ctrl, value) = (this.ctrl, this.value);
        std::mem::forget(this);
        unsafe { Control::value_dec(ctrl.as_ptr()) };
        WideWeak {
            ctrl,
            value,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw_parts(this: &Self) -> (*mut Control, *mut T) {
        (this.ctrl.as_ptr(), this.value.as_ptr())
    }

    /// Consumes the reference, handing out its pointers along with the one
    /// shared count it carries.
    pub(crate) fn into_raw_parts(this: Self) -> (*mut Control, *mut T) {
        let parts = Self::raw_parts(&this);
        std::mem::forget(this);
        parts
    }

    /// The pair must carry one shared count for this reference to assume.
    pub(crate) unsafe fn from_raw_parts(ctrl: *mut Control, value: *mut T) -> Self {
        WideShared {
            ctrl: NonNull::new_unchecked(ctrl),
            value: NonNull::new_unchecked(value),
            _marker: PhantomData,
        }
    }

    /// A reference to `value` under `this`'s control block.
    #[cfg(test)]
    pub(crate) fn alias<U>(this: &Self, value: *mut U) -> WideShared<U> {
        unsafe { Control::shared_inc(this.ctrl.as_ptr()) };
        WideShared {
            ctrl: this.ctrl,
            value: NonNull::new(value).expect("aliased value pointer must be non-null"),
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for WideShared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }
}

impl<T> Clone for WideShared<T> {
    fn clone(&self) -> Self {
        unsafe { Control::shared_inc(self.ctrl.as_ptr()) };
        WideShared {
            ctrl: self.ctrl,
            value: self.value,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for WideShared<T> {
    fn drop(&mut self) {
        unsafe { Control::shared_dec(self.ctrl.as_ptr()) };
    }
}

impl<T: fmt::Debug> fmt::Debug for WideShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// The weak counterpart of [`WideShared`]. Remembers the value pointer so a
/// successful upgrade can hand it back without consulting the layout.
pub struct WideWeak<T> {
    ctrl: NonNull<Control>,
    value: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for WideWeak<T> {}
unsafe impl<T: Send + Sync> Sync for WideWeak<T> {}

impl<T> WideWeak<T> {
    /// Attempts to promote to a shared reference; fails once the last shared
    /// reference has been released.
    pub fn upgrade(&self) -> Option<WideShared<T>> {
        match unsafe { Control::shared_inc_if_nonzero(self.ctrl.as_ptr()) } {
            PromoteResult::AddedSharedInc => Some(WideShared {
                ctrl: self.ctrl,
                value: self.value,
                _marker: PhantomData,
            }),
            PromoteResult::NoInc => None,
        }
    }

    pub fn use_count(&self) -> u32 {
        unsafe { Control::shared_count(self.ctrl.as_ptr()) }
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    pub(crate) fn raw_parts(this: &Self) -> (*mut Control, *mut T) {
        (this.ctrl.as_ptr(), this.value.as_ptr())
    }

    /// Consumes the reference, handing out its pointers along with the one
    /// control count it carries.
    pub(crate) fn into_raw_parts(this: Self) -> (*mut Control, *mut T) {
        let parts = Self::raw_parts(&this);
        std::mem::forget(this);
        parts
    }

    /// The pair must carry one control count for this reference to assume.
    pub(crate) unsafe fn from_raw_parts(ctrl: *mut Control, value: *mut T) -> Self {
        WideWeak {
            ctrl: NonNull::new_unchecked(ctrl),
            value: NonNull::new_unchecked(value),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for WideWeak<T> {
    fn clone(&self) -> Self {
        unsafe { Control::weak_inc(self.ctrl.as_ptr()) };
        WideWeak {
            ctrl: self.ctrl,
            value: self.value,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for WideWeak<T> {
    fn drop(&mut self) {
        unsafe { Control::weak_dec(self.ctrl.as_ptr()) };
    }
}

impl<T> fmt::Debug for WideWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(WideWeak)")
    }
}
