//! Reference-counted shared/weak pointers in two flavors, plus atomic cells
//! over both.
//!
//! [`Shared`]/[`Weak`] are one machine word wide: the control block is
//! colocated directly in front of the value, so a single value pointer is
//! enough to reach both. [`WideShared`]/[`WideWeak`] carry an independent
//! (control, value) pointer pair and allow the value to live in its own
//! allocation.
//!
//! Both reference counts live in one packed 64-bit atomic: the value (strong)
//! count in the low half, the control count in the high half. A shared
//! reference holds one of each, added and removed in a single atomic
//! operation, so the two halves can never disagree about liveness.
//!
//! [`AtomicShared`], [`AtomicWeak`], [`AtomicWideShared`] and
//! [`AtomicWideWeak`] make these pointers atomically replaceable. They are
//! not lock-free: the least significant bit of the control word doubles as a
//! spinlock so that the pointer swap and the reference count adjustment
//! appear as one operation (and, in the wide case, so that the second word
//! moves together with the first). Waiting is built on the platform futex
//! via `atomic-wait`.

mod atomic;
mod count;
mod futex;
mod shared;
mod spin;
mod wide;
mod wide_atomic;

pub use atomic::{AtomicShared, AtomicWeak, CompareExchangeError};
pub use shared::{Shared, Weak};
pub use wide::{WideShared, WideWeak};
pub use wide_atomic::{AtomicWideShared, AtomicWideWeak};
