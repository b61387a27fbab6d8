//! Blocking support for the atomic cells.
//!
//! `atomic-wait` exposes a 32-bit futex, while the cells' contents are
//! pointer sized, so waiters do not sleep on the pointer word itself: a
//! truncated compare could equate two distinct pointers and swallow a
//! notification. Each cell instead carries a [`WaitCounter`], bumped by
//! every mutation that replaces the cell's contents. A waiter snapshots the
//! counter, validates the cell, and sleeps keyed on the snapshot; a bump
//! landing anywhere in that window makes the sleep return immediately.

use std::sync::atomic::{AtomicU32, Ordering};

use atomic_wait::{wait, wake_all, wake_one};

pub(crate) struct WaitCounter {
    generation: AtomicU32,
}

impl WaitCounter {
    pub(crate) fn new() -> Self {
        WaitCounter {
            generation: AtomicU32::new(0),
        }
    }

    /// Snapshot to hand to [`sleep`](Self::sleep). Take it before reading
    /// the state the wait is about.
    pub(crate) fn current(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Records a change. Call after publishing the new contents.
    pub(crate) fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Blocks while the counter still reads `observed`.
    pub(crate) fn sleep(&self, observed: u32) {
        wait(&self.generation, observed);
    }

    pub(crate) fn wake_one(&self) {
        wake_one(&self.generation);
    }

    pub(crate) fn wake_all(&self) {
        wake_all(&self.generation);
    }
}
