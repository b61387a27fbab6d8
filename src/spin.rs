/// Backoff for the lock-bit acquisition loops: a pause instruction for the
/// first `PAUSE_COUNT` waits, then a scheduler yield. The lock is only ever
/// held across a couple of loads and stores, so running out of pauses means
/// real contention and the thread should get out of the way.
pub(crate) struct SpinWait {
    counter: u32,
}

const PAUSE_COUNT: u32 = 100;

impl SpinWait {
    pub(crate) fn new() -> Self {
        SpinWait { counter: 0 }
    }

    pub(crate) fn wait(&mut self) {
        if self.counter < PAUSE_COUNT {
            self.counter += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}
