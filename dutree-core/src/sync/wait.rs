use parking_lot::{Condvar, Mutex};

/// Outstanding-work counter.
///
/// Unlike a fixed-size barrier, tracked jobs may `add` more work while a
/// waiter is already blocked in [`WaitCounter::wait`]; the waiter only wakes
/// once the count drops back to zero.
#[derive(Default)]
pub struct WaitCounter {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Mark one unit done. Panics on underflow.
    pub fn done(&self) {
        let mut c = self.count.lock();
        *c = c
            .checked_sub(1)
            .expect("WaitCounter::done called more often than add");
        if *c == 0 {
            self.zero.notify_all();
        }
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut c = self.count.lock();
        while *c > 0 {
            self.zero.wait(&mut c);
        }
    }

    pub fn get(&self) -> usize {
        *self.count.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.get() == 0
    }
}
