use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Slots {
    in_use: usize,
    peak: usize,
}

/// Counting semaphore bounding how many directories are listed (or deleted)
/// at once. Records the high-water mark so callers can verify the bound.
pub struct AdmissionPool {
    capacity: usize,
    slots: Mutex<Slots>,
    freed: Condvar,
}

/// Slot held until dropped.
pub struct AdmissionPermit<'a> {
    pool: &'a AdmissionPool,
}

impl AdmissionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots::default()),
            freed: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> AdmissionPermit<'_> {
        let mut s = self.slots.lock();
        while s.in_use >= self.capacity {
            self.freed.wait(&mut s);
        }
        s.in_use += 1;
        s.peak = s.peak.max(s.in_use);
        AdmissionPermit { pool: self }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest number of permits ever held at the same time.
    pub fn peak(&self) -> usize {
        self.slots.lock().peak
    }

    fn release(&self) {
        let mut s = self.slots.lock();
        s.in_use -= 1;
        drop(s);
        self.freed.notify_one();
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}
