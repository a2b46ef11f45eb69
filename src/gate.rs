use parking_lot::{Condvar, Mutex};

/// A single-slot wakeup gate.
///
/// [`Gate::release`] deposits one wakeup, [`Gate::wait`] consumes it and
/// blocks while none is deposited. Releasing an open gate is a no-op, so a
/// wakeup issued before the waiter arrives is never lost and never counted
/// twice. This is the only primitive used to wake one vCPU context from
/// another.
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn release(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        *open = false;
    }

    /// Consumes a deposited wakeup without blocking.
    pub fn try_wait(&self) -> bool {
        let mut open = self.open.lock();
        core::mem::replace(&mut *open, false)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
