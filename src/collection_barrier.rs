use parking_lot::{Condvar, Mutex};

struct BarrierState {
    cycles: usize,
    requested: usize,
    shutdown_requested: bool,
}

/// Parks mutators that asked for a collection until the marker completes a cycle.
pub struct CollectionBarrier {
    mutex: Mutex<BarrierState>,
    cv_wakeup: Condvar,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(BarrierState {
                cycles: 0,
                requested: 0,
                shutdown_requested: false,
            }),
            cv_wakeup: Condvar::new(),
        }
    }

    /// Some requester still waits for a cycle that has not completed.
    pub fn was_gc_requested(&self) -> bool {
        let guard = self.mutex.lock();
        guard.requested > guard.cycles
    }

    /// Request a collection. Returns the cycle count that satisfies the request; a cycle
    /// already in progress does not count.
    pub fn request_gc(&self, cycle_in_progress: bool) -> usize {
        let mut guard = self.mutex.lock();
        let target = guard.cycles + if cycle_in_progress { 2 } else { 1 };
        guard.requested = guard.requested.max(target);
        target
    }

    pub fn cycles(&self) -> usize {
        self.mutex.lock().cycles
    }

    /// Blocks until `target` cycles completed or the collector shut down. Returns false in
    /// the latter case.
    pub fn await_collection(&self, target: usize) -> bool {
        let mut guard = self.mutex.lock();
        while guard.cycles < target && !guard.shutdown_requested {
            self.cv_wakeup.wait(&mut guard);
        }
        guard.cycles >= target
    }

    pub fn notify_shutdown_requested(&self) {
        let mut guard = self.mutex.lock();
        guard.shutdown_requested = true;
        self.cv_wakeup.notify_all();
    }

    pub(crate) fn reset_shutdown(&self) {
        self.mutex.lock().shutdown_requested = false;
    }

    /// Called once a cycle finished.
    pub fn resume_threads_awaiting_collection(&self) {
        let mut guard = self.mutex.lock();
        guard.cycles += 1;
        self.cv_wakeup.notify_all();
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}
