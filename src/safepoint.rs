//! Phase tracking and stop-the-world coordination.
//!
//! Every engine (and the incremental marker) owns a [PhaseCell] registered in the
//! [PhaseTracker]. Cells are in one of the following phases:
//!   Managed:   Running application code. Allowed to touch the heap but must give the
//!              collector a chance to run by invoking [PhaseTracker::safepoint].
//!   Unmanaged: Not touching the heap, e.g. blocked on a channel or joining. This is
//!              considered to be a safepoint.
//!   Blocking:  Collector work running concurrently with mutators. Not a safepoint; the
//!              owner must yield before a stop can complete.
//!   Yielding:  Parked at a safepoint while a stop is in effect.
//!   Stopped:   The engine finished and will not touch the heap again.
use std::sync::{
    atomic::{AtomicBool, AtomicU32},
    Arc,
};

use atomic::{Atomic, Ordering};
use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Unmanaged = 0,
    Managed = 1,
    Blocking = 2,
    Yielding = 3,
    Stopped = 4,
}

impl Phase {
    pub fn safe_for_safepoint(self) -> bool {
        matches!(self, Self::Unmanaged | Self::Yielding | Self::Stopped)
    }
}

/// Per-engine cooperation state.
pub struct PhaseCell {
    id: u32,
    name: String,
    phase: Atomic<Phase>,
}

impl PhaseCell {
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn phase(&self) -> Phase {
        self.phase.load(Ordering::Acquire)
    }
}

struct BarrierState {
    armed: bool,
    owner: Option<u32>,
}

struct Barrier {
    state: Mutex<BarrierState>,
    requested: AtomicBool,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Barrier {
    fn blocks(state: &BarrierState, id: u32) -> bool {
        state.armed && state.owner != Some(id)
    }

    fn wait_until_released(&self, guard: &mut MutexGuard<'_, BarrierState>, id: u32) {
        while Self::blocks(guard, id) {
            self.cv_resume.wait(guard);
        }
    }
}

/// Used to bring every engine to a safepoint such that e.g. the finish pass of a
/// collection can run with exclusive heap access.
pub struct PhaseTracker {
    cells: Mutex<Vec<Arc<PhaseCell>>>,
    barrier: Barrier,
    next_id: AtomicU32,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(vec![]),
            barrier: Barrier {
                state: Mutex::new(BarrierState {
                    armed: false,
                    owner: None,
                }),
                requested: AtomicBool::new(false),
                cv_resume: Condvar::new(),
                cv_stopped: Condvar::new(),
            },
            next_id: AtomicU32::new(1),
        }
    }

    pub fn register(&self, name: impl Into<String>) -> Arc<PhaseCell> {
        let cell = Arc::new(PhaseCell {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            phase: Atomic::new(Phase::Unmanaged),
        });
        self.cells.lock().push(cell.clone());
        cell
    }

    pub fn unregister(&self, cell: &PhaseCell) {
        let guard = self.barrier.state.lock();
        cell.phase.store(Phase::Stopped, Ordering::Release);
        self.cells.lock().retain(|c| c.id != cell.id);
        self.barrier.cv_stopped.notify_all();
        drop(guard);
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn phases(&self) -> Vec<(String, Phase)> {
        self.cells
            .lock()
            .iter()
            .map(|c| (c.name.clone(), c.phase()))
            .collect()
    }

    fn enter_unsafe(&self, cell: &PhaseCell, phase: Phase) {
        let mut guard = self.barrier.state.lock();
        if Barrier::blocks(&guard, cell.id) {
            if !cell.phase().safe_for_safepoint() {
                cell.phase.store(Phase::Yielding, Ordering::Release);
                self.barrier.cv_stopped.notify_all();
            }
            self.barrier.wait_until_released(&mut guard, cell.id);
        }
        cell.phase.store(phase, Ordering::Release);
    }

    fn enter_safe(&self, cell: &PhaseCell, phase: Phase) {
        let guard = self.barrier.state.lock();
        cell.phase.store(phase, Ordering::Release);
        self.barrier.cv_stopped.notify_all();
        drop(guard);
    }

    /// Become Managed, waiting out any stop in progress.
    pub fn managed(&self, cell: &PhaseCell) {
        self.enter_unsafe(cell, Phase::Managed);
    }

    pub fn blocking(&self, cell: &PhaseCell) {
        self.enter_unsafe(cell, Phase::Blocking);
    }

    pub fn unmanaged(&self, cell: &PhaseCell) {
        self.enter_safe(cell, Phase::Unmanaged);
    }

    pub fn stopped(&self, cell: &PhaseCell) {
        self.enter_safe(cell, Phase::Stopped);
    }

    /// Park at a safepoint. Returns once no stop owned by someone else is in effect; the
    /// cell stays Yielding until it transitions again.
    pub fn yielding(&self, cell: &PhaseCell) {
        let mut guard = self.barrier.state.lock();
        cell.phase.store(Phase::Yielding, Ordering::Release);
        self.barrier.cv_stopped.notify_all();
        self.barrier.wait_until_released(&mut guard, cell.id);
    }

    /// Safepoint check. Returns true when the caller had to stop.
    #[inline]
    pub fn safepoint(&self, cell: &PhaseCell) -> bool {
        if !self.barrier.requested.load(Ordering::Acquire) {
            return false;
        }
        self.safepoint_slow(cell)
    }

    #[cold]
    #[inline(never)]
    fn safepoint_slow(&self, cell: &PhaseCell) -> bool {
        let mut guard = self.barrier.state.lock();
        if !Barrier::blocks(&guard, cell.id) {
            return false;
        }
        let previous = cell.phase();
        cell.phase.store(Phase::Yielding, Ordering::Release);
        self.barrier.cv_stopped.notify_all();
        self.barrier.wait_until_released(&mut guard, cell.id);
        cell.phase.store(previous, Ordering::Release);
        true
    }

    pub fn is_stop_requested(&self) -> bool {
        self.barrier.requested.load(Ordering::Acquire)
    }

    /// Ask every engine to stop at its next safepoint.
    pub fn set_stop(&self) {
        let mut guard = self.barrier.state.lock();
        guard.armed = true;
        self.barrier.requested.store(true, Ordering::Release);
    }

    fn others_at_safepoint(&self, id: u32) -> bool {
        self.cells
            .lock()
            .iter()
            .all(|c| c.id == id || c.phase().safe_for_safepoint())
    }

    /// Acquire exclusive access: waits until every other registered cell is at a
    /// safepoint. Released when the returned guard is dropped.
    pub fn lock<'a>(&'a self, cell: &'a PhaseCell) -> LockPhase<'a> {
        let mut guard = self.barrier.state.lock();
        let previous = cell.phase();
        while guard.owner.is_some() && guard.owner != Some(cell.id) {
            if !cell.phase().safe_for_safepoint() {
                cell.phase.store(Phase::Yielding, Ordering::Release);
                self.barrier.cv_stopped.notify_all();
            }
            self.barrier.cv_resume.wait(&mut guard);
        }
        guard.armed = true;
        guard.owner = Some(cell.id);
        self.barrier.requested.store(true, Ordering::Release);
        cell.phase.store(previous, Ordering::Release);

        while !self.others_at_safepoint(cell.id) {
            self.barrier.cv_stopped.wait(&mut guard);
        }
        drop(guard);
        LockPhase {
            tracker: self,
            cell,
        }
    }

    fn unlock(&self) {
        let mut guard = self.barrier.state.lock();
        guard.armed = false;
        guard.owner = None;
        self.barrier.requested.store(false, Ordering::Release);
        self.barrier.cv_resume.notify_all();
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive stop-the-world section.
pub struct LockPhase<'a> {
    tracker: &'a PhaseTracker,
    cell: &'a PhaseCell,
}

impl<'a> LockPhase<'a> {
    pub fn owner(&self) -> &PhaseCell {
        self.cell
    }
}

impl<'a> Drop for LockPhase<'a> {
    fn drop(&mut self) {
        self.tracker.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, thread, time::Duration};

    #[test]
    fn lock_waits_for_managed_engines() {
        let tracker = Arc::new(PhaseTracker::new());
        let collector = tracker.register("collector");
        let mutator = tracker.register("mutator");
        tracker.managed(&mutator);

        let progress = Arc::new(AtomicUsize::new(0));
        let t = {
            let tracker = tracker.clone();
            let progress = progress.clone();
            thread::spawn(move || {
                let _locked = tracker.lock(&collector);
                progress.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(progress.load(Ordering::SeqCst), 0);
        assert!(tracker.is_stop_requested());

        assert!(tracker.safepoint(&mutator));
        t.join().unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(mutator.phase(), Phase::Managed);
        assert!(!tracker.is_stop_requested());
    }

    #[test]
    fn unmanaged_engines_do_not_block_a_stop() {
        let tracker = PhaseTracker::new();
        let collector = tracker.register("collector");
        let mutator = tracker.register("mutator");
        tracker.managed(&mutator);
        tracker.unmanaged(&mutator);
        {
            let locked = tracker.lock(&collector);
            assert_eq!(locked.owner().id(), collector.id());
        }
        tracker.managed(&mutator);
        assert_eq!(mutator.phase(), Phase::Managed);
        assert!(!tracker.safepoint(&mutator));
    }

    #[test]
    fn unregistered_cells_are_ignored() {
        let tracker = PhaseTracker::new();
        let collector = tracker.register("collector");
        let gone = tracker.register("gone");
        tracker.managed(&gone);
        tracker.unregister(&gone);
        assert_eq!(tracker.len(), 1);
        drop(tracker.lock(&collector));
    }
}
