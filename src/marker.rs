//! Background incremental marker.
//!
//! The marker thread registers its own phase cell. It is Blocking while it traces the mark
//! stack so it never holds up mutators, and steps aside (Yielding) whenever a young pass or
//! an external interrupt asks for the heap. Once the mark stack drains it requests the finish
//! pass, which runs under an exclusive stop-the-world lock.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use atomic::Ordering;
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Result, ThreadError},
    safepoint::PhaseCell,
    shared_state::SharedState,
    Config,
};

pub struct IncrementalMarker {
    step: usize,
    idle: Duration,
    base_threshold: usize,
    threshold: AtomicUsize,
    thread_exit: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    cell: Mutex<Option<Arc<PhaseCell>>>,
    wake_pending: Mutex<bool>,
    cv_idle: Condvar,
    stop_time: Mutex<Duration>,
    concurrent_steps: AtomicUsize,
    yields: AtomicUsize,
}

impl IncrementalMarker {
    pub fn new(config: &Config) -> Self {
        Self {
            step: config.mark_step.max(1),
            idle: config.marker_idle,
            base_threshold: config.gc_threshold,
            threshold: AtomicUsize::new(config.gc_threshold),
            thread_exit: AtomicBool::new(false),
            handle: Mutex::new(None),
            cell: Mutex::new(None),
            wake_pending: Mutex::new(false),
            cv_idle: Condvar::new(),
            stop_time: Mutex::new(Duration::from_secs(0)),
            concurrent_steps: AtomicUsize::new(0),
            yields: AtomicUsize::new(0),
        }
    }

    pub(crate) fn start(&self, shared: Arc<SharedState>) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(ThreadError::AlreadyStarted.into());
        }
        self.thread_exit.store(false, Ordering::Release);
        let cell = shared.tracker().register("comet.marker");
        *self.cell.lock() = Some(cell.clone());
        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("comet.marker".to_string())
            .spawn(move || thread_shared.marker().run(&thread_shared, cell));
        match spawned {
            Ok(thread) => {
                *handle = Some(thread);
                Ok(())
            }
            Err(e) => {
                if let Some(cell) = self.cell.lock().take() {
                    shared.tracker().unregister(&cell);
                }
                Err(ThreadError::Spawn(e.to_string()).into())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Live object count that starts the next concurrent cycle.
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn stop_time(&self) -> Duration {
        *self.stop_time.lock()
    }

    pub fn concurrent_steps(&self) -> usize {
        self.concurrent_steps.load(Ordering::Relaxed)
    }

    /// Times the marker stepped aside in the middle of a cycle.
    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::Relaxed)
    }

    /// Cut the idle sleep short.
    pub fn wake(&self) {
        let mut pending = self.wake_pending.lock();
        *pending = true;
        self.cv_idle.notify_all();
    }

    pub(crate) fn stop(&self, shared: &SharedState) {
        self.thread_exit.store(true, Ordering::Release);
        self.wake();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Some(cell) = self.cell.lock().take() {
            shared.tracker().unregister(&cell);
        }
    }

    /// Drop the state of a marker thread that does not exist in this process image and
    /// start over.
    pub(crate) fn after_fork_child(&self, shared: &Arc<SharedState>) -> Result<()> {
        // the thread did not survive the fork; forget it without joining
        drop(self.handle.lock().take());
        if let Some(cell) = self.cell.lock().take() {
            shared.tracker().unregister(&cell);
        }
        shared.heap().discard_marking();
        self.threshold.store(self.base_threshold, Ordering::Relaxed);
        if shared.config().concurrent_marking {
            self.start(shared.clone())?;
        }
        Ok(())
    }

    fn exiting(&self) -> bool {
        self.thread_exit.load(Ordering::Acquire)
    }

    fn should_start_cycle(&self, shared: &SharedState) -> bool {
        !shared.heap().is_marking()
            && (shared.barrier().was_gc_requested() || shared.heap().len() >= self.threshold())
    }

    fn run(&self, shared: &SharedState, cell: Arc<PhaseCell>) {
        let tracker = shared.tracker();
        let heap = shared.heap();
        tracker.managed(&cell);
        logln_if!(shared.config().verbose, "[comet-rt] marker started");

        while !self.exiting() {
            tracker.blocking(&cell);
            if self.should_start_cycle(shared) {
                shared.start_cycle();
            }

            if heap.is_marking() && !heap.collect_full_requested() {
                loop {
                    let drained = heap.process_mark_stack(self.step);
                    self.concurrent_steps.fetch_add(1, Ordering::Relaxed);
                    if self.exiting() || heap.collect_full_requested() {
                        break;
                    }
                    if drained {
                        heap.set_collect_full(true);
                        break;
                    }
                    if heap.collect_young_requested() || tracker.is_stop_requested() {
                        self.yields.fetch_add(1, Ordering::Relaxed);
                        tracker.yielding(&cell);
                        thread::yield_now();
                    } else if heap.interrupt_requested() {
                        self.yields.fetch_add(1, Ordering::Relaxed);
                        tracker.yielding(&cell);
                        heap.set_interrupt(false);
                    }
                    tracker.blocking(&cell);
                }
            }

            if self.exiting() {
                break;
            }

            if heap.collect_full_requested() {
                let start = Instant::now();
                tracker.set_stop();
                let freed = {
                    let _locked = tracker.lock(&cell);
                    let freed = shared.collect_full_finish();
                    shared.collect_full_restart();
                    freed
                };
                let pause = start.elapsed();
                *self.stop_time.lock() += pause;
                let live = heap.len();
                self.threshold
                    .store(self.base_threshold.max(live * 2), Ordering::Relaxed);
                logln_if!(
                    shared.config().collection_log,
                    "[comet-rt] GC({}) freed {} objects, {} live, pause {:.3}ms",
                    shared.barrier().cycles(),
                    freed,
                    live,
                    pause.as_secs_f64() * 1000.0
                );
                continue;
            }

            tracker.unmanaged(&cell);
            let mut pending = self.wake_pending.lock();
            if !*pending && !self.exiting() {
                self.cv_idle.wait_for(&mut pending, self.idle);
            }
            *pending = false;
        }

        heap.discard_marking();
        tracker.unregister(&cell);
        logln_if!(shared.config().verbose, "[comet-rt] marker stopped");
    }
}
