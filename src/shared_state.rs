//! The runtime context every engine, fiber and channel hangs off.
//!
//! There is no process-global state: embedders construct a [SharedState] explicitly and
//! pass it around. It owns the phase tracker, the fiber stack pool, the object heap and the
//! incremental marker, and keeps registries of engines and channels for root scanning.
use std::sync::{atomic::AtomicI32, Arc, Weak};

use atomic::Ordering;
use parking_lot::Mutex;

use crate::{
    channel::ChannelInner,
    collection_barrier::CollectionBarrier,
    engine::Engine,
    error::Result,
    heap::Heap,
    host::{Host, NativeHost},
    jit::Jit,
    marker::IncrementalMarker,
    marking::SynchronousMarking,
    safepoint::{PhaseCell, PhaseTracker},
    stack_pool::StackPool,
    statistics::RuntimeStatistics,
    value::{ObjectRef, Value},
    visitor::VisitorTrait,
    Config,
};

pub struct SharedState {
    config: Config,
    host: Arc<dyn Host>,
    tracker: PhaseTracker,
    pool: StackPool,
    heap: Heap,
    barrier: CollectionBarrier,
    marker: IncrementalMarker,
    jit: Jit,
    engines: Mutex<Vec<Engine>>,
    channels: Mutex<Vec<Weak<ChannelInner>>>,
    pid: AtomicI32,
}

fn process_id() -> i32 {
    #[cfg(unix)]
    unsafe {
        libc::getpid()
    }
    #[cfg(not(unix))]
    {
        std::process::id() as i32
    }
}

impl SharedState {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_host(config, Arc::new(NativeHost::new()))
    }

    pub fn with_host(config: Config, host: Arc<dyn Host>) -> Arc<Self> {
        let this = Arc::new(Self {
            pool: StackPool::new(config.fiber_stacks, config.verbose),
            marker: IncrementalMarker::new(&config),
            config,
            host,
            tracker: PhaseTracker::new(),
            heap: Heap::new(),
            barrier: CollectionBarrier::new(),
            jit: Jit::new(),
            engines: Mutex::new(vec![]),
            channels: Mutex::new(vec![]),
            pid: AtomicI32::new(process_id()),
        });
        if this.config.concurrent_marking {
            if let Err(e) = this.marker.start(this.clone()) {
                logln_if!(
                    this.config.verbose,
                    "[comet-rt] marker unavailable, collecting synchronously: {}",
                    e
                );
            }
        }
        this
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    pub fn pool(&self) -> &StackPool {
        &self.pool
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn barrier(&self) -> &CollectionBarrier {
        &self.barrier
    }

    pub fn marker(&self) -> &IncrementalMarker {
        &self.marker
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    /// Register the calling native thread as an engine. The first engine attached to a
    /// runtime becomes its main engine.
    pub fn attach_current_thread(self: &Arc<Self>, name: &str) -> Result<Engine> {
        let main = !self.engines.lock().iter().any(|e| e.is_main());
        Engine::attach(self, name, main)
    }

    pub(crate) fn register_engine(&self, engine: Engine) {
        self.engines.lock().push(engine);
    }

    pub fn engines(&self) -> Vec<Engine> {
        self.engines.lock().clone()
    }

    /// Drop finished engines from the registry. Returns how many were reaped.
    pub fn reap_zombies(&self) -> usize {
        let mut engines = self.engines.lock();
        let before = engines.len();
        engines.retain(|e| !e.is_zombie());
        before - engines.len()
    }

    pub(crate) fn register_channel(&self, channel: Weak<ChannelInner>) {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.push(channel);
    }

    /// Allocate an object. Crossing the marker threshold wakes the marker.
    pub fn allocate(&self, fields: Vec<Value>) -> ObjectRef {
        let object = self.heap.allocate(fields);
        if self.marker.is_running() && self.heap.len() >= self.marker.threshold() {
            self.marker.wake();
        }
        object
    }

    /// Visit every collector root: engine locals and results, fiber hand-off boxes and
    /// locals, queued channel values and the object references recorded on fiber stacks.
    pub(crate) fn visit_roots(&self, vis: &mut dyn VisitorTrait, marked_only: bool) {
        let engines = self.engines();
        for engine in engines.iter() {
            engine.visit_roots(vis);
        }
        let owners = self
            .pool
            .contexts()
            .iter()
            .filter_map(|ctx| ctx.owner())
            .collect::<Vec<_>>();
        for owner in owners.iter() {
            owner.visit_roots(vis);
        }
        let channels = self
            .channels
            .lock()
            .iter()
            .filter_map(|c| c.upgrade())
            .collect::<Vec<_>>();
        for channel in channels.iter() {
            channel.visit_roots(vis);
        }
        self.pool.gc_scan(vis, marked_only);
    }

    /// Begin a concurrent cycle: reset marks and grey the roots.
    pub(crate) fn start_cycle(&self) {
        self.heap.start_marking();
        let mut vis = self.heap.marking_visitor();
        self.visit_roots(&mut vis, false);
        logln_if!(
            self.config.verbose,
            "[comet-rt] marking started, {} roots",
            vis.visited()
        );
    }

    /// Stop-the-world half of a cycle: decide fiber context liveness, rescan every root,
    /// drain the mark stack and sweep. Returns the number of freed objects.
    pub(crate) fn collect_full_finish(&self) -> usize {
        self.pool.gc_clear_mark();
        self.pool.mark_live();
        {
            let mut vis = self.heap.marking_visitor();
            self.visit_roots(&mut vis, true);
            vis.drain();
        }
        self.heap.sweep()
    }

    pub(crate) fn collect_full_restart(&self) {
        self.heap.set_collect_full(false);
        self.barrier.resume_threads_awaiting_collection();
    }

    /// Runs `f` with every other engine stopped at a safepoint. Threads that are not
    /// attached borrow a temporary phase cell.
    fn with_world_stopped<R>(&self, f: impl FnOnce() -> R) -> R {
        let run = |cell: &PhaseCell| {
            let _locked = self.tracker.lock(cell);
            f()
        };
        match Engine::current() {
            Ok(engine) if self.owns(&engine) => run(engine.cell()),
            _ => {
                let cell = self.tracker.register("comet.collector");
                self.tracker.managed(&cell);
                let result = run(&cell);
                self.tracker.unregister(&cell);
                result
            }
        }
    }

    fn owns(&self, engine: &Engine) -> bool {
        std::ptr::eq(Arc::as_ptr(engine.shared()), self)
    }

    /// Run a full collection and wait for it. With the marker running the request is
    /// handed to it and the caller parks Unmanaged until the cycle completed; otherwise
    /// the whole cycle runs under stop-the-world on the calling thread.
    pub fn collect_garbage(&self) {
        if !self.marker.is_running() {
            let freed = self.with_world_stopped(|| {
                self.pool.gc_clear_mark();
                self.pool.mark_live();
                SynchronousMarking::new(&self.heap).run(|vis| self.visit_roots(vis, true));
                let freed = self.heap.sweep();
                self.barrier.resume_threads_awaiting_collection();
                freed
            });
            logln_if!(
                self.config.collection_log,
                "[comet-rt] GC({}) freed {} objects, {} live",
                self.barrier.cycles(),
                freed,
                self.heap.len()
            );
            return;
        }

        let target = self.barrier.request_gc(self.heap.is_marking());
        self.marker.wake();
        let engine = Engine::current().ok().filter(|e| self.owns(e));
        if let Some(engine) = engine.as_ref() {
            self.tracker.unmanaged(engine.cell());
        }
        self.barrier.await_collection(target);
        if let Some(engine) = engine.as_ref() {
            self.tracker.managed(engine.cell());
        }
    }

    /// Run a young-generation pass supplied by the host collector with every engine
    /// stopped. A concurrent mark in progress steps aside for the duration.
    pub fn collect_young(&self, pass: impl FnOnce(&Heap)) {
        self.heap.set_collect_young(true);
        self.with_world_stopped(|| pass(&self.heap));
        self.heap.set_collect_young(false);
    }

    pub fn statistics(&self) -> RuntimeStatistics {
        let engines = self.engines();
        let pool = self.pool.statistics();
        RuntimeStatistics {
            engines: engines.len(),
            live_engines: engines.iter().filter(|e| e.is_alive()).count(),
            fiber_contexts: pool.contexts,
            stack_slots: pool.slots,
            stack_capacity: pool.capacity,
            stack_memory: pool.mapped_bytes,
            leased_slots: pool.leased_slots,
            live_objects: self.heap.len(),
            total_objects_allocated: self.heap.total_allocated(),
            total_objects_swept: self.heap.total_swept(),
            total_gc_cycles_count: self.barrier.cycles(),
            gc_threshold: self.marker.threshold(),
            marking: self.heap.is_marking(),
        }
    }

    /// True when the process forked since this runtime was created or last repaired.
    pub fn forked(&self) -> bool {
        self.pid.load(Ordering::Acquire) != process_id()
    }

    /// Repair the runtime in a forked child: only the calling thread survived, so every
    /// other engine is retired, marking state is discarded and the marker restarted.
    pub fn after_fork_child(self: &Arc<Self>) -> Result<()> {
        self.pid.store(process_id(), Ordering::Release);
        let current = Engine::current().ok().filter(|e| self.owns(e));
        let others = self
            .engines()
            .into_iter()
            .filter(|e| Some(e) != current.as_ref() && e.is_alive())
            .collect::<Vec<_>>();
        for engine in others {
            engine.retire(Ok(Value::Nil));
        }
        self.reap_zombies();
        self.barrier.reset_shutdown();
        self.marker.after_fork_child(self)
    }

    /// Stop the marker, release collection waiters and kill every fiber context. The
    /// calling engine is detached if it belongs to this runtime.
    pub fn shutdown(&self) {
        if let Ok(engine) = Engine::current() {
            if self.owns(&engine) {
                engine.detach(Ok(Value::Nil));
            }
        }
        self.marker.stop(self);
        self.barrier.notify_shutdown_requested();
        self.pool.die();
        self.engines.lock().clear();
        self.channels.lock().clear();
        logln_if!(self.config.verbose, "[comet-rt] runtime shut down");
    }

    /// Request process exit through the host.
    pub fn system_exit(&self, status: i32) {
        self.host.exit(status);
    }
}
