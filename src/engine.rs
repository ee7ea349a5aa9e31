//! Worker engines: native threads hosting a chain of fibers.
//!
//! An engine owns one phase cell in the [PhaseTracker](crate::safepoint::PhaseTracker). It is
//! Managed while it runs application code and drops to Unmanaged around every blocking wait
//! (join, channel receive, sleep) so a stop-the-world request never waits on it.
//!
//! Kill and raise requests from other engines are registered on the target and combined with
//! a wakeup; the target observes them at its next checkpoint.
use std::{
    cell::RefCell,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicI64},
        Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use atomic::Ordering;
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Error, Result, ThreadError},
    fiber::Fiber,
    safepoint::PhaseCell,
    shared_state::SharedState,
    value::{ObjectRef, Value},
    visitor::VisitorTrait,
};

thread_local! {
    static CURRENT: RefCell<Option<Engine>> = RefCell::new(None);
}

/// Something an engine can be parked on and woken from.
pub trait Wakeable: Send + Sync {
    fn wake(&self);
}

/// Asynchronous request delivered at the target's next checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum Interrupt {
    Kill,
    Raise(Error),
}

pub type Task = Box<dyn FnOnce() -> Result<Value> + Send>;

struct JoinData {
    running: Mutex<bool>,
    cv_stopped: Condvar,
}

struct Times {
    start: Option<(SystemTime, Instant)>,
    stop: Option<Instant>,
}

pub struct EngineInner {
    shared: Arc<SharedState>,
    cell: Arc<PhaseCell>,
    main: bool,
    root_fiber: Fiber,
    current_fiber: Mutex<Fiber>,
    locals: Mutex<HashMap<String, Value>>,
    join: JoinData,
    started: AtomicBool,
    zombie: AtomicBool,
    priority: AtomicI32,
    tid: AtomicI64,
    times: Mutex<Times>,
    task: Mutex<Option<Task>>,
    value: Mutex<Option<Result<Value>>>,
    interrupt: Mutex<Option<Interrupt>>,
    woken: AtomicBool,
    waiting_on: Mutex<Option<Arc<dyn Wakeable>>>,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
}

#[derive(Clone)]
pub struct Engine(pub(crate) Arc<EngineInner>);

impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Engine {}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn native_thread_id() -> i64 {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as i64
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    unsafe {
        libc::getpid() as i64
    }
    #[cfg(not(unix))]
    {
        0
    }
}

impl Engine {
    fn new(shared: &Arc<SharedState>, name: &str, main: bool, task: Option<Task>) -> Engine {
        let cell = shared.tracker().register(name);
        let root_fiber = Fiber::root(shared, cell.id());
        let engine = Engine(Arc::new(EngineInner {
            shared: shared.clone(),
            cell,
            main,
            current_fiber: Mutex::new(root_fiber.clone()),
            root_fiber,
            locals: Mutex::new(HashMap::new()),
            join: JoinData {
                running: Mutex::new(false),
                cv_stopped: Condvar::new(),
            },
            started: AtomicBool::new(false),
            zombie: AtomicBool::new(false),
            priority: AtomicI32::new(0),
            tid: AtomicI64::new(0),
            times: Mutex::new(Times {
                start: None,
                stop: None,
            }),
            task: Mutex::new(task),
            value: Mutex::new(None),
            interrupt: Mutex::new(None),
            woken: AtomicBool::new(false),
            waiting_on: Mutex::new(None),
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
        }));
        shared.register_engine(engine.clone());
        engine
    }

    /// Binds `task` to a new engine. The native thread is started by [Engine::fork].
    pub fn create<F>(shared: &Arc<SharedState>, name: &str, task: F) -> Engine
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        Self::new(shared, name, false, Some(Box::new(task)))
    }

    /// [Engine::create] followed by [Engine::fork] with the configured stack size.
    pub fn spawn<F>(shared: &Arc<SharedState>, name: &str, task: F) -> Result<Engine>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let engine = Self::create(shared, name, task);
        engine.fork(None)?;
        Ok(engine)
    }

    /// Engine for a thread that is already running, e.g. the process main thread.
    pub(crate) fn attach(shared: &Arc<SharedState>, name: &str, main: bool) -> Result<Engine> {
        if Self::current().is_ok() {
            return Err(ThreadError::AlreadyStarted.into());
        }
        let engine = Self::new(shared, name, main, None);
        engine.0.started.store(true, Ordering::Release);
        engine.started();
        Self::set_current(Some(engine.clone()));
        Ok(engine)
    }

    pub fn current() -> Result<Engine> {
        CURRENT
            .with(|current| current.borrow().clone())
            .ok_or_else(|| ThreadError::NotAttached.into())
    }

    pub(crate) fn set_current(engine: Option<Engine>) {
        CURRENT.with(|current| *current.borrow_mut() = engine);
    }

    /// Every engine registered with `shared`.
    pub fn list(shared: &SharedState) -> Vec<Engine> {
        shared.engines()
    }

    pub fn id(&self) -> u32 {
        self.0.cell.id()
    }

    pub fn name(&self) -> &str {
        self.0.cell.name()
    }

    pub fn is_main(&self) -> bool {
        self.0.main
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.0.shared
    }

    pub(crate) fn cell(&self) -> &PhaseCell {
        &self.0.cell
    }

    /// Native thread id, zero until the thread started.
    pub fn tid(&self) -> i64 {
        self.0.tid.load(Ordering::Acquire)
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        self.0.times.lock().start.map(|(wall, _)| wall)
    }

    pub fn run_time(&self) -> Duration {
        let times = self.0.times.lock();
        match times.start {
            Some((_, start)) => times.stop.unwrap_or_else(Instant::now) - start,
            None => Duration::from_secs(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.0.join.running.lock()
    }

    pub fn is_zombie(&self) -> bool {
        self.0.zombie.load(Ordering::Acquire)
    }

    pub fn priority(&self) -> i32 {
        self.0.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) -> i32 {
        self.0.priority.store(priority, Ordering::Relaxed);
        priority
    }

    pub fn root_fiber(&self) -> Fiber {
        self.0.root_fiber.clone()
    }

    pub fn current_fiber(&self) -> Fiber {
        self.0.current_fiber.lock().clone()
    }

    pub(crate) fn set_current_fiber(&self, fiber: Fiber) {
        *self.0.current_fiber.lock() = fiber;
    }

    fn is_current(&self) -> bool {
        Self::current().map(|e| e == *self).unwrap_or(false)
    }

    /// Start the native thread. `stack_size` defaults to the configured engine stack size and
    /// is validated by the host.
    pub fn fork(&self, stack_size: Option<usize>) -> Result<()> {
        let shared = self.0.shared.clone();
        let requested = stack_size.unwrap_or(shared.config().thread_stack_size);
        let size = shared.host().validate_stack_size(requested)?;
        if self.0.started.swap(true, Ordering::AcqRel) {
            return Err(ThreadError::AlreadyStarted.into());
        }
        *self.0.join.running.lock() = true;

        let engine = self.clone();
        let spawned = thread::Builder::new()
            .name(self.name().to_string())
            .stack_size(size)
            .spawn(move || run_engine(engine));
        if let Err(e) = spawned {
            self.finish(Err(Error::Killed));
            return Err(ThreadError::Spawn(e.to_string()).into());
        }
        Ok(())
    }

    fn started(&self) {
        let shared = &self.0.shared;
        self.0.tid.store(native_thread_id(), Ordering::Release);
        self.0.times.lock().start = Some((shared.host().now(), Instant::now()));
        *self.0.join.running.lock() = true;
        shared.tracker().managed(&self.0.cell);
        logln_if!(
            shared.config().verbose,
            "[comet-rt] start thread: {}, {}",
            self.name(),
            self.tid()
        );
    }

    /// Record the task outcome, release joiners and retire the phase cell.
    pub(crate) fn finish(&self, result: Result<Value>) {
        let shared = self.0.shared.clone();
        let exit = match &result {
            Err(Error::Exit(status)) => Some(*status),
            Ok(_) if self.0.main => Some(0),
            Err(_) if self.0.main => Some(1),
            _ => None,
        };
        self.retire(result);
        if let Some(status) = exit {
            shared.host().exit(status);
        }
    }

    /// Mark the engine stopped without exit propagation.
    pub(crate) fn retire(&self, result: Result<Value>) {
        let shared = self.0.shared.clone();
        let value = match result {
            Err(Error::Killed) => Ok(Value::Nil),
            other => other,
        };
        *self.0.value.lock() = Some(value);
        self.0.times.lock().stop = Some(Instant::now());

        logln_if!(
            shared.config().verbose,
            "[comet-rt] exit thread: {} {:.6}s",
            self.name(),
            self.run_time().as_secs_f64()
        );
        shared.tracker().unregister(&self.0.cell);
        self.0.zombie.store(true, Ordering::Release);

        let mut running = self.0.join.running.lock();
        *running = false;
        self.0.join.cv_stopped.notify_all();
    }

    /// Finish an engine created with [SharedState::attach_current_thread].
    pub fn detach(&self, result: Result<Value>) {
        if self.is_current() {
            Self::set_current(None);
        }
        self.finish(result);
    }

    /// Block until this engine stopped or `timeout` elapsed. Returns `None` on timeout.
    pub fn join(&self, timeout: Option<Duration>) -> Result<Option<Engine>> {
        let caller = Self::current().ok();
        if caller.as_ref() == Some(self) {
            return Err(ThreadError::JoinSelf.into());
        }
        if let Some(caller) = caller.as_ref() {
            self.0.shared.tracker().unmanaged(caller.cell());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        {
            let mut running = self.0.join.running.lock();
            while *running {
                match deadline {
                    Some(deadline) => {
                        if self
                            .0
                            .join
                            .cv_stopped
                            .wait_until(&mut running, deadline)
                            .timed_out()
                        {
                            timed_out = *running;
                            break;
                        }
                    }
                    None => self.0.join.cv_stopped.wait(&mut running),
                }
            }
        }
        if let Some(caller) = caller.as_ref() {
            self.0.shared.tracker().managed(caller.cell());
        }
        Ok(if timed_out { None } else { Some(self.clone()) })
    }

    /// Result of the task, joining first.
    pub fn value(&self) -> Result<Value> {
        self.join(None)?;
        self.0.value.lock().clone().unwrap_or(Ok(Value::Nil))
    }

    /// Terminate this engine. On the calling engine itself this returns the termination
    /// error in place, otherwise the request is delivered at the target's next checkpoint.
    pub fn kill(&self) -> Result<()> {
        if self.is_current() {
            return Err(Error::Killed);
        }
        if self.is_alive() {
            self.register_interrupt(Interrupt::Kill);
        }
        Ok(())
    }

    pub fn raise(&self, exception: Error) -> Result<()> {
        if self.is_current() {
            return Err(exception);
        }
        if self.is_alive() {
            self.register_interrupt(Interrupt::Raise(exception));
        }
        Ok(())
    }

    fn register_interrupt(&self, interrupt: Interrupt) {
        {
            let mut pending = self.0.interrupt.lock();
            // a pending kill wins over anything registered later
            if *pending != Some(Interrupt::Kill) {
                *pending = Some(interrupt);
            }
        }
        self.wakeup();
    }

    pub fn has_interrupt(&self) -> bool {
        self.0.interrupt.lock().is_some()
    }

    /// Wake the engine from a sleep or channel wait. Returns false for stopped engines.
    pub fn wakeup(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.0.woken.store(true, Ordering::Release);
        let waiting_on = self.0.waiting_on.lock().clone();
        if let Some(waiting_on) = waiting_on {
            waiting_on.wake();
        }
        let _guard = self.0.sleep_lock.lock();
        self.0.sleep_cv.notify_all();
        true
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.0.woken.load(Ordering::Acquire)
    }

    pub(crate) fn take_wakeup(&self) -> bool {
        self.0.woken.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn wait_on(&self, wakeable: Arc<dyn Wakeable>) {
        *self.0.waiting_on.lock() = Some(wakeable);
    }

    pub(crate) fn clear_waiter(&self) {
        *self.0.waiting_on.lock() = None;
    }

    /// Deliver a pending kill or raise.
    pub fn check_async(&self) -> Result<()> {
        match self.0.interrupt.lock().take() {
            Some(Interrupt::Kill) => Err(Error::Killed),
            Some(Interrupt::Raise(exception)) => Err(exception),
            None => Ok(()),
        }
    }

    /// Collector safepoint. Returns true if the engine had to stop.
    pub fn safepoint(&self) -> bool {
        self.0.shared.tracker().safepoint(&self.0.cell)
    }

    /// Safepoint that also delivers pending interrupts.
    pub fn checkpoint(&self) -> Result<()> {
        self.safepoint();
        self.check_async()
    }

    pub fn pass(&self) {
        self.safepoint();
        thread::yield_now();
    }

    /// Park until woken, interrupted or `duration` elapsed. `None` sleeps until woken.
    pub fn sleep(&self, duration: Option<Duration>) -> Result<Duration> {
        self.check_async()?;
        let started = Instant::now();
        let deadline = duration.map(|d| started + d);
        let tracker = self.0.shared.tracker();
        self.take_wakeup();
        tracker.unmanaged(&self.0.cell);
        {
            let mut guard = self.0.sleep_lock.lock();
            while !self.is_woken() && !self.has_interrupt() {
                match deadline {
                    Some(deadline) => {
                        if self.0.sleep_cv.wait_until(&mut guard, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.0.sleep_cv.wait(&mut guard),
                }
            }
        }
        self.take_wakeup();
        tracker.managed(&self.0.cell);
        self.check_async()?;
        Ok(started.elapsed())
    }

    /// Fiber whose locals shadow the engine locals: the running non-root fiber when called on
    /// the calling engine.
    fn locals_fiber(&self) -> Option<Fiber> {
        if !self.is_current() {
            return None;
        }
        let fiber = self.current_fiber();
        if fiber.is_root() {
            None
        } else {
            Some(fiber)
        }
    }

    pub fn local(&self, key: &str) -> Value {
        let found = match self.locals_fiber() {
            Some(fiber) => fiber.local(key),
            None => self.0.locals.lock().get(key).cloned(),
        };
        found.unwrap_or(Value::Nil)
    }

    pub fn set_local(&self, key: &str, value: Value) -> Value {
        match self.locals_fiber() {
            Some(fiber) => {
                fiber.set_local(key, value.clone());
            }
            None => {
                self.0.locals.lock().insert(key.to_string(), value.clone());
            }
        }
        value
    }

    pub fn remove_local(&self, key: &str) -> Value {
        let removed = match self.locals_fiber() {
            Some(fiber) => fiber.remove_local(key),
            None => self.0.locals.lock().remove(key),
        };
        removed.unwrap_or(Value::Nil)
    }

    pub fn local_keys(&self) -> Vec<String> {
        match self.locals_fiber() {
            Some(fiber) => fiber.local_keys(),
            None => self.0.locals.lock().keys().cloned().collect(),
        }
    }

    pub fn has_local(&self, key: &str) -> bool {
        match self.locals_fiber() {
            Some(fiber) => fiber.has_local(key),
            None => self.0.locals.lock().contains_key(key),
        }
    }

    /// Record `object` as a root on the stack of the running fiber.
    pub fn push_root(&self, object: ObjectRef) -> Result<()> {
        let ctx = self.running_context()?;
        self.0.shared.pool().push_root(&ctx, object.to_word())
    }

    pub fn pop_root(&self) -> Result<Option<ObjectRef>> {
        let ctx = self.running_context()?;
        Ok(ObjectRef::from_word(self.0.shared.pool().pop_root(&ctx)?))
    }

    pub fn enter_frame(&self) -> Result<()> {
        let ctx = self.running_context()?;
        self.0.shared.pool().enter_frame(&ctx);
        Ok(())
    }

    pub fn leave_frame(&self) -> Result<()> {
        let ctx = self.running_context()?;
        self.0.shared.pool().leave_frame(&ctx)
    }

    fn running_context(&self) -> Result<Arc<crate::fiber_context::FiberContext>> {
        self.current_fiber()
            .context()
            .ok_or_else(|| crate::error::FiberError::Dead.into())
    }

    /// Allocate an object on the shared heap.
    pub fn allocate(&self, fields: Vec<Value>) -> ObjectRef {
        self.0.shared.allocate(fields)
    }

    pub(crate) fn visit_roots(&self, vis: &mut dyn VisitorTrait) {
        for value in self.0.locals.lock().values() {
            vis.visit_value(value);
        }
        if let Some(Ok(value)) = self.0.value.lock().as_ref() {
            vis.visit_value(value);
        }
        if let Some(Interrupt::Raise(Error::Raised(value))) = self.0.interrupt.lock().as_ref() {
            vis.visit_value(value);
        }
    }
}

fn run_engine(engine: Engine) {
    Engine::set_current(Some(engine.clone()));
    engine.started();
    let task = engine.0.task.lock().take();
    let result = match task {
        Some(task) => catch_unwind(AssertUnwindSafe(task))
            .unwrap_or_else(|payload| Err(Error::from_panic(payload))),
        None => Ok(Value::Nil),
    };
    engine.set_current_fiber(engine.root_fiber());
    Engine::set_current(None);
    engine.finish(result);
}
