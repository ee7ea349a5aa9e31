//! Cooperative coroutines scheduled explicitly with `resume`, `transfer` and `yield`.
//!
//! Every non-root fiber executes on a native thread of its own that stays parked on its
//! context's baton whenever the fiber is not running. Handing the baton over is the stack
//! switch: at most one fiber per engine holds it at any time. The root fiber of an engine
//! runs on the engine's thread.
//!
//! Values passed to `resume`, `transfer` and `yield` are boxed into an argument list that
//! the receiving side collapses with [Value::from_args].
use std::{
    collections::HashMap,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread,
};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{
    engine::Engine,
    error::{Error, FiberError, Result, ThreadError},
    fiber_context::{FiberContext, Signal},
    shared_state::SharedState,
    value::Value,
    visitor::VisitorTrait,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FiberStatus {
    Created = 0,
    Running = 1,
    Sleeping = 2,
    Dead = 3,
}

pub type Starter = Box<dyn FnOnce(Vec<Value>) -> Result<Value> + Send>;

#[derive(Default)]
struct HandOff {
    value: Option<Vec<Value>>,
    exception: Option<Error>,
}

pub struct FiberInner {
    shared: Arc<SharedState>,
    root: bool,
    stack_size: usize,
    status: Atomic<FiberStatus>,
    prev: Mutex<Option<Weak<FiberInner>>>,
    starter: Mutex<Option<Starter>>,
    context: Mutex<Option<Arc<FiberContext>>>,
    hand_off: Mutex<HandOff>,
    locals: Mutex<HashMap<String, Value>>,
}

impl FiberInner {
    pub(crate) fn visit_roots(&self, vis: &mut dyn VisitorTrait) {
        {
            let hand_off = self.hand_off.lock();
            if let Some(values) = hand_off.value.as_ref() {
                for value in values {
                    vis.visit_value(value);
                }
            }
            if let Some(Error::Raised(value)) = hand_off.exception.as_ref() {
                vis.visit_value(value);
            }
        }
        for value in self.locals.lock().values() {
            vis.visit_value(value);
        }
    }
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        if let Some(ctx) = self.context.get_mut().take() {
            self.shared.pool().release(&ctx);
            self.shared.pool().remove_context(&ctx);
            ctx.die();
        }
    }
}

/// Handle to a fiber. Cloning is cheap; the fiber is finalized with its last handle.
#[derive(Clone)]
pub struct Fiber(pub(crate) Arc<FiberInner>);

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Fiber {}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("root", &self.0.root)
            .field("status", &self.status())
            .finish()
    }
}

enum Switch {
    Resume,
    Transfer,
}

impl Fiber {
    fn new(shared: &Arc<SharedState>, root: bool, starter: Option<Starter>) -> Self {
        Self(Arc::new(FiberInner {
            shared: shared.clone(),
            root,
            stack_size: shared.config().fiber_stack_size,
            status: Atomic::new(if root {
                FiberStatus::Running
            } else {
                FiberStatus::Created
            }),
            prev: Mutex::new(None),
            starter: Mutex::new(starter),
            context: Mutex::new(None),
            hand_off: Mutex::new(HandOff::default()),
            locals: Mutex::new(HashMap::new()),
        }))
    }

    /// New fiber running `callable` on its first resume. Its context is created lazily.
    pub fn create<F>(shared: &Arc<SharedState>, callable: F) -> Fiber
    where
        F: FnOnce(Vec<Value>) -> Result<Value> + Send + 'static,
    {
        Self::new(shared, false, Some(Box::new(callable)))
    }

    /// Root fiber of an engine, running on the engine's own thread.
    pub(crate) fn root(shared: &Arc<SharedState>, engine: u32) -> Fiber {
        let fiber = Self::new(shared, true, None);
        let ctx = shared
            .pool()
            .new_context(engine, shared.config().fiber_stack_size, true);
        ctx.set_owner(Arc::downgrade(&fiber.0));
        *fiber.0.context.lock() = Some(ctx);
        fiber
    }

    /// Fiber currently running on the calling engine.
    pub fn current() -> Result<Fiber> {
        Ok(Engine::current()?.current_fiber())
    }

    pub fn status(&self) -> FiberStatus {
        self.0.status.load(Ordering::Acquire)
    }

    fn set_status(&self, status: FiberStatus) {
        self.0.status.store(status, Ordering::Release);
    }

    pub fn is_root(&self) -> bool {
        self.0.root
    }

    pub fn is_alive(&self) -> bool {
        self.status() != FiberStatus::Dead
            && !self.context().map(|ctx| ctx.is_dead()).unwrap_or(false)
    }

    /// Context of this fiber, if it was ever resumed.
    pub fn context(&self) -> Option<Arc<FiberContext>> {
        self.0.context.lock().clone()
    }

    pub(crate) fn shared(&self) -> &Arc<SharedState> {
        &self.0.shared
    }

    /// Whether this fiber waits for a return to the fiber that resumed it.
    pub fn has_resumer(&self) -> bool {
        self.0.prev.lock().is_some()
    }

    pub fn local(&self, key: &str) -> Option<Value> {
        self.0.locals.lock().get(key).cloned()
    }

    pub fn set_local(&self, key: &str, value: Value) -> Option<Value> {
        self.0.locals.lock().insert(key.to_string(), value)
    }

    pub fn remove_local(&self, key: &str) -> Option<Value> {
        self.0.locals.lock().remove(key)
    }

    pub fn local_keys(&self) -> Vec<String> {
        self.0.locals.lock().keys().cloned().collect()
    }

    pub fn has_local(&self, key: &str) -> bool {
        self.0.locals.lock().contains_key(key)
    }

    fn set_value(&self, args: Vec<Value>) {
        self.0.hand_off.lock().value = Some(args);
    }

    fn take_value(&self) -> Vec<Value> {
        self.0.hand_off.lock().value.take().unwrap_or_default()
    }

    /// Result handed to this fiber by whoever switched into it.
    fn take_result(&self) -> Result<Value> {
        let mut hand_off = self.0.hand_off.lock();
        if let Some(exception) = hand_off.exception.take() {
            hand_off.value = None;
            return Err(exception);
        }
        Ok(hand_off.value.take().map(Value::from_args).unwrap_or(Value::Nil))
    }

    fn resolve_prev(&self) -> Option<Fiber> {
        self.0
            .prev
            .lock()
            .take()
            .and_then(|prev| prev.upgrade())
            .map(Fiber)
    }

    fn context_for(&self, engine: &Engine) -> Arc<FiberContext> {
        let mut context = self.0.context.lock();
        match context.as_ref() {
            Some(ctx) => ctx.clone(),
            None => {
                let ctx = self
                    .0
                    .shared
                    .pool()
                    .new_context(engine.id(), self.0.stack_size, false);
                ctx.set_owner(Arc::downgrade(&self.0));
                *context = Some(ctx.clone());
                ctx
            }
        }
    }

    pub fn resume(&self, args: Vec<Value>) -> Result<Value> {
        self.switch_into(Switch::Resume, args)
    }

    /// Like [Fiber::resume] except that the target returns to the engine's root fiber when it
    /// yields or finishes.
    pub fn transfer(&self, args: Vec<Value>) -> Result<Value> {
        self.switch_into(Switch::Transfer, args)
    }

    fn switch_into(&self, kind: Switch, args: Vec<Value>) -> Result<Value> {
        let engine = Engine::current()?;
        let ctx = self.context_for(&engine);

        if self.status() == FiberStatus::Dead || ctx.is_dead() {
            return Err(FiberError::Dead.into());
        }
        if let Switch::Resume = kind {
            if self.has_resumer() {
                return Err(FiberError::DoubleResume.into());
            }
        }
        if ctx.engine() != engine.id() {
            return Err(FiberError::CrossEngine.into());
        }
        let cur = engine.current_fiber();
        if cur == *self {
            return Err(FiberError::Current.into());
        }
        engine.safepoint();
        self.0.shared.pool().activate(&ctx)?;
        self.prepare_thread(&engine, &ctx)?;

        self.set_value(args);
        let root;
        let prev = match kind {
            Switch::Resume => &cur,
            Switch::Transfer => {
                root = engine.root_fiber();
                &root
            }
        };
        *self.0.prev.lock() = Some(Arc::downgrade(&prev.0));

        cur.set_status(FiberStatus::Sleeping);
        self.set_status(FiberStatus::Running);
        engine.set_current_fiber(self.clone());
        let parked = cur.context_for(&engine);
        drop(cur);
        ctx.baton.signal(Signal::Run);
        drop(ctx);

        park(&parked)?;
        engine.current_fiber().take_result()
    }

    /// Hands `args` to the fiber that resumed the current one and suspends it.
    pub fn yield_(args: Vec<Value>) -> Result<Value> {
        let engine = Engine::current()?;
        let cur = engine.current_fiber();
        if cur.is_root() {
            return Err(FiberError::RootYield.into());
        }
        let dest = match cur.resolve_prev() {
            Some(dest) if dest.is_alive() => dest,
            _ => engine.root_fiber(),
        };
        let dest_ctx = dest.context_for(&engine);
        engine.safepoint();
        if let Err(e) = cur.0.shared.pool().activate(&dest_ctx) {
            *cur.0.prev.lock() = Some(Arc::downgrade(&dest.0));
            return Err(e);
        }

        dest.set_value(args);
        cur.set_status(FiberStatus::Sleeping);
        dest.set_status(FiberStatus::Running);
        engine.set_current_fiber(dest);
        let parked = cur.context_for(&engine);
        drop(cur);
        dest_ctx.baton.signal(Signal::Run);
        drop(dest_ctx);

        park(&parked)?;
        engine.current_fiber().take_result()
    }

    /// Starts the native thread of a fiber on its first switch. The thread parks on the
    /// context baton until the switch completes.
    fn prepare_thread(&self, engine: &Engine, ctx: &Arc<FiberContext>) -> Result<()> {
        if ctx.is_started() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.0);
        let thread_ctx = ctx.clone();
        let thread_engine = engine.clone();
        let stack_size = self.0.shared.config().thread_stack_size;
        thread::Builder::new()
            .name(format!("fiber-{}", ctx.id()))
            .stack_size(stack_size)
            .spawn(move || run_fiber(weak, thread_ctx, thread_engine))
            .map_err(|e| ThreadError::Spawn(e.to_string()))?;
        ctx.set_started();
        logln_if!(
            self.0.shared.config().verbose,
            "[comet-rt] started fiber context {} on engine {}",
            ctx.id(),
            engine.id()
        );
        Ok(())
    }
}

/// Unwind payload of a fiber thread whose context was killed while parked.
struct FiberKilled;

/// Waits for the baton. A killed root context reports `Error::Killed` to the engine
/// thread. A killed fiber thread detaches from its engine and unwinds back into
/// `run_fiber`, so none of the fiber's remaining code runs.
fn park(ctx: &FiberContext) -> Result<()> {
    match ctx.baton.wait() {
        Signal::Kill if ctx.is_root() => Err(Error::Killed),
        Signal::Kill => {
            Engine::set_current(None);
            resume_unwind(Box::new(FiberKilled))
        }
        _ => Ok(()),
    }
}

fn run_fiber(weak: Weak<FiberInner>, ctx: Arc<FiberContext>, engine: Engine) {
    if let Signal::Kill = ctx.baton.wait() {
        return;
    }
    Engine::set_current(Some(engine.clone()));
    let (starter, args) = match weak.upgrade() {
        Some(inner) => {
            let fiber = Fiber(inner);
            let starter = fiber.0.starter.lock().take();
            (starter, fiber.take_value())
        }
        None => {
            Engine::set_current(None);
            return;
        }
    };
    let result = match starter {
        Some(starter) => match catch_unwind(AssertUnwindSafe(move || starter(args))) {
            Ok(result) => result,
            Err(payload) if payload.is::<FiberKilled>() => return,
            Err(payload) => Err(Error::from_panic(payload)),
        },
        None => Err(FiberError::Dead.into()),
    };

    let fiber = match weak.upgrade() {
        Some(inner) => Fiber(inner),
        None => {
            Engine::set_current(None);
            return;
        }
    };
    fiber.set_status(FiberStatus::Dead);
    ctx.declare_dead();

    let dest = match fiber.resolve_prev() {
        Some(dest) if dest.is_alive() => dest,
        _ => engine.root_fiber(),
    };
    match result {
        Ok(value) => dest.set_value(vec![value]),
        Err(exception) => dest.0.hand_off.lock().exception = Some(exception),
    }
    let dest_ctx = dest.context_for(&engine);
    let shared = fiber.shared().clone();
    if let Err(e) = shared.pool().activate(&dest_ctx) {
        logln_if!(
            shared.config().verbose,
            "[comet-rt] unable to reactivate fiber context {}: {}",
            dest_ctx.id(),
            e
        );
    }
    dest.set_status(FiberStatus::Running);
    engine.set_current_fiber(dest);
    shared.pool().release(&ctx);
    drop(fiber);
    dest_ctx.baton.signal(Signal::Run);
    Engine::set_current(None);
}
