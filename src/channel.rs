//! Blocking FIFO combined with a semaphore counter.
//!
//! Nil sends only bump the counter. A non-nil send first turns pending counts into nil
//! entries so receivers observe everything in arrival order. Receives prefer the counter.
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    engine::{Engine, Wakeable},
    error::{Error, Result},
    shared_state::SharedState,
    value::Value,
    visitor::VisitorTrait,
};

struct ChannelState {
    queue: VecDeque<Value>,
    semaphore_count: usize,
    waiters: usize,
}

pub struct ChannelInner {
    state: Mutex<ChannelState>,
    condition: Condvar,
}

impl ChannelInner {
    pub(crate) fn visit_roots(&self, vis: &mut dyn VisitorTrait) {
        for value in self.state.lock().queue.iter() {
            vis.visit_value(value);
        }
    }
}

impl Wakeable for ChannelInner {
    fn wake(&self) {
        let _guard = self.state.lock();
        self.condition.notify_all();
    }
}

enum Wake {
    Ready,
    TimedOut,
    Woken,
    Interrupted,
}

#[derive(Clone)]
pub struct Channel(Arc<ChannelInner>);

impl Channel {
    /// New empty channel. Queued values are collector roots for as long as the channel lives.
    pub fn new(shared: &SharedState) -> Self {
        let inner = Arc::new(ChannelInner {
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                semaphore_count: 0,
                waiters: 0,
            }),
            condition: Condvar::new(),
        });
        shared.register_channel(Arc::downgrade(&inner));
        Self(inner)
    }

    pub fn send(&self, value: Value) {
        let mut state = self.0.state.lock();
        if value.is_nil() {
            state.semaphore_count += 1;
        } else {
            for _ in 0..state.semaphore_count {
                state.queue.push_back(Value::Nil);
            }
            state.semaphore_count = 0;
            state.queue.push_back(value);
        }
        if state.waiters > 0 {
            self.0.condition.notify_one();
        }
    }

    /// Non-blocking receive. Nil when nothing is available.
    pub fn try_receive(&self) -> Value {
        let mut state = self.0.state.lock();
        Self::take(&mut state).unwrap_or(Value::Nil)
    }

    fn take(state: &mut ChannelState) -> Option<Value> {
        if state.semaphore_count > 0 {
            state.semaphore_count -= 1;
            return Some(Value::Nil);
        }
        state.queue.pop_front()
    }

    pub fn receive(&self) -> Result<Value> {
        self.receive_timeout(None)
    }

    /// Receive, waiting at most `duration` (forever with `None`).
    ///
    /// Returns nil on timeout and `false` when the waiting engine was woken with nothing
    /// available. A kill or raise registered on the waiting engine is returned as an error.
    pub fn receive_timeout(&self, duration: Option<Duration>) -> Result<Value> {
        let mut state = self.0.state.lock();
        if let Some(value) = Self::take(&mut state) {
            return Ok(value);
        }

        let deadline = duration.map(|d| Instant::now() + d);
        let engine = Engine::current().ok();
        if let Some(engine) = engine.as_ref() {
            engine.check_async()?;
            // only wakeups sent while waiting count
            engine.take_wakeup();
            engine.wait_on(self.0.clone());
            engine.shared().tracker().unmanaged(engine.cell());
        }
        state.waiters += 1;

        let reason = loop {
            if state.semaphore_count > 0 || !state.queue.is_empty() {
                break Wake::Ready;
            }
            if let Some(engine) = engine.as_ref() {
                if engine.has_interrupt() {
                    break Wake::Interrupted;
                }
                if engine.take_wakeup() {
                    break Wake::Woken;
                }
            }
            match deadline {
                Some(deadline) => {
                    if self.0.condition.wait_until(&mut state, deadline).timed_out() {
                        break Wake::TimedOut;
                    }
                }
                None => self.0.condition.wait(&mut state),
            }
        };

        state.waiters -= 1;
        if let Some(engine) = engine.as_ref() {
            engine.clear_waiter();
            if let Wake::Interrupted = reason {
                engine.take_wakeup();
            }
            MutexGuard::unlocked(&mut state, || {
                engine.shared().tracker().managed(engine.cell())
            });
            engine.check_async()?;
        }

        if let Some(value) = Self::take(&mut state) {
            return Ok(value);
        }
        Ok(match reason {
            Wake::TimedOut => Value::Nil,
            _ => Value::Bool(false),
        })
    }

    /// [Channel::receive_timeout] with the duration given as a value: an integer or float
    /// number of seconds, or nil to wait forever.
    pub fn receive_timeout_value(&self, duration: &Value) -> Result<Value> {
        let duration = match duration {
            Value::Nil => None,
            Value::Int(secs) => Some(Duration::from_secs((*secs).max(0) as u64)),
            Value::Float(secs) if secs.is_finite() => Some(Duration::from_secs_f64(secs.max(0.0))),
            other => {
                return Err(Error::Argument(format!(
                    "invalid receive timeout: {}",
                    other
                )))
            }
        };
        self.receive_timeout(duration)
    }

    /// Number of receives that would succeed without waiting.
    pub fn len(&self) -> usize {
        let state = self.0.state.lock();
        state.queue.len() + state.semaphore_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn semaphore_count(&self) -> usize {
        self.0.state.lock().semaphore_count
    }

    pub fn waiters(&self) -> usize {
        self.0.state.lock().waiters
    }
}
