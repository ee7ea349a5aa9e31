//! # comet-rt
//!
//! Execution and memory-coordination layer for VMs implemented in Rust. The crate schedules
//! cooperative [fibers](fiber) on top of native worker [engines](engine) and coordinates them
//! with a concurrent, incremental [marker](marker).
//!
//! # Features
//! - Ruby-style fibers: `resume`, `transfer` and `yield` with a boxed value hand-off
//! - Bounded pool of fiber stacks with least-referenced reuse once the pool is full
//! - Worker engines with join, kill, raise, priorities and fiber-scoped locals
//! - Channels that double as the generic park/wake primitive
//! - Phase tracking and stop-the-world coordination between mutators and the collector
//!
//! Everything hangs off one explicitly constructed [SharedState](shared_state::SharedState):
//!
//! ```no_run
//! use comet_rt::{fiber::Fiber, shared_state::SharedState, value::Value, Config};
//!
//! let shared = SharedState::new(Config::default());
//! let _main = shared.attach_current_thread("main").unwrap();
//! let fib = Fiber::create(&shared, |_args| Ok(Value::Int(42)));
//! assert_eq!(fib.resume(vec![]).unwrap(), Value::Int(42));
//! shared.shutdown();
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            println!($($t)*);
        }
    };
}

pub mod channel;
pub mod collection_barrier;
pub mod engine;
pub mod error;
pub mod fiber;
pub mod fiber_context;
pub mod heap;
pub mod host;
pub mod jit;
pub mod marker;
pub mod marking;
pub mod safepoint;
pub mod shared_state;
pub mod stack_pool;
pub mod statistics;
pub mod util;
pub mod value;
pub mod visitor;

#[cfg(test)]
mod tests;

use std::time::Duration;

pub use error::{Error, Result};

/// Configuration for [SharedState](shared_state::SharedState) constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of a single fiber stack slot.
    pub fiber_stack_size: usize,
    /// Maximum amount of stack slots the pool keeps. Once reached slots are shared.
    pub fiber_stacks: usize,
    /// Native stack size for engines forked without an explicit size.
    pub thread_stack_size: usize,
    /// Objects processed by the incremental marker before it re-checks its flags.
    pub mark_step: usize,
    /// How long the marker sleeps when it has nothing to do.
    pub marker_idle: Duration,
    /// Live object count that triggers a concurrent cycle.
    pub gc_threshold: usize,
    /// Start the background incremental marker.
    pub concurrent_marking: bool,
    /// Enables verbose printing
    pub verbose: bool,
    /// Print a summary line after each collection cycle
    pub collection_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fiber_stack_size: 64 * 1024,
            fiber_stacks: 10,
            thread_stack_size: 4 * 1024 * 1024,
            mark_step: 256,
            marker_idle: Duration::from_millis(10),
            gc_threshold: 64 * 1024,
            concurrent_marking: true,
            verbose: false,
            collection_log: false,
        }
    }
}
