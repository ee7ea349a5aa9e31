use thiserror::Error;

use crate::value::Value;

/// Misuse of the fiber API. Raised before any stack switch happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    #[error("dead fiber called")]
    Dead,
    #[error("double resume")]
    DoubleResume,
    #[error("cross thread fiber resuming is illegal")]
    CrossEngine,
    #[error("can't yield from root fiber")]
    RootYield,
    #[error("attempt to resume the current fiber")]
    Current,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    #[error("unable to create native thread: {0}")]
    Spawn(String),
    #[error("invalid stack size {size} (minimum {minimum})")]
    StackSize { size: usize, minimum: usize },
    #[error("current thread is not attached to the runtime")]
    NotAttached,
    #[error("thread is already running")]
    AlreadyStarted,
    #[error("thread cannot join itself")]
    JoinSelf,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("no fiber stack slot can hold {0} bytes")]
    StackTooLarge(usize),
    #[error("fiber stack overflow")]
    StackOverflow,
    #[error("fiber stack underflow")]
    StackUnderflow,
}

/// Catchable condition raised by runtime operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Fiber(#[from] FiberError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("thread killed")]
    Killed,
    #[error("exit {0}")]
    Exit(i32),
    #[error("{0}")]
    Raised(Value),
    #[error("panic: {0}")]
    Panic(String),
    #[error("argument error: {0}")]
    Argument(String),
}

impl Error {
    pub fn raise(value: impl Into<Value>) -> Self {
        Error::Raised(value.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Error::Panic(s.to_string())
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Error::Panic(s.clone())
        } else {
            Error::Panic("unknown panic payload".to_string())
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
