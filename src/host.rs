//! Scheduling hooks supplied by the embedding VM.
use std::{sync::atomic::AtomicI32, time::SystemTime};

use atomic::Ordering;

use crate::{
    error::{Result, ThreadError},
    util::{align_up, page_size},
};

pub trait Host: Send + Sync {
    /// Validates a requested native stack size and returns the size to use.
    fn validate_stack_size(&self, size: usize) -> Result<usize>;
    /// Wall-clock time used for engine start and run times.
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
    /// Invoked when the main engine finishes or a task requests process exit.
    fn exit(&self, status: i32);
}

/// Default host: enforces the platform thread stack minimum and records exit requests
/// instead of terminating the process.
pub struct NativeHost {
    exit_status: AtomicI32,
}

const NO_EXIT: i32 = i32::MIN;

impl NativeHost {
    pub fn new() -> Self {
        Self {
            exit_status: AtomicI32::new(NO_EXIT),
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self.exit_status.load(Ordering::Acquire) {
            NO_EXIT => None,
            status => Some(status),
        }
    }

    pub fn minimum_stack_size() -> usize {
        #[cfg(unix)]
        {
            libc::PTHREAD_STACK_MIN as usize
        }
        #[cfg(not(unix))]
        {
            64 * 1024
        }
    }
}

impl Default for NativeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for NativeHost {
    fn validate_stack_size(&self, size: usize) -> Result<usize> {
        let minimum = Self::minimum_stack_size();
        if size == 0 {
            return Err(ThreadError::StackSize { size, minimum }.into());
        }
        Ok(align_up(size.max(minimum), page_size()))
    }

    fn exit(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }
}
