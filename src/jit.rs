//! Compiler hooks. No backend is linked in, so the JIT starts disabled and stays disabled:
//! every request answers `false` and nothing is queued.
use std::sync::atomic::AtomicBool;

use atomic::Ordering;
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileRequest {
    pub code: String,
    pub hits: usize,
    pub is_block: bool,
}

pub struct Jit {
    enabled: AtomicBool,
    requests: Mutex<Vec<CompileRequest>>,
}

impl Jit {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Queue `code` for compilation. Returns whether the request was accepted.
    pub fn compile(&self, code: &str, hits: usize, is_block: bool) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.requests.lock().push(CompileRequest {
            code: code.to_string(),
            hits,
            is_block,
        });
        true
    }

    pub fn compile_threshold(&self) -> usize {
        0
    }

    pub fn sync(&self) -> bool {
        false
    }

    pub fn set_sync(&self, _flag: bool) -> bool {
        false
    }

    /// Enabling only succeeds on a JIT that is already enabled.
    pub fn enable(&self) -> bool {
        self.is_enabled()
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.requests.lock().clear();
    }

    pub fn pending_requests(&self) -> Vec<CompileRequest> {
        self.requests.lock().clone()
    }
}

impl Default for Jit {
    fn default() -> Self {
        Self::new()
    }
}
