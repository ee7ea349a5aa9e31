//! Per-fiber execution state.
//!
//! A context owns a stack image: a downward growing buffer of root words recorded at
//! absolute addresses of the stack slot it leased. While the context is resident the
//! words live in the slot itself. When another context claims the slot the image is
//! flushed into a heap copy and the context carries a [Displacement] that maps the
//! recorded addresses onto that copy. Recorded addresses are never rewritten.
use std::{
    mem::size_of,
    sync::{
        atomic::{AtomicBool, AtomicU64},
        Weak,
    },
};

use atomic::Ordering;
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{ResourceError, Result},
    fiber::FiberInner,
    stack_pool::{SlotId, StackSlot},
    util::bug,
    value::ObjectRef,
};

pub const WORD: usize = size_of::<usize>();

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Offset transform for a stack image that is not at the address it recorded.
///
/// Addresses in `lower..upper` are moved by `offset`; everything else maps to itself.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Displacement {
    pub offset: isize,
    pub lower: usize,
    pub upper: usize,
}

impl Displacement {
    pub const IDENTITY: Displacement = Displacement {
        offset: 0,
        lower: 0,
        upper: 0,
    };

    pub fn new(offset: isize, lower: usize, upper: usize) -> Self {
        Self {
            offset,
            lower,
            upper,
        }
    }

    #[inline]
    pub fn displace(&self, addr: usize) -> usize {
        if addr >= self.lower && addr < self.upper {
            (addr as isize).wrapping_add(self.offset) as usize
        } else {
            addr
        }
    }

    pub fn is_identity(&self) -> bool {
        self.offset == 0
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Signal {
    Idle,
    Run,
    Kill,
}

/// Hand-off baton. The execution parked on it resumes when someone signals `Run`.
pub(crate) struct Baton {
    signal: Mutex<Signal>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            signal: Mutex::new(Signal::Idle),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self, signal: Signal) {
        let mut guard = self.signal.lock();
        // a kill is sticky
        if *guard != Signal::Kill {
            *guard = signal;
        }
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) -> Signal {
        let mut guard = self.signal.lock();
        while *guard == Signal::Idle {
            self.cv.wait(&mut guard);
        }
        let signal = *guard;
        if signal == Signal::Run {
            *guard = Signal::Idle;
        }
        signal
    }
}

pub(crate) struct StackImage {
    pub(crate) slot: Option<SlotId>,
    origin: usize,
    size: usize,
    sp: usize,
    frames: Vec<usize>,
    heap_copy: Option<Box<[u8]>>,
    private: Option<Box<[u8]>>,
    displacement: Displacement,
}

impl StackImage {
    fn top(&self) -> usize {
        self.origin + self.size
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.origin != 0
    }

    pub(crate) fn used(&self) -> usize {
        self.top() - self.sp
    }

    pub(crate) fn is_resident(&self) -> bool {
        self.heap_copy.is_none()
    }

    /// Bind the image to the recorded addresses of a freshly leased slot.
    pub(crate) fn bind(&mut self, slot: SlotId, base: usize, size: usize) {
        self.slot = Some(slot);
        self.origin = base;
        self.size = size;
        self.sp = base + size;
        self.frames.clear();
        self.heap_copy = None;
        self.displacement = Displacement::IDENTITY;
    }

    pub(crate) fn unbind(&mut self) {
        self.slot = None;
        self.heap_copy = None;
        self.displacement = Displacement::IDENTITY;
        self.frames.clear();
        self.sp = self.top();
    }

    /// Copy the live part of the image out of `slot` and displace the recorded range onto it.
    pub(crate) fn copy_to_heap(&mut self, slot: &StackSlot) {
        if !self.is_resident() || !self.is_bound() {
            return;
        }
        let mut copy = vec![0u8; self.size].into_boxed_slice();
        let from = self.sp - slot.base();
        let to = self.top() - slot.base();
        let at = self.sp - self.origin;
        copy[at..at + (to - from)].copy_from_slice(&slot.bytes()[from..to]);
        let offset = copy.as_ptr() as isize - self.origin as isize;
        self.displacement = Displacement::new(offset, self.origin, self.top());
        self.heap_copy = Some(copy);
    }

    /// Move the heap copy back into `slot`, making the recorded addresses valid again.
    pub(crate) fn copy_from_heap(&mut self, slot: &mut StackSlot) {
        if let Some(copy) = self.heap_copy.take() {
            let from = self.sp - self.origin;
            let to = self.size;
            let at = self.sp - slot.base();
            slot.bytes_mut()[at..at + (to - from)].copy_from_slice(&copy[from..to]);
        }
        self.displacement = Displacement::IDENTITY;
    }

    pub(crate) fn displacement(&self) -> Displacement {
        self.displacement
    }

    fn locate<'a>(&'a self, slots: &'a [StackSlot], addr: usize) -> Option<(&'a [u8], usize)> {
        let addr = self.displacement.displace(addr);
        for buf in self.heap_copy.iter().chain(self.private.iter()) {
            let base = buf.as_ptr() as usize;
            if addr >= base && addr + WORD <= base + buf.len() {
                return Some((&buf[..], addr - base));
            }
        }
        let slot = &slots[self.slot?.0];
        if addr >= slot.base() && addr + WORD <= slot.base() + slot.size() {
            return Some((slot.bytes(), addr - slot.base()));
        }
        None
    }

    pub(crate) fn read_word(&self, slots: &[StackSlot], addr: usize) -> usize {
        match self.locate(slots, addr) {
            Some((bytes, at)) => {
                let mut word = [0u8; WORD];
                word.copy_from_slice(&bytes[at..at + WORD]);
                usize::from_ne_bytes(word)
            }
            None => bug("fiber stack address outside of its stack"),
        }
    }

    fn write_word(&mut self, slots: &mut [StackSlot], addr: usize, word: usize) {
        let addr = self.displacement.displace(addr);
        let bytes = word.to_ne_bytes();
        for buf in self.heap_copy.iter_mut().chain(self.private.iter_mut()) {
            let base = buf.as_ptr() as usize;
            if addr >= base && addr + WORD <= base + buf.len() {
                buf[addr - base..addr - base + WORD].copy_from_slice(&bytes);
                return;
            }
        }
        if let Some(slot) = self.slot {
            let slot = &mut slots[slot.0];
            let base = slot.base();
            if addr >= base && addr + WORD <= base + slot.size() {
                slot.bytes_mut()[addr - base..addr - base + WORD].copy_from_slice(&bytes);
                return;
            }
        }
        bug("fiber stack address outside of its stack");
    }

    pub(crate) fn push(&mut self, slots: &mut [StackSlot], word: usize) -> Result<()> {
        if self.sp < self.origin + WORD {
            return Err(ResourceError::StackOverflow.into());
        }
        self.sp -= WORD;
        let sp = self.sp;
        self.write_word(slots, sp, word);
        Ok(())
    }

    pub(crate) fn pop(&mut self, slots: &mut [StackSlot]) -> Result<usize> {
        let floor = self.frames.last().copied().unwrap_or_else(|| self.top());
        if self.sp >= floor {
            return Err(ResourceError::StackUnderflow.into());
        }
        let word = self.read_word(slots, self.sp);
        let sp = self.sp;
        self.write_word(slots, sp, 0);
        self.sp += WORD;
        Ok(word)
    }

    pub(crate) fn enter_frame(&mut self) {
        self.frames.push(self.sp);
    }

    pub(crate) fn leave_frame(&mut self, slots: &mut [StackSlot]) -> Result<()> {
        let frame = self.frames.pop().ok_or(ResourceError::StackUnderflow)?;
        while self.sp < frame {
            let sp = self.sp;
            self.write_word(slots, sp, 0);
            self.sp += WORD;
        }
        Ok(())
    }

    /// Recorded addresses of every live root word, innermost first.
    pub(crate) fn live_range(&self) -> std::ops::Range<usize> {
        self.sp..self.top()
    }

    pub(crate) fn frame_root(&self) -> Option<usize> {
        self.frames.last().copied()
    }

    pub(crate) fn each_object(&self, slots: &[StackSlot], f: &mut dyn FnMut(ObjectRef)) {
        let mut addr = self.sp;
        while addr < self.top() {
            if let Some(object) = ObjectRef::from_word(self.read_word(slots, addr)) {
                f(object);
            }
            addr += WORD;
        }
    }
}

/// Execution state of a single fiber.
pub struct FiberContext {
    id: u64,
    engine: u32,
    root: bool,
    stack_size: usize,
    dead: AtomicBool,
    marked: AtomicBool,
    started: AtomicBool,
    pub(crate) baton: Baton,
    pub(crate) image: Mutex<StackImage>,
    owner: Mutex<Weak<FiberInner>>,
}

impl FiberContext {
    pub(crate) fn new(engine: u32, stack_size: usize, root: bool) -> Self {
        let mut image = StackImage {
            slot: None,
            origin: 0,
            size: stack_size,
            sp: 0,
            frames: vec![],
            heap_copy: None,
            private: None,
            displacement: Displacement::IDENTITY,
        };
        if root {
            // root fibers run on the engine's native stack and never lease a slot
            let private = vec![0u8; stack_size].into_boxed_slice();
            image.origin = private.as_ptr() as usize;
            image.sp = image.origin + stack_size;
            image.private = Some(private);
        }
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            root,
            stack_size,
            dead: AtomicBool::new(false),
            marked: AtomicBool::new(false),
            started: AtomicBool::new(root),
            baton: Baton::new(),
            image: Mutex::new(image),
            owner: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the engine this context is bound to.
    pub fn engine(&self) -> u32 {
        self.engine
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub fn set_mark(&self) {
        self.marked.store(true, Ordering::Release);
    }

    pub fn clear_mark(&self) {
        self.marked.store(false, Ordering::Release);
    }

    /// Leased stack slot, if any.
    pub fn slot(&self) -> Option<SlotId> {
        self.image.lock().slot
    }

    pub fn displacement(&self) -> Displacement {
        self.image.lock().displacement()
    }

    /// Whether the stack image currently lives in its slot rather than a heap copy.
    pub fn is_resident(&self) -> bool {
        self.image.lock().is_resident()
    }

    /// Recorded address of the innermost frame.
    pub fn frame_root(&self) -> Option<usize> {
        self.image.lock().frame_root()
    }

    pub fn depth(&self) -> usize {
        self.image.lock().used() / WORD
    }

    pub(crate) fn set_owner(&self, owner: Weak<FiberInner>) {
        *self.owner.lock() = owner;
    }

    /// The owning fiber is still reachable from outside the collector.
    pub(crate) fn owner_alive(&self) -> bool {
        self.owner.lock().strong_count() > 0
    }

    pub(crate) fn owner(&self) -> Option<std::sync::Arc<FiberInner>> {
        self.owner.lock().upgrade()
    }

    /// Whether a native execution was ever started for this context.
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn set_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Declared dead by the collector. The context is never re-entered.
    pub(crate) fn declare_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Kill the context and wake whatever execution is parked on it.
    pub(crate) fn die(&self) {
        self.dead.store(true, Ordering::Release);
        self.baton.signal(Signal::Kill);
    }
}
