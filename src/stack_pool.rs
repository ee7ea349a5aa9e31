//! Bounded pool of fiber stacks.
//!
//! Slots are anonymous memory maps that are leased to fiber contexts and never unmapped while
//! pooled. Once the pool reached its capacity new leases share the least referenced slot; the
//! context that last ran on a shared slot is flushed to a heap copy before another context
//! claims it.
use std::sync::{Arc, Weak};

use memmap2::MmapMut;

use crate::{
    error::{FiberError, ResourceError, Result},
    fiber_context::FiberContext,
    util::{bug, SpinLock},
    visitor::VisitorTrait,
};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SlotId(pub(crate) usize);

pub struct StackSlot {
    region: MmapMut,
    refs: usize,
    user: Option<Weak<FiberContext>>,
}

impl StackSlot {
    /// Maps a fresh stack region. Running out of address space for fiber stacks is fatal.
    fn new(size: usize) -> Self {
        let region = match MmapMut::map_anon(size) {
            Ok(region) => region,
            Err(e) => bug(&format!("unable to map fiber stack of {} bytes: {}", size, e)),
        };
        Self {
            region,
            refs: 0,
            user: None,
        }
    }

    pub fn base(&self) -> usize {
        self.region.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.region.len()
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn is_unused(&self) -> bool {
        self.refs == 0
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.region[..]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.region[..]
    }

    fn user(&self) -> Option<Arc<FiberContext>> {
        self.user.as_ref().and_then(|user| user.upgrade())
    }
}

struct PoolInner {
    slots: Vec<StackSlot>,
    contexts: Vec<Weak<FiberContext>>,
}

impl PoolInner {
    fn slot_mut(&mut self, id: SlotId) -> &mut StackSlot {
        match self.slots.get_mut(id.0) {
            Some(slot) => slot,
            None => bug("fiber stack slot missing from pool"),
        }
    }

    fn allocate(&mut self, max_stacks: usize, size: usize) -> Result<SlotId> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.is_unused() && slot.size() >= size)
        {
            self.slots[index].refs += 1;
            return Ok(SlotId(index));
        }

        let index = if self.slots.len() < max_stacks {
            self.slots.push(StackSlot::new(size));
            self.slots.len() - 1
        } else {
            let mut chosen: Option<usize> = None;
            for (index, slot) in self.slots.iter().enumerate() {
                if slot.size() < size {
                    continue;
                }
                match chosen {
                    Some(c) if self.slots[c].refs <= slot.refs => (),
                    _ => chosen = Some(index),
                }
            }
            chosen.ok_or(ResourceError::StackTooLarge(size))?
        };
        self.slots[index].refs += 1;
        Ok(SlotId(index))
    }

    fn live_contexts(&mut self) -> Vec<Arc<FiberContext>> {
        self.contexts.retain(|ctx| ctx.strong_count() > 0);
        self.contexts.iter().filter_map(|ctx| ctx.upgrade()).collect()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub slots: usize,
    pub capacity: usize,
    pub mapped_bytes: usize,
    pub leased_slots: usize,
    pub total_refs: usize,
    pub contexts: usize,
}

pub struct StackPool {
    max_stacks: usize,
    verbose: bool,
    inner: SpinLock<PoolInner>,
}

impl StackPool {
    pub fn new(max_stacks: usize, verbose: bool) -> Self {
        Self {
            max_stacks: max_stacks.max(1),
            verbose,
            inner: SpinLock::new(PoolInner {
                slots: vec![],
                contexts: vec![],
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_stacks
    }

    /// Number of slots currently mapped.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lease a slot of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<SlotId> {
        self.inner.lock().allocate(self.max_stacks, size)
    }

    pub fn slot_refs(&self, id: SlotId) -> usize {
        self.inner.lock().slot_mut(id).refs
    }

    pub fn new_context(&self, engine: u32, stack_size: usize, root: bool) -> Arc<FiberContext> {
        let ctx = Arc::new(FiberContext::new(engine, stack_size, root));
        self.inner.lock().contexts.push(Arc::downgrade(&ctx));
        ctx
    }

    pub fn remove_context(&self, ctx: &FiberContext) {
        self.inner.lock().contexts.retain(|other| match other.upgrade() {
            Some(other) => other.id() != ctx.id(),
            None => false,
        });
    }

    /// Every registered context that is still referenced.
    pub fn contexts(&self) -> Vec<Arc<FiberContext>> {
        self.inner.lock().live_contexts()
    }

    /// Return the slot leased by `ctx` to the pool. The slot becomes reusable once nobody
    /// references it.
    pub fn release(&self, ctx: &FiberContext) {
        let mut inner = self.inner.lock();
        let mut image = ctx.image.lock();
        let id = match image.slot {
            Some(id) => id,
            None => return,
        };
        let slot = inner.slot_mut(id);
        let owned = match slot.user.as_ref() {
            Some(user) => user.upgrade().map(|u| u.id() == ctx.id()).unwrap_or(true),
            None => false,
        };
        if owned {
            slot.user = None;
        }
        if slot.refs == 0 {
            bug("fiber stack slot released more often than leased");
        }
        slot.refs -= 1;
        image.unbind();
    }

    /// Make `ctx` the running user of its slot, leasing one on first activation. The live
    /// image of the slot's previous user is flushed to its heap copy first.
    pub fn activate(&self, ctx: &Arc<FiberContext>) -> Result<()> {
        if ctx.is_root() {
            return Ok(());
        }
        if ctx.is_dead() {
            return Err(FiberError::Dead.into());
        }
        let mut inner = self.inner.lock();
        let mut image = ctx.image.lock();
        let id = match image.slot {
            Some(id) => id,
            None => {
                let id = inner.allocate(self.max_stacks, ctx.stack_size())?;
                let slot = inner.slot_mut(id);
                image.bind(id, slot.base(), slot.size());
                logln_if!(
                    self.verbose,
                    "[comet-rt] fiber context {} leased stack slot {} ({} refs)",
                    ctx.id(),
                    id.0,
                    slot.refs
                );
                id
            }
        };
        let slot = inner.slot_mut(id);
        match slot.user() {
            Some(user) if user.id() == ctx.id() => (),
            Some(previous) => {
                if !previous.is_dead() {
                    previous.image.lock().copy_to_heap(slot);
                    logln_if!(
                        self.verbose,
                        "[comet-rt] flushed fiber context {} out of stack slot {}",
                        previous.id(),
                        id.0
                    );
                }
            }
            None => (),
        }
        image.copy_from_heap(slot);
        slot.user = Some(Arc::downgrade(ctx));
        Ok(())
    }

    /// Record an object reference word on the stack of `ctx`.
    pub fn push_root(&self, ctx: &FiberContext, word: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut image = ctx.image.lock();
        image.push(&mut inner.slots, word)
    }

    pub fn pop_root(&self, ctx: &FiberContext) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut image = ctx.image.lock();
        image.pop(&mut inner.slots)
    }

    pub fn enter_frame(&self, ctx: &FiberContext) {
        ctx.image.lock().enter_frame();
    }

    pub fn leave_frame(&self, ctx: &FiberContext) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut image = ctx.image.lock();
        image.leave_frame(&mut inner.slots)
    }

    /// Read back the root words of `ctx`, innermost first, through its displacement.
    pub fn root_words(&self, ctx: &FiberContext) -> Vec<usize> {
        let inner = self.inner.lock();
        let image = ctx.image.lock();
        image
            .live_range()
            .step_by(crate::fiber_context::WORD)
            .map(|addr| image.read_word(&inner.slots, addr))
            .collect()
    }

    pub fn gc_clear_mark(&self) {
        for ctx in self.inner.lock().live_contexts() {
            ctx.clear_mark();
        }
    }

    /// Mark every context whose fiber is still reachable. Returns the marked count.
    pub fn mark_live(&self) -> usize {
        let mut marked = 0;
        for ctx in self.inner.lock().live_contexts() {
            if !ctx.is_dead() && ctx.owner_alive() {
                ctx.set_mark();
                marked += 1;
            }
        }
        marked
    }

    /// Visit the object references recorded on every live context stack. With
    /// `marked_only` set, contexts that failed the liveness mark are declared dead and
    /// skipped. Returns the number of contexts scanned.
    pub fn gc_scan(&self, visitor: &mut dyn VisitorTrait, marked_only: bool) -> usize {
        let mut inner = self.inner.lock();
        let contexts = inner.live_contexts();
        let mut scanned = 0;
        for ctx in contexts.iter() {
            if ctx.is_dead() {
                continue;
            }
            if marked_only && !ctx.is_marked() {
                ctx.declare_dead();
                continue;
            }
            let image = ctx.image.lock();
            image.each_object(&inner.slots, &mut |object| visitor.visit(object));
            scanned += 1;
        }
        scanned
    }

    /// Kill every registered context. Used when the runtime is torn down.
    pub fn die(&self) {
        let contexts = self.inner.lock().live_contexts();
        for ctx in contexts {
            ctx.die();
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let mut inner = self.inner.lock();
        let contexts = inner.live_contexts().len();
        PoolStatistics {
            slots: inner.slots.len(),
            capacity: self.max_stacks,
            mapped_bytes: inner.slots.iter().map(|s| s.size()).sum(),
            leased_slots: inner.slots.iter().filter(|s| !s.is_unused()).count(),
            total_refs: inner.slots.iter().map(|s| s.refs).sum(),
            contexts,
        }
    }
}
