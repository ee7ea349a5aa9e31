//! Object space traversed by the collector.
//!
//! Objects are ordered field vectors addressed by [ObjectRef]. The heap tracks the flags the
//! incremental marker polls between steps and implements the incremental-update write
//! barrier: while a mark is in progress stored references are greyed and new objects are
//! allocated black.
use std::sync::atomic::{AtomicBool, AtomicUsize};

use atomic::Ordering;
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    marking::MarkingVisitor,
    value::{ObjectRef, Value},
};

pub struct HeapObject {
    pub(crate) fields: Vec<Value>,
    pub(crate) marked: bool,
}

pub(crate) struct ObjectSpace {
    pub(crate) objects: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    pub(crate) mark_stack: Vec<ObjectRef>,
    live: usize,
}

impl ObjectSpace {
    /// Mark `object` and queue it for tracing. Returns false if it was already marked.
    pub(crate) fn grey(&mut self, object: ObjectRef) -> bool {
        match self.objects.get_mut(object.index()) {
            Some(Some(obj)) if !obj.marked => {
                obj.marked = true;
                self.mark_stack.push(object);
                true
            }
            _ => false,
        }
    }

    fn get(&self, object: ObjectRef) -> Result<&HeapObject> {
        match self.objects.get(object.index()) {
            Some(Some(obj)) => Ok(obj),
            _ => Err(Error::Argument(format!("invalid object reference {}", object.0))),
        }
    }

    /// Trace up to `step` grey objects. Returns true once the mark stack is empty.
    pub(crate) fn process_mark_stack(&mut self, step: usize) -> bool {
        let mut children = vec![];
        for _ in 0..step {
            let object = match self.mark_stack.pop() {
                Some(object) => object,
                None => return true,
            };
            if let Some(Some(obj)) = self.objects.get(object.index()) {
                for field in obj.fields.iter() {
                    field.each_object(&mut |child| children.push(child));
                }
            }
            for child in children.drain(..) {
                self.grey(child);
            }
        }
        self.mark_stack.is_empty()
    }
}

pub struct Heap {
    space: Mutex<ObjectSpace>,
    collect_full: AtomicBool,
    collect_young: AtomicBool,
    interrupt: AtomicBool,
    mark_in_progress: AtomicBool,
    total_allocated: AtomicUsize,
    total_swept: AtomicUsize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            space: Mutex::new(ObjectSpace {
                objects: vec![],
                free: vec![],
                mark_stack: vec![],
                live: 0,
            }),
            collect_full: AtomicBool::new(false),
            collect_young: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            mark_in_progress: AtomicBool::new(false),
            total_allocated: AtomicUsize::new(0),
            total_swept: AtomicUsize::new(0),
        }
    }

    pub fn allocate(&self, fields: Vec<Value>) -> ObjectRef {
        let mut space = self.space.lock();
        let object = HeapObject {
            fields,
            marked: self.is_marking(),
        };
        let object_ref = match space.free.pop() {
            Some(index) => {
                space.objects[index as usize] = Some(object);
                ObjectRef(index)
            }
            None => {
                space.objects.push(Some(object));
                ObjectRef((space.objects.len() - 1) as u32)
            }
        };
        space.live += 1;
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        object_ref
    }

    pub fn contains(&self, object: ObjectRef) -> bool {
        self.space.lock().get(object).is_ok()
    }

    pub fn is_marked(&self, object: ObjectRef) -> bool {
        self.space
            .lock()
            .get(object)
            .map(|obj| obj.marked)
            .unwrap_or(false)
    }

    pub fn field(&self, object: ObjectRef, index: usize) -> Result<Value> {
        let space = self.space.lock();
        let obj = space.get(object)?;
        obj.fields
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Argument(format!("field index {} out of range", index)))
    }

    pub fn fields(&self, object: ObjectRef) -> Result<Vec<Value>> {
        Ok(self.space.lock().get(object)?.fields.clone())
    }

    /// Store into a field, growing the object if needed.
    pub fn set_field(&self, object: ObjectRef, index: usize, value: Value) -> Result<()> {
        let mut space = self.space.lock();
        space.get(object)?;
        if self.is_marking() {
            let mut stored = vec![];
            value.each_object(&mut |child| stored.push(child));
            for child in stored {
                space.grey(child);
            }
        }
        if let Some(Some(obj)) = space.objects.get_mut(object.index()) {
            if obj.fields.len() <= index {
                obj.fields.resize(index + 1, Value::Nil);
            }
            obj.fields[index] = value;
        }
        Ok(())
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.space.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub fn total_swept(&self) -> usize {
        self.total_swept.load(Ordering::Relaxed)
    }

    /// Clear every mark and start a marking cycle. Roots are pushed by the caller.
    pub(crate) fn start_marking(&self) {
        let mut space = self.space.lock();
        for obj in space.objects.iter_mut().flatten() {
            obj.marked = false;
        }
        space.mark_stack.clear();
        self.mark_in_progress.store(true, Ordering::Release);
    }

    pub fn marking_visitor(&self) -> MarkingVisitor<'_> {
        MarkingVisitor::new(self.space.lock())
    }

    /// Trace at most `step` objects. Returns true when the mark stack drained.
    pub fn process_mark_stack(&self, step: usize) -> bool {
        self.space.lock().process_mark_stack(step)
    }

    pub fn mark_stack_len(&self) -> usize {
        self.space.lock().mark_stack.len()
    }

    /// Free every unmarked object and finish the marking cycle. Returns the freed count.
    pub(crate) fn sweep(&self) -> usize {
        let mut space = self.space.lock();
        let mut freed = vec![];
        for (index, slot) in space.objects.iter_mut().enumerate() {
            let dead = matches!(slot, Some(obj) if !obj.marked);
            if dead {
                *slot = None;
                freed.push(index as u32);
            }
        }
        space.live -= freed.len();
        let count = freed.len();
        space.free.extend(freed);
        space.mark_stack.clear();
        self.mark_in_progress.store(false, Ordering::Release);
        self.total_swept.fetch_add(count, Ordering::Relaxed);
        count
    }

    /// Drop marking state left over from another process image.
    pub(crate) fn discard_marking(&self) {
        let mut space = self.space.lock();
        space.mark_stack.clear();
        for obj in space.objects.iter_mut().flatten() {
            obj.marked = false;
        }
        self.mark_in_progress.store(false, Ordering::Release);
        self.collect_full.store(false, Ordering::Release);
        self.collect_young.store(false, Ordering::Release);
        self.interrupt.store(false, Ordering::Release);
    }

    pub fn is_marking(&self) -> bool {
        self.mark_in_progress.load(Ordering::Acquire)
    }

    pub fn collect_full_requested(&self) -> bool {
        self.collect_full.load(Ordering::Acquire)
    }

    pub fn collect_young_requested(&self) -> bool {
        self.collect_young.load(Ordering::Acquire)
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub(crate) fn set_collect_full(&self, value: bool) {
        self.collect_full.store(value, Ordering::Release);
    }

    pub(crate) fn set_collect_young(&self, value: bool) {
        self.collect_young.store(value, Ordering::Release);
    }

    /// Ask the marker to step aside at its next check.
    pub fn set_interrupt(&self, value: bool) {
        self.interrupt.store(value, Ordering::Release);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
