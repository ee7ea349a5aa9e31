use parking_lot::MutexGuard;

use crate::{
    heap::{Heap, ObjectSpace},
    value::ObjectRef,
    visitor::VisitorTrait,
};

/// Greys every object it visits. Holds the object space locked for its lifetime.
pub struct MarkingVisitor<'a> {
    space: MutexGuard<'a, ObjectSpace>,
    visited: usize,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) fn new(space: MutexGuard<'a, ObjectSpace>) -> Self {
        Self { space, visited: 0 }
    }

    /// Objects newly greyed by this visitor.
    pub fn visited(&self) -> usize {
        self.visited
    }

    pub fn drain(&mut self) {
        while !self.space.process_mark_stack(usize::MAX) {}
    }
}

impl<'a> VisitorTrait for MarkingVisitor<'a> {
    fn visit(&mut self, object: ObjectRef) {
        if self.space.grey(object) {
            self.visited += 1;
        }
    }
}

/// Runs a whole mark from the roots supplied by `roots` without yielding.
pub struct SynchronousMarking<'a> {
    heap: &'a Heap,
}

impl<'a> SynchronousMarking<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap }
    }

    pub fn run(&mut self, roots: impl FnOnce(&mut dyn VisitorTrait)) -> usize {
        self.heap.start_marking();
        let mut vis = self.heap.marking_visitor();
        roots(&mut vis);
        vis.drain();
        vis.visited()
    }
}
