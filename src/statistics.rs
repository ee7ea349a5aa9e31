pub struct RuntimeStatistics {
    pub engines: usize,
    pub live_engines: usize,
    pub fiber_contexts: usize,
    pub stack_slots: usize,
    pub stack_capacity: usize,
    pub stack_memory: usize,
    pub leased_slots: usize,
    pub live_objects: usize,
    pub total_objects_allocated: usize,
    pub total_objects_swept: usize,
    pub total_gc_cycles_count: usize,
    pub gc_threshold: usize,
    pub marking: bool,
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for RuntimeStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Runtime statistics:")?;
        writeln!(
            f,
            "  Engines: {} ({} running)",
            self.engines, self.live_engines
        )?;
        writeln!(f, "  Fiber contexts: {}", self.fiber_contexts)?;
        writeln!(
            f,
            "  Stack slots: {} of {} ({} leased)",
            self.stack_slots, self.stack_capacity, self.leased_slots
        )?;
        writeln!(
            f,
            "  Memory mapped for fiber stacks: {}",
            formatted_size(self.stack_memory)
        )?;
        writeln!(f, "  Live objects: {}", self.live_objects)?;
        writeln!(
            f,
            "  Total objects allocated: {}",
            self.total_objects_allocated
        )?;
        writeln!(
            f,
            "  Total objects swept: {} ({:.2}%)",
            self.total_objects_swept,
            if self.total_objects_allocated == 0 {
                0.0
            } else {
                (self.total_objects_swept as f64 / self.total_objects_allocated as f64) * 100.0
            }
        )?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(f, "  GC threshold: {} objects", self.gc_threshold)?;
        if self.marking {
            writeln!(f, "  Marking in progress")?;
        }
        Ok(())
    }
}
