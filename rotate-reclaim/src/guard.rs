use std::rc::Rc;

use crate::{
    collector::{self, Collector, Local},
    epoch::Epoch,
    retired::Retired,
};

/// A critical section on one thread.
///
/// While a guard is alive, nothing retired after it was created is freed.
/// Dropping the last guard of a thread leaves the critical section.
pub struct Guard {
    local: Rc<Local>,
}

impl Guard {
    pub(crate) fn new(local: Rc<Local>) -> Self {
        Guard { local }
    }

    /// Hands an unlinked object to the collector, which frees it once every
    /// thread has left the critical sections that could still observe it.
    pub fn retire(&self, retired: Retired) {
        self.local.retire(retired);
    }

    /// Runs a reclamation pass for this thread's garbage.
    pub fn flush(&self) -> usize {
        self.local.collect()
    }

    /// The epoch published by this thread's slot.
    pub fn epoch(&self) -> Epoch {
        self.local.epoch()
    }

    /// Whether this guard protects memory managed by `collector`.
    pub fn is_pinned_by(&self, collector: &Collector) -> bool {
        collector.owns(&self.local)
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.local.unpin() {
            collector::unbind(&self.local);
        }
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("epoch", &self.epoch().value())
            .finish()
    }
}
