use std::{
    cell::{Cell, RefCell},
    mem,
    ptr::NonNull,
    rc::Rc,
    sync::{
        Arc, OnceLock,
        atomic::{self, AtomicUsize, Ordering::*},
    },
};

use crossbeam::queue::SegQueue;

use crate::{
    epoch::{AtomicEpoch, Epoch},
    guard::Guard,
    registry::{Registry, ThreadSlot},
    retired::Retired,
};

/// Number of retirements on one thread between two reclamation passes.
pub const RECLAIM_THRESHOLD: usize = 64;

pub(crate) struct Global {
    registry: Registry,
    epoch: AtomicEpoch,
    /// Garbage left behind by threads that exited before it could be freed.
    orphans: SegQueue<Retired>,
    orphaned: AtomicUsize,
    retired: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl Global {
    fn new() -> Self {
        Global {
            registry: Registry::new(),
            epoch: AtomicEpoch::new(Epoch::starting()),
            orphans: SegQueue::new(),
            orphaned: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
        }
    }

    /// Advances the global epoch and frees every entry of `bag` (and of the
    /// orphan queue) retired before the oldest epoch still pinned by a thread.
    fn collect(&self, bag: &mut Vec<Retired>) -> usize {
        let current = self.epoch.advance(SeqCst);
        atomic::fence(SeqCst);

        let horizon = self
            .registry
            .iter()
            .map(ThreadSlot::epoch)
            .filter(|epoch| epoch.is_pinned())
            .map(Epoch::unpinned)
            .min_by_key(|epoch| epoch.value())
            .unwrap_or(current);

        let mut ready = Vec::new();
        let mut pending = Vec::with_capacity(bag.len());
        for r in bag.drain(..) {
            if r.epoch().precedes(horizon) {
                ready.push(r);
            } else {
                pending.push(r);
            }
        }
        *bag = pending;

        let mut orphans = Vec::new();
        for _ in 0..self.orphans.len() {
            let Some(r) = self.orphans.pop() else {
                break;
            };
            self.orphaned.fetch_sub(1, Relaxed);
            if r.epoch().precedes(horizon) {
                ready.push(r);
            } else {
                orphans.push(r);
            }
        }
        for r in orphans {
            self.adopt(r);
        }

        let freed = ready.len();
        for r in ready {
            unsafe { r.destroy() };
        }
        self.reclaimed.fetch_add(freed, SeqCst);

        if freed > 0 {
            tracing::debug!(
                epoch = current.value(),
                horizon = horizon.value(),
                freed,
                pending = bag.len(),
                "reclaimed retired objects"
            );
        }
        freed
    }
}

impl Global {
    fn adopt(&self, retired: Retired) {
        self.orphans.push(retired);
        self.orphaned.fetch_add(1, Relaxed);
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        // Every thread binding holds a strong reference, so nobody is pinned.
        let mut freed = 0;
        while let Some(r) = self.orphans.pop() {
            unsafe { r.destroy() };
            freed += 1;
        }
        if freed > 0 {
            tracing::debug!(freed, "freed orphaned objects on collector shutdown");
        }
    }
}

/// A thread's binding to one collector: its claimed slot, its reentrant pin
/// depth and its private bag of retired objects.
pub(crate) struct Local {
    global: Arc<Global>,
    slot: NonNull<ThreadSlot>,
    guard_count: Cell<usize>,
    since_collect: Cell<usize>,
    /// Unbind once the last guard drops.
    released: Cell<bool>,
    bag: RefCell<Vec<Retired>>,
}

impl Local {
    fn new(global: Arc<Global>) -> Rc<Self> {
        let slot = NonNull::from(global.registry.acquire());
        Rc::new(Local {
            global,
            slot,
            guard_count: Cell::new(0),
            since_collect: Cell::new(0),
            released: Cell::new(false),
            bag: RefCell::new(Vec::new()),
        })
    }

    fn slot(&self) -> &ThreadSlot {
        // The slot list lives as long as `self.global`.
        unsafe { self.slot.as_ref() }
    }

    pub(crate) fn pin(self: &Rc<Self>) -> Guard {
        let count = self.guard_count.get();
        self.guard_count.set(count + 1);
        if count == 0 {
            let global = self.global.epoch.load(SeqCst);
            self.slot().pin(global);
        }
        Guard::new(self.clone())
    }

    /// Leaves one level of the critical section. Returns `true` when the
    /// binding was released and no guard uses it anymore.
    pub(crate) fn unpin(&self) -> bool {
        let count = self.guard_count.get();
        debug_assert!(count > 0, "unpin without a matching pin");
        self.guard_count.set(count - 1);
        if count != 1 {
            return false;
        }
        self.slot().unpin();

        // Garbage of exited threads is otherwise only collected when a
        // living thread fills its own bag.
        if self.global.orphaned.load(Relaxed) >= RECLAIM_THRESHOLD {
            self.collect();
        }
        self.released.get()
    }

    pub(crate) fn epoch(&self) -> Epoch {
        self.slot().epoch()
    }

    pub(crate) fn slot_id(&self) -> usize {
        self.slot().id()
    }

    pub(crate) fn is_bound_to(&self, global: &Arc<Global>) -> bool {
        Arc::ptr_eq(&self.global, global)
    }

    pub(crate) fn retire(&self, mut retired: Retired) {
        retired.stamp(self.global.epoch.load(SeqCst));
        self.bag.borrow_mut().push(retired);
        self.global.retired.fetch_add(1, Relaxed);

        let since = self.since_collect.get() + 1;
        if since >= RECLAIM_THRESHOLD {
            self.collect();
        } else {
            self.since_collect.set(since);
        }
    }

    pub(crate) fn collect(&self) -> usize {
        self.since_collect.set(0);
        // Destructors may retire more objects, so the bag is not borrowed
        // while they run.
        let mut bag = mem::take(&mut *self.bag.borrow_mut());
        let freed = self.global.collect(&mut bag);
        self.bag.borrow_mut().append(&mut bag);
        freed
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        // Nobody holds a guard of this binding anymore, so the thread is not
        // pinned and its own garbage may already be collectable.
        let mut bag = mem::take(self.bag.get_mut());
        if !bag.is_empty() {
            self.global.collect(&mut bag);
        }
        if !bag.is_empty() {
            tracing::trace!(
                slot = self.slot().id(),
                pending = bag.len(),
                "moving garbage of exiting thread to orphans"
            );
        }
        for r in bag {
            self.global.adopt(r);
        }
        self.global.registry.release(self.slot());
    }
}

thread_local! {
    static BINDINGS: RefCell<Vec<Rc<Local>>> = const { RefCell::new(Vec::new()) };
}

/// Entry point to the reclamation engine.
///
/// A collector owns a thread registry and a global epoch. Every data
/// structure sharing a collector shares its critical sections; cloning the
/// handle is cheap.
#[derive(Clone)]
pub struct Collector {
    global: Arc<Global>,
}

impl Collector {
    pub fn new() -> Self {
        Collector {
            global: Arc::new(Global::new()),
        }
    }

    /// Enters a critical section on the calling thread.
    ///
    /// Shared memory reached while the guard is alive is not freed before
    /// the guard is dropped. Guards nest.
    pub fn pin(&self) -> Guard {
        self.local().pin()
    }

    /// Binds the calling thread to a slot if it has none yet and returns the
    /// slot id. Meant as a thread start hook; [`Collector::pin`] binds lazily
    /// otherwise.
    pub fn register(&self) -> usize {
        self.local().slot_id()
    }

    /// Drops the calling thread's binding so its slot can be reused. Runs
    /// automatically when the thread exits.
    ///
    /// A binding still used by a live guard keeps serving this thread, and is
    /// released once its last guard drops.
    pub fn release(&self) {
        let removed = BINDINGS
            .try_with(|bindings| {
                let mut bindings = bindings.borrow_mut();
                let idx = bindings
                    .iter()
                    .position(|local| local.is_bound_to(&self.global))?;
                if bindings[idx].guard_count.get() > 0 {
                    bindings[idx].released.set(true);
                    None
                } else {
                    Some(bindings.swap_remove(idx))
                }
            })
            .ok()
            .flatten();
        drop(removed);
    }

    /// Runs a reclamation pass from the calling thread and returns how many
    /// objects were freed.
    pub fn flush(&self) -> usize {
        self.local().collect()
    }

    pub fn epoch(&self) -> Epoch {
        self.global.epoch.load(SeqCst)
    }

    pub fn registry(&self) -> &Registry {
        &self.global.registry
    }

    /// Total number of objects retired through this collector.
    pub fn retired_count(&self) -> usize {
        self.global.retired.load(SeqCst)
    }

    /// Total number of retired objects already freed.
    pub fn reclaimed_count(&self) -> usize {
        self.global.reclaimed.load(SeqCst)
    }

    pub fn ptr_eq(&self, other: &Collector) -> bool {
        Arc::ptr_eq(&self.global, &other.global)
    }

    pub(crate) fn owns(&self, local: &Local) -> bool {
        local.is_bound_to(&self.global)
    }

    fn local(&self) -> Rc<Local> {
        let mut stale = Vec::new();
        let local = BINDINGS.try_with(|bindings| {
            let mut bindings = bindings.borrow_mut();

            // Bindings whose collector is gone everywhere else only keep a
            // slot alive for nothing.
            let mut i = 0;
            while i < bindings.len() {
                let local = &bindings[i];
                if !local.is_bound_to(&self.global)
                    && Arc::strong_count(&local.global) == 1
                    && Rc::strong_count(local) == 1
                {
                    stale.push(bindings.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            match bindings.iter().find(|l| l.is_bound_to(&self.global)) {
                Some(local) => local.clone(),
                None => {
                    let local = Local::new(self.global.clone());
                    tracing::trace!(slot = local.slot_id(), "bound thread to slot");
                    bindings.push(local.clone());
                    local
                }
            }
        });
        drop(stale);

        // Thread-local storage is already torn down: use a binding that lives
        // only as long as the guards built from it.
        local.unwrap_or_else(|_| Local::new(self.global.clone()))
    }
}

/// Removes a released binding from the calling thread once its last guard
/// is gone.
pub(crate) fn unbind(local: &Rc<Local>) {
    let removed = BINDINGS
        .try_with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            bindings
                .iter()
                .position(|l| Rc::ptr_eq(l, local))
                .map(|idx| bindings.swap_remove(idx))
        })
        .ok()
        .flatten();
    drop(removed);
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("epoch", &self.epoch().value())
            .field("slots", &self.registry().len())
            .field("retired", &self.retired_count())
            .field("reclaimed", &self.reclaimed_count())
            .finish()
    }
}

/// The process-wide collector, built on first use.
pub fn default_collector() -> &'static Collector {
    static COLLECTOR: OnceLock<Collector> = OnceLock::new();
    COLLECTOR.get_or_init(Collector::new)
}
