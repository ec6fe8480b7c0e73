use std::{
    alloc::{self, Layout},
    ptr,
    sync::atomic::{self, AtomicBool, AtomicPtr, AtomicUsize, Ordering::*},
};

use crossbeam::utils::CachePadded;

use crate::epoch::{AtomicEpoch, Epoch};

/// Per-thread reclamation bookkeeping.
///
/// A slot is owned by at most one live thread at a time. It is never unlinked
/// from its registry; when its thread terminates the slot is released and the
/// next thread that needs one claims it again.
#[derive(Debug)]
pub struct ThreadSlot {
    id: usize,
    owned: AtomicBool,
    epoch: AtomicEpoch,
}

impl ThreadSlot {
    fn new(id: usize) -> Self {
        ThreadSlot {
            id,
            owned: AtomicBool::new(true),
            epoch: AtomicEpoch::new(Epoch::starting()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_owned(&self) -> bool {
        self.owned.load(Acquire)
    }

    /// The epoch this slot published, with the pinned flag set while its
    /// thread is inside a critical section.
    pub fn epoch(&self) -> Epoch {
        self.epoch.load(SeqCst)
    }

    fn try_claim(&self) -> bool {
        !self.owned.swap(true, Acquire)
    }

    pub(crate) fn pin(&self, global: Epoch) {
        self.epoch.store(global.pinned(), Relaxed);
        atomic::fence(SeqCst);
    }

    pub(crate) fn unpin(&self) {
        let current = self.epoch.load(Relaxed);
        self.epoch.store(current.unpinned(), Release);
    }

    fn release(&self) {
        self.unpin();
        self.owned.store(false, Release);
    }
}

struct SlotNode {
    slot: ThreadSlot,
    next: *const CachePadded<SlotNode>,
}

/// Lock-free list of reusable thread slots.
pub struct Registry {
    head: AtomicPtr<CachePadded<SlotNode>>,
    next_id: AtomicUsize,
    active: AtomicUsize,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    pub fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
            next_id: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Claims a free slot for the calling thread, allocating a new one only
    /// when every existing slot is owned.
    ///
    /// The returned slot stays valid for the lifetime of the registry.
    pub fn acquire(&self) -> &ThreadSlot {
        let slot = match self.iter().find(|slot| slot.try_claim()) {
            Some(slot) => {
                tracing::trace!(slot = slot.id(), "reclaimed thread slot");
                slot
            }
            None => self.push_new(),
        };
        self.active.fetch_add(1, Relaxed);
        slot
    }

    /// Releases a slot obtained from [`Registry::acquire`] so a later thread
    /// can claim it.
    pub fn release(&self, slot: &ThreadSlot) {
        assert!(slot.is_owned(), "thread slot {} released twice", slot.id());
        slot.release();
        self.active.fetch_sub(1, Relaxed);
        tracing::trace!(slot = slot.id(), "released thread slot");
    }

    fn push_new(&self) -> &ThreadSlot {
        let layout = Layout::new::<CachePadded<SlotNode>>();
        let id = self.next_id.fetch_add(1, Relaxed);

        let node = unsafe { alloc::alloc(layout) as *mut CachePadded<SlotNode> };
        if node.is_null() {
            tracing::error!(slot = id, size = layout.size(), "failed to allocate thread slot");
            alloc::handle_alloc_error(layout);
        }

        unsafe {
            ptr::write(
                node,
                CachePadded::new(SlotNode {
                    slot: ThreadSlot::new(id),
                    next: ptr::null(),
                }),
            );
        }

        let mut head = self.head.load(Acquire);
        loop {
            unsafe { (&mut *node).next = head };
            match self.head.compare_exchange_weak(head, node, AcqRel, Acquire) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }

        tracing::debug!(slot = id, "allocated thread slot");
        unsafe { &(&*node).slot }
    }

    /// Number of slots ever created. Bounded by the peak number of threads
    /// holding a slot at the same time.
    pub fn len(&self) -> usize {
        self.next_id.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots currently owned by live threads.
    pub fn active(&self) -> usize {
        self.active.load(Relaxed)
    }

    pub fn iter(&self) -> Slots<'_> {
        Slots {
            cur: self.head.load(Acquire),
            _registry: self,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let layout = Layout::new::<CachePadded<SlotNode>>();
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            unsafe {
                let next = (&*cur).next as *mut CachePadded<SlotNode>;
                ptr::drop_in_place(cur);
                alloc::dealloc(cur as *mut u8, layout);
                cur = next;
            }
        }
    }
}

pub struct Slots<'a> {
    cur: *const CachePadded<SlotNode>,
    _registry: &'a Registry,
}

impl<'a> Iterator for Slots<'a> {
    type Item = &'a ThreadSlot;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }

        // Nodes are only freed when the registry itself is dropped.
        let node: &'a SlotNode = unsafe { &*self.cur };
        self.cur = node.next;
        Some(&node.slot)
    }
}
