use std::{
    alloc::{self, Layout},
    ops::{Deref, Index},
    ptr::{self, NonNull, addr_of_mut},
    sync::atomic::{AtomicU8, Ordering::*},
};

use crate::{
    error::{Error, Result},
    marked_ptr::AtomicMarkedPtr,
    options::MAX_HEIGHT,
};

pub(crate) type Link<K, V> = AtomicMarkedPtr<Node<K, V>>;

// Lifecycle of a node's memory.
const LIVE: u8 = 0;
const RETIRED: u8 = 1;
const FREED: u8 = 2;

/// The inserter stopped linking the tower.
pub(crate) const BUILT: u8 = 0b01;
/// The remover finished its unlink pass.
pub(crate) const UNLINKED: u8 = 0b10;

/// Forward links of a node, one per level. The actual number of links is the
/// node's height and lives right after the header.
#[repr(C)]
pub(crate) struct Tower<K, V> {
    links: [Link<K, V>; 0],
}

impl<K, V> Index<usize> for Tower<K, V> {
    type Output = Link<K, V>;

    fn index(&self, level: usize) -> &Link<K, V> {
        // Callers only index below the height of the owning node.
        unsafe { &*self.links.as_ptr().add(level) }
    }
}

/// The sentinel in front of every level.
#[repr(C)]
pub(crate) struct Head<K, V> {
    links: [Link<K, V>; MAX_HEIGHT],
}

impl<K, V> Head<K, V> {
    pub(crate) fn new() -> Self {
        Head {
            links: std::array::from_fn(|_| Link::null()),
        }
    }
}

impl<K, V> Deref for Head<K, V> {
    type Target = Tower<K, V>;

    fn deref(&self) -> &Tower<K, V> {
        unsafe { &*(self as *const Self as *const Tower<K, V>) }
    }
}

#[repr(C)]
pub(crate) struct Node<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    height: usize,
    state: AtomicU8,
    link_state: AtomicU8,
    // Must stay last: the links are allocated past the end of the struct.
    pub(crate) tower: Tower<K, V>,
}

impl<K, V> Node<K, V> {
    fn layout(height: usize) -> Result<Layout> {
        assert!((1..=MAX_HEIGHT).contains(&height), "invalid tower height {height}");
        Layout::new::<Self>()
            .extend(Layout::array::<Link<K, V>>(height).map_err(|_| Error::ResourceExhausted {
                size: usize::MAX,
            })?)
            .map(|(layout, _)| layout.pad_to_align())
            .map_err(|_| Error::ResourceExhausted { size: usize::MAX })
    }

    /// Allocates a node with `height` null links.
    pub(crate) fn alloc(key: K, value: V, height: usize) -> Result<NonNull<Self>> {
        let layout = Self::layout(height)?;
        unsafe {
            let p = alloc::alloc(layout) as *mut Self;
            let Some(p) = NonNull::new(p) else {
                tracing::error!(size = layout.size(), height, "failed to allocate node");
                return Err(Error::ResourceExhausted {
                    size: layout.size(),
                });
            };

            let node = p.as_ptr();
            ptr::write(addr_of_mut!((*node).key), key);
            ptr::write(addr_of_mut!((*node).value), value);
            ptr::write(addr_of_mut!((*node).height), height);
            ptr::write(addr_of_mut!((*node).state), AtomicU8::new(LIVE));
            ptr::write(addr_of_mut!((*node).link_state), AtomicU8::new(0));
            ptr::write_bytes(
                addr_of_mut!((*node).tower) as *mut Link<K, V>,
                0,
                height,
            );
            Ok(p)
        }
    }

    /// Drops the key and value and releases the memory.
    ///
    /// # Safety
    ///
    /// `ptr` comes from [`Node::alloc`] and nobody else can reach it.
    pub(crate) unsafe fn dealloc(ptr: *mut Self) {
        unsafe {
            let height = (*ptr).height;
            ptr::drop_in_place(addr_of_mut!((*ptr).key));
            ptr::drop_in_place(addr_of_mut!((*ptr).value));
            let layout = Self::layout(height).expect("layout was valid at allocation");
            alloc::dealloc(ptr as *mut u8, layout);
        }
    }

    /// Destructor handed to the collector together with a retired node.
    ///
    /// # Safety
    ///
    /// Only the collector calls this, once no thread can reach the node.
    pub(crate) unsafe fn destroy(ptr: *mut ()) {
        let node = ptr as *mut Self;
        unsafe {
            let prev = (*node).state.swap(FREED, SeqCst);
            assert_eq!(prev, RETIRED, "node freed without being retired");
            Self::dealloc(node);
        }
    }

    pub(crate) fn height(&self) -> usize {
        self.height
    }

    /// Whether the node has been logically deleted.
    pub(crate) fn is_removed(&self) -> bool {
        self.tower[0].load(SeqCst).is_marked()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state.load(SeqCst) != LIVE
    }

    /// Marks every level from the top down. Returns `true` if this call set
    /// the level 0 mark, i.e. performed the logical deletion.
    pub(crate) fn mark_tower(&self) -> bool {
        for level in (1..self.height).rev() {
            self.tower[level].mark(SeqCst);
        }
        !self.tower[0].mark(SeqCst).is_marked()
    }

    /// Records that the inserter (`BUILT`) or the remover (`UNLINKED`) is done
    /// with the tower. Returns `true` for the party that finishes second,
    /// which owns the final unlink and the retirement.
    pub(crate) fn finish(&self, flag: u8) -> bool {
        let prev = self.link_state.fetch_or(flag, SeqCst);
        debug_assert_eq!(prev & flag, 0, "link state {flag:#b} set twice");
        prev | flag == BUILT | UNLINKED
    }

    pub(crate) fn mark_retired(&self) {
        if let Err(state) = self.state.compare_exchange(LIVE, RETIRED, SeqCst, SeqCst) {
            panic!("node retired twice (state {state})");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering::SeqCst},
    };

    use crate::marked_ptr::MarkedPtr;

    use super::{BUILT, Node, UNLINKED};

    struct DropItem(Arc<AtomicUsize>);

    impl Drop for DropItem {
        fn drop(&mut self) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn test_alloc_zeroes_tower() {
        let node = Node::alloc(7u64, "seven", 5).unwrap();
        unsafe {
            let n = node.as_ref();
            assert_eq!(n.key, 7);
            assert_eq!(n.value, "seven");
            assert_eq!(n.height(), 5);
            for level in 0..5 {
                assert_eq!(n.tower[level].load(SeqCst), MarkedPtr::null());
            }
            assert!(!n.is_removed());
            assert!(!n.is_retired());
            Node::dealloc(node.as_ptr());
        }
    }

    #[test]
    fn test_layout_grows_with_height() {
        let low = Node::<u64, u64>::layout(1).unwrap();
        let high = Node::<u64, u64>::layout(10).unwrap();
        assert!(high.size() >= low.size() + 9 * std::mem::size_of::<usize>());
        assert!(low.align() >= 2);
    }

    #[test]
    fn test_dealloc_drops_key_and_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Node::alloc(DropItem(drops.clone()), DropItem(drops.clone()), 3).unwrap();
        unsafe { Node::dealloc(node.as_ptr()) };
        assert_eq!(drops.load(SeqCst), 2);
    }

    #[test]
    fn test_only_one_marker_wins() {
        let node = Node::alloc(1u64, (), 4).unwrap();
        unsafe {
            let n = node.as_ref();
            assert!(n.mark_tower());
            assert!(!n.mark_tower());
            assert!(n.is_removed());
            for level in 0..4 {
                assert!(n.tower[level].load(SeqCst).is_marked());
            }
            Node::dealloc(node.as_ptr());
        }
    }

    #[test]
    fn test_second_finisher_owns_retirement() {
        let node = Node::alloc(1u64, (), 1).unwrap();
        unsafe {
            let n = node.as_ref();
            assert!(!n.finish(UNLINKED));
            assert!(n.finish(BUILT));
            Node::dealloc(node.as_ptr());
        }
    }

    #[test]
    fn test_destroy_requires_retirement() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Node::alloc(1u64, DropItem(drops.clone()), 2).unwrap();
        unsafe {
            node.as_ref().mark_retired();
            assert!(node.as_ref().is_retired());
            Node::<u64, DropItem>::destroy(node.as_ptr() as *mut ());
        }
        assert_eq!(drops.load(SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "retired twice")]
    fn test_double_retire_is_fatal() {
        let node = Node::alloc(1u64, (), 1).unwrap();
        let n = unsafe { node.as_ref() };
        n.mark_retired();
        n.mark_retired();
    }
}
