use std::{
    cmp::Ordering::*,
    ops::{Bound, RangeBounds, RangeFull},
    ptr::NonNull,
    sync::atomic::{AtomicIsize, AtomicUsize, Ordering::*},
};

use crossbeam::utils::CachePadded;
use rotate_reclaim::{Collector, Guard, Retired, default_collector};

use crate::{
    comparator::prelude::*,
    error::{Error, Result},
    iterator::Range,
    marked_ptr::MarkedPtr,
    node::{BUILT, Head, Link, Node, Tower, UNLINKED},
    options::{MAX_HEIGHT, Options},
};

/// Counters touched by every writer, kept off the cache line of the
/// read-mostly fields.
struct HotData {
    height: AtomicUsize,
    len: AtomicIsize,
}

/// Where a key sits on every level: the last tower strictly before it and
/// the link that followed that tower when it was read.
struct Position<'g, K, V> {
    /// The unmarked node holding the key at level 0, if any.
    found: Option<&'g Node<K, V>>,
    left: [&'g Tower<K, V>; MAX_HEIGHT],
    right: [MarkedPtr<Node<K, V>>; MAX_HEIGHT],
}

/// Result of walking a single level.
struct Step<'g, K, V> {
    left: &'g Tower<K, V>,
    right: MarkedPtr<Node<K, V>>,
    found: Option<&'g Node<K, V>>,
}

/// A concurrent ordered map.
///
/// Every operation runs inside a critical section of the list's collector,
/// so unlinked nodes are freed only once no thread can still be reading them.
pub struct SkipList<K, V, C = DefaultComparator<K>> {
    head: NonNull<Head<K, V>>,
    hot: CachePadded<HotData>,
    c: C,
    options: Options,
    collector: Collector,
}

unsafe impl<K, V, C> Send for SkipList<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: Send,
{
}

unsafe impl<K, V, C> Sync for SkipList<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: Sync,
{
}

impl<K: Ord, V> SkipList<K, V> {
    pub fn new() -> Self {
        Self::with_comparator(DefaultComparator::default())
    }
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> SkipList<K, V, C>
where
    C: Comparator<Item = K>,
{
    /// A list with default options on the process-wide collector.
    pub fn with_comparator(c: C) -> Self {
        Self::with_options(c, Options::default(), default_collector().clone())
    }

    pub(crate) fn with_options(c: C, options: Options, collector: Collector) -> Self {
        let head = Box::new(Head::new());
        tracing::debug!(
            max_height = options.max_height(),
            level_probability = options.level_probability(),
            "created skip list"
        );
        SkipList {
            head: NonNull::from(Box::leak(head)),
            hot: CachePadded::new(HotData {
                height: AtomicUsize::new(1),
                len: AtomicIsize::new(0),
            }),
            c,
            options,
            collector,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn comparator(&self) -> &C {
        &self.c
    }

    /// Enters a critical section of the list's collector. References handed
    /// out by [`SkipList::get`] and [`SkipList::range`] live as long as the
    /// guard.
    pub fn pin(&self) -> Guard {
        self.collector.pin()
    }

    /// Number of entries. Only exact while no writer is running.
    pub fn len(&self) -> usize {
        self.hot.len.load(SeqCst).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head(&self) -> &Head<K, V> {
        unsafe { self.head.as_ref() }
    }

    fn height(&self) -> usize {
        self.hot.height.load(SeqCst)
    }

    fn raise_height(&self, height: usize) {
        let mut current = self.height();
        while height > current {
            match self
                .hot
                .height
                .compare_exchange_weak(current, height, SeqCst, SeqCst)
            {
                Ok(_) => {
                    tracing::trace!(from = current, to = height, "raised skip list height");
                    break;
                }
                Err(h) => current = h,
            }
        }
    }

    fn check_guard(&self, guard: &Guard) {
        assert!(
            guard.is_pinned_by(&self.collector),
            "guard belongs to a different collector"
        );
    }

    pub fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        let node = self.lower_bound(Bound::Included(key), guard)?;
        if self.c.equals(&node.key, key) {
            Some(&node.value)
        } else {
            None
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let guard = self.pin();
        self.get(key, &guard).is_some()
    }

    /// Looks up `key` and returns a copy of its value.
    pub fn find(&self, key: &K) -> Result<V>
    where
        V: Clone,
    {
        let guard = self.pin();
        self.get(key, &guard).cloned().ok_or(Error::NotFound)
    }

    /// Lazily walks the entries within `range` in ascending order.
    ///
    /// The walk is weakly consistent: it never yields a removed entry it has
    /// not yet reached, and it may or may not see entries inserted behind it.
    pub fn range<'g, R>(&'g self, range: R, guard: &'g Guard) -> Range<'g, K, V, C, R>
    where
        R: RangeBounds<K>,
    {
        self.check_guard(guard);
        Range::new(self, range, guard)
    }

    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Range<'g, K, V, C, RangeFull> {
        self.range(.., guard)
    }

    /// First live node after `bound`, found without modifying any link.
    pub(crate) fn lower_bound<'g>(
        &'g self,
        bound: Bound<&K>,
        _guard: &'g Guard,
    ) -> Option<&'g Node<K, V>> {
        let mut pred: &'g Tower<K, V> = self.head();
        let mut curr = MarkedPtr::null();

        for level in (0..self.height()).rev() {
            curr = pred[level].load(SeqCst).with_mark(false);
            while let Some(c) = unsafe { curr.as_ref() } {
                let succ = c.tower[level].load(SeqCst);
                if succ.is_marked() {
                    curr = succ.with_mark(false);
                    continue;
                }
                let before = match bound {
                    Bound::Included(key) => self.c.compare(&c.key, key).is_lt(),
                    Bound::Excluded(key) => self.c.compare(&c.key, key).is_le(),
                    Bound::Unbounded => false,
                };
                if !before {
                    break;
                }
                pred = &c.tower;
                curr = succ;
            }
        }
        unsafe { curr.as_ref() }
    }

    /// The live node following `node` on level 0.
    pub(crate) fn next_node<'g>(
        &'g self,
        node: &'g Node<K, V>,
        guard: &'g Guard,
    ) -> Option<&'g Node<K, V>> {
        if node.is_removed() {
            // The successor link is frozen and may lead nowhere useful.
            return self.lower_bound(Bound::Excluded(&node.key), guard);
        }
        let mut curr = node.tower[0].load(SeqCst).with_mark(false);
        while let Some(c) = unsafe { curr.as_ref() } {
            let succ = c.tower[0].load(SeqCst);
            if !succ.is_marked() {
                return Some(c);
            }
            curr = succ.with_mark(false);
        }
        None
    }

    fn help_unlink(
        link: &Link<K, V>,
        curr: &Node<K, V>,
        succ: MarkedPtr<Node<K, V>>,
    ) -> Option<MarkedPtr<Node<K, V>>> {
        let succ = succ.with_mark(false);
        link.compare_exchange(MarkedPtr::from_ref(curr), succ, SeqCst, SeqCst)
            .ok()
            .map(|_| succ)
    }

    /// Walks one level from `start`, snipping removed nodes on the way.
    ///
    /// Stops at the first node not below `key`, or past the run of nodes
    /// equal to it when `past_equal` is set. Returns `None` when `start` was
    /// removed or a snip lost a race; the caller must search again from the
    /// top.
    fn search_level<'g>(
        &'g self,
        start: &'g Tower<K, V>,
        level: usize,
        key: &K,
        past_equal: bool,
        _guard: &'g Guard,
    ) -> Option<Step<'g, K, V>> {
        let mut pred = start;
        let mut left = start;
        let mut found = None;

        let mut curr = pred[level].load(SeqCst);
        if curr.is_marked() {
            return None;
        }

        while let Some(c) = unsafe { curr.as_ref() } {
            let succ = c.tower[level].load(SeqCst);
            if succ.is_marked() {
                curr = Self::help_unlink(&pred[level], c, succ)?;
                continue;
            }

            match self.c.compare(&c.key, key) {
                Less => left = &c.tower,
                Equal => {
                    assert!(
                        self.c.equals(&c.key, key),
                        "comparator ordering and equality disagree"
                    );
                    found.get_or_insert(c);
                    if !past_equal {
                        break;
                    }
                }
                Greater => break,
            }
            pred = &c.tower;
            curr = succ;
        }

        Some(Step {
            left,
            right: curr,
            found,
        })
    }

    fn search_position<'g>(
        &'g self,
        key: &K,
        past_equal: bool,
        guard: &'g Guard,
    ) -> Position<'g, K, V> {
        'search: loop {
            let head: &'g Tower<K, V> = self.head();
            let mut pos = Position {
                found: None,
                left: [head; MAX_HEIGHT],
                right: [MarkedPtr::null(); MAX_HEIGHT],
            };

            let mut pred = head;
            for level in (0..self.height()).rev() {
                let Some(step) = self.search_level(pred, level, key, past_equal, guard) else {
                    continue 'search;
                };
                pos.left[level] = step.left;
                pos.right[level] = step.right;
                pred = step.left;
                if level == 0 {
                    pos.found = step.found;
                }
            }
            return pos;
        }
    }
}

impl<K, V, C> SkipList<K, V, C>
where
    K: Send + 'static,
    V: Send + 'static,
    C: Comparator<Item = K>,
{
    /// Adds `key` with `value`. An existing entry for `key` is left untouched
    /// and [`Error::AlreadyExists`] is returned.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let guard = self.pin();

        let mut pos = self.search_position(&key, false, &guard);
        if pos.found.is_some() {
            return Err(Error::AlreadyExists);
        }

        let height = self.options.random_height();
        let node = Node::alloc(key, value, height)?;
        let n = unsafe { node.as_ref() };
        let new = MarkedPtr::from_non_null(node);
        self.raise_height(height);

        loop {
            n.tower[0].store(pos.right[0], SeqCst);
            if pos.left[0][0]
                .compare_exchange(pos.right[0], new, SeqCst, SeqCst)
                .is_ok()
            {
                break;
            }

            let found = match self.search_level(pos.left[0], 0, &n.key, false, &guard) {
                Some(step) => {
                    pos.left[0] = step.left;
                    pos.right[0] = step.right;
                    step.found
                }
                None => {
                    pos = self.search_position(&n.key, false, &guard);
                    pos.found
                }
            };
            if found.is_some() {
                // Never published.
                unsafe { Node::dealloc(node.as_ptr()) };
                return Err(Error::AlreadyExists);
            }
        }
        self.hot.len.fetch_add(1, SeqCst);

        'build: for level in 1..height {
            loop {
                let next = n.tower[level].load(SeqCst);
                if next.is_marked() {
                    break 'build;
                }
                let right = pos.right[level];
                if n.tower[level]
                    .compare_exchange(next, right, SeqCst, SeqCst)
                    .is_err()
                {
                    // Only a remover writes to the tower before it is linked.
                    break 'build;
                }
                if pos.left[level][level]
                    .compare_exchange(right, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    break;
                }

                match self.search_level(pos.left[level], level, &n.key, false, &guard) {
                    Some(step) => {
                        pos.left[level] = step.left;
                        pos.right[level] = step.right;
                    }
                    None => pos = self.search_position(&n.key, false, &guard),
                }
            }
        }

        if n.finish(BUILT) {
            self.retire(n, &guard);
        }
        Ok(())
    }

    /// Removes `key`, or returns [`Error::NotFound`] if it is absent.
    pub fn remove(&self, key: &K) -> Result<()> {
        let guard = self.pin();

        loop {
            let pos = self.search_position(key, false, &guard);
            let n = pos.found.ok_or(Error::NotFound)?;
            if !n.mark_tower() {
                // Another remover got there first.
                continue;
            }
            self.hot.len.fetch_sub(1, SeqCst);

            self.unlink(n, &pos, &guard);
            if n.finish(UNLINKED) {
                self.retire(n, &guard);
            }
            return Ok(());
        }
    }

    fn unlink<'g>(&'g self, n: &'g Node<K, V>, pos: &Position<'g, K, V>, guard: &'g Guard) {
        let this = MarkedPtr::from_ref(n);
        for level in (0..n.height()).rev() {
            let succ = n.tower[level].load(SeqCst).with_mark(false);
            let unlinked = pos.right[level] == this
                && pos.left[level][level]
                    .compare_exchange(this, succ, SeqCst, SeqCst)
                    .is_ok();
            if !unlinked {
                self.search_position(&n.key, true, guard);
                return;
            }
        }
    }

    /// Hands a fully marked node to the collector once both the inserter and
    /// the remover are done with it.
    fn retire(&self, n: &Node<K, V>, guard: &Guard) {
        // A snip may have been lost to a racing link; sweep the key once more
        // so that no level still reaches the node.
        self.search_position(&n.key, true, guard);
        n.mark_retired();
        tracing::trace!(height = n.height(), "retiring skip list node");
        unsafe {
            guard.retire(Retired::new(
                n as *const Node<K, V> as *mut (),
                Node::<K, V>::destroy,
            ));
        }
    }
}

impl<K, V, C> Drop for SkipList<K, V, C> {
    fn drop(&mut self) {
        unsafe {
            let mut cur = self.head.as_ref()[0].load(SeqCst).as_ptr();
            while !cur.is_null() {
                let next = (&(*cur).tower)[0].load(SeqCst).as_ptr();
                assert!(!(*cur).is_retired(), "retired node still linked");
                Node::dealloc(cur);
                cur = next;
            }
            drop(Box::from_raw(self.head.as_ptr()));
        }
    }
}

#[cfg(test)]
impl<K, V, C> SkipList<K, V, C>
where
    C: Comparator<Item = K>,
{
    /// Checks the structure of a quiescent list.
    pub(crate) fn check_invariants(&self) {
        use std::collections::HashMap;

        let _guard = self.pin();
        let mut linked: HashMap<*const Node<K, V>, usize> = HashMap::new();

        for level in 0..MAX_HEIGHT {
            let mut prev: Option<&Node<K, V>> = None;
            let mut curr = self.head()[level].load(SeqCst);
            assert!(!curr.is_marked(), "head link marked at level {level}");

            while let Some(c) = unsafe { curr.as_ref() } {
                let next = c.tower[level].load(SeqCst);
                assert!(!next.is_marked(), "removed node linked at level {level}");
                assert!(!c.is_retired(), "retired node linked at level {level}");
                assert!(level < c.height(), "node linked above its height");
                if let Some(p) = prev {
                    assert_eq!(
                        self.c.compare(&p.key, &c.key),
                        Less,
                        "keys out of order at level {level}"
                    );
                }

                let below = linked.entry(c as *const Node<K, V>).or_insert(0);
                assert_eq!(*below, level, "tower has a gap below level {level}");
                *below += 1;

                prev = Some(c);
                curr = next;
            }
        }

        for (&node, &levels) in &linked {
            assert_eq!(levels, unsafe { (*node).height() }, "tower not fully linked");
        }
        assert_eq!(linked.len(), self.len(), "length counter drifted");
    }

    /// Checks tower contiguity while writers run: a node linked and unmarked
    /// at some level must still be linked at every level below, unless its
    /// removal has marked that level since.
    pub(crate) fn check_towers_linked_below(&self, guard: &Guard) {
        self.check_guard(guard);
        for level in (1..self.height()).rev() {
            let mut curr = self.head()[level].load(SeqCst);
            while let Some(c) = unsafe { curr.as_ref() } {
                let next = c.tower[level].load(SeqCst);
                assert!(level < c.height(), "node linked above its height");
                if !next.is_marked() {
                    for below in (0..level).rev() {
                        // Unlinking requires the mark, so read it after the walk.
                        let linked = self.is_linked_at(c, below);
                        assert!(
                            linked || c.tower[below].load(SeqCst).is_marked(),
                            "node linked at level {level} but missing at level {below}"
                        );
                    }
                }
                curr = next.with_mark(false);
            }
        }
    }

    fn is_linked_at(&self, node: &Node<K, V>, level: usize) -> bool {
        let mut curr = self.head()[level].load(SeqCst);
        while let Some(c) = unsafe { curr.as_ref() } {
            if std::ptr::eq(c, node) {
                return true;
            }
            if self.c.compare(&c.key, &node.key) == Greater {
                return false;
            }
            curr = c.tower[level].load(SeqCst).with_mark(false);
        }
        false
    }
}
