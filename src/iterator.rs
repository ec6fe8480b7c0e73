use std::ops::{Bound, RangeBounds};

use rotate_reclaim::Guard;

use crate::{comparator::Comparator, node::Node, skip_list::SkipList};

/// Forward iterator over the entries of a [`SkipList`] within a range.
///
/// Yields references that stay valid for as long as the guard it was created
/// with. Entries removed after the iterator passed them are not revisited;
/// a removed entry under the cursor makes the next step search again from
/// its key.
pub struct Range<'g, K, V, C, R> {
    list: &'g SkipList<K, V, C>,
    guard: &'g Guard,
    range: R,
    cursor: Option<&'g Node<K, V>>,
    done: bool,
}

impl<'g, K, V, C, R> Range<'g, K, V, C, R>
where
    C: Comparator<Item = K>,
    R: RangeBounds<K>,
{
    pub(crate) fn new(list: &'g SkipList<K, V, C>, range: R, guard: &'g Guard) -> Self {
        Range {
            list,
            guard,
            range,
            cursor: None,
            done: false,
        }
    }

    fn within_end(&self, key: &K) -> bool {
        let c = self.list.comparator();
        match self.range.end_bound() {
            Bound::Included(end) => c.compare(key, end).is_le(),
            Bound::Excluded(end) => c.compare(key, end).is_lt(),
            Bound::Unbounded => true,
        }
    }
}

impl<'g, K, V, C, R> Iterator for Range<'g, K, V, C, R>
where
    C: Comparator<Item = K>,
    R: RangeBounds<K>,
{
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let next = match self.cursor {
            None => self.list.lower_bound(self.range.start_bound(), self.guard),
            Some(node) => self.list.next_node(node, self.guard),
        };

        match next {
            Some(node) if self.within_end(&node.key) => {
                self.cursor = Some(node);
                Some((&node.key, &node.value))
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

impl<K, V, C, R> std::iter::FusedIterator for Range<'_, K, V, C, R>
where
    C: Comparator<Item = K>,
    R: RangeBounds<K>,
{
}
