use std::{cmp, marker::PhantomData};

use super::Comparator;

/// Orders keys by their [`Ord`] implementation.
#[derive(Debug)]
pub struct DefaultComparator<T> {
    _marker: PhantomData<fn(&T)>,
}

impl<T> Default for DefaultComparator<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Comparator for DefaultComparator<T>
where
    T: Ord,
{
    type Item = T;

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> cmp::Ordering {
        a.cmp(b)
    }

    fn equals(&self, a: &Self::Item, b: &Self::Item) -> bool {
        a == b
    }
}

impl<T> Clone for DefaultComparator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DefaultComparator<T> {}
