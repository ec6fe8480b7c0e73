use std::{cmp, fmt, marker::PhantomData};

use super::Comparator;

/// Orders keys with a closure.
pub struct FnComparator<T, F> {
    f: F,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F> FnComparator<T, F>
where
    F: Fn(&T, &T) -> cmp::Ordering + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Comparator for FnComparator<T, F>
where
    F: Fn(&T, &T) -> cmp::Ordering + Send + Sync,
{
    type Item = T;

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> cmp::Ordering {
        (self.f)(a, b)
    }
}

impl<T, F: Clone> Clone for FnComparator<T, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, F> fmt::Debug for FnComparator<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnComparator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering::*;

    use crate::comparator::prelude::*;

    #[test]
    fn test_reverse_compare() {
        let cmp = FnComparator::new(|a: &u32, b: &u32| b.cmp(a));
        assert_eq!(cmp.compare(&1, &2), Greater);
        assert_eq!(cmp.compare(&2, &1), Less);
        assert!(cmp.equals(&3, &3));
    }
}
