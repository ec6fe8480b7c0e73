use std::cmp;

mod default_comparator;
mod fn_comparator;

pub mod prelude {
    pub use super::{
        Comparator, default_comparator::DefaultComparator, fn_comparator::FnComparator,
    };
}

/// Orders the keys of a skip list.
///
/// `compare` must be a total order. `equals` is the key-equality check used
/// to decide whether a search hit the key; it must agree with `compare`
/// returning `Equal`, but can be overridden with a cheaper test.
pub trait Comparator: Send + Sync {
    type Item;

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> cmp::Ordering;

    fn equals(&self, a: &Self::Item, b: &Self::Item) -> bool {
        self.compare(a, b).is_eq()
    }
}
