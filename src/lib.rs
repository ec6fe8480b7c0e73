mod marked_ptr;
mod node;

pub mod comparator;
pub mod error;
pub mod iterator;
pub mod options;
pub mod skip_list;

#[cfg(test)]
mod test_utils;

pub use rotate_reclaim;

pub mod prelude {
    pub use crate::{
        comparator::prelude::*,
        error::{Error, Result},
        iterator::Range,
        options::{Options, SkipListBuilder},
        skip_list::SkipList,
    };
    pub use rotate_reclaim::{Collector, Guard, default_collector};
}
