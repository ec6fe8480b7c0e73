mod collector;
mod epoch;
mod guard;
mod registry;
mod retired;

#[cfg(test)]
mod test_utils;

pub use collector::{Collector, RECLAIM_THRESHOLD, default_collector};
pub use epoch::Epoch;
pub use guard::Guard;
pub use registry::{Registry, ThreadSlot};
pub use retired::Retired;

pub mod prelude {
    pub use crate::{Collector, Guard, Retired, default_collector};
}
