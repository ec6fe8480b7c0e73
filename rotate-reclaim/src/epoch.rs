use std::sync::atomic::{AtomicU64, Ordering};

/// An epoch value with the lowest bit reserved as the "pinned" flag.
///
/// Thread slots publish `epoch << 1 | pinned` in a single word so a scanning
/// thread never observes a pinned flag paired with a stale epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Epoch {
    data: u64,
}

impl Epoch {
    pub const fn starting() -> Self {
        Epoch { data: 0 }
    }

    /// The epoch counter without the pinned flag.
    pub fn value(self) -> u64 {
        self.data >> 1
    }

    pub fn is_pinned(self) -> bool {
        self.data & 1 == 1
    }

    pub fn pinned(self) -> Self {
        Epoch {
            data: self.data | 1,
        }
    }

    pub fn unpinned(self) -> Self {
        Epoch {
            data: self.data & !1,
        }
    }

    pub fn successor(self) -> Self {
        Epoch {
            data: self.unpinned().data.wrapping_add(2),
        }
    }

    /// Whether `self` was observed strictly before `other`, ignoring the pinned flag.
    pub fn precedes(self, other: Epoch) -> bool {
        self.value() < other.value()
    }
}

#[derive(Debug, Default)]
pub struct AtomicEpoch {
    data: AtomicU64,
}

impl AtomicEpoch {
    pub const fn new(epoch: Epoch) -> Self {
        AtomicEpoch {
            data: AtomicU64::new(epoch.data),
        }
    }

    pub fn load(&self, ord: Ordering) -> Epoch {
        Epoch {
            data: self.data.load(ord),
        }
    }

    pub fn store(&self, epoch: Epoch, ord: Ordering) {
        self.data.store(epoch.data, ord);
    }

    /// Moves the epoch one step forward and returns the new value.
    pub fn advance(&self, ord: Ordering) -> Epoch {
        let prev = Epoch {
            data: self.data.fetch_add(2, ord),
        };
        prev.successor()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use super::{AtomicEpoch, Epoch};

    #[test]
    fn test_pinned_flag_does_not_change_value() {
        let e = Epoch::starting().successor().successor();
        assert_eq!(e.value(), 2);
        assert!(!e.is_pinned());

        let p = e.pinned();
        assert!(p.is_pinned());
        assert_eq!(p.value(), 2);
        assert_eq!(p.unpinned(), e);
        assert_eq!(p.successor().value(), 3);
        assert!(!p.successor().is_pinned());
    }

    #[test]
    fn test_precedes_ignores_pin() {
        let a = Epoch::starting().pinned();
        let b = Epoch::starting().successor();
        assert!(a.precedes(b));
        assert!(!b.precedes(a));
        assert!(!a.precedes(a.unpinned()));
    }

    #[test]
    fn test_atomic_advance() {
        let global = AtomicEpoch::new(Epoch::starting());
        assert_eq!(global.advance(SeqCst).value(), 1);
        assert_eq!(global.advance(SeqCst).value(), 2);
        assert_eq!(global.load(SeqCst).value(), 2);
    }
}
