use std::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

const MARK: usize = 0b1;

/// A pointer paired with a deletion mark.
///
/// The mark lives in the lowest address bit, so `T` must be aligned to at
/// least two bytes. Nodes always are: they contain a `usize`.
pub(crate) struct MarkedPtr<T> {
    raw: *mut T,
}

impl<T> Clone for MarkedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MarkedPtr<T> {}

impl<T> PartialEq for MarkedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.raw, other.raw)
    }
}

impl<T> Eq for MarkedPtr<T> {}

impl<T> fmt::Debug for MarkedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkedPtr")
            .field("ptr", &self.as_ptr())
            .field("marked", &self.is_marked())
            .finish()
    }
}

impl<T> MarkedPtr<T> {
    pub(crate) fn null() -> Self {
        MarkedPtr {
            raw: ptr::null_mut(),
        }
    }

    pub(crate) fn new(ptr: *mut T, marked: bool) -> Self {
        debug_assert_eq!(ptr.addr() & MARK, 0, "pointer is not aligned for marking");
        MarkedPtr { raw: ptr }.with_mark(marked)
    }

    pub(crate) fn from_ref(r: &T) -> Self {
        Self::new(r as *const T as *mut T, false)
    }

    pub(crate) fn from_non_null(ptr: NonNull<T>) -> Self {
        Self::new(ptr.as_ptr(), false)
    }

    pub(crate) fn as_ptr(self) -> *mut T {
        self.raw.map_addr(|addr| addr & !MARK)
    }

    pub(crate) fn is_marked(self) -> bool {
        self.raw.addr() & MARK == MARK
    }

    pub(crate) fn with_mark(self, marked: bool) -> Self {
        let raw = if marked {
            self.raw.map_addr(|addr| addr | MARK)
        } else {
            self.raw.map_addr(|addr| addr & !MARK)
        };
        MarkedPtr { raw }
    }

    /// # Safety
    ///
    /// The pointee must be alive for `'a`.
    pub(crate) unsafe fn as_ref<'a>(self) -> Option<&'a T> {
        unsafe { self.as_ptr().as_ref() }
    }
}

/// A [`MarkedPtr`] that can be loaded, stored and compared-and-swapped as a
/// single unit, so a CAS fails both when the pointer changed and when it was
/// marked in the meantime.
pub(crate) struct AtomicMarkedPtr<T> {
    raw: AtomicPtr<T>,
}

impl<T> AtomicMarkedPtr<T> {
    pub(crate) fn null() -> Self {
        AtomicMarkedPtr {
            raw: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn load(&self, ord: Ordering) -> MarkedPtr<T> {
        MarkedPtr {
            raw: self.raw.load(ord),
        }
    }

    pub(crate) fn store(&self, ptr: MarkedPtr<T>, ord: Ordering) {
        self.raw.store(ptr.raw, ord);
    }

    pub(crate) fn compare_exchange(
        &self,
        current: MarkedPtr<T>,
        new: MarkedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T>, MarkedPtr<T>> {
        self.raw
            .compare_exchange(current.raw, new.raw, success, failure)
            .map(|raw| MarkedPtr { raw })
            .map_err(|raw| MarkedPtr { raw })
    }

    /// Sets the mark, keeping the pointer. Returns the previous value; the
    /// caller set the mark iff the returned value is unmarked.
    pub(crate) fn mark(&self, ord: Ordering) -> MarkedPtr<T> {
        let mut current = self.load(ord);
        loop {
            if current.is_marked() {
                return current;
            }
            match self.compare_exchange(current, current.with_mark(true), ord, ord) {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T> fmt::Debug for AtomicMarkedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
