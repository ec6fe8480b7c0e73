use crate::epoch::Epoch;

/// A type-erased object that has been unlinked from a shared structure and is
/// waiting for every concurrent reader to move past it.
pub struct Retired {
    ptr: *mut (),
    destroy: unsafe fn(*mut ()),
    epoch: Epoch,
}

unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    ///
    /// `ptr` must stay valid until `destroy` is called on it, no new reference
    /// to it may be created once it is retired, and `destroy` must be safe to
    /// run on any thread.
    pub unsafe fn new(ptr: *mut (), destroy: unsafe fn(*mut ())) -> Self {
        Retired {
            ptr,
            destroy,
            epoch: Epoch::starting(),
        }
    }

    /// Retires a boxed value, dropping it once it is reclaimed.
    pub fn from_box<T: Send + 'static>(value: Box<T>) -> Self {
        unsafe fn drop_box<T>(ptr: *mut ()) {
            unsafe { drop(Box::from_raw(ptr as *mut T)) }
        }

        unsafe { Self::new(Box::into_raw(value) as *mut (), drop_box::<T>) }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) fn stamp(&mut self, epoch: Epoch) {
        self.epoch = epoch.unpinned();
    }

    /// # Safety
    ///
    /// No thread may still hold a reference into the object.
    pub(crate) unsafe fn destroy(self) {
        unsafe { (self.destroy)(self.ptr) }
    }
}

impl std::fmt::Debug for Retired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retired")
            .field("ptr", &self.ptr)
            .field("epoch", &self.epoch.value())
            .finish()
    }
}
