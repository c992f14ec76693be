use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::backend::VirtualMachine;
use crate::lock::LockError;
use crate::vm::VmHandle;

/// A resource that holds a backend connection and an image lock.
pub trait Release {
    fn image_id(&self) -> &str;

    fn close_connection(&mut self);

    fn unlock(&mut self) -> Result<(), LockError>;
}

impl<V: VirtualMachine> Release for VmHandle<V> {
    fn image_id(&self) -> &str {
        VmHandle::image_id(self)
    }

    fn close_connection(&mut self) {
        VmHandle::close_connection(self);
    }

    fn unlock(&mut self) -> Result<(), LockError> {
        VmHandle::unlock(self)
    }
}

/// Owns a locked [`VmHandle`] and releases it on scope exit.
///
/// Dropping the guard closes the backend connection and then unlocks the
/// image, on success, early return and unwinding alike. Unlock failures are
/// logged and never change the outcome of the run.
pub struct CleanupGuard<R: Release> {
    inner: R,
}

impl<R: Release> CleanupGuard<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Release> Deref for CleanupGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner
    }
}

impl<R: Release> DerefMut for CleanupGuard<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Release> Drop for CleanupGuard<R> {
    fn drop(&mut self) {
        // Close first: closing must not rely on the lock still being held.
        self.inner.close_connection();
        if let Err(e) = self.inner.unlock() {
            warn!(image_id = self.inner.image_id(), error = %e, "unable to unlock VM");
        } else {
            debug!(image_id = self.inner.image_id(), "released VM");
        }
    }
}
