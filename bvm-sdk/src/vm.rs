use std::ops::{Deref, DerefMut};

use crate::backend::VirtualMachine;
use crate::lock::{ImageLock, LockDir, LockError, LockMode};

/// Handle to one VM resource, addressed and locked by image identifier.
///
/// The handle owns the backend connection (through `V`) and whether this
/// process holds the image lock. Dereferences to the underlying VM.
pub struct VmHandle<V> {
    image_id: String,
    vm: V,
    locks: LockDir,
    lock: Option<ImageLock>,
}

impl<V: VirtualMachine> VmHandle<V> {
    pub fn new(image_id: impl Into<String>, vm: V, locks: LockDir) -> Self {
        Self {
            image_id: image_id.into(),
            vm,
            locks,
            lock: None,
        }
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Whether this handle currently holds the image lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Acquire the host-wide lock for this image.
    ///
    /// Fails with [`LockError::AlreadyLocked`] if any holder exists,
    /// including this handle.
    pub fn lock(&mut self, mode: LockMode) -> Result<(), LockError> {
        if self.lock.is_some() {
            return Err(LockError::AlreadyLocked {
                image_id: self.image_id.clone(),
            });
        }
        self.lock = Some(self.locks.try_lock(&self.image_id, mode)?);
        Ok(())
    }

    /// Release the lock. A no-op when not locked.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        match self.lock.take() {
            Some(lock) => lock.unlock(),
            None => Ok(()),
        }
    }

    pub fn close_connection(&mut self) {
        self.vm.close_connection();
    }
}

impl<V> Deref for VmHandle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.vm
    }
}

impl<V> DerefMut for VmHandle<V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.vm
    }
}
