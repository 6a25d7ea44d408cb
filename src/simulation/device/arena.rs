use tracing::debug;

use super::backend::{AccessMode, BufferHandle, ComputeBackend};
use crate::error::BackendError;

/**
 * One device buffer that is only ever reallocated to grow.
 *
 * Reallocation drops the old contents; callers learn about it from the return value of `ensure` and
 * have to upload again.
 */
#[derive(Debug)]
pub struct BufferArena {
    name: &'static str,
    access: AccessMode,
    handle: Option<BufferHandle>,
    byte_capacity: usize,
}

impl BufferArena {
    pub fn new(name: &'static str, access: AccessMode) -> Self {
        BufferArena {
            name,
            access,
            handle: None,
            byte_capacity: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn byte_capacity(&self) -> usize {
        self.byte_capacity
    }

    pub fn handle(&self) -> Result<BufferHandle, BackendError> {
        self.handle.ok_or(BackendError::ContextNotInitialized)
    }

    /// Makes sure the buffer holds at least `byte_size` bytes. Returns `true` if it was (re)created.
    pub fn ensure(&mut self, backend: &mut dyn ComputeBackend, byte_size: usize) -> Result<bool, BackendError> {
        let byte_size = byte_size.max(4);
        if self.handle.is_some() && self.byte_capacity >= byte_size {
            return Ok(false);
        }

        if let Some(old) = self.handle.take() {
            backend.release_buffer(old)?;
        }
        self.byte_capacity = 0;

        let handle = backend.create_buffer(self.access, byte_size)?;
        debug!("allocated device buffer `{}` with {} bytes", self.name, byte_size);
        self.handle = Some(handle);
        self.byte_capacity = byte_size;
        Ok(true)
    }

    /// Forgets the handle without releasing it (the context that owned it is gone).
    pub fn invalidate(&mut self) {
        self.handle = None;
        self.byte_capacity = 0;
    }
}
