use std::marker::PhantomData;

/**
 * Raw pointer into a slice that can be shared between worker threads.
 *
 * Used for scatter writes whose destinations form a permutation, so no two workers
 * ever touch the same element.
 */
pub struct ScatterPtr<'a, T> {
    ptr: *mut T,
    len: usize,
    slice: PhantomData<&'a mut [T]>,
}

unsafe impl<'a, T: Send> Sync for ScatterPtr<'a, T> {}
unsafe impl<'a, T: Send> Send for ScatterPtr<'a, T> {}

impl<'a, T> ScatterPtr<'a, T> {
    pub fn new(slice: &'a mut [T]) -> ScatterPtr<'a, T> {
        ScatterPtr {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            slice: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// No other thread may read or write element `idx` while this call runs.
    #[inline(always)]
    pub unsafe fn write(&self, idx: usize, value: T) {
        assert!(idx < self.len, "scatter index {} out of bounds ({})", idx, self.len);
        *self.ptr.add(idx) = value;
    }
}
