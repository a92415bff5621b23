use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use log::error;

use crate::error::{CoreError, CoreResult};
use crate::machine::StoreTarget;

/// Releases the memory of an external allocation. It receives the pointer of the allocation
/// and must not panic.
pub type Deleter = Box<dyn FnOnce(*mut u8)>;

struct AllocationInner {
    target: StoreTarget,
    device_id: Option<u32>,
    ptr: *mut u8,
    size: usize,
    read_only: bool,
    deleter: RefCell<Option<Deleter>>,
    released: Cell<bool>,
}

impl AllocationInner {
    fn release(&self) {
        self.released.set(true);
        let Some(deleter) = self.deleter.borrow_mut().take() else {
            return;
        };
        let ptr = self.ptr;
        if std::panic::catch_unwind(AssertUnwindSafe(move || deleter(ptr))).is_err() {
            error!("the deleter of an external allocation panicked");
            std::process::abort();
        }
    }
}

impl Drop for AllocationInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// A user-owned memory region handed over to the runtime.
/// Clones share the allocation, and the deleter runs once when the last clone is dropped
/// unless [`ExternalAllocation::maybe_deallocate`] released it earlier.
#[derive(Clone)]
pub struct ExternalAllocation(Rc<AllocationInner>);

impl ExternalAllocation {
    /// Creates an allocation over memory owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `size` bytes (and for writes unless `read_only`)
    /// until the deleter runs, or until the last clone is dropped when there is no deleter.
    /// For device memory the pointer is never dereferenced on the host.
    pub unsafe fn new(
        target: StoreTarget,
        device_id: Option<u32>,
        ptr: *mut u8,
        size: usize,
        read_only: bool,
        deleter: Option<Deleter>,
    ) -> CoreResult<Self> {
        match (target, device_id) {
            (StoreTarget::Fbmem, None) => {
                return Err(CoreError::invalid(
                    "a framebuffer allocation needs a device id",
                ))
            }
            (StoreTarget::Fbmem, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(CoreError::invalid(format!(
                    "a device id is only meaningful for framebuffer allocations, not {target}"
                )))
            }
        }
        if ptr.is_null() && size > 0 {
            return Err(CoreError::invalid("external allocation has a null pointer"));
        }
        Ok(Self(Rc::new(AllocationInner {
            target,
            device_id,
            ptr,
            size,
            read_only,
            deleter: RefCell::new(deleter),
            released: Cell::new(false),
        })))
    }

    /// Creates a system memory allocation.
    ///
    /// # Safety
    ///
    /// The same contract as [`ExternalAllocation::new`] applies.
    pub unsafe fn create_sysmem(
        ptr: *mut u8,
        size: usize,
        read_only: bool,
        deleter: Option<Deleter>,
    ) -> CoreResult<Self> {
        Self::new(StoreTarget::Sysmem, None, ptr, size, read_only, deleter)
    }

    /// Creates a framebuffer allocation on the given device.
    ///
    /// # Safety
    ///
    /// The same contract as [`ExternalAllocation::new`] applies.
    pub unsafe fn create_fbmem(
        device_id: u32,
        ptr: *mut u8,
        size: usize,
        read_only: bool,
        deleter: Option<Deleter>,
    ) -> CoreResult<Self> {
        Self::new(
            StoreTarget::Fbmem,
            Some(device_id),
            ptr,
            size,
            read_only,
            deleter,
        )
    }

    /// Creates a system memory allocation that owns `data`.
    pub fn from_vec(data: Vec<u8>, read_only: bool) -> Self {
        Self::from_vec_with_deleter(data, read_only, |_| {})
    }

    /// Creates a system memory allocation that owns `data` and calls `on_delete` with the
    /// pointer of the buffer right before the buffer is freed.
    pub fn from_vec_with_deleter<F>(data: Vec<u8>, read_only: bool, on_delete: F) -> Self
    where
        F: FnOnce(*mut u8) + 'static,
    {
        let size = data.len();
        let ptr = Box::into_raw(data.into_boxed_slice()) as *mut u8;
        let deleter: Deleter = Box::new(move |ptr| {
            on_delete(ptr);
            // SAFETY: the pointer and length come from the boxed slice leaked above,
            // and the deleter runs at most once.
            drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, size)) });
        });
        Self(Rc::new(AllocationInner {
            target: StoreTarget::Sysmem,
            device_id: None,
            ptr,
            size,
            read_only,
            deleter: RefCell::new(Some(deleter)),
            released: Cell::new(false),
        }))
    }

    pub fn target(&self) -> StoreTarget {
        self.0.target
    }

    pub fn device_id(&self) -> Option<u32> {
        self.0.device_id
    }

    pub fn ptr(&self) -> *mut u8 {
        self.0.ptr
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn read_only(&self) -> bool {
        self.0.read_only
    }

    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }

    /// Runs the deleter early if the allocation is read-only.
    /// A writable allocation stays alive until its last clone is dropped.
    pub fn maybe_deallocate(&self) {
        if self.0.read_only {
            self.0.release();
        }
    }

    fn check_host_access(&self, len: usize) -> CoreResult<()> {
        if self.0.target == StoreTarget::Fbmem {
            return Err(CoreError::unsupported(format!(
                "host access to {} allocations",
                self.0.target
            )));
        }
        if self.0.released.get() {
            return Err(CoreError::invalid("external allocation was already released"));
        }
        if len > self.0.size {
            return Err(CoreError::invalid(format!(
                "external allocation of {} bytes cannot hold {len} bytes",
                self.0.size
            )));
        }
        Ok(())
    }

    /// Copies the first `len` bytes of the allocation.
    pub(crate) fn read_bytes(&self, len: usize) -> CoreResult<Vec<u8>> {
        self.check_host_access(len)?;
        if len == 0 {
            return Ok(vec![]);
        }
        // SAFETY: the constructor contract guarantees `size` readable bytes
        // until the allocation is released, which was checked above.
        let bytes = unsafe { std::slice::from_raw_parts(self.0.ptr, len) };
        Ok(bytes.to_vec())
    }

    pub(crate) fn write_bytes(&self, data: &[u8]) -> CoreResult<()> {
        if self.0.read_only {
            return Err(CoreError::invalid("cannot write to a read-only allocation"));
        }
        self.check_host_access(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        // SAFETY: the allocation is writable and holds at least `data.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.0.ptr, data.len()) };
        Ok(())
    }
}

impl fmt::Debug for ExternalAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalAllocation")
            .field("target", &self.0.target)
            .field("device_id", &self.0.device_id)
            .field("ptr", &self.0.ptr)
            .field("size", &self.0.size)
            .field("read_only", &self.0.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_deleter_runs_on_last_drop() {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::new(Cell::new(std::ptr::null_mut()));
        let allocation = {
            let calls = calls.clone();
            let seen = seen.clone();
            ExternalAllocation::from_vec_with_deleter(vec![0; 16], false, move |ptr| {
                calls.set(calls.get() + 1);
                seen.set(ptr);
            })
        };
        let ptr = allocation.ptr();
        let clone = allocation.clone();
        allocation.maybe_deallocate();
        drop(allocation);
        assert_eq!(calls.get(), 0);
        drop(clone);
        assert_eq!(calls.get(), 1);
        assert_eq!(seen.get(), ptr);
    }

    #[test]
    fn test_read_only_released_early() -> CoreResult<()> {
        let calls = Rc::new(Cell::new(0));
        let allocation = {
            let calls = calls.clone();
            ExternalAllocation::from_vec_with_deleter(vec![7; 8], true, move |_| {
                calls.set(calls.get() + 1)
            })
        };
        assert_eq!(allocation.read_bytes(8)?, vec![7; 8]);
        assert!(allocation.write_bytes(&[0]).is_err());
        allocation.maybe_deallocate();
        assert_eq!(calls.get(), 1);
        assert!(allocation.read_bytes(8).is_err());
        drop(allocation);
        assert_eq!(calls.get(), 1);
        Ok(())
    }

    #[test]
    fn test_size_and_device_checks() {
        let allocation = ExternalAllocation::from_vec(vec![0; 4], false);
        assert!(allocation.read_bytes(5).is_err());
        assert!(allocation.write_bytes(&[1, 2, 3, 4]).is_ok());
        let mut buffer = [0u8; 4];
        // SAFETY: the buffer outlives the allocation handle.
        let fbmem = unsafe {
            ExternalAllocation::new(StoreTarget::Fbmem, None, buffer.as_mut_ptr(), 4, true, None)
        };
        assert!(matches!(fbmem, Err(CoreError::InvalidArgument(_))));
    }
}
