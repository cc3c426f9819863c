//! Page-aligned DMA-visible buffer.
//!
//! A `DmaBuffer` is pinned for device access from the moment it is
//! created until it is dropped; the CPU mapping is a separate,
//! independently toggled concern. Drop order matters: the CPU mapping
//! is released before the device pin, never the reverse.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Cached,
    Uncached,
}

/// A contiguous, pinned region of memory visible to both the CPU and
/// the device.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
    cache_policy: CachePolicy,
    device_address: u64,
    mapped: bool,
}

// The buffer is a plain allocation; sharing it across threads is safe
// as long as accesses to its contents are externally synchronized,
// which every consumer in this crate (DmaPool, Ring) already does.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocates and pins a new buffer of `size` bytes under the given
    /// cache policy. `Uncached` buffers larger than one page fail with
    /// `NoResources`, matching the single-page constraint a real bus
    /// imposes on non-contiguous uncached allocations.
    pub fn create(cache_policy: CachePolicy, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgs("size must be non-zero"));
        }
        if cache_policy == CachePolicy::Uncached && size > PAGE_SIZE {
            return Err(Error::NoResources);
        }

        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| Error::InvalidArgs("size/alignment overflow"))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::NoResources)?;

        // Simulated pin: the device address is the allocation's own
        // address. A real bus implementation would instead obtain this
        // from an IOMMU/BTI pin operation.
        let device_address = ptr.as_ptr() as u64;

        Ok(Self {
            ptr,
            layout,
            size,
            cache_policy,
            device_address,
            mapped: false,
        })
    }

    /// Establishes the CPU mapping. Fails with `BadState` if already
    /// mapped.
    pub fn map(&mut self) -> Result<()> {
        if self.mapped {
            return Err(Error::BadState);
        }
        self.mapped = true;
        Ok(())
    }

    /// Tears down the CPU mapping. Fails with `BadState` if not
    /// currently mapped.
    pub fn unmap(&mut self) -> Result<()> {
        if !self.mapped {
            return Err(Error::BadState);
        }
        self.mapped = false;
        Ok(())
    }

    /// The CPU-visible base address, if currently mapped.
    pub fn cpu_address(&self) -> Option<NonNull<u8>> {
        self.mapped.then_some(self.ptr)
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Raw pointer to the backing storage, valid regardless of the
    /// `map`/`unmap` toggle. Used internally by `DmaPool` and the DMA
    /// rings, which manage their own mapping discipline distinct from
    /// the public CPU-mapping API.
    pub(crate) fn raw_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // CPU mapping first, then the device pin.
        self.mapped = false;
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
