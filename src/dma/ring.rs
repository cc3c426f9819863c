//! Single-producer/single-consumer DMA rings of fixed-size items.
//!
//! A ring does not auto-wrap: a call near the end of the linear mapping
//! returns at most the items up to the end, never a region that
//! straddles the wrap point. This matches the original's rationale —
//! letting a single `map_read`/`map_write` call assume a contiguous
//! slice, at the cost of callers occasionally having to make two calls
//! to drain a region that crosses the end.

use std::sync::atomic::{fence, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use crate::cache;
use crate::dma::buffer::{CachePolicy, DmaBuffer};
use crate::error::{Error, Result};

/// The read/write indices for one ring, held in device-visible memory.
/// Shared via `Arc` so a test harness can observe or drive them directly
/// to simulate the device side of the ring.
#[derive(Default)]
pub struct RingIndices {
    read_index: AtomicU16,
    write_index: AtomicU16,
}

impl RingIndices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn read_index(&self) -> &AtomicU16 {
        &self.read_index
    }

    pub fn write_index(&self) -> &AtomicU16 {
        &self.write_index
    }
}

struct Base {
    backing: DmaBuffer,
    item_size: usize,
    capacity: u16,
    indices: Arc<RingIndices>,
}

impl Base {
    fn create(backing: DmaBuffer, item_size: usize, capacity: u16, indices: Arc<RingIndices>) -> Result<Self> {
        if item_size == 0 || capacity == 0 {
            return Err(Error::InvalidArgs("item_size/capacity must be non-zero"));
        }
        let required = item_size
            .checked_mul(capacity as usize)
            .ok_or(Error::InvalidArgs("item_size * capacity overflows"))?;
        if backing.size() < required {
            return Err(Error::OutOfRange {
                value: required,
                limit: backing.size(),
            });
        }
        if backing.cache_policy() != CachePolicy::Cached {
            // We handle cache maintenance ourselves; an uncached mapping buys nothing.
            return Err(Error::InvalidArgs("ring backing buffer must be Cached"));
        }
        indices.read_index.store(0, Ordering::Release);
        indices.write_index.store(0, Ordering::Release);
        Ok(Self {
            backing,
            item_size,
            capacity,
            indices,
        })
    }

    fn item_ptr(&self, index: u16) -> *mut u8 {
        let base = self.backing.raw_ptr().as_ptr();
        unsafe { base.add(index as usize * self.item_size) }
    }

    fn item_size(&self) -> usize {
        self.item_size
    }

    fn capacity(&self) -> u16 {
        self.capacity
    }

    fn device_address(&self) -> u64 {
        self.backing.device_address()
    }
}

/// The consumer-side view of a ring whose device-visible writer is the
/// firmware: a "complete" ring in MSGBUF terms.
pub struct ReadDmaRing {
    base: Base,
    /// High-water mark of the region already cache-invalidated since the
    /// last wrap, to avoid redundant invalidation on repeated `map_read`
    /// calls against the same uncommitted region. An atomic (rather than
    /// a `Cell`) only to keep the ring `Sync`; access is still
    /// single-threaded by convention.
    cache_invalidate_high_water: AtomicU16,
}

impl ReadDmaRing {
    pub fn create(
        mut backing: DmaBuffer,
        item_size: usize,
        capacity: u16,
        indices: Arc<RingIndices>,
    ) -> Result<Self> {
        backing.map()?;
        Ok(Self {
            base: Base::create(backing, item_size, capacity, indices)?,
            cache_invalidate_high_water: AtomicU16::new(0),
        })
    }

    pub fn item_size(&self) -> usize {
        self.base.item_size()
    }

    pub fn capacity(&self) -> u16 {
        self.base.capacity()
    }

    pub fn device_address(&self) -> u64 {
        self.base.device_address()
    }

    /// `(write_index, read_index)` reported by the device, plus the
    /// count of items available to read without wrapping.
    fn available_reads_from(&self, read_index: u16) -> u16 {
        let write_index = self.base.indices.write_index.load(Ordering::Acquire);
        if read_index <= write_index {
            write_index - read_index
        } else {
            self.base.capacity() - read_index
        }
    }

    pub fn available_reads(&self) -> u16 {
        let read_index = self.base.indices.read_index.load(Ordering::Acquire);
        self.available_reads_from(read_index)
    }

    /// Maps `item_count` consecutive items for read, starting at the
    /// current read cursor, invalidating the CPU cache over whatever
    /// part of that range hasn't been invalidated yet this pass.
    pub fn map_read(&self, item_count: u16) -> Result<*const u8> {
        let read_index = self.base.indices.read_index.load(Ordering::Acquire);
        let available = self.available_reads_from(read_index);
        if item_count > available {
            return Err(Error::Unavailable {
                requested: item_count as usize,
                available: available as usize,
            });
        }

        let end_index = read_index + item_count;
        let high_water = self.cache_invalidate_high_water.load(Ordering::Relaxed);
        if high_water < end_index {
            let ptr = self.base.item_ptr(high_water);
            cache::invalidate(ptr, (end_index - high_water) as usize * self.base.item_size());
            self.cache_invalidate_high_water.store(end_index, Ordering::Relaxed);
        }
        fence(Ordering::Acquire);

        Ok(self.base.item_ptr(read_index) as *const u8)
    }

    /// Advances the read index by `item_count`, wrapping to 0 at
    /// capacity (resetting the cache-invalidate high-water mark too).
    pub fn commit_read(&self, item_count: u16) -> Result<()> {
        let read_index = self.base.indices.read_index.load(Ordering::Acquire);
        let available = self.available_reads_from(read_index);
        if item_count > available {
            return Err(Error::Unavailable {
                requested: item_count as usize,
                available: available as usize,
            });
        }
        let mut new_read_index = read_index + item_count;

        if self.cache_invalidate_high_water.load(Ordering::Relaxed) < new_read_index {
            self.cache_invalidate_high_water.store(new_read_index, Ordering::Relaxed);
        }

        if new_read_index == self.base.capacity() {
            new_read_index = 0;
            self.cache_invalidate_high_water.store(0, Ordering::Relaxed);
        }

        self.base.indices.read_index.store(new_read_index, Ordering::Release);
        Ok(())
    }
}

/// The producer-side view of a ring whose device-visible reader is the
/// firmware: a "submit" ring in MSGBUF terms, including flow rings.
pub struct WriteDmaRing {
    base: Base,
    write_signal: Option<Arc<AtomicU32>>,
    /// High-water mark of the region recorded dirty by `map_write`
    /// calls, flushed lazily on `commit_write`. An atomic only to keep
    /// the ring `Sync`; access is still single-threaded by convention.
    cache_clean_high_water: AtomicU16,
}

impl WriteDmaRing {
    pub fn create(
        mut backing: DmaBuffer,
        item_size: usize,
        capacity: u16,
        indices: Arc<RingIndices>,
        write_signal: Option<Arc<AtomicU32>>,
    ) -> Result<Self> {
        backing.map()?;
        Ok(Self {
            base: Base::create(backing, item_size, capacity, indices)?,
            write_signal,
            cache_clean_high_water: AtomicU16::new(0),
        })
    }

    pub fn item_size(&self) -> usize {
        self.base.item_size()
    }

    pub fn capacity(&self) -> u16 {
        self.base.capacity()
    }

    pub fn device_address(&self) -> u64 {
        self.base.device_address()
    }

    fn available_writes_from(&self, write_index: u16) -> u16 {
        let read_index = self.base.indices.read_index.load(Ordering::Acquire);
        if write_index < read_index {
            // Never allowed to fill completely: that's indistinguishable from empty.
            read_index - write_index - 1
        } else {
            std::cmp::min(self.base.capacity(), read_index + self.base.capacity() - 1) - write_index
        }
    }

    pub fn available_writes(&self) -> u16 {
        let write_index = self.base.indices.write_index.load(Ordering::Acquire);
        self.available_writes_from(write_index)
    }

    /// Maps `item_count` consecutive items for write, starting at the
    /// current write cursor. Does not flush the CPU cache yet; that
    /// happens lazily in `commit_write`.
    pub fn map_write(&self, item_count: u16) -> Result<*mut u8> {
        let write_index = self.base.indices.write_index.load(Ordering::Acquire);
        let available = self.available_writes_from(write_index);
        if item_count > available {
            return Err(Error::Unavailable {
                requested: item_count as usize,
                available: available as usize,
            });
        }

        let end_index = write_index + item_count;
        if self.cache_clean_high_water.load(Ordering::Relaxed) < end_index {
            self.cache_clean_high_water.store(end_index, Ordering::Relaxed);
        }

        Ok(self.base.item_ptr(write_index))
    }

    /// Flushes the CPU cache over the newly committed range, advances
    /// the write index (wrapping at capacity), and signals the
    /// doorbell.
    pub fn commit_write(&self, item_count: u16) -> Result<()> {
        let write_index = self.base.indices.write_index.load(Ordering::Acquire);
        let available = self.available_writes_from(write_index);
        if item_count > available {
            return Err(Error::Unavailable {
                requested: item_count as usize,
                available: available as usize,
            });
        }
        let mut new_write_index = write_index + item_count;

        fence(Ordering::Release);
        let high_water = self.cache_clean_high_water.load(Ordering::Relaxed);
        let clean_end = std::cmp::min(high_water, new_write_index);
        if high_water < new_write_index {
            self.cache_clean_high_water.store(new_write_index, Ordering::Relaxed);
        }
        if clean_end > write_index {
            let ptr = self.base.item_ptr(write_index);
            cache::clean(ptr, (clean_end - write_index) as usize * self.base.item_size());
        }

        if new_write_index == self.base.capacity() {
            new_write_index = 0;
            self.cache_clean_high_water.store(0, Ordering::Relaxed);
        }

        self.base.indices.write_index.store(new_write_index, Ordering::Release);
        if let Some(signal) = &self.write_signal {
            signal.store(1, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
impl WriteDmaRing {
    /// Test-only: pointer to item `index`'s backing storage, for a test
    /// harness acting as the device-side consumer of a submit ring.
    pub(crate) fn item_ptr_for_test(&self, index: u16) -> *const u8 {
        self.base.item_ptr(index) as *const u8
    }
}

#[cfg(test)]
impl ReadDmaRing {
    /// Test-only: simulates firmware producing one entry at the current
    /// write cursor via `fill`, then advances the write index the way
    /// real firmware would (wrapping at capacity).
    pub(crate) fn simulate_device_write_for_test(&self, fill: impl FnOnce(*mut u8)) {
        let write_index = self.base.indices.write_index.load(Ordering::Acquire);
        fill(self.base.item_ptr(write_index));
        let mut new_write_index = write_index + 1;
        if new_write_index == self.base.capacity() {
            new_write_index = 0;
        }
        self.base.indices.write_index.store(new_write_index, Ordering::Release);
    }
}
