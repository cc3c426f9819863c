//! Fixed set of same-sized buffers carved from one `DmaBuffer`, leased
//! out through a lock-free, ABA-resistant free list.
//!
//! Each slot moves between three states: `Free` (linked into the free
//! list, available to `allocate`), `Allocated` (held by exactly one
//! live `Buffer`), and `Released` (the lease was handed to the device;
//! the slot is not on the free list, but is reacquirable by index via
//! `acquire`). This three-state contract is load-bearing: `Released`
//! must be a real, reachable state, not a vestigial one.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::cache;
use crate::dma::buffer::{CachePolicy, DmaBuffer};
use crate::error::{Error, Result};

const NIL: u32 = u32::MAX;

const STATE_FREE: u8 = 0;
const STATE_ALLOCATED: u8 = 1;
const STATE_RELEASED: u8 = 2;

struct Record {
    next_free: AtomicU32,
    state: AtomicU8,
}

struct Inner {
    backing: DmaBuffer,
    buffer_size: usize,
    buffer_count: usize,
    records: Vec<Record>,
    /// Packed `(index: u32, aba_counter: u32)`. `index == NIL` means an
    /// empty free list. Every CAS increments the counter, guarding
    /// against ABA across concurrent `allocate`/`reset` pairs.
    free_list_head: AtomicU64,
}

fn pack(index: u32, counter: u32) -> u64 {
    (u64::from(index) << 32) | u64::from(counter)
}

fn unpack(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// A fixed-size pool of DMA buffers, leased out by index.
pub struct DmaPool {
    inner: Arc<Inner>,
}

impl DmaPool {
    /// Carves `buffer_count` buffers of `buffer_size` bytes out of
    /// `backing`. `backing` must use the `Cached` policy (the pool
    /// manages its own cache maintenance) and must be at least
    /// `buffer_size * buffer_count` bytes.
    pub fn create(buffer_size: usize, buffer_count: usize, mut backing: DmaBuffer) -> Result<Self> {
        if backing.cache_policy() != CachePolicy::Cached {
            return Err(Error::InvalidArgs("pool backing buffer must be Cached"));
        }
        if buffer_size == 0 || buffer_count == 0 {
            return Err(Error::InvalidArgs("buffer_size/buffer_count must be non-zero"));
        }
        let required = buffer_size
            .checked_mul(buffer_count)
            .ok_or(Error::InvalidArgs("buffer_size * buffer_count overflows"))?;
        if backing.size() < required {
            return Err(Error::OutOfRange {
                value: required,
                limit: backing.size(),
            });
        }
        backing.map()?;

        let mut records = Vec::with_capacity(buffer_count);
        for i in 0..buffer_count {
            let next = if i + 1 < buffer_count { (i + 1) as u32 } else { NIL };
            records.push(Record {
                next_free: AtomicU32::new(next),
                state: AtomicU8::new(STATE_FREE),
            });
        }
        let free_list_head = AtomicU64::new(pack(0, 0));

        Ok(Self {
            inner: Arc::new(Inner {
                backing,
                buffer_size,
                buffer_count,
                records,
                free_list_head,
            }),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.buffer_count
    }

    /// Lock-free pop from the free list. Fails with `NoResources` if
    /// the pool is exhausted.
    pub fn allocate(&self) -> Result<Buffer> {
        loop {
            let head = self.inner.free_list_head.load(Ordering::Acquire);
            let (index, counter) = unpack(head);
            if index == NIL {
                return Err(Error::NoResources);
            }
            let record = &self.inner.records[index as usize];
            let next = record.next_free.load(Ordering::Relaxed);
            let new_head = pack(next, counter.wrapping_add(1));
            if self
                .inner
                .free_list_head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                record.state.store(STATE_ALLOCATED, Ordering::Release);
                return Ok(Buffer {
                    pool: self.inner.clone(),
                    index: index as usize,
                    read_high_water: self.inner.buffer_size,
                    write_high_water: 0,
                    disposed: false,
                });
            }
        }
    }

    /// Leases the slot at `index`, which must currently be `Released`.
    /// Fails with `NotFound` if the slot is `Free`, or `BadState` if
    /// it is already `Allocated`.
    pub fn acquire(&self, index: usize) -> Result<Buffer> {
        if index >= self.inner.buffer_count {
            return Err(Error::OutOfRange {
                value: index,
                limit: self.inner.buffer_count,
            });
        }
        let record = &self.inner.records[index];
        match record.state.compare_exchange(
            STATE_RELEASED,
            STATE_ALLOCATED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(Buffer {
                pool: self.inner.clone(),
                index,
                read_high_water: 0,
                write_high_water: 0,
                disposed: false,
            }),
            Err(STATE_FREE) => Err(Error::NotFound),
            Err(_) => Err(Error::BadState),
        }
    }

}

/// Pushes `index` back onto the free list, transitioning it from
/// `Allocated` to `Free`. Called from `Buffer`'s `Drop`.
fn return_to_free_list(inner: &Inner, index: usize) {
    let record = &inner.records[index];
    loop {
        let head = inner.free_list_head.load(Ordering::Acquire);
        let (head_index, counter) = unpack(head);
        record.next_free.store(head_index, Ordering::Relaxed);
        let new_head = pack(index as u32, counter.wrapping_add(1));
        if inner
            .free_list_head
            .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            record.state.store(STATE_FREE, Ordering::Release);
            return;
        }
    }
}

/// A lease on one slot in a `DmaPool`.
pub struct Buffer {
    pool: Arc<Inner>,
    index: usize,
    read_high_water: usize,
    write_high_water: usize,
    disposed: bool,
}

impl Buffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.pool.buffer_size
    }

    fn slot_ptr(&self) -> *mut u8 {
        let base = self.pool.backing.raw_ptr().as_ptr();
        unsafe { base.add(self.index * self.pool.buffer_size) }
    }

    /// Returns a pointer to `size` readable bytes, invalidating the CPU
    /// cache over whatever part of the range hasn't already been
    /// invalidated this lease, then issuing an acquire fence.
    pub fn map_read(&mut self, size: usize) -> Result<*const u8> {
        if size > self.pool.buffer_size {
            return Err(Error::OutOfRange {
                value: size,
                limit: self.pool.buffer_size,
            });
        }
        let ptr = self.slot_ptr();
        if self.read_high_water < size {
            let start = unsafe { ptr.add(self.read_high_water) };
            cache::invalidate(start, size - self.read_high_water);
            self.read_high_water = size;
        }
        std::sync::atomic::fence(Ordering::Acquire);
        Ok(ptr as *const u8)
    }

    /// Returns a pointer to `size` writable bytes. Records the write
    /// range for the next `pin()`, but performs no cache flush yet.
    pub fn map_write(&mut self, size: usize) -> Result<*mut u8> {
        if size > self.pool.buffer_size {
            return Err(Error::OutOfRange {
                value: size,
                limit: self.pool.buffer_size,
            });
        }
        if self.write_high_water < size {
            self.write_high_water = size;
        }
        Ok(self.slot_ptr())
    }

    /// Publishes all pending writes to the device: release fence, then
    /// flush the CPU cache over `[0, write_high_water)`. Returns the
    /// device address of the slot and resets both high-water marks.
    pub fn pin(&mut self) -> Result<u64> {
        self.read_high_water = 0;
        if self.write_high_water > 0 {
            std::sync::atomic::fence(Ordering::Release);
            cache::clean(self.slot_ptr(), self.write_high_water);
            self.write_high_water = 0;
        }
        let offset = (self.index * self.pool.buffer_size) as u64;
        Ok(self.pool.backing.device_address() + offset)
    }

    /// Hands the lease to the device: the slot stays `Allocated` in
    /// bookkeeping terms but becomes `Released`, reacquirable later by
    /// index via `DmaPool::acquire`. Consumes the buffer without
    /// returning the slot to the free list.
    pub fn release(mut self) {
        let record_index = self.index;
        let pool = self.pool.clone();
        pool.records[record_index]
            .state
            .store(STATE_RELEASED, Ordering::Release);
        self.disposed = true;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        return_to_free_list(&self.pool, self.index);
    }
}
