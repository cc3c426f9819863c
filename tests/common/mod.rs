//! A fake bus: in-process stand-ins for the three provider traits,
//! built only out of the crate's public API, so a "device" thread can
//! drive the other side of a ring exactly the way firmware would —
//! writing raw bytes at a published DMA address and advancing a shared
//! index — without any of this crate's internals leaking into the test
//! binary.
//!
//! Grounded on the original driver's `fake_msgbuf_interfaces.{h,cc}`
//! test doubles: a single object vending the three provider interfaces
//! plus helpers a test can use to inspect or drive ring state directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use brcmfmac_msgbuf::bus::{
    DmaBufferProvider, DmaConfig, DmaRingProvider, InterruptHandler, InterruptProvider,
};
use brcmfmac_msgbuf::dma::buffer::{CachePolicy, DmaBuffer};
use brcmfmac_msgbuf::dma::pool::DmaPool;
use brcmfmac_msgbuf::dma::ring::{ReadDmaRing, RingIndices, WriteDmaRing};
use brcmfmac_msgbuf::{Error, Result};

pub const RING_ITEM_SIZE: usize = 64;
pub const RING_CAPACITY: u16 = 64;

pub struct FakeDmaBufferProvider;

impl DmaBufferProvider for FakeDmaBufferProvider {
    fn create_dma_buffer(&self, cache_policy: CachePolicy, size: usize) -> Result<DmaBuffer> {
        DmaBuffer::create(cache_policy, size)
    }
}

/// The address, item size, and capacity of a created flow ring, kept
/// around after ownership of the ring itself moves to the caller so a
/// test can still peek at what landed in its backing memory.
#[derive(Clone, Copy)]
pub struct FlowRingMemo {
    pub device_address: u64,
    pub item_size: usize,
    pub capacity: u16,
}

pub struct FakeDmaRingProvider {
    config: DmaConfig,
    control_submit: WriteDmaRing,
    rx_buffer_submit: WriteDmaRing,
    control_complete: ReadDmaRing,
    pub control_complete_indices: Arc<RingIndices>,
    tx_complete: ReadDmaRing,
    pub tx_complete_indices: Arc<RingIndices>,
    rx_complete: ReadDmaRing,
    pub rx_complete_indices: Arc<RingIndices>,
    flow_rings: Mutex<HashMap<usize, FlowRingMemo>>,
}

impl FakeDmaRingProvider {
    pub fn new(config: DmaConfig) -> Self {
        let make_write_ring = || {
            let backing = DmaBuffer::create(CachePolicy::Cached, RING_ITEM_SIZE * RING_CAPACITY as usize).unwrap();
            let indices = RingIndices::new();
            WriteDmaRing::create(backing, RING_ITEM_SIZE, RING_CAPACITY, indices, None).unwrap()
        };
        let make_read_ring = || {
            let backing = DmaBuffer::create(CachePolicy::Cached, RING_ITEM_SIZE * RING_CAPACITY as usize).unwrap();
            let indices = RingIndices::new();
            (
                ReadDmaRing::create(backing, RING_ITEM_SIZE, RING_CAPACITY, indices.clone()).unwrap(),
                indices,
            )
        };

        let (control_complete, control_complete_indices) = make_read_ring();
        let (tx_complete, tx_complete_indices) = make_read_ring();
        let (rx_complete, rx_complete_indices) = make_read_ring();

        Self {
            config,
            control_submit: make_write_ring(),
            rx_buffer_submit: make_write_ring(),
            control_complete,
            control_complete_indices,
            tx_complete,
            tx_complete_indices,
            rx_complete,
            rx_complete_indices,
            flow_rings: Mutex::new(HashMap::new()),
        }
    }

    pub fn control_submit_ring(&self) -> &WriteDmaRing {
        &self.control_submit
    }

    pub fn control_complete_ring(&self) -> &ReadDmaRing {
        &self.control_complete
    }

    pub fn flow_ring_memo(&self, flow_ring_index: u16) -> FlowRingMemo {
        *self
            .flow_rings
            .lock()
            .unwrap()
            .get(&(flow_ring_index as usize))
            .expect("flow ring was never created")
    }
}

impl DmaRingProvider for FakeDmaRingProvider {
    fn dma_config(&self) -> &DmaConfig {
        &self.config
    }
    fn control_submit_ring(&self) -> &WriteDmaRing {
        &self.control_submit
    }
    fn rx_buffer_submit_ring(&self) -> &WriteDmaRing {
        &self.rx_buffer_submit
    }
    fn control_complete_ring(&self) -> &ReadDmaRing {
        &self.control_complete
    }
    fn tx_complete_ring(&self) -> &ReadDmaRing {
        &self.tx_complete
    }
    fn rx_complete_ring(&self) -> &ReadDmaRing {
        &self.rx_complete
    }
    fn create_flow_ring(&self, flow_ring_index: usize) -> Result<WriteDmaRing> {
        let item_size = std::mem::size_of::<brcmfmac_msgbuf::msgbuf::wire::TxRequest>();
        let capacity = RING_CAPACITY;
        let backing = DmaBuffer::create(CachePolicy::Cached, item_size * capacity as usize)?;
        let device_address = backing.device_address();
        let indices = RingIndices::new();
        let ring = WriteDmaRing::create(backing, item_size, capacity, indices, None)?;
        self.flow_rings.lock().unwrap().insert(
            flow_ring_index,
            FlowRingMemo {
                device_address,
                item_size,
                capacity,
            },
        );
        Ok(ring)
    }
}

pub struct FakeInterruptProvider {
    handlers: Mutex<Vec<Arc<dyn InterruptHandler>>>,
}

impl FakeInterruptProvider {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl InterruptProvider for FakeInterruptProvider {
    fn add_handler(&self, handler: Arc<dyn InterruptHandler>) -> Result<()> {
        self.handlers.lock().unwrap().push(handler);
        Ok(())
    }
    fn remove_handler(&self, handler: &Arc<dyn InterruptHandler>) -> Result<()> {
        let mut handlers = self.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        if handlers.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}

pub fn make_pool(provider: &FakeDmaBufferProvider, buffer_size: usize, buffer_count: usize) -> DmaPool {
    let backing = provider
        .create_dma_buffer(CachePolicy::Cached, buffer_size * buffer_count)
        .unwrap();
    DmaPool::create(buffer_size, buffer_count, backing).unwrap()
}

pub fn default_config() -> DmaConfig {
    DmaConfig {
        max_flow_rings: 4,
        flow_ring_offset: 2,
        max_ioctl_rx_buffers: 2,
        max_event_rx_buffers: 2,
        max_rx_buffers: 2,
        rx_data_offset: 4,
    }
}

/// Writes `entry` at the ring's current write cursor and advances it,
/// exactly as firmware would: raw bytes at the published DMA address,
/// no host-side API involved.
pub fn write_complete_entry<T: Copy>(ring: &ReadDmaRing, indices: &RingIndices, entry: T) {
    use std::sync::atomic::Ordering;
    let write_index = indices.write_index().load(Ordering::Acquire);
    let ptr = (ring.device_address() as *mut u8).wrapping_add(write_index as usize * ring.item_size());
    unsafe { std::ptr::write_unaligned(ptr as *mut T, entry) };
    let mut new_write_index = write_index + 1;
    if new_write_index == ring.capacity() {
        new_write_index = 0;
    }
    indices.write_index().store(new_write_index, Ordering::Release);
}

/// Reads item `index` off a write ring's backing memory the way the
/// device would: straight off the published DMA address.
pub fn read_submit_entry<T: Copy>(ring: &WriteDmaRing, index: u16) -> T {
    let ptr = (ring.device_address() as *const u8).wrapping_add(index as usize * ring.item_size());
    unsafe { std::ptr::read_unaligned(ptr as *const T) }
}

pub struct RecordingEventHandler {
    pub events: Mutex<Vec<(u8, Vec<u8>)>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl brcmfmac_msgbuf::msgbuf::ring_handler::EventHandler for RecordingEventHandler {
    fn handle_wl_event(&self, interface_index: u8, data: &[u8]) {
        self.events.lock().unwrap().push((interface_index, data.to_vec()));
    }
}
