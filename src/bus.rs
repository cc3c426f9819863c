//! Bus abstraction traits the transport core consumes (§6).
//!
//! The core never talks to PCIe/SDIO registers directly; everything it
//! needs from the bus comes through these three traits, so the same
//! ring/pool/handler code runs unmodified against real hardware or a
//! fake bus in tests.

use crate::dma::buffer::{CachePolicy, DmaBuffer};
use crate::dma::ring::{ReadDmaRing, WriteDmaRing};
use crate::error::Result;

/// Creates DMA-visible buffers on behalf of `DmaPool` and `DmaBuffer`
/// consumers that need raw backing storage.
pub trait DmaBufferProvider: Send + Sync {
    fn create_dma_buffer(&self, cache_policy: CachePolicy, size: usize) -> Result<DmaBuffer>;
}

/// Firmware-reported parameters governing DMA ring sizing and RX buffer
/// bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct DmaConfig {
    /// Maximum number of flow rings supported by firmware.
    pub max_flow_rings: usize,
    /// Firmware index of the first flow ring; flow rings occupy
    /// `[flow_ring_offset, flow_ring_offset + max_flow_rings)`.
    pub flow_ring_offset: u16,
    /// Maximum idle RX buffers queued for ioctl responses.
    pub max_ioctl_rx_buffers: usize,
    /// Maximum idle RX buffers queued for event notifications.
    pub max_event_rx_buffers: usize,
    /// Maximum idle RX buffers queued for wireless RX. If the bus
    /// reports 0 here, `255` is used (§9 open question 3).
    pub max_rx_buffers: usize,
    /// Offset to frame data within each RX buffer.
    pub rx_data_offset: usize,
}

impl DmaConfig {
    /// Resolved `max_rx_buffers`, applying the documented default when
    /// the bus reports 0.
    pub fn resolved_max_rx_buffers(&self) -> usize {
        if self.max_rx_buffers == 0 {
            255
        } else {
            self.max_rx_buffers
        }
    }
}

/// Provides the static submit/complete rings and creates dynamic flow
/// rings. The provider retains ownership of the static rings; flow
/// rings are owned by the caller once created.
pub trait DmaRingProvider: Send + Sync {
    fn dma_config(&self) -> &DmaConfig;

    fn control_submit_ring(&self) -> &WriteDmaRing;
    fn rx_buffer_submit_ring(&self) -> &WriteDmaRing;
    fn control_complete_ring(&self) -> &ReadDmaRing;
    fn tx_complete_ring(&self) -> &ReadDmaRing;
    fn rx_complete_ring(&self) -> &ReadDmaRing;

    fn create_flow_ring(&self, flow_ring_index: usize) -> Result<WriteDmaRing>;
}

/// Invoked by the bus when a doorbell interrupt fires. The handler
/// returns the bits it handled (and that the bus should mask/clear
/// before the next invocation).
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, mailboxint: u32) -> u32;
}

/// Registers/unregisters interrupt handlers with the bus. Handlers are
/// invoked in registration order; `remove_handler` only returns once no
/// invocation of the removed handler is in flight.
pub trait InterruptProvider: Send + Sync {
    fn add_handler(&self, handler: std::sync::Arc<dyn InterruptHandler>) -> Result<()>;
    fn remove_handler(&self, handler: &std::sync::Arc<dyn InterruptHandler>) -> Result<()>;
}
