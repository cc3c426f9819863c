//! # brcmfmac-msgbuf
//!
//! The MSGBUF transport core of a Broadcom full-MAC WiFi driver: DMA
//! ring machinery, the per-destination flow-ring TX state machine, and
//! the ring handler that multiplexes ioctl requests, firmware event
//! notifications, and RX buffer replenishment across an interrupt
//! thread and a worker thread.
//!
//! Chipset enumeration, firmware loading, NVRAM parsing, and the bus
//! (PCIe/SDIO) register glue live outside this crate; [`bus`] defines
//! the traits the core expects from them.

pub mod bus;
pub mod cache;
pub mod dma;
pub mod error;
pub mod intrusive_list;
pub mod msgbuf;
pub mod workqueue;

pub use error::{Error, Result};
