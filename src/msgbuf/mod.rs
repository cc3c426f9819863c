//! The MSGBUF protocol: wire layout, per-destination flow rings, flow
//! lifecycle management, and the top-level ring handler that
//! multiplexes ioctl, event, and RX traffic over them.

pub mod flow_ring;
pub mod flow_ring_handler;
pub mod ring_handler;
pub mod wire;
