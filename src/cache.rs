//! Cache-maintenance hooks.
//!
//! Every transition between CPU ownership and device ownership of a DMA
//! buffer must pair a memory fence with the matching cache operation:
//! CPU-to-device is a release fence followed by a cache clean (flush);
//! device-to-CPU is a cache invalidate followed by an acquire fence.
//!
//! On a cache-coherent bus (the common case for the hosts this crate
//! targets) the clean/invalidate operations below are no-ops; the fence
//! is what actually matters, and it is never skipped. On a
//! non-coherent bus, a real bus implementation provides its own
//! platform-specific clean/invalidate path at these exact call sites —
//! the functions here are the seam where that plugs in.

/// Flush (clean) the CPU cache over `[ptr, ptr+len)`, publishing CPU
/// writes so the device observes them. Must be preceded by a release
/// fence at the call site.
#[inline]
pub fn clean(_ptr: *const u8, _len: usize) {
    // No-op on coherent buses; see module docs.
}

/// Invalidate the CPU cache over `[ptr, ptr+len)`, discarding any stale
/// CPU-side cached copy so subsequent reads observe device writes. Must
/// be followed by an acquire fence at the call site.
#[inline]
pub fn invalidate(_ptr: *const u8, _len: usize) {
    // No-op on coherent buses; see module docs.
}
