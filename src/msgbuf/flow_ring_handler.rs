//! Flow-ring lifecycle, (interface, destination, priority) → ring
//! lookup, and fair-share submission scheduling.

use std::collections::HashMap;

use log::{error, warn};
use slab::Slab;

use crate::bus::{DmaConfig, DmaRingProvider};
use crate::dma::pool::DmaPool;
use crate::dma::ring::WriteDmaRing;
use crate::error::{Error, Result};
use crate::intrusive_list::IntrusiveList;
use crate::msgbuf::flow_ring::{Frame, FlowRing, SubmitTag};
use crate::msgbuf::wire::{CommonHeader, FlowRingCreateRequest, FlowRingDeleteRequest, MsgType};

pub type MacAddr = [u8; 6];

const ALL_MULTICAST: MacAddr = [0xFF; 6];

/// 802.1D priority → TX fifo. Out-of-range priorities default to fifo
/// 1, not fifo 0 — easy to get backwards.
const FIFO_LIST: [u8; 8] = [1, 0, 0, 1, 2, 2, 3, 3];

pub fn priority_to_fifo(priority: u8) -> u8 {
    FIFO_LIST.get(priority as usize).copied().unwrap_or(1)
}

struct InterfaceState {
    is_ap_mode: bool,
    /// (destination, fifo) -> flow ring index.
    destinations: HashMap<(MacAddr, u8), u16>,
}

/// Flow-ring lifecycle manager: creates/destroys rings, resolves
/// (interface, destination, priority) to a ring index, and runs the
/// fair-share submission pass across every ring with pending work.
///
/// `flow_rings` is a slab of boxed rings: the slab hands out a reusable
/// slot index in O(1) (the same role `allocate_flow_ring_index` used to
/// fill with a linear scan), and boxing each ring keeps its address (and
/// the submit queue's pointers into it) stable even while the slab's own
/// backing storage grows. `flow_ring_offset` translates between a slab
/// key and the device-visible flow ring id (`key + flow_ring_offset`);
/// it is firmware-reported and fixed for the handler's lifetime, latched
/// from the first `get_or_add_flow_ring` call.
pub struct FlowRingHandler {
    interfaces: HashMap<u8, InterfaceState>,
    flow_rings: Slab<Box<FlowRing>>,
    flow_ring_offset: u16,
    submit_queue: IntrusiveList<FlowRing, SubmitTag>,
    control_submit_transaction: u32,
}

impl FlowRingHandler {
    pub fn new() -> Self {
        Self {
            interfaces: HashMap::new(),
            flow_rings: Slab::new(),
            flow_ring_offset: 0,
            submit_queue: IntrusiveList::new(),
            control_submit_transaction: 0,
        }
    }

    fn slab_key(&self, flow_ring_index: u16) -> Option<usize> {
        flow_ring_index.checked_sub(self.flow_ring_offset).map(|k| k as usize)
    }

    pub fn add_interface(&mut self, interface_index: u8, is_ap_mode: bool) {
        self.interfaces.insert(
            interface_index,
            InterfaceState {
                is_ap_mode,
                destinations: HashMap::new(),
            },
        );
    }

    /// Requests a close of every ring owned by the interface. The rings
    /// stay in `flow_rings` until `notify_flow_ring_destroyed` arrives
    /// for each.
    pub fn remove_interface(&mut self, interface_index: u8) {
        let Some(iface) = self.interfaces.remove(&interface_index) else {
            return;
        };
        for &flow_ring_index in iface.destinations.values() {
            if let Some(key) = self.slab_key(flow_ring_index) {
                if let Some(ring) = self.flow_rings.get_mut(key) {
                    let _ = ring.close();
                }
            }
        }
    }

    /// Finds or creates the flow ring for `(interface, destination,
    /// priority)`. In AP mode, all multicast destinations collapse onto
    /// the broadcast MAC with fifo 0.
    pub fn get_or_add_flow_ring(
        &mut self,
        interface_index: u8,
        source: MacAddr,
        destination: MacAddr,
        priority: u8,
        dma_ring_provider: &dyn DmaRingProvider,
        control_submit: &WriteDmaRing,
    ) -> Result<u16> {
        let fifo = priority_to_fifo(priority);
        let iface = self.interfaces.get(&interface_index).ok_or(Error::NotFound)?;

        let is_multicast = destination[0] & 0x01 != 0;
        let (lookup_destination, lookup_fifo) = if iface.is_ap_mode && is_multicast {
            (ALL_MULTICAST, 0)
        } else {
            (destination, fifo)
        };

        if let Some(&index) = iface.destinations.get(&(lookup_destination, lookup_fifo)) {
            return Ok(index);
        }

        let config = *dma_ring_provider.dma_config();
        self.flow_ring_offset = config.flow_ring_offset;
        if self.flow_rings.len() >= config.max_flow_rings {
            return Err(Error::NoResources);
        }

        let entry = self.flow_rings.vacant_entry();
        let flow_ring_index = config.flow_ring_offset + entry.key() as u16;
        let write_ring = dma_ring_provider.create_flow_ring(flow_ring_index as usize)?;
        let ring = FlowRing::new(interface_index, flow_ring_index, write_ring);
        entry.insert(Box::new(ring));

        let iface = self.interfaces.get_mut(&interface_index).ok_or(Error::NotFound)?;
        iface.destinations.insert((lookup_destination, lookup_fifo), flow_ring_index);

        self.open_flow_ring(flow_ring_index, lookup_destination, source, fifo, &config, control_submit)?;
        Ok(flow_ring_index)
    }

    fn open_flow_ring(
        &mut self,
        flow_ring_index: u16,
        da: MacAddr,
        sa: MacAddr,
        tid: u8,
        _config: &DmaConfig,
        control_submit: &WriteDmaRing,
    ) -> Result<()> {
        self.control_submit_transaction += 1;
        let request = FlowRingCreateRequest {
            common: CommonHeader::new(MsgType::FlowRingCreate, 0, 0, self.control_submit_transaction),
            da,
            sa,
            tid,
            flow_ring_id: flow_ring_index,
            max_items: 0,
            len_item: 0,
            flow_ring_addr: 0,
        };
        let ptr = control_submit.map_write(1)? as *mut FlowRingCreateRequest;
        unsafe { std::ptr::write_unaligned(ptr, request) };
        control_submit.commit_write(1)
    }

    pub fn close_flow_ring(&mut self, flow_ring_index: u16, control_submit: &WriteDmaRing) -> Result<()> {
        let key = self.slab_key(flow_ring_index).ok_or(Error::NotFound)?;
        let ring = self.flow_rings.get_mut(key).ok_or(Error::NotFound)?;
        ring.close()?;

        self.control_submit_transaction += 1;
        let request = FlowRingDeleteRequest {
            common: CommonHeader::new(MsgType::FlowRingDelete, 0, 0, self.control_submit_transaction),
            flow_ring_id: flow_ring_index,
            _reserved: 0,
        };
        let ptr = control_submit.map_write(1)? as *mut FlowRingDeleteRequest;
        unsafe { std::ptr::write_unaligned(ptr, request) };
        control_submit.commit_write(1)
    }

    /// Enqueues a frame on the given ring, registering it on the submit
    /// queue if it isn't already there.
    pub fn queue(&mut self, flow_ring_index: u16, frame: Frame) -> Result<()> {
        let key = self.slab_key(flow_ring_index).ok_or(Error::NotFound)?;
        let ring: &mut FlowRing = self.flow_rings.get_mut(key).map(|b| &mut **b).ok_or(Error::NotFound)?;
        ring.queue(frame)?;
        if !ring.submit_link.is_linked() {
            self.submit_queue.push_back(ring);
        }
        Ok(())
    }

    pub fn notify_flow_ring_created(&mut self, flow_ring_index: u16, status: i32) -> Result<()> {
        let Some(key) = self.slab_key(flow_ring_index) else {
            return Err(Error::NotFound);
        };
        let Some(ring): Option<&mut FlowRing> = self.flow_rings.get_mut(key).map(|b| &mut **b) else {
            return Err(Error::NotFound);
        };
        if status != 0 {
            warn!("flow ring {flow_ring_index}: firmware create failed with status {status}");
            self.terminate_with_extreme_prejudice(flow_ring_index);
            return Ok(());
        }
        match ring.notify_opened() {
            Ok(()) => {
                if ring.has_pending() && !ring.submit_link.is_linked() {
                    self.submit_queue.push_back(ring);
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    "flow ring {flow_ring_index}: unexpected create ack in state {:?}",
                    ring.state()
                );
                self.terminate_with_extreme_prejudice(flow_ring_index);
                Err(e)
            }
        }
    }

    pub fn notify_flow_ring_destroyed(&mut self, flow_ring_index: u16) {
        let Some(key) = self.slab_key(flow_ring_index) else {
            warn!("flow ring {flow_ring_index}: late destroy notify for an already-terminated ring, ignoring");
            return;
        };
        let Some(ring) = self.flow_rings.get_mut(key) else {
            warn!("flow ring {flow_ring_index}: late destroy notify for an already-terminated ring, ignoring");
            return;
        };
        if ring.notify_closed().is_err() {
            error!(
                "flow ring {flow_ring_index}: unexpected destroy ack in state {:?}",
                ring.state()
            );
        }
        self.flow_rings.remove(key);
        for iface in self.interfaces.values_mut() {
            iface.destinations.retain(|_, &mut index| index != flow_ring_index);
        }
    }

    /// Unconditionally and synchronously drops the ring: no firmware
    /// round-trip. Dropping the boxed `FlowRing` unlinks it from the
    /// submit queue automatically. A subsequent late
    /// `notify_flow_ring_destroyed` for this index is logged and
    /// ignored since it's no longer present.
    pub fn terminate_with_extreme_prejudice(&mut self, flow_ring_index: u16) {
        if let Some(key) = self.slab_key(flow_ring_index) {
            if self.flow_rings.contains(key) {
                self.flow_rings.remove(key);
            }
        }
        for iface in self.interfaces.values_mut() {
            iface.destinations.retain(|_, &mut index| index != flow_ring_index);
        }
    }

    /// Fair-share submission across every ring with pending frames.
    /// Rounds start at a per-ring cap of 8, doubling (capped at 256)
    /// each round that submits something; stops when a round submits
    /// nothing.
    pub fn submit_to_flow_rings(&mut self, tx_pool: &DmaPool) {
        const INITIAL_CAP: usize = 8;
        const MAX_CAP: usize = 256;

        let mut cap = INITIAL_CAP;
        loop {
            if self.submit_queue.is_empty() {
                break;
            }

            let pending_tail: IntrusiveList<FlowRing, SubmitTag> = IntrusiveList::new();
            let failure_tail: IntrusiveList<FlowRing, SubmitTag> = IntrusiveList::new();
            let mut total_submitted = 0;

            while let Some(mut ptr) = self.submit_queue.pop_front() {
                let ring = unsafe { ptr.as_mut() };
                match ring.submit(tx_pool, cap) {
                    Ok(count) => {
                        total_submitted += count;
                        if ring.has_pending() {
                            pending_tail.push_back(ring);
                        }
                    }
                    Err(e) => {
                        error!("flow ring {}: submit failed: {e}", ring.flow_ring_index());
                        failure_tail.push_back(ring);
                    }
                }
            }

            pending_tail.append(&failure_tail);
            self.submit_queue.append(&pending_tail);

            if total_submitted == 0 {
                break;
            }
            cap = (cap * 2).min(MAX_CAP);
        }
    }
}

impl Default for FlowRingHandler {
    fn default() -> Self {
        Self::new()
    }
}
