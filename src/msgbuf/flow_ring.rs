//! Per-destination TX queue: the four-state flow-ring lifecycle and its
//! frame-submission batching.

use std::collections::VecDeque;

use arrayvec::ArrayVec;
use log::{debug, warn};

use crate::dma::pool::{Buffer, DmaPool};
use crate::dma::ring::WriteDmaRing;
use crate::error::{Error, Result};
use crate::intrusive_list::Link;
use crate::msgbuf::wire::{CommonHeader, MsgType, TxFlags, TxRequest, TX_HEADER_SIZE};

/// A queued frame awaiting submission, paired with the callback that
/// delivers its eventual completion.
pub struct Frame {
    pub data: Vec<u8>,
    pub on_complete: Box<dyn FnOnce(Result<()>) + Send>,
}

impl Frame {
    pub fn new(data: Vec<u8>, on_complete: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self {
            data,
            on_complete: Box::new(on_complete),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Opening,
    Open,
    Closing,
    Closed,
}

/// A per-destination flow ring: one TX write ring plus the queue of
/// frames not yet drained into it.
pub struct FlowRing {
    state: State,
    interface_index: u8,
    flow_ring_index: u16,
    write_ring: WriteDmaRing,
    pending: VecDeque<Frame>,
    /// Membership in the handler's submit queue. Not owned by the list:
    /// dropping `FlowRing` unlinks it automatically.
    pub submit_link: Link<SubmitTag>,
}

/// Tag for the `IntrusiveList<FlowRing, SubmitTag>` submit queue.
pub enum SubmitTag {}

crate::impl_listable!(FlowRing, submit_link, SubmitTag);

impl FlowRing {
    pub fn new(interface_index: u8, flow_ring_index: u16, write_ring: WriteDmaRing) -> Self {
        Self {
            state: State::Opening,
            interface_index,
            flow_ring_index,
            write_ring,
            pending: VecDeque::new(),
            submit_link: Link::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn flow_ring_index(&self) -> u16 {
        self.flow_ring_index
    }

    pub fn interface_index(&self) -> u8 {
        self.interface_index
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Enqueues a frame. Valid in `Opening`/`Open`; fails `BadState`
    /// (aborted) once closing or closed.
    pub fn queue(&mut self, frame: Frame) -> Result<()> {
        match self.state {
            State::Opening | State::Open => {
                self.pending.push_back(frame);
                Ok(())
            }
            State::Closing => {
                (frame.on_complete)(Err(Error::ConnectionAborted));
                Err(Error::ConnectionAborted)
            }
            State::Closed => Err(Error::BadState),
        }
    }

    /// Requests the ring be closed: any queued frames are failed with
    /// `ConnectionAborted`. Valid from `Opening`/`Open`.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            State::Opening | State::Open => {
                self.state = State::Closing;
                while let Some(frame) = self.pending.pop_front() {
                    (frame.on_complete)(Err(Error::ConnectionAborted));
                }
                Ok(())
            }
            State::Closing | State::Closed => Err(Error::BadState),
        }
    }

    /// Firmware acknowledged the flow-ring create request. A close
    /// requested after the create was already in flight can race this
    /// notification; per the state table the ring lands back in `Open`
    /// rather than staying `Closing` — the caller must re-issue `close`
    /// if it still wants the ring torn down.
    pub fn notify_opened(&mut self) -> Result<()> {
        match self.state {
            State::Opening | State::Closing => {
                self.state = State::Open;
                Ok(())
            }
            State::Open | State::Closed => Err(Error::BadState),
        }
    }

    /// Firmware acknowledged the flow-ring delete request.
    pub fn notify_closed(&mut self) -> Result<()> {
        match self.state {
            State::Closing => {
                self.state = State::Closed;
                Ok(())
            }
            State::Opening | State::Open | State::Closed => Err(Error::BadState),
        }
    }

    /// Drains up to `max` frames into the write ring. Stops early (but
    /// still returns `Ok`) when the ring is full or the TX pool is
    /// exhausted. An oversized frame is a hard per-frame failure: its
    /// owner is notified `NoResources` and it's dropped, but the batch
    /// continues with the next frame.
    ///
    /// No-op (returns `Ok(0)`) outside `Open`.
    pub fn submit(&mut self, tx_pool: &DmaPool, max: usize) -> Result<usize> {
        if self.state != State::Open {
            return Ok(0);
        }

        let entry_count = self
            .pending
            .len()
            .min(max)
            .min(self.write_ring.available_writes() as usize);
        if entry_count == 0 {
            return Ok(0);
        }

        // One mapping for the whole batch: entries live at consecutive
        // offsets from this base, written directly rather than through
        // repeated `map_write` calls (which would all hand back the
        // same still-uncommitted offset).
        let base = self.write_ring.map_write(entry_count as u16)? as *mut TxRequest;

        let mut submitted = 0;
        while submitted < entry_count {
            let Some(frame) = self.pending.pop_front() else {
                break;
            };

            if frame.data.len() > TX_HEADER_SIZE && frame.data.len() - TX_HEADER_SIZE > tx_pool.buffer_size() {
                warn!(
                    "flow ring {}: frame of {} bytes exceeds TX buffer size {}, dropping",
                    self.flow_ring_index,
                    frame.data.len(),
                    tx_pool.buffer_size()
                );
                (frame.on_complete)(Err(Error::NoResources));
                continue;
            }

            let tx_buffer = match tx_pool.allocate() {
                Ok(buffer) => buffer,
                Err(Error::NoResources) => {
                    // Soft stop: put the frame back, submit whatever we
                    // already committed this pass.
                    self.pending.push_front(frame);
                    break;
                }
                Err(e) => return Err(e),
            };

            let entry_ptr = unsafe { base.add(submitted) };
            Self::write_entry(self.interface_index, entry_ptr, &frame, tx_buffer)?;
            (frame.on_complete)(Ok(()));
            submitted += 1;
        }

        if submitted > 0 {
            self.write_ring.commit_write(submitted as u16)?;
            debug!("flow ring {}: submitted {} frames", self.flow_ring_index, submitted);
        }
        Ok(submitted)
    }

    fn write_entry(interface_index: u8, entry_ptr: *mut TxRequest, frame: &Frame, mut tx_buffer: Buffer) -> Result<()> {
        let header_len = frame.data.len().min(TX_HEADER_SIZE);
        let payload = &frame.data[header_len..];

        let data_buf_addr = if payload.is_empty() {
            0
        } else {
            let ptr = tx_buffer.map_write(payload.len())?;
            unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };
            tx_buffer.pin()?
        };

        // Staged in a stack-only fixed-capacity buffer before landing in
        // the packed ring entry's plain array field, the same inline-copy
        // role arrayvec plays for small fixed-size buffers elsewhere in
        // this corpus.
        let mut staged: ArrayVec<u8, TX_HEADER_SIZE> = ArrayVec::new();
        staged
            .try_extend_from_slice(&frame.data[..header_len])
            .expect("header_len <= TX_HEADER_SIZE by construction");
        staged.extend(std::iter::repeat(0u8).take(TX_HEADER_SIZE - header_len));
        let mut txhdr = [0u8; TX_HEADER_SIZE];
        txhdr.copy_from_slice(&staged);

        let entry = TxRequest {
            common: CommonHeader::new(MsgType::TxRequest, interface_index, 0, tx_buffer.index() as u32),
            txhdr,
            data_len: payload.len() as u16,
            seg_cnt: 1,
            flags: TxFlags::FRAME_TYPE_802_3.bits(),
            data_buf_addr,
        };

        unsafe { std::ptr::write_unaligned(entry_ptr, entry) };

        // The device now owns the payload buffer; reacquirable by index
        // once it posts a completion.
        tx_buffer.release();
        Ok(())
    }
}
