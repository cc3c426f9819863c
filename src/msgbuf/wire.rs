//! Bit-exact MSGBUF wire records.
//!
//! Every record here is `repr(C, packed)`, little-endian, with no
//! padding beyond what's written out explicitly as a reserved field.
//! Sizes are pinned down with `static_assertions` so a field reorder or
//! an accidental padding byte fails to compile rather than silently
//! shifting every ring entry.

use static_assertions::const_assert_eq;

/// 1-byte tag identifying which record format a ring entry uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Invalid = 0x00,
    /// Flow ring create request (host → device). Value not given by any
    /// retained firmware ABI reference; chosen as the smallest tag not
    /// already claimed by the fixed common-header tags below.
    FlowRingCreate = 0x03,
    /// Flow ring delete request (host → device), same caveat as above.
    FlowRingDelete = 0x05,
    IoctlRequest = 0x09,
    IoctlAck = 0x0A,
    IoctlBufferPost = 0x0B,
    IoctlResponse = 0x0C,
    EventBufferPost = 0x0D,
    /// Event notification arriving on the control complete ring,
    /// same caveat as the flow-ring tags above.
    WlEvent = 0x0E,
    /// TX data request (host → device) on a flow ring, same caveat.
    TxRequest = 0x0F,
    RxBufferPost = 0x11,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Invalid),
            0x03 => Some(Self::FlowRingCreate),
            0x05 => Some(Self::FlowRingDelete),
            0x09 => Some(Self::IoctlRequest),
            0x0A => Some(Self::IoctlAck),
            0x0B => Some(Self::IoctlBufferPost),
            0x0C => Some(Self::IoctlResponse),
            0x0D => Some(Self::EventBufferPost),
            0x0E => Some(Self::WlEvent),
            0x0F => Some(Self::TxRequest),
            0x11 => Some(Self::RxBufferPost),
            _ => None,
        }
    }
}

/// Inline header carried by every ring entry: 8 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CommonHeader {
    pub msgtype: u8,
    pub interface_index: u8,
    pub flags: u8,
    pub _reserved: u8,
    pub request_id: u32,
}
const_assert_eq!(std::mem::size_of::<CommonHeader>(), 8);

impl CommonHeader {
    pub fn new(msgtype: MsgType, interface_index: u8, flags: u8, request_id: u32) -> Self {
        Self {
            msgtype: msgtype as u8,
            interface_index,
            flags,
            _reserved: 0,
            request_id,
        }
    }
}

/// Shared by every entry on a complete ring: 4 bytes, immediately after
/// [`CommonHeader`].
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CompletionHeader {
    pub status: i16,
    pub flow_ring_id: u16,
}
const_assert_eq!(std::mem::size_of::<CompletionHeader>(), 4);

/// Host → device ioctl request: 40 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct IoctlRequest {
    pub common: CommonHeader,
    pub cmd: u32,
    pub trans_id: u16,
    pub input_len: u16,
    pub output_len: u16,
    pub _reserved: [u16; 3],
    pub req_buf_addr: u64,
    pub _reserved2: [u32; 2],
}
const_assert_eq!(std::mem::size_of::<IoctlRequest>(), 40);

/// Device → host ioctl response: 24 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct IoctlResponse {
    pub common: CommonHeader,
    pub completion: CompletionHeader,
    pub resp_len: u16,
    pub trans_id: u16,
    pub cmd: u32,
    pub _reserved: u32,
}
const_assert_eq!(std::mem::size_of::<IoctlResponse>(), 24);

/// Host → device ioctl or event RX buffer post: 32 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct IoctlOrEventBufferPost {
    pub common: CommonHeader,
    pub host_buf_len: u16,
    pub _reserved: [u16; 3],
    pub host_buf_addr: u64,
    pub _reserved2: [u32; 2],
}
const_assert_eq!(std::mem::size_of::<IoctlOrEventBufferPost>(), 32);

/// Device → host WLAN event: shares the RX buffer post layout's
/// completion-side fields via [`CommonHeader`] + data already posted by
/// a prior `IoctlOrEventBufferPost`; the event payload is read out of
/// that posted buffer, not carried inline. Mirrors `IoctlResponse`'s
/// completion shape since both arrive on the control complete ring.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct WlEvent {
    pub common: CommonHeader,
    pub completion: CompletionHeader,
    pub event_data_len: u32,
    pub _reserved: u32,
}
const_assert_eq!(std::mem::size_of::<WlEvent>(), 20);

/// Host → device data RX buffer post: 32 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct RxBufferPost {
    pub common: CommonHeader,
    pub metadata_len: u16,
    pub data_len: u16,
    pub _reserved: u32,
    pub metadata_addr: u64,
    pub data_addr: u64,
}
const_assert_eq!(std::mem::size_of::<RxBufferPost>(), 32);

/// Inline TX header bytes copied from the front of every frame. The
/// exact length is firmware-ABI defined; implementers must match it. 30
/// bytes covers an Ethernet header plus the BDC header the original
/// driver prepends, and keeps `TxRequest` comfortably above the 48-byte
/// floor.
pub const TX_HEADER_SIZE: usize = 30;

/// Host → device TX data request on a flow ring.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct TxRequest {
    pub common: CommonHeader,
    pub txhdr: [u8; TX_HEADER_SIZE],
    pub data_len: u16,
    pub seg_cnt: u8,
    pub flags: u8,
    pub data_buf_addr: u64,
}
const_assert_eq!(std::mem::size_of::<TxRequest>(), 50);

bitflags::bitflags! {
    /// `TxRequest::flags` as named bits. The wire field itself stays a
    /// plain `u8` (the packed struct's layout is load-bearing); this is
    /// the typed view code builds and inspects it through, converted at
    /// the boundary with `.bits()` / `from_bits_truncate()`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxFlags: u8 {
        /// A plain Ethernet (802.3) frame, as opposed to an 802.11 or
        /// AMSDU-aggregated one.
        const FRAME_TYPE_802_3 = 0x01;
        const FRAME_TYPE_AMSDU = 0x02;
        const EXEMPT = 0x04;
    }
}

/// Host → device flow ring creation request.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FlowRingCreateRequest {
    pub common: CommonHeader,
    pub da: [u8; 6],
    pub sa: [u8; 6],
    pub tid: u8,
    pub flow_ring_id: u16,
    pub max_items: u16,
    pub len_item: u16,
    pub flow_ring_addr: u64,
}
const_assert_eq!(std::mem::size_of::<FlowRingCreateRequest>(), 35);

/// Host → device flow ring deletion request.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FlowRingDeleteRequest {
    pub common: CommonHeader,
    pub flow_ring_id: u16,
    pub _reserved: u16,
}
const_assert_eq!(std::mem::size_of::<FlowRingDeleteRequest>(), 12);
