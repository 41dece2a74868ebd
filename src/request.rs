//! The request control block shared by the driver engine and the back-end.
//!
//! A [`Request`] describes one USB transfer as it crosses the ioctl boundary:
//! submitted with `DO_REQUEST`, reaped with `GET_COMPLETED`, targeted by
//! `CANCEL` through its [`context`](Request::context) field.

use bitflags::bitflags;
use rustix::io::Errno;

/// Setup-packet size in bytes.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Maximum data-stage length for a control request.
pub const MAX_CTRL_LEN: usize = 32767;

/// Default transfer timeout in milliseconds, used when a request that
/// requires a deadline supplies none.
pub const DEFAULT_TIMEOUT_MS: u32 = 5000;

/// `bmRequestType`: host-to-device, device recipient.
pub const RT_WRITE_DEVICE: u8 = 0x00;
/// `bmRequestType`: host-to-device, interface recipient.
pub const RT_WRITE_INTERFACE: u8 = 0x01;
/// `bmRequestType`: device-to-host, device recipient.
pub const RT_READ_DEVICE: u8 = 0x80;
/// Direction bit of `bmRequestType`.
pub const RT_READ: u8 = 0x80;

/// Standard request: GET_STATUS.
pub const REQ_GET_STATUS: u8 = 0x00;
/// Standard request: SET_ADDRESS.
pub const REQ_SET_ADDRESS: u8 = 0x05;
/// Standard request: SET_CONFIGURATION.
pub const REQ_SET_CONFIG: u8 = 0x09;
/// Standard request: SET_INTERFACE.
pub const REQ_SET_INTERFACE: u8 = 0x0b;
/// Standard request: CLEAR_FEATURE.
pub const REQ_CLEAR_FEATURE: u8 = 0x01;

/// The 8-byte control-request header.
///
/// The 16-bit fields are little-endian on the wire and in memory for
/// asynchronous submission. `SetupPacket` stores the raw bytes and converts
/// only in its typed accessors, so neither side of the boundary can byteswap
/// twice: the submitter packs host-order values once, and the driver engine
/// reads them back through the same accessors.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[repr(C)]
pub struct SetupPacket(pub [u8; SETUP_PACKET_SIZE]);

impl SetupPacket {
    /// Pack a setup packet from host-order fields.
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        let v = value.to_le_bytes();
        let i = index.to_le_bytes();
        let l = length.to_le_bytes();
        SetupPacket([request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]])
    }

    /// Reinterpret the first 8 bytes of `buf` as a setup packet.
    ///
    /// Returns `None` if `buf` is too short to contain one.
    pub fn from_prefix(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; SETUP_PACKET_SIZE] = buf.get(..SETUP_PACKET_SIZE)?.try_into().ok()?;
        Some(SetupPacket(bytes))
    }

    /// `bmRequestType` field.
    pub fn request_type(&self) -> u8 {
        self.0[0]
    }

    /// `bRequest` field.
    pub fn request(&self) -> u8 {
        self.0[1]
    }

    /// `wValue` field.
    pub fn value(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    /// `wIndex` field.
    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    /// `wLength` field: the length of the data stage.
    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    /// Whether the data stage moves device-to-host.
    pub fn is_read(&self) -> bool {
        self.request_type() & RT_READ != 0
    }

    /// Whether this request would damage bus integrity if issued from the
    /// generic device node: writes of SET_ADDRESS, SET_CONFIGURATION or
    /// SET_INTERFACE must go through the bus stack, never a user request.
    pub fn damages_bus_integrity(&self) -> bool {
        (self.request_type() == RT_WRITE_DEVICE && self.request() == REQ_SET_ADDRESS)
            || (self.request_type() == RT_WRITE_DEVICE && self.request() == REQ_SET_CONFIG)
            || (self.request_type() == RT_WRITE_INTERFACE && self.request() == REQ_SET_INTERFACE)
    }
}

bitflags! {
    /// Per-request transfer flags.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct RequestFlags: u32 {
        /// A read completing with fewer bytes than requested is not an error.
        const SHORT_XFER_OK = 0x04;
        /// Force the transfer to end on a short packet.
        const FORCE_SHORT_XFER = 0x08;
    }
}

/// State of a request, reported in the reaped control block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RequestStatus {
    /// Submitted and not yet finished.
    InProgress,
    /// Finished with the full requested length.
    Normal,
    /// Read finished short where short transfers are not tolerated.
    Short,
    /// Terminated by `CANCEL` or endpoint teardown.
    Cancelled,
    /// Endpoint stalled.
    Stalled,
    /// Deadline elapsed before the device responded.
    TimedOut,
    /// Interrupted by a signal.
    Interrupted,
    /// Generic transport failure.
    IoError,
    /// Transfer or buffer allocation failed.
    NoMemory,
    /// Malformed request.
    Invalid,
}

impl RequestStatus {
    /// Errno reported when a submit call fails outright instead of going
    /// in-progress.
    pub fn submit_errno(self) -> Errno {
        match self {
            RequestStatus::Interrupted => Errno::INTR,
            RequestStatus::TimedOut => Errno::TIMEDOUT,
            RequestStatus::NoMemory => Errno::NOMEM,
            RequestStatus::Invalid => Errno::INVAL,
            _ => Errno::IO,
        }
    }
}

/// One asynchronous USB request.
///
/// The submitter builds a `Request` and hands it to the driver engine, which
/// owns it until it is reaped (the buffer travels with it). The `context`
/// field is the correlation currency: it must be unique among the
/// outstanding requests of one endpoint, and `GET_COMPLETED` hands it back
/// unchanged so the caller can recover its own bookkeeping.
#[derive(Debug, PartialEq)]
pub struct Request {
    /// USB device address.
    pub address: u8,
    /// Control-request header. Ignored for bulk requests.
    pub setup: SetupPacket,
    /// Data buffer: read into (device-to-host) or written from
    /// (host-to-device). May be empty.
    pub data: Vec<u8>,
    /// Requested length. For control requests this must equal
    /// `setup.length()`; for bulk requests it is the transfer size.
    pub len: usize,
    /// Actual length on completion.
    pub actlen: usize,
    /// Transfer flags.
    pub flags: RequestFlags,
    /// Data-stage direction for bulk requests (control requests carry the
    /// direction in the setup packet).
    pub read: bool,
    /// Timeout in milliseconds; 0 means no deadline, interruptible wait.
    pub timeout_ms: u32,
    /// Opaque submitter-chosen correlation id.
    pub context: usize,
    /// Terminal state, valid once reaped.
    pub status: RequestStatus,
}

impl Request {
    /// Build a control request. `data` must be the full data-stage buffer;
    /// its length becomes `wLength`-checked `len`.
    pub fn control(
        address: u8,
        setup: SetupPacket,
        data: Vec<u8>,
        timeout_ms: u32,
        context: usize,
    ) -> Request {
        Request {
            address,
            setup,
            len: setup.length() as usize,
            read: setup.is_read(),
            data,
            actlen: 0,
            flags: RequestFlags::empty(),
            timeout_ms,
            context,
            status: RequestStatus::InProgress,
        }
    }

    /// Build a bulk request of `data.len()` bytes in the given direction.
    pub fn bulk(address: u8, data: Vec<u8>, read: bool, timeout_ms: u32, context: usize) -> Request {
        Request {
            address,
            setup: SetupPacket::default(),
            len: data.len(),
            data,
            actlen: 0,
            flags: RequestFlags::empty(),
            read,
            timeout_ms,
            context,
            status: RequestStatus::InProgress,
        }
    }

    /// Set transfer flags.
    pub fn with_flags(mut self, flags: RequestFlags) -> Request {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_is_little_endian() {
        let s = SetupPacket::new(RT_READ_DEVICE, REQ_GET_STATUS, 0x1234, 0xabcd, 2);
        assert_eq!(s.0, [0x80, 0x00, 0x34, 0x12, 0xcd, 0xab, 0x02, 0x00]);
        assert_eq!(s.value(), 0x1234);
        assert_eq!(s.index(), 0xabcd);
        assert_eq!(s.length(), 2);
        assert!(s.is_read());
    }

    #[test]
    fn setup_packet_from_prefix() {
        let buf = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff];
        let s = SetupPacket::from_prefix(&buf).unwrap();
        assert_eq!(s.request(), REQ_SET_CONFIG);
        assert_eq!(s.value(), 1);
        assert!(SetupPacket::from_prefix(&buf[..7]).is_none());
    }

    #[test]
    fn bus_integrity_writes_are_flagged() {
        for (rt, rq) in [
            (RT_WRITE_DEVICE, REQ_SET_ADDRESS),
            (RT_WRITE_DEVICE, REQ_SET_CONFIG),
            (RT_WRITE_INTERFACE, REQ_SET_INTERFACE),
        ] {
            assert!(SetupPacket::new(rt, rq, 0, 0, 0).damages_bus_integrity());
        }
        // The read-direction counterparts are fine.
        assert!(!SetupPacket::new(RT_READ_DEVICE, REQ_GET_STATUS, 0, 0, 2).damages_bus_integrity());
        assert!(!SetupPacket::new(RT_READ_DEVICE, REQ_SET_CONFIG, 0, 0, 0).damages_bus_integrity());
    }

    #[test]
    fn submit_errno_translation() {
        assert_eq!(RequestStatus::Interrupted.submit_errno(), Errno::INTR);
        assert_eq!(RequestStatus::TimedOut.submit_errno(), Errno::TIMEDOUT);
        assert_eq!(RequestStatus::Stalled.submit_errno(), Errno::IO);
        assert_eq!(RequestStatus::IoError.submit_errno(), Errno::IO);
    }
}
