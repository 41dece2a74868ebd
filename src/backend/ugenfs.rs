//! Wrappers for the generic-USB character device ioctls.
//!
//! The control block crossing this boundary is [`UgenRequest`]; its setup
//! header is carried as raw little-endian bytes (see
//! [`SetupPacket`](crate::request::SetupPacket)), so the driver side applies
//! no byteswapping of its own. The legacy synchronous `REQUEST` command uses
//! the same layout.
#![allow(dead_code)]

use std::ffi::{c_int, c_void};
use std::path::PathBuf;

use rustix::{
    fd::AsFd,
    io,
    ioctl::{self, opcode, Ioctl, IoctlOutput, Opcode},
};

use crate::request::{RequestStatus, SETUP_PACKET_SIZE};

/// Highest bus number probed for `/dev/usb<N>` nodes.
pub const BUS_NODE_MAX: u8 = 8;

/// Path of a bus node.
pub fn bus_node(number: u8) -> PathBuf {
    PathBuf::from(format!("/dev/usb{number}"))
}

/// Path of a device's control node.
pub fn control_node(devname: &str) -> PathBuf {
    endpoint_node(devname, 0)
}

/// Path of a device's endpoint node.
pub fn endpoint_node(devname: &str, endpoint: u8) -> PathBuf {
    PathBuf::from(format!("/dev/{devname}.{endpoint:02}"))
}

/// The request control block as the driver expects it.
#[repr(C)]
#[derive(Debug)]
pub struct UgenRequest {
    pub addr: c_int,
    /// Setup header, 16-bit fields little-endian.
    pub setup: [u8; SETUP_PACKET_SIZE],
    pub data: *mut c_void,
    pub flags: c_int,
    /// Requested length in, actual length out.
    pub actlen: c_int,
    pub timeout: c_int,
    /// Opaque correlation id; the driver hands it back on reap.
    pub context: usize,
    pub read: c_int,
    /// Wire-encoded [`RequestStatus`], valid on reap.
    pub status: c_int,
}

impl UgenRequest {
    pub fn zeroed() -> UgenRequest {
        UgenRequest {
            addr: 0,
            setup: [0; SETUP_PACKET_SIZE],
            data: std::ptr::null_mut(),
            flags: 0,
            actlen: 0,
            timeout: 0,
            context: 0,
            read: 0,
            status: 0,
        }
    }
}

// Wire encoding of transfer statuses.
pub const STATUS_NORMAL: c_int = 0;
pub const STATUS_IN_PROGRESS: c_int = 1;
pub const STATUS_INVAL: c_int = 4;
pub const STATUS_NOMEM: c_int = 5;
pub const STATUS_CANCELLED: c_int = 6;
pub const STATUS_IOERROR: c_int = 13;
pub const STATUS_TIMEOUT: c_int = 15;
pub const STATUS_SHORT_XFER: c_int = 16;
pub const STATUS_STALLED: c_int = 17;
pub const STATUS_INTERRUPTED: c_int = 18;

/// Decode a reaped status field.
pub fn status_from_wire(status: c_int) -> RequestStatus {
    match status {
        STATUS_NORMAL => RequestStatus::Normal,
        STATUS_IN_PROGRESS => RequestStatus::InProgress,
        STATUS_INVAL => RequestStatus::Invalid,
        STATUS_NOMEM => RequestStatus::NoMemory,
        STATUS_CANCELLED => RequestStatus::Cancelled,
        STATUS_TIMEOUT => RequestStatus::TimedOut,
        STATUS_SHORT_XFER => RequestStatus::Short,
        STATUS_STALLED => RequestStatus::Stalled,
        STATUS_INTERRUPTED => RequestStatus::Interrupted,
        _ => RequestStatus::IoError,
    }
}

const USB_REQUEST: Opcode = opcode::read_write::<UgenRequest>(b'U', 1);
const USB_SET_TIMEOUT: Opcode = opcode::write::<c_int>(b'U', 70);
const USB_SET_SHORT_XFER: Opcode = opcode::write::<c_int>(b'U', 71);
const USB_DO_REQUEST: Opcode = opcode::read_write::<UgenRequest>(b'U', 111);
const USB_GET_COMPLETED: Opcode = opcode::read_write::<UgenRequest>(b'U', 112);
const USB_CANCEL: Opcode = opcode::write::<UgenRequest>(b'U', 113);

/// Pointer-passing ioctl whose argument the kernel updates in place.
struct Update<const OPCODE: Opcode, Input> {
    input: *mut Input,
}

impl<const OPCODE: Opcode, Input> Update<OPCODE, Input> {
    /// # Safety
    ///
    /// - `OPCODE` must be valid for `Input` on this device.
    /// - Pointers inside `Input` must be valid for the kernel to read or
    ///   write through for the duration of the call (and, for asynchronous
    ///   submission, until the request is reaped).
    unsafe fn new(input: *mut Input) -> Self {
        Self { input }
    }
}

unsafe impl<const OPCODE: Opcode, Input> Ioctl for Update<OPCODE, Input> {
    type Output = ();

    const IS_MUTATING: bool = true;

    fn opcode(&self) -> Opcode {
        OPCODE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        self.input as *mut c_void
    }

    unsafe fn output_from_ptr(_: IoctlOutput, _: *mut c_void) -> io::Result<Self::Output> {
        Ok(())
    }
}

/// Submit an asynchronous request (`DO_REQUEST`).
///
/// # Safety
///
/// `req.data` must stay valid and unmoved until the request is reaped with
/// [`get_completed`] or the endpoint is closed; the driver reads from or
/// writes into it after this call returns.
pub unsafe fn do_request<Fd: AsFd>(fd: Fd, req: *mut UgenRequest) -> io::Result<()> {
    unsafe {
        let ctl = Update::<{ USB_DO_REQUEST }, UgenRequest>::new(req);
        ioctl::ioctl(fd, ctl)
    }
}

/// Pop the endpoint's oldest completion (`GET_COMPLETED`). Fails with `EIO`
/// when nothing is ready.
///
/// # Safety
///
/// `req` must be valid for the kernel to write the reaped control block to.
pub unsafe fn get_completed<Fd: AsFd>(fd: Fd, req: *mut UgenRequest) -> io::Result<()> {
    unsafe {
        let ctl = Update::<{ USB_GET_COMPLETED }, UgenRequest>::new(req);
        ioctl::ioctl(fd, ctl)
    }
}

/// Cancel the outstanding request with the given context (`CANCEL`).
pub fn cancel<Fd: AsFd>(fd: Fd, context: usize) -> io::Result<()> {
    let mut req = UgenRequest::zeroed();
    req.context = context;
    unsafe {
        let ctl = Update::<{ USB_CANCEL }, UgenRequest>::new(&mut req);
        ioctl::ioctl(fd, ctl)
    }
}

/// Set the endpoint's default timeout, both directions (`SET_TIMEOUT`).
pub fn set_timeout<Fd: AsFd>(fd: Fd, timeout_ms: u32) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ USB_SET_TIMEOUT }, c_int>::new(timeout_ms as c_int);
        ioctl::ioctl(fd, ctl)
    }
}

/// Toggle short-transfer tolerance on reads (`SET_SHORT_XFER`).
pub fn set_short_xfer<Fd: AsFd>(fd: Fd, ok: bool) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ USB_SET_SHORT_XFER }, c_int>::new(ok as c_int);
        ioctl::ioctl(fd, ctl)
    }
}

/// The legacy synchronous request (`REQUEST`): blocks until the transfer
/// finishes and updates `req.actlen` in place.
///
/// # Safety
///
/// `req.data` must be valid for the kernel to read or write through for the
/// duration of the call.
pub unsafe fn request<Fd: AsFd>(fd: Fd, req: *mut UgenRequest) -> io::Result<()> {
    unsafe {
        let ctl = Update::<{ USB_REQUEST }, UgenRequest>::new(req);
        ioctl::ioctl(fd, ctl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names() {
        assert_eq!(bus_node(0).to_str(), Some("/dev/usb0"));
        assert_eq!(control_node("ugen0").to_str(), Some("/dev/ugen0.00"));
        assert_eq!(endpoint_node("ugen2", 3).to_str(), Some("/dev/ugen2.03"));
        assert_eq!(endpoint_node("ugen2", 12).to_str(), Some("/dev/ugen2.12"));
    }

    #[test]
    fn status_decoding() {
        assert_eq!(status_from_wire(STATUS_NORMAL), RequestStatus::Normal);
        assert_eq!(status_from_wire(STATUS_CANCELLED), RequestStatus::Cancelled);
        assert_eq!(status_from_wire(STATUS_STALLED), RequestStatus::Stalled);
        assert_eq!(status_from_wire(STATUS_SHORT_XFER), RequestStatus::Short);
        assert_eq!(status_from_wire(STATUS_TIMEOUT), RequestStatus::TimedOut);
        // Unknown wire values degrade to a generic I/O error.
        assert_eq!(status_from_wire(99), RequestStatus::IoError);
    }
}
