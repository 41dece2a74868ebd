//! Device handles: the control node fd plus the sparse per-endpoint node
//! table.

use std::ffi::c_int;
use std::sync::Mutex;

use log::{debug, warn};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;

use crate::driver::USB_MAX_ENDPOINTS;
use crate::error::Error;
use crate::request::{RequestFlags, SetupPacket};

use super::ugenfs;

/// Hook fired when the device disappears underneath its open nodes.
pub type DisconnectHook = Box<dyn Fn() + Send + Sync>;

/// An opened generic USB device.
///
/// A device attached to the generic driver has a `devname` (its node name,
/// e.g. `ugen0`) and an open control node. A device without an attached
/// node can still make synchronous control transfers through its bus node.
pub struct DeviceHandle {
    devname: Option<String>,
    bus_number: u8,
    address: u8,
    fd: Option<OwnedFd>,
    endpoints: Mutex<[Option<OwnedFd>; USB_MAX_ENDPOINTS]>,
    disconnect: Mutex<Option<DisconnectHook>>,
}

impl DeviceHandle {
    /// Open the control node of a device attached to the generic driver.
    pub(crate) fn open(devname: &str, bus_number: u8, address: u8) -> Result<DeviceHandle, Error> {
        let path = ugenfs::control_node(devname);
        let fd = match rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ACCESS) => {
                // Read-only still allows reaping and descriptor queries.
                warn!("opening {path:?} read-only");
                rustix::fs::open(&path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
                    .map_err(|e| Error::from_errno(e, "failed to open device node").log_debug())?
            }
            Err(e) => return Err(Error::from_errno(e, "failed to open device node").log_debug()),
        };
        debug!("opened {path:?} as fd {}", fd.as_raw_fd());
        Ok(DeviceHandle {
            devname: Some(devname.to_owned()),
            bus_number,
            address,
            fd: Some(fd),
            endpoints: Mutex::new(std::array::from_fn(|_| None)),
            disconnect: Mutex::new(None),
        })
    }

    /// A device with no generic-driver node; only synchronous control
    /// transfers through the bus node are possible.
    pub(crate) fn unattached(bus_number: u8, address: u8) -> DeviceHandle {
        DeviceHandle {
            devname: None,
            bus_number,
            address,
            fd: None,
            endpoints: Mutex::new(std::array::from_fn(|_| None)),
            disconnect: Mutex::new(None),
        }
    }

    /// Node name of the attached generic driver, if any.
    pub fn devname(&self) -> Option<&str> {
        self.devname.as_deref()
    }

    /// Bus this device sits on.
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    /// USB device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Install the hook fired on disconnect.
    pub fn on_disconnect(&self, hook: DisconnectHook) {
        *self.disconnect.lock().unwrap() = Some(hook);
    }

    pub(crate) fn fire_disconnect(&self) {
        if let Some(hook) = self.disconnect.lock().unwrap().as_ref() {
            hook();
        }
    }

    pub(crate) fn device_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Issue a synchronous control request through the device node (the
    /// legacy `REQUEST` command). Blocks until the transfer finishes and
    /// returns the actual length. A zero timeout means the driver default.
    pub fn control_sync(
        &self,
        setup: SetupPacket,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, Error> {
        let fd = self.device_fd().ok_or_else(|| {
            Error::new(
                crate::ErrorKind::NotSupported,
                "device has no generic driver node",
            )
        })?;
        if data.len() < setup.length() as usize {
            return Err(Error::new(
                crate::ErrorKind::InvalidParam,
                "buffer shorter than wLength",
            ));
        }
        let mut req = ugenfs::UgenRequest {
            addr: self.address as c_int,
            setup: setup.0,
            data: data.as_mut_ptr().cast(),
            flags: RequestFlags::SHORT_XFER_OK.bits() as c_int,
            actlen: setup.length() as c_int,
            timeout: timeout_ms as c_int,
            context: 0,
            read: setup.is_read() as c_int,
            status: 0,
        };
        unsafe { ugenfs::request(fd, &mut req) }
            .map_err(|e| Error::from_errno(e, "synchronous request failed").log_debug())?;
        Ok(req.actlen as usize)
    }

    /// Raw device fd for pump bookkeeping.
    pub(crate) fn device_raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Open (or reuse) the node for an endpoint. Returns the raw fd and
    /// whether this call opened it, in which case the caller registers it
    /// with the event pump.
    ///
    /// The node is opened read-write so the same fd serves both directions;
    /// exclusive-use endpoints refuse that with `ENXIO`, and the open falls
    /// back to the direction needed now.
    pub(crate) fn access_endpoint(&self, endpoint: u8, read: bool) -> Result<(RawFd, bool), Error> {
        let Some(devname) = self.devname.as_deref() else {
            return Err(Error::new(
                crate::ErrorKind::NotSupported,
                "device has no generic driver node",
            ));
        };
        let number = (endpoint & 0x0f) as usize;

        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(fd) = &endpoints[number] {
            return Ok((fd.as_raw_fd(), false));
        }

        let path = ugenfs::endpoint_node(devname, number as u8);
        debug!("opening endpoint node {path:?}");
        let fd = match rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::NXIO) => {
                let mode = if read { OFlags::RDONLY } else { OFlags::WRONLY };
                rustix::fs::open(&path, mode | OFlags::CLOEXEC, Mode::empty())
                    .map_err(|e| Error::from_errno(e, "failed to open endpoint node"))?
            }
            Err(e) => return Err(Error::from_errno(e, "failed to open endpoint node")),
        };
        let raw = fd.as_raw_fd();
        endpoints[number] = Some(fd);
        Ok((raw, true))
    }

    /// Whether `fd` belongs to this handle; used to route pump readiness.
    pub(crate) fn owns_fd(&self, fd: RawFd) -> bool {
        if self.device_raw_fd() == Some(fd) {
            return true;
        }
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|e| e.as_raw_fd() == fd)
    }

    /// Take every open endpoint node, so the caller can unregister them
    /// from the pump before they close on drop.
    pub(crate) fn take_endpoint_fds(&self) -> Vec<OwnedFd> {
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.iter_mut().filter_map(|e| e.take()).collect()
    }
}

/// Open a bus node by number.
pub(crate) fn bus_open(number: u8) -> Result<OwnedFd, Error> {
    let path = ugenfs::bus_node(number);
    rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
        .map_err(|e| Error::from_errno(e, "failed to open bus node").log_debug())
}
