//! The user-space library back-end.
//!
//! [`Context`] maps the generic submit/cancel/poll contract onto the
//! character-device ioctls: control and bulk transfers are submitted
//! asynchronously with `DO_REQUEST` and reaped by the event pump with
//! `GET_COMPLETED`; interrupt and isochronous reads take the pre-existing
//! synchronous endpoint-node path; control transfers on devices without a
//! generic-driver node fall back to the synchronous bus-node request.

use std::ffi::c_int;
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::OnceCell;
use rustix::fd::{AsRawFd, BorrowedFd, RawFd};

use crate::error::{Error, ErrorKind};
use crate::request::{RequestFlags, SetupPacket, SETUP_PACKET_SIZE};

mod device;
mod events;
mod transfer;
pub(crate) mod ugenfs;

pub use device::{DeviceHandle, DisconnectHook};
pub use transfer::{Transfer, TransferFlags, TransferKind, TransferStatus, ENDPOINT_DIR_IN};

use device::bus_open;
use events::Pump;
use transfer::{drain_completions, Registry};
use ugenfs::UgenRequest;

/// One descriptor the pump observed as ready.
#[derive(Copy, Clone, Debug)]
pub struct ReadyEvent {
    /// The ready descriptor.
    pub fd: RawFd,
    /// Whether the error bit was set, signalling disconnect.
    pub error: bool,
}

/// The back-end: open devices, outstanding transfers, and the event pump.
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    open_devs: Mutex<Vec<Arc<DeviceHandle>>>,
    registry: Registry,
    pump: OnceCell<Pump>,
}

impl Context {
    /// Create an empty back-end. The pump thread starts on first use.
    pub fn new() -> Context {
        Context {
            inner: Arc::new(ContextInner {
                open_devs: Mutex::new(Vec::new()),
                registry: Registry::new(),
                pump: OnceCell::new(),
            }),
        }
    }

    /// Open a device attached to the generic driver and register its
    /// control node with the pump.
    pub fn open_device(
        &self,
        devname: &str,
        bus_number: u8,
        address: u8,
    ) -> Result<Arc<DeviceHandle>, Error> {
        let handle = Arc::new(DeviceHandle::open(devname, bus_number, address)?);
        if let Some(fd) = handle.device_raw_fd() {
            self.pump().register(fd);
        }
        self.inner.open_devs.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    /// Track a device with no generic-driver node. Only synchronous control
    /// transfers through its bus node are possible.
    pub fn open_unattached(&self, bus_number: u8, address: u8) -> Arc<DeviceHandle> {
        let handle = Arc::new(DeviceHandle::unattached(bus_number, address));
        self.inner.open_devs.lock().unwrap().push(handle.clone());
        handle
    }

    /// Drop a device: unregister and close its descriptors.
    pub fn close_device(&self, handle: &Arc<DeviceHandle>) {
        let mut open_devs = self.inner.open_devs.lock().unwrap();
        open_devs.retain(|h| !Arc::ptr_eq(h, handle));
        drop(open_devs);
        for fd in handle.take_endpoint_fds() {
            self.inner.pump_unregister(fd.as_raw_fd());
        }
        if let Some(fd) = handle.device_raw_fd() {
            self.inner.pump_unregister(fd);
        }
    }

    /// Submit a transfer.
    ///
    /// Asynchronous paths (control on an attached device, bulk) return as
    /// soon as the request is in the driver; the completion arrives through
    /// the pump. Synchronous paths (bus-node control fallback, interrupt,
    /// isochronous reads) signal the transfer complete before returning.
    pub fn submit(&self, handle: &Arc<DeviceHandle>, transfer: &Arc<Transfer>) -> Result<(), Error> {
        match transfer.kind {
            TransferKind::Control => self.submit_control(handle, transfer),
            TransferKind::Bulk => self.submit_bulk(handle, transfer),
            TransferKind::Isochronous => {
                if !transfer.is_read() {
                    // Isochronous write is not supported.
                    return Err(Error::new(ErrorKind::NotSupported, "isochronous write"));
                }
                self.submit_sync_endpoint(handle, transfer)
            }
            TransferKind::Interrupt => {
                if !transfer.is_read() && transfer.flags.contains(TransferFlags::ADD_ZERO_PACKET) {
                    return Err(Error::new(
                        ErrorKind::NotSupported,
                        "interrupt write with zero packet",
                    ));
                }
                self.submit_sync_endpoint(handle, transfer)
            }
        }
    }

    /// Cancel an outstanding transfer.
    ///
    /// Returns promptly; the cancelled completion arrives through the pump.
    pub fn cancel(&self, handle: &Arc<DeviceHandle>, transfer: &Arc<Transfer>) -> Result<(), Error> {
        let context = transfer
            .lock()
            .context
            .ok_or_else(|| Error::new(ErrorKind::InvalidParam, "transfer is not outstanding"))?;
        match transfer.kind {
            TransferKind::Control => {
                let fd = handle.device_fd().ok_or_else(|| {
                    Error::new(ErrorKind::NotSupported, "device has no generic driver node")
                })?;
                ugenfs::cancel(fd, context).map_err(|e| {
                    debug!("transfer ctx {context} not found");
                    Error::from_errno(e, "cancel failed")
                })
            }
            TransferKind::Bulk => {
                let (fd, newly) = handle.access_endpoint(transfer.endpoint, transfer.is_read())?;
                if newly {
                    self.pump().register(fd);
                }
                let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                ugenfs::cancel(fd, context).map_err(|e| {
                    debug!("transfer ctx {context} not found");
                    Error::from_errno(e, "cancel failed")
                })
            }
            _ => Err(Error::new(
                ErrorKind::NotSupported,
                "cancel on synchronous transfer type",
            )),
        }
    }

    /// Forget a transfer's registry entry, if it still has one.
    pub fn clear_transfer(&self, transfer: &Arc<Transfer>) {
        if let Some(context) = transfer.lock().context.take() {
            self.inner.registry.remove(context);
        }
    }

    /// Process a set of descriptors the pump observed ready. Public so an
    /// external event loop can drive the back-end instead of the built-in
    /// pump.
    pub fn handle_events(&self, events: &[ReadyEvent]) -> Result<(), Error> {
        self.inner.handle_events(events)
    }

    fn submit_control(
        &self,
        handle: &Arc<DeviceHandle>,
        transfer: &Arc<Transfer>,
    ) -> Result<(), Error> {
        let (setup, data) = {
            let mut state = transfer.lock();
            let setup = SetupPacket::from_prefix(&state.buffer).ok_or_else(|| {
                Error::new(ErrorKind::InvalidParam, "control buffer too short for setup")
            })?;
            if state.buffer.len() < SETUP_PACKET_SIZE + setup.length() as usize {
                return Err(Error::new(
                    ErrorKind::InvalidParam,
                    "control buffer shorter than wLength",
                ));
            }
            // Pointer to the data stage; stable while the Arc lives and the
            // buffer is left alone.
            let data = unsafe { state.buffer.as_mut_ptr().add(SETUP_PACKET_SIZE) };
            (setup, data)
        };
        debug!(
            "control submit: type {:#x} request {:#x} value {:#x} index {} length {} timeout {}",
            setup.request_type(),
            setup.request(),
            setup.value(),
            setup.index(),
            setup.length(),
            transfer.timeout_ms,
        );

        let mut flags = 0;
        if !transfer.flags.contains(TransferFlags::SHORT_NOT_OK) {
            flags |= RequestFlags::SHORT_XFER_OK.bits() as c_int;
        }

        let mut req = UgenRequest {
            addr: handle.address() as c_int,
            setup: setup.0,
            data: data.cast(),
            flags,
            actlen: setup.length() as c_int,
            timeout: 0,
            context: 0,
            read: setup.is_read() as c_int,
            status: 0,
        };

        match handle.device_fd() {
            None => {
                // No attached driver node: a synchronous request through
                // the bus node, default timeout only, completes eagerly.
                let bus = bus_open(handle.bus_number())?;
                unsafe { ugenfs::request(&bus, &mut req) }
                    .map_err(|e| Error::from_errno(e, "bus-node request failed"))?;
                transfer.finish(TransferStatus::Completed, req.actlen as usize);
                Ok(())
            }
            Some(fd) => {
                let context = self.inner.registry.insert(transfer.clone());
                req.context = context;
                req.timeout = transfer.timeout_ms as c_int;
                if let Err(e) = unsafe { ugenfs::do_request(fd, &mut req) } {
                    self.inner.registry.remove(context);
                    transfer.lock().context = None;
                    return Err(Error::from_errno(e, "control submit failed").log_debug());
                }
                Ok(())
            }
        }
    }

    fn submit_bulk(
        &self,
        handle: &Arc<DeviceHandle>,
        transfer: &Arc<Transfer>,
    ) -> Result<(), Error> {
        let read = transfer.is_read();
        let (fd, newly) = handle.access_endpoint(transfer.endpoint, read)?;
        if newly {
            self.pump().register(fd);
        }

        let mut flags = 0;
        if !transfer.flags.contains(TransferFlags::SHORT_NOT_OK) {
            flags |= RequestFlags::SHORT_XFER_OK.bits() as c_int;
        }
        if transfer.flags.contains(TransferFlags::ADD_ZERO_PACKET) {
            flags |= RequestFlags::FORCE_SHORT_XFER.bits() as c_int;
        }

        let (data, len) = {
            let mut state = transfer.lock();
            (state.buffer.as_mut_ptr(), state.buffer.len())
        };
        let context = self.inner.registry.insert(transfer.clone());
        let mut req = UgenRequest {
            addr: handle.address() as c_int,
            setup: [0; SETUP_PACKET_SIZE],
            data: data.cast(),
            flags,
            actlen: len as c_int,
            timeout: transfer.timeout_ms as c_int,
            context,
            read: read as c_int,
            status: 0,
        };
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = unsafe { ugenfs::do_request(fd, &mut req) } {
            self.inner.registry.remove(context);
            transfer.lock().context = None;
            return Err(Error::from_errno(e, "bulk submit failed").log_debug());
        }
        Ok(())
    }

    /// The pre-existing synchronous endpoint-node path used for interrupt
    /// and isochronous transfers: plain read/write with the endpoint's
    /// timeout and short-transfer settings, completion signalled eagerly.
    fn submit_sync_endpoint(
        &self,
        handle: &Arc<DeviceHandle>,
        transfer: &Arc<Transfer>,
    ) -> Result<(), Error> {
        let read = transfer.is_read();
        let (fd, newly) = handle.access_endpoint(transfer.endpoint, read)?;
        if newly {
            self.pump().register(fd);
        }
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };

        ugenfs::set_timeout(fd, transfer.timeout_ms)
            .map_err(|e| Error::from_errno(e, "failed to set endpoint timeout"))?;
        if read && !transfer.flags.contains(TransferFlags::SHORT_NOT_OK) {
            ugenfs::set_short_xfer(fd, true)
                .map_err(|e| Error::from_errno(e, "failed to allow short transfers"))?;
        }

        let n = {
            let mut state = transfer.lock();
            if read {
                rustix::io::read(fd, &mut state.buffer)
            } else {
                rustix::io::write(fd, &state.buffer)
            }
            .map_err(|e| Error::from_errno(e, "endpoint transfer failed"))?
        };
        transfer.finish(TransferStatus::Completed, n);
        Ok(())
    }

    fn pump(&self) -> &Pump {
        self.inner
            .pump
            .get_or_init(|| Pump::start(Arc::downgrade(&self.inner)))
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl ContextInner {
    /// Drain completions for each ready descriptor, dispatching terminal
    /// statuses to the owning transfers. Runs under the open-devices lock
    /// so the fd-to-handle mapping stays stable.
    pub(crate) fn handle_events(&self, events: &[ReadyEvent]) -> Result<(), Error> {
        let open_devs = self.open_devs.lock().unwrap();
        for event in events {
            let Some(handle) = open_devs.iter().find(|h| h.owns_fd(event.fd)) else {
                return Err(
                    Error::new(ErrorKind::Other, "ready fd is not an event descriptor")
                        .log_error(),
                );
            };

            if event.error {
                debug!("got a disconnect event on fd {}", event.fd);
                for fd in handle.take_endpoint_fds() {
                    self.pump_unregister(fd.as_raw_fd());
                }
                if let Some(fd) = handle.device_raw_fd() {
                    self.pump_unregister(fd);
                }
                handle.fire_disconnect();
                continue;
            }

            let fd = unsafe { BorrowedFd::borrow_raw(event.fd) };
            drain_completions(&self.registry, || {
                let mut req = UgenRequest::zeroed();
                match unsafe { ugenfs::get_completed(fd, &mut req) } {
                    Ok(()) => Some((
                        req.context,
                        ugenfs::status_from_wire(req.status),
                        req.actlen as usize,
                    )),
                    // The queue is drained (or the node is gone); either
                    // way this descriptor is done.
                    Err(_) => None,
                }
            });
        }
        Ok(())
    }

    fn pump_unregister(&self, fd: RawFd) {
        if let Some(pump) = self.pump.get() {
            pump.unregister(fd);
        }
    }
}
