//! The driver-side asynchronous transfer engine.
//!
//! [`Device`] models the generic-USB character driver's view of one device:
//! an endpoint table where each endpoint carries a submit queue and a
//! complete queue of outstanding [`Request`]s. Submission is non-blocking;
//! the host controller (a [`Bus`] implementation) reports completion through
//! a [`BusComplete`] capability, which moves the request between queues and
//! wakes pollers. Results are reaped explicitly, in completion order.
//!
//! Methods return `rustix::io::Errno` because this layer models the ioctl
//! surface of the driver; the user-space back-end maps these to
//! [`Error`](crate::Error).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};
use rustix::io::Errno;

use crate::request::{Request, RequestFlags, RequestStatus, DEFAULT_TIMEOUT_MS, MAX_CTRL_LEN};

pub mod bus;
mod endpoint;

pub use bus::{Bus, BusComplete, BusXfer, Dir, EndpointKind, XferResult};

use endpoint::{Completed, Endpoint, InFlight};

/// Endpoint numbers per device.
pub const USB_MAX_ENDPOINTS: usize = 16;

/// The control endpoint number.
pub const CONTROL_ENDPOINT: u8 = 0;

/// Driver engine for one generic USB device.
pub struct Device<B: Bus> {
    shared: Arc<DeviceShared<B>>,
}

pub(crate) struct DeviceShared<B: Bus> {
    bus: Arc<B>,
    address: u8,
    endpoints: Mutex<[Option<Arc<Endpoint<B>>>; USB_MAX_ENDPOINTS]>,
    /// Correlation ids for the synchronous request path, carved from the top
    /// of the context space to stay clear of submitter-chosen values.
    sync_ctx: AtomicUsize,
}

impl<B: Bus> Device<B> {
    /// Attach to the device at `address`, opening its control pipe.
    pub fn new(bus: Arc<B>, address: u8) -> Result<Device<B>, Errno> {
        let pipe = bus
            .open_pipe(address, CONTROL_ENDPOINT, Dir::In, EndpointKind::Control)
            .map_err(|_| Errno::NXIO)?;
        let ep0 = Endpoint::new(CONTROL_ENDPOINT, EndpointKind::Control);
        ep0.pipes[Dir::In as usize]
            .set(pipe)
            .unwrap_or_else(|_| unreachable!("fresh endpoint"));

        let mut endpoints = std::array::from_fn(|_| None);
        endpoints[CONTROL_ENDPOINT as usize] = Some(Arc::new(ep0));

        Ok(Device {
            shared: Arc::new(DeviceShared {
                bus,
                address,
                endpoints: Mutex::new(endpoints),
                sync_ctx: AtomicUsize::new(usize::MAX),
            }),
        })
    }

    /// USB device address this engine drives.
    pub fn address(&self) -> u8 {
        self.shared.address
    }

    /// Open one direction of an endpoint, creating its queue pair on first
    /// open. The transfer type must match on reopen of the other direction.
    pub fn open_endpoint(&self, number: u8, dir: Dir, kind: EndpointKind) -> Result<(), Errno> {
        if number == CONTROL_ENDPOINT || number as usize >= USB_MAX_ENDPOINTS {
            return Err(Errno::INVAL);
        }
        let ep = {
            let mut table = self.shared.endpoints.lock().unwrap();
            match &table[number as usize] {
                Some(ep) if ep.kind != kind => return Err(Errno::INVAL),
                Some(ep) => ep.clone(),
                None => {
                    let ep = Arc::new(Endpoint::new(number, kind));
                    table[number as usize] = Some(ep.clone());
                    ep
                }
            }
        };
        if ep.pipes[dir as usize].get().is_some() {
            return Err(Errno::BUSY);
        }
        let pipe = self
            .shared
            .bus
            .open_pipe(self.shared.address, number, dir, kind)
            .map_err(|_| Errno::NXIO)?;
        ep.pipes[dir as usize].set(pipe).map_err(|_| Errno::BUSY)?;
        debug!("opened endpoint {number} dir {dir:?} as {kind:?}");
        Ok(())
    }

    /// Tear an endpoint down: abort every transfer still on the submit
    /// queue, wait for the cancelled completions to come back, then drain
    /// and free both queues.
    pub fn close_endpoint(&self, number: u8) -> Result<(), Errno> {
        let ep = self.shared.endpoint(number)?;

        let aborts: Vec<_> = {
            let mut queues = ep.queues.lock().unwrap();
            queues.closing = true;
            queues
                .submit
                .iter()
                .filter_map(|rec| rec.handle.as_ref().map(|h| (rec.req.read, h.clone())))
                .collect()
        };
        for (read, handle) in &aborts {
            if let Some(pipe) = ep.pipe(*read) {
                self.shared.bus.abort(pipe, handle);
            }
        }

        let mut queues = ep.queues.lock().unwrap();
        while !queues.submit.is_empty() {
            queues = ep.wait.wait(queues).unwrap();
        }
        let drained = queues.complete.len();
        queues.complete.clear();
        drop(queues);
        if drained > 0 {
            debug!("endpoint {number} teardown dropped {drained} unreaped completions");
        }

        self.shared.endpoints.lock().unwrap()[number as usize] = None;
        Ok(())
    }

    /// Tear down every open endpoint, the control endpoint last.
    pub fn close(&self) {
        let open: Vec<u8> = {
            let table = self.shared.endpoints.lock().unwrap();
            table
                .iter()
                .flatten()
                .map(|ep| ep.number)
                .filter(|n| *n != CONTROL_ENDPOINT)
                .collect()
        };
        for number in open {
            let _ = self.close_endpoint(number);
        }
        let _ = self.close_endpoint(CONTROL_ENDPOINT);
    }

    /// Submit an asynchronous request on the given endpoint (`DO_REQUEST`).
    ///
    /// Returns as soon as the transfer is in progress; the result is reaped
    /// later with [`get_completed`](Self::get_completed). Only setup-level
    /// failures are reported here.
    pub fn do_request(&self, endpoint: u8, req: Request) -> Result<(), Errno> {
        let ep = self.shared.endpoint(endpoint)?;
        if endpoint == CONTROL_ENDPOINT {
            self.shared.submit_ctrl(&ep, req)
        } else {
            match ep.kind {
                EndpointKind::Bulk => self.shared.submit_bulk(&ep, req),
                // Interrupt and isochronous endpoints keep their
                // ring-buffer read path; no async submission.
                _ => Err(Errno::INVAL),
            }
        }
    }

    /// Pop the oldest completion on the endpoint (`GET_COMPLETED`).
    ///
    /// Fails with `EIO` when the complete queue is empty; readiness is
    /// advertised through [`readable`](Self::readable). The reaped request
    /// carries the terminal status, the actual length, and (for reads that
    /// completed normally) the data.
    pub fn get_completed(&self, endpoint: u8) -> Result<Request, Errno> {
        let ep = self.shared.endpoint(endpoint)?;
        let rec = {
            let mut queues = ep.queues.lock().unwrap();
            queues.complete.pop_front().ok_or(Errno::IO)?
        };
        Ok(finish_record(rec))
    }

    /// Cancel the outstanding request with the given context (`CANCEL`).
    ///
    /// Best-effort and non-blocking: an in-flight transfer is aborted (the
    /// completion callback performs the queue move), an already-completed
    /// one is marked cancelled in place. Either way the record is reaped
    /// later with status [`RequestStatus::Cancelled`]. Fails with `EINVAL`
    /// if the context is not outstanding on this endpoint.
    pub fn cancel(&self, endpoint: u8, context: usize) -> Result<(), Errno> {
        let ep = self.shared.endpoint(endpoint)?;

        let in_flight = {
            let mut queues = ep.queues.lock().unwrap();
            if let Some(rec) = queues.submit.iter().find(|r| r.req.context == context) {
                Some((rec.req.read, rec.handle.clone()))
            } else if let Some(rec) = queues
                .complete
                .iter_mut()
                .find(|r| r.req.context == context)
            {
                rec.req.status = RequestStatus::Cancelled;
                None
            } else {
                return Err(Errno::INVAL);
            }
        };

        // The abort happens outside the queue lock: the bus may deliver the
        // cancelled completion synchronously, and that path takes the lock.
        if let Some((read, handle)) = in_flight {
            match handle {
                Some(handle) => {
                    if let Some(pipe) = ep.pipe(read) {
                        self.shared.bus.abort(pipe, &handle);
                    }
                }
                // Submission still in the bus; it will complete normally.
                None => debug!("cancel ctx {context} raced submission, not aborted"),
            }
        }
        Ok(())
    }

    /// Set the endpoint's default timeout in milliseconds, both directions
    /// (`SET_TIMEOUT`). Affects future synchronous operations only;
    /// asynchronous requests carry their own deadline.
    pub fn set_timeout(&self, endpoint: u8, timeout_ms: u32) -> Result<(), Errno> {
        let ep = self.shared.endpoint(endpoint)?;
        ep.queues.lock().unwrap().timeout_ms = timeout_ms;
        Ok(())
    }

    /// Default timeout configured on the endpoint.
    pub fn timeout(&self, endpoint: u8) -> Result<u32, Errno> {
        Ok(self.shared.endpoint(endpoint)?.queues.lock().unwrap().timeout_ms)
    }

    /// Toggle short-transfer tolerance on the IN side (`SET_SHORT_XFER`).
    /// Not meaningful on the control endpoint.
    pub fn set_short_xfer(&self, endpoint: u8, ok: bool) -> Result<(), Errno> {
        if endpoint == CONTROL_ENDPOINT {
            return Err(Errno::INVAL);
        }
        let ep = self.shared.endpoint(endpoint)?;
        if ep.pipes[Dir::In as usize].get().is_none() {
            return Err(Errno::INVAL);
        }
        ep.queues.lock().unwrap().short_ok = ok;
        Ok(())
    }

    /// Whether short transfers are tolerated on the endpoint's read path.
    pub fn short_xfer_ok(&self, endpoint: u8) -> Result<bool, Errno> {
        Ok(self.shared.endpoint(endpoint)?.queues.lock().unwrap().short_ok)
    }

    /// Poll integration: true when the endpoint has completions to reap.
    ///
    /// Interrupt and isochronous endpoints advertise readability from their
    /// ring buffers, outside this engine.
    pub fn readable(&self, endpoint: u8) -> bool {
        match self.shared.endpoint(endpoint) {
            Ok(ep) => match ep.kind {
                EndpointKind::Control | EndpointKind::Bulk => {
                    !ep.queues.lock().unwrap().complete.is_empty()
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// Block until the endpoint is readable or the timeout elapses.
    /// Returns the final readability.
    pub fn wait_readable(&self, endpoint: u8, timeout: Option<Duration>) -> bool {
        let Ok(ep) = self.shared.endpoint(endpoint) else {
            return false;
        };
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut queues = ep.queues.lock().unwrap();
        while queues.complete.is_empty() {
            match deadline {
                Some(deadline) => {
                    let Some(left) = deadline.checked_duration_since(std::time::Instant::now())
                    else {
                        return false;
                    };
                    let (guard, timed_out) = ep.wait.wait_timeout(queues, left).unwrap();
                    queues = guard;
                    if timed_out.timed_out() && queues.complete.is_empty() {
                        return false;
                    }
                }
                None => queues = ep.wait.wait(queues).unwrap(),
            }
        }
        true
    }

    /// The legacy synchronous control request (`REQUEST`), retained for
    /// operations issued through the bus node. Blocks until the transfer
    /// finishes and returns the completed request directly; nothing is
    /// queued for reaping. A zero timeout falls back to the default.
    pub fn request_sync(&self, mut req: Request) -> Result<Request, Errno> {
        let ep = self.shared.endpoint(CONTROL_ENDPOINT)?;

        let caller_context = req.context;
        let context = self.shared.sync_ctx.fetch_sub(1, Ordering::Relaxed);
        req.context = context;
        if req.timeout_ms == 0 {
            req.timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        self.shared.submit_ctrl(&ep, req)?;

        let rec = {
            let mut queues = ep.queues.lock().unwrap();
            loop {
                if let Some(pos) = queues
                    .complete
                    .iter()
                    .position(|r| r.req.context == context)
                {
                    break queues.complete.remove(pos).unwrap();
                }
                queues = ep.wait.wait(queues).unwrap();
            }
        };
        let mut req = finish_record(rec);
        req.context = caller_context;
        match req.status {
            RequestStatus::Normal => Ok(req),
            status => Err(status.submit_errno()),
        }
    }
}

impl<B: Bus> DeviceShared<B> {
    fn endpoint(&self, number: u8) -> Result<Arc<Endpoint<B>>, Errno> {
        self.endpoints
            .lock()
            .unwrap()
            .get(number as usize)
            .and_then(|e| e.clone())
            .ok_or(Errno::INVAL)
    }

    fn submit_ctrl(self: &Arc<Self>, ep: &Arc<Endpoint<B>>, req: Request) -> Result<(), Errno> {
        if req.setup.damages_bus_integrity() {
            return Err(Errno::INVAL);
        }
        let len = req.setup.length() as usize;
        if len > MAX_CTRL_LEN || req.len != len || req.data.len() != len {
            return Err(Errno::INVAL);
        }

        let read = req.setup.is_read();
        let buffer = if read {
            vec![0; len]
        } else {
            req.data.clone()
        };
        let xfer = BusXfer {
            setup: Some(req.setup),
            buffer,
            read,
            timeout_ms: req.timeout_ms,
            flags: req.flags & RequestFlags::SHORT_XFER_OK,
        };
        self.start_xfer(ep, req, xfer)
    }

    fn submit_bulk(self: &Arc<Self>, ep: &Arc<Endpoint<B>>, req: Request) -> Result<(), Errno> {
        let len = req.len;
        // Zero-length bulk is rejected pending device-class rules.
        if len == 0 || req.data.len() != len {
            return Err(Errno::INVAL);
        }

        let buffer = if req.read {
            vec![0; len]
        } else {
            req.data.clone()
        };
        let xfer = BusXfer {
            setup: None,
            buffer,
            read: req.read,
            timeout_ms: req.timeout_ms,
            flags: req.flags
                & (RequestFlags::SHORT_XFER_OK | RequestFlags::FORCE_SHORT_XFER),
        };
        self.start_xfer(ep, req, xfer)
    }

    /// Queue the request and hand the transfer to the bus. The record is
    /// inserted before submission so a completion delivered synchronously
    /// from inside `Bus::submit` always finds it.
    fn start_xfer(
        self: &Arc<Self>,
        ep: &Arc<Endpoint<B>>,
        mut req: Request,
        xfer: BusXfer,
    ) -> Result<(), Errno> {
        let pipe = ep.pipe(req.read).ok_or(Errno::INVAL)?;
        let context = req.context;

        {
            let mut queues = ep.queues.lock().unwrap();
            if queues.closing {
                return Err(Errno::NXIO);
            }
            if Endpoint::context_outstanding(&queues, context) {
                return Err(Errno::INVAL);
            }
            req.status = RequestStatus::InProgress;
            queues.submit.push_back(InFlight { req, handle: None });
        }

        let done = BusComplete {
            device: Arc::downgrade(self),
            endpoint: ep.number,
            context,
        };
        match self.bus.submit(pipe, xfer, done) {
            Ok(handle) => {
                let mut queues = ep.queues.lock().unwrap();
                if let Some(rec) = queues.submit.iter_mut().find(|r| r.req.context == context) {
                    rec.handle = Some(handle);
                }
                Ok(())
            }
            Err(status) => {
                debug!("submit on ep {} failed: {status:?}", ep.number);
                {
                    let mut queues = ep.queues.lock().unwrap();
                    if let Some(pos) =
                        queues.submit.iter().position(|r| r.req.context == context)
                    {
                        queues.submit.remove(pos);
                    }
                }
                ep.wait.notify_all();
                self.bus.clear_stall(pipe);
                Err(status.submit_errno())
            }
        }
    }

    /// Completion callback: unlink from the submit queue, append to the
    /// complete queue, wake pollers. Runs in bus context; touches nothing
    /// but the queues.
    pub(crate) fn complete_xfer(&self, endpoint: u8, context: usize, result: XferResult) {
        let Ok(ep) = self.endpoint(endpoint) else {
            error!("completion for closed endpoint {endpoint}");
            return;
        };
        let mut queues = ep.queues.lock().unwrap();
        let Some(pos) = queues.submit.iter().position(|r| r.req.context == context) else {
            error!("completion for unknown context {context} on endpoint {endpoint}");
            return;
        };
        let InFlight { mut req, .. } = queues.submit.remove(pos).unwrap();
        if result.status == RequestStatus::Cancelled {
            req.status = RequestStatus::Cancelled;
        }
        queues.complete.push_back(Completed { req, result });
        drop(queues);
        ep.wait.notify_all();
    }
}

/// Turn a reaped record into the caller-visible request: resolve the
/// terminal status, clamp the actual length, and copy read data back.
fn finish_record(rec: Completed) -> Request {
    let Completed { mut req, result } = rec;

    // Cancelled wins over whatever the bus reported; nothing transferred.
    if req.status == RequestStatus::Cancelled {
        req.actlen = 0;
        return req;
    }

    req.status = result.status;
    if result.status == RequestStatus::Normal {
        let len = req.len.min(result.actlen);
        req.actlen = len;
        if req.read && len > 0 {
            req.data[..len].copy_from_slice(&result.buffer[..len]);
        }
    }
    req
}
