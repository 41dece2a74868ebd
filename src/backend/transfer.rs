//! Library-side transfer objects and the context registry.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error};
use slab::Slab;

use crate::request::{RequestStatus, SetupPacket, SETUP_PACKET_SIZE};

/// Direction bit of an endpoint address.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Transfer type, as the library's user selects it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransferKind {
    /// Control transfer on the default endpoint.
    Control,
    /// Isochronous transfer (reads only; synchronous path).
    Isochronous,
    /// Bulk transfer (asynchronous).
    Bulk,
    /// Interrupt transfer (synchronous path).
    Interrupt,
}

bitflags! {
    /// Transfer-level flags.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct TransferFlags: u32 {
        /// Treat a short read as an error.
        const SHORT_NOT_OK = 0x01;
        /// Terminate an OUT transfer with a zero-length packet.
        const ADD_ZERO_PACKET = 0x02;
    }
}

/// Terminal state of a transfer, the library taxonomy.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransferStatus {
    /// Transfer finished normally.
    Completed,
    /// Transfer failed.
    Error,
    /// Transfer was cancelled.
    Cancelled,
    /// Endpoint stalled.
    Stall,
}

/// Outcome of decoding one reaped completion.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Reaped {
    /// Deliver this status to the transfer.
    Report(TransferStatus),
    /// Spurious wakeup; keep draining without reporting.
    Spurious,
}

/// Map a reaped request status onto the library taxonomy.
pub(crate) fn map_status(status: RequestStatus) -> Reaped {
    match status {
        RequestStatus::Normal => Reaped::Report(TransferStatus::Completed),
        RequestStatus::Short => Reaped::Report(TransferStatus::Error),
        RequestStatus::InProgress => Reaped::Spurious,
        RequestStatus::Cancelled => Reaped::Report(TransferStatus::Cancelled),
        RequestStatus::Stalled => Reaped::Report(TransferStatus::Stall),
        _ => Reaped::Report(TransferStatus::Error),
    }
}

pub(crate) struct TransferState {
    /// The transfer buffer. For control transfers the setup header occupies
    /// the first eight bytes and the data stage follows.
    ///
    /// While the transfer is submitted the driver holds a pointer into this
    /// buffer; it must not be touched or reallocated until the completion
    /// comes back.
    pub(crate) buffer: Vec<u8>,
    /// Cumulative bytes transferred.
    pub(crate) transferred: usize,
    /// Terminal status; `None` while idle or submitted.
    pub(crate) status: Option<TransferStatus>,
    /// Registry key while the transfer is outstanding.
    pub(crate) context: Option<usize>,
}

/// One library transfer.
///
/// Build with the [`control`](Self::control) or [`endpoint`](Self::endpoint)
/// constructor, submit through the back-end, then [`wait`](Self::wait) for
/// the terminal status or let the event pump deliver it.
pub struct Transfer {
    pub(crate) kind: TransferKind,
    /// Endpoint address including the direction bit; 0 for control.
    pub(crate) endpoint: u8,
    pub(crate) timeout_ms: u32,
    pub(crate) flags: TransferFlags,
    pub(crate) state: Mutex<TransferState>,
    done: Condvar,
}

impl Transfer {
    /// A control transfer. The data stage direction and length come from
    /// the setup packet; for reads, `data` is the buffer to fill and must
    /// be `setup.length()` bytes.
    pub fn control(setup: SetupPacket, data: Vec<u8>, timeout_ms: u32) -> Transfer {
        let mut buffer = Vec::with_capacity(SETUP_PACKET_SIZE + data.len());
        buffer.extend_from_slice(&setup.0);
        buffer.extend_from_slice(&data);
        Transfer::new(TransferKind::Control, 0, buffer, timeout_ms)
    }

    /// A transfer on a non-control endpoint. `endpoint` carries the
    /// direction bit; for IN endpoints `buffer` is capacity to fill.
    pub fn endpoint(kind: TransferKind, endpoint: u8, buffer: Vec<u8>, timeout_ms: u32) -> Transfer {
        Transfer::new(kind, endpoint, buffer, timeout_ms)
    }

    fn new(kind: TransferKind, endpoint: u8, buffer: Vec<u8>, timeout_ms: u32) -> Transfer {
        Transfer {
            kind,
            endpoint,
            timeout_ms,
            flags: TransferFlags::empty(),
            state: Mutex::new(TransferState {
                buffer,
                transferred: 0,
                status: None,
                context: None,
            }),
            done: Condvar::new(),
        }
    }

    /// Set transfer flags.
    pub fn with_flags(mut self, flags: TransferFlags) -> Transfer {
        self.flags = flags;
        self
    }

    /// Whether the data moves device-to-host.
    pub fn is_read(&self) -> bool {
        match self.kind {
            TransferKind::Control => {
                let state = self.state.lock().unwrap();
                SetupPacket::from_prefix(&state.buffer).is_some_and(|s| s.is_read())
            }
            _ => self.endpoint & ENDPOINT_DIR_IN != 0,
        }
    }

    /// Terminal status, if the transfer has finished.
    pub fn status(&self) -> Option<TransferStatus> {
        self.state.lock().unwrap().status
    }

    /// Cumulative bytes transferred.
    pub fn transferred(&self) -> usize {
        self.state.lock().unwrap().transferred
    }

    /// Snapshot of the buffer. For a finished control read the data stage
    /// sits after the 8-byte setup header.
    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().buffer.clone()
    }

    /// Block until the transfer reaches a terminal status or the timeout
    /// elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<TransferStatus> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        while state.status.is_none() {
            match deadline {
                Some(deadline) => {
                    let Some(left) = deadline.checked_duration_since(std::time::Instant::now())
                    else {
                        return None;
                    };
                    let (guard, timed_out) = self.done.wait_timeout(state, left).unwrap();
                    state = guard;
                    if timed_out.timed_out() && state.status.is_none() {
                        return None;
                    }
                }
                None => state = self.done.wait(state).unwrap(),
            }
        }
        state.status
    }

    /// Deliver a terminal status, accumulating the reported length under
    /// the transfer lock, and wake waiters.
    pub(crate) fn finish(&self, status: TransferStatus, actlen: usize) {
        let mut state = self.state.lock().unwrap();
        state.transferred += actlen;
        state.status = Some(status);
        state.context = None;
        debug!("transfer finished: {status:?}, transferred {}", state.transferred);
        drop(state);
        self.done.notify_all();
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap()
    }
}

/// Live transfers keyed by context id, the correlation currency across the
/// ioctl boundary.
pub(crate) struct Registry {
    slab: Mutex<Slab<Arc<Transfer>>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            slab: Mutex::new(Slab::new()),
        }
    }

    /// Register an outstanding transfer, recording the key as its context.
    pub(crate) fn insert(&self, transfer: Arc<Transfer>) -> usize {
        let mut slab = self.slab.lock().unwrap();
        let context = slab.insert(transfer.clone());
        transfer.lock().context = Some(context);
        context
    }

    /// Claim the transfer for a reaped completion.
    pub(crate) fn remove(&self, context: usize) -> Option<Arc<Transfer>> {
        self.slab.lock().unwrap().try_remove(context)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slab.lock().unwrap().len()
    }
}

/// Drain one endpoint's completions: call `reap` until it fails, decode
/// each record, and hand terminal results to the owning transfers.
///
/// `reap` yields `(context, status, actlen)` per completion. Returns the
/// number of transfers finished.
pub(crate) fn drain_completions<F>(registry: &Registry, mut reap: F) -> usize
where
    F: FnMut() -> Option<(usize, RequestStatus, usize)>,
{
    let mut finished = 0;
    while let Some((context, status, actlen)) = reap() {
        let reported = match map_status(status) {
            Reaped::Spurious => continue,
            Reaped::Report(status) => status,
        };
        match registry.remove(context) {
            Some(transfer) => {
                if reported == TransferStatus::Cancelled {
                    debug!("cancelling transfer ctx {context}");
                }
                transfer.finish(reported, actlen);
                finished += 1;
            }
            None => error!("completion for unknown context {context}"),
        }
    }
    finished
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::request::{RT_READ_DEVICE, REQ_GET_STATUS};

    fn get_status_transfer() -> Transfer {
        let setup = SetupPacket::new(RT_READ_DEVICE, REQ_GET_STATUS, 0, 0, 2);
        Transfer::control(setup, vec![0; 2], 1000)
    }

    #[test]
    fn status_taxonomy_mapping() {
        use RequestStatus as R;
        use TransferStatus as T;
        assert_eq!(map_status(R::Normal), Reaped::Report(T::Completed));
        assert_eq!(map_status(R::Short), Reaped::Report(T::Error));
        assert_eq!(map_status(R::Cancelled), Reaped::Report(T::Cancelled));
        assert_eq!(map_status(R::Stalled), Reaped::Report(T::Stall));
        assert_eq!(map_status(R::InProgress), Reaped::Spurious);
        assert_eq!(map_status(R::TimedOut), Reaped::Report(T::Error));
        assert_eq!(map_status(R::IoError), Reaped::Report(T::Error));
    }

    #[test]
    fn control_buffer_carries_setup_header() {
        let t = get_status_transfer();
        assert!(t.is_read());
        let data = t.data();
        assert_eq!(data.len(), SETUP_PACKET_SIZE + 2);
        assert_eq!(SetupPacket::from_prefix(&data).unwrap().length(), 2);
    }

    #[test]
    fn registry_round_trip() {
        let registry = Registry::new();
        let t = Arc::new(get_status_transfer());
        let ctx = registry.insert(t.clone());
        assert_eq!(t.lock().context, Some(ctx));
        assert!(registry.remove(ctx).is_some());
        assert!(registry.remove(ctx).is_none());
    }

    #[test]
    fn drain_stops_when_reap_fails() {
        let registry = Registry::new();
        let t = Arc::new(get_status_transfer());
        let ctx = registry.insert(t.clone());

        let mut completions =
            vec![(ctx, RequestStatus::Normal, 2usize)].into_iter();
        let finished = drain_completions(&registry, || completions.next());
        assert_eq!(finished, 1);
        assert_eq!(t.status(), Some(TransferStatus::Completed));
        assert_eq!(t.transferred(), 2);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn drain_restarts_past_spurious_records() {
        let registry = Registry::new();
        let t = Arc::new(get_status_transfer());
        let ctx = registry.insert(t.clone());

        // An in-progress record is a spurious wakeup: the drain keeps going
        // without reporting anything.
        let mut completions = vec![
            (usize::MAX, RequestStatus::InProgress, 0usize),
            (ctx, RequestStatus::Cancelled, 0),
        ]
        .into_iter();
        let finished = drain_completions(&registry, || completions.next());
        assert_eq!(finished, 1);
        assert_eq!(t.status(), Some(TransferStatus::Cancelled));
        assert_eq!(t.transferred(), 0);
    }

    #[test]
    fn transferred_accumulates_across_completions() {
        let t = get_status_transfer();
        t.finish(TransferStatus::Completed, 2);
        t.finish(TransferStatus::Completed, 3);
        assert_eq!(t.transferred(), 5);
    }

    #[test]
    fn wait_times_out_without_completion() {
        let t = get_status_transfer();
        assert_eq!(t.wait(Some(Duration::from_millis(10))), None);
    }
}
