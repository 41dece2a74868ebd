//! Per-endpoint state: pipes, the submit/complete FIFOs, and the wait point.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use once_cell::sync::OnceCell;

use crate::request::Request;

use super::bus::{Bus, Dir, EndpointKind, XferResult};

/// A request pinned on the submit queue by its in-flight bus transfer.
pub(super) struct InFlight<B: Bus> {
    pub(super) req: Request,
    /// Set once the bus accepts the transfer. `None` only in the window
    /// between queue insertion and `Bus::submit` returning.
    pub(super) handle: Option<B::XferHandle>,
}

/// A finished request waiting to be reaped, paired with the bus result.
pub(super) struct Completed {
    pub(super) req: Request,
    pub(super) result: XferResult,
}

/// Queues and queue-adjacent endpoint state, all under one lock.
pub(super) struct Queues<B: Bus> {
    pub(super) submit: VecDeque<InFlight<B>>,
    pub(super) complete: VecDeque<Completed>,
    /// Default timeout for the legacy synchronous paths, milliseconds.
    pub(super) timeout_ms: u32,
    /// Short reads tolerated on the legacy read path.
    pub(super) short_ok: bool,
    /// Teardown in progress; no new submissions accepted.
    pub(super) closing: bool,
}

/// One endpoint number of the device: the IN/OUT pipe pair plus the shared
/// submit and complete queues all requests on this number travel through.
pub(super) struct Endpoint<B: Bus> {
    pub(super) number: u8,
    pub(super) kind: EndpointKind,
    /// Pipes indexed by [`Dir`], each opened at most once per endpoint
    /// lifetime; the control pipe sits in the IN slot.
    pub(super) pipes: [OnceCell<B::Pipe>; 2],
    pub(super) queues: Mutex<Queues<B>>,
    /// Wakes pollers and synchronous waiters when the complete queue grows.
    pub(super) wait: Condvar,
}

impl<B: Bus> Endpoint<B> {
    pub(super) fn new(number: u8, kind: EndpointKind) -> Endpoint<B> {
        Endpoint {
            number,
            kind,
            pipes: [OnceCell::new(), OnceCell::new()],
            queues: Mutex::new(Queues {
                submit: VecDeque::new(),
                complete: VecDeque::new(),
                timeout_ms: 0,
                short_ok: false,
                closing: false,
            }),
            wait: Condvar::new(),
        }
    }

    /// The pipe a request in the given direction travels on.
    pub(super) fn pipe(&self, read: bool) -> Option<&B::Pipe> {
        match self.kind {
            EndpointKind::Control => self.pipes[Dir::In as usize].get(),
            _ => self.pipes[if read { Dir::In } else { Dir::Out } as usize].get(),
        }
    }

    /// Whether a context is outstanding on either queue.
    pub(super) fn context_outstanding(queues: &Queues<B>, context: usize) -> bool {
        queues.submit.iter().any(|r| r.req.context == context)
            || queues.complete.iter().any(|r| r.req.context == context)
    }
}
