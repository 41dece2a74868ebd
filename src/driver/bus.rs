//! The host-controller seam.
//!
//! The engine drives the bus through the [`Bus`] trait and gets results back
//! through [`BusComplete`], a single-purpose capability: invoking it moves
//! the finished request from its endpoint's submit queue to the complete
//! queue and wakes pollers. The capability never touches caller memory and
//! never frees the record; the reap path does that.

use std::sync::Weak;

use crate::request::{RequestFlags, RequestStatus, SetupPacket};

use super::DeviceShared;

/// Endpoint direction, host point of view.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Dir {
    /// Host to device.
    Out = 0,
    /// Device to host.
    In = 1,
}

/// Transfer type of an endpoint, from its descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EndpointKind {
    /// Default (message) endpoint.
    Control,
    /// Isochronous endpoint.
    Isochronous,
    /// Bulk endpoint.
    Bulk,
    /// Interrupt endpoint.
    Interrupt,
}

/// The bus transfer object: one in-flight exchange handed to the host
/// controller. Owns its data buffer for the duration of the transfer
/// (the engine's stand-in for the DMA buffer).
#[derive(Debug)]
pub struct BusXfer {
    /// Control-request header; `None` for bulk pipes.
    pub setup: Option<SetupPacket>,
    /// Transfer buffer. Pre-filled for writes; capacity to fill for reads.
    pub buffer: Vec<u8>,
    /// Data direction.
    pub read: bool,
    /// Deadline in milliseconds; 0 means none.
    pub timeout_ms: u32,
    /// Short-transfer handling flags.
    pub flags: RequestFlags,
}

/// Completion report handed back by the host controller.
#[derive(Debug)]
pub struct XferResult {
    /// Final transfer status.
    pub status: RequestStatus,
    /// Bytes actually moved.
    pub actlen: usize,
    /// The buffer from the [`BusXfer`], filled up to `actlen` for reads.
    pub buffer: Vec<u8>,
}

impl XferResult {
    /// A cancelled completion with nothing transferred.
    pub fn cancelled() -> XferResult {
        XferResult {
            status: RequestStatus::Cancelled,
            actlen: 0,
            buffer: Vec::new(),
        }
    }
}

/// Completion capability for one submitted transfer.
///
/// The host controller must invoke [`finish`](Self::finish) exactly once per
/// transfer it accepted, whether the transfer completed, failed, timed out,
/// or was aborted. Dropping the capability without invoking it strands the
/// request on the submit queue until endpoint teardown.
pub struct BusComplete<B: Bus> {
    pub(super) device: Weak<DeviceShared<B>>,
    pub(super) endpoint: u8,
    pub(super) context: usize,
}

impl<B: Bus> BusComplete<B> {
    /// Record the result and move the request to the complete queue.
    pub fn finish(self, result: XferResult) {
        if let Some(device) = self.device.upgrade() {
            device.complete_xfer(self.endpoint, self.context, result);
        } else {
            log::debug!(
                "completion for ep {} ctx {} after device teardown",
                self.endpoint,
                self.context
            );
        }
    }
}

impl<B: Bus> std::fmt::Debug for BusComplete<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusComplete")
            .field("endpoint", &self.endpoint)
            .field("context", &self.context)
            .finish()
    }
}

/// A host controller that executes transfers and reports completions.
///
/// Contract:
/// - `submit` returning `Ok(handle)` means the transfer went in-progress and
///   `done` will be invoked exactly once, possibly before `submit` returns.
///   On `Err`, `done` must be dropped uninvoked.
/// - `abort` of an in-flight transfer eventually invokes its completion with
///   [`RequestStatus::Cancelled`]; aborting a transfer that already
///   completed is a no-op.
pub trait Bus: Send + Sync + Sized + 'static {
    /// Host-side handle for an opened endpoint.
    type Pipe: Send + Sync;

    /// Identifier for an accepted, in-flight transfer. Cloned so that
    /// cancel paths can abort without holding queue locks.
    type XferHandle: Clone + Send + Sync;

    /// Open a pipe to the given endpoint of the device at `address`.
    fn open_pipe(
        &self,
        address: u8,
        endpoint: u8,
        dir: Dir,
        kind: EndpointKind,
    ) -> Result<Self::Pipe, RequestStatus>;

    /// Start a transfer. `Ok` means in-progress.
    fn submit(
        &self,
        pipe: &Self::Pipe,
        xfer: BusXfer,
        done: BusComplete<Self>,
    ) -> Result<Self::XferHandle, RequestStatus>;

    /// Abort an in-flight transfer.
    fn abort(&self, pipe: &Self::Pipe, handle: &Self::XferHandle);

    /// Clear a stall condition on the endpoint.
    fn clear_stall(&self, pipe: &Self::Pipe);
}
