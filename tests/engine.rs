//! Driver-engine tests against a mock host controller.
//!
//! The mock accepts transfers without completing them; tests then finish,
//! fail, expire, or abort them explicitly, so every queue transition and
//! race side is driven deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustix::io::Errno;
use ugen::driver::{Bus, BusComplete, BusXfer, Device, Dir, EndpointKind, XferResult};
use ugen::request::{
    Request, RequestFlags, RequestStatus, SetupPacket, REQ_GET_STATUS, REQ_SET_ADDRESS,
    REQ_SET_CONFIG, REQ_SET_INTERFACE, RT_READ_DEVICE, RT_WRITE_DEVICE, RT_WRITE_INTERFACE,
};

struct Pending {
    id: u64,
    xfer: BusXfer,
    done: BusComplete<MockBus>,
}

#[derive(Default)]
struct MockInner {
    next_id: u64,
    pending: Vec<Pending>,
    stalls_cleared: u32,
    /// Fail the next submit with this status instead of accepting it.
    submit_error: Option<RequestStatus>,
}

#[derive(Default)]
struct MockBus {
    inner: Mutex<MockInner>,
}

#[derive(Debug)]
struct MockPipe;

impl Bus for MockBus {
    type Pipe = MockPipe;
    type XferHandle = u64;

    fn open_pipe(
        &self,
        _address: u8,
        _endpoint: u8,
        _dir: Dir,
        _kind: EndpointKind,
    ) -> Result<Self::Pipe, RequestStatus> {
        Ok(MockPipe)
    }

    fn submit(
        &self,
        _pipe: &MockPipe,
        xfer: BusXfer,
        done: BusComplete<MockBus>,
    ) -> Result<u64, RequestStatus> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = inner.submit_error.take() {
            return Err(status);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push(Pending { id, xfer, done });
        Ok(id)
    }

    fn abort(&self, _pipe: &MockPipe, handle: &u64) {
        let aborted = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .pending
                .iter()
                .position(|p| p.id == *handle)
                .map(|i| inner.pending.remove(i))
        };
        // Aborting an already-completed transfer is a no-op.
        if let Some(pending) = aborted {
            pending.done.finish(XferResult::cancelled());
        }
    }

    fn clear_stall(&self, _pipe: &MockPipe) {
        self.inner.lock().unwrap().stalls_cleared += 1;
    }
}

impl MockBus {
    fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    fn stalls_cleared(&self) -> u32 {
        self.inner.lock().unwrap().stalls_cleared
    }

    fn fail_next_submit(&self, status: RequestStatus) {
        self.inner.lock().unwrap().submit_error = Some(status);
    }

    fn timeout_of_first(&self) -> u32 {
        self.inner.lock().unwrap().pending[0].xfer.timeout_ms
    }

    /// Complete the nth outstanding transfer. For reads, `data` is what the
    /// device delivered; for writes, `accepted` is the byte count taken.
    fn finish_nth(&self, n: usize, status: RequestStatus, data: &[u8], accepted: usize) {
        let Pending { mut xfer, done, .. } = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(n)
        };
        let actlen = if xfer.read {
            let n = data.len().min(xfer.buffer.len());
            xfer.buffer[..n].copy_from_slice(&data[..n]);
            n
        } else {
            accepted
        };
        done.finish(XferResult {
            status,
            actlen,
            buffer: xfer.buffer,
        });
    }

    fn finish_first(&self, status: RequestStatus, data: &[u8]) {
        self.finish_nth(0, status, data, data.len());
    }
}

fn new_device() -> (Arc<MockBus>, Device<MockBus>) {
    let bus = Arc::new(MockBus::default());
    let device = Device::new(bus.clone(), 0).unwrap();
    (bus, device)
}

fn control_read(length: u16, context: usize) -> Request {
    let setup = SetupPacket::new(RT_READ_DEVICE, REQ_GET_STATUS, 0, 0, length);
    Request::control(0, setup, vec![0; length as usize], 0, context)
}

fn bulk_in(len: usize, context: usize) -> Request {
    Request::bulk(0, vec![0; len], true, 0, context)
}

fn open_bulk(device: &Device<MockBus>, number: u8) {
    device.open_endpoint(number, Dir::In, EndpointKind::Bulk).unwrap();
    device.open_endpoint(number, Dir::Out, EndpointKind::Bulk).unwrap();
}

#[test]
fn rejects_bus_integrity_writes() {
    let (bus, device) = new_device();
    for (rt, rq) in [
        (RT_WRITE_DEVICE, REQ_SET_ADDRESS),
        (RT_WRITE_DEVICE, REQ_SET_CONFIG),
        (RT_WRITE_INTERFACE, REQ_SET_INTERFACE),
    ] {
        let setup = SetupPacket::new(rt, rq, 1, 0, 0);
        let req = Request::control(0, setup, Vec::new(), 0, 1);
        assert_eq!(device.do_request(0, req), Err(Errno::INVAL));
    }
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(device.get_completed(0), Err(Errno::IO));
}

#[test]
fn control_length_bounds() {
    let (_bus, device) = new_device();

    // 32768 is out of range.
    let req = control_read(32768, 1);
    assert_eq!(device.do_request(0, req), Err(Errno::INVAL));

    // Zero-length control is fine and reaps with actlen 0.
    let setup = SetupPacket::new(0x40, 0x01, 0, 0, 0);
    let req = Request::control(0, setup, Vec::new(), 0, 2);
    device.do_request(0, req).unwrap();
}

#[test]
fn zero_length_control_reaps_empty() {
    let (bus, device) = new_device();
    let setup = SetupPacket::new(0x40, 0x01, 0, 0, 0);
    device
        .do_request(0, Request::control(0, setup, Vec::new(), 0, 9))
        .unwrap();
    bus.finish_first(RequestStatus::Normal, &[]);
    let reaped = device.get_completed(0).unwrap();
    assert_eq!(reaped.context, 9);
    assert_eq!(reaped.status, RequestStatus::Normal);
    assert_eq!(reaped.actlen, 0);
}

#[test]
fn bulk_zero_length_rejected() {
    let (_bus, device) = new_device();
    open_bulk(&device, 1);
    assert_eq!(device.do_request(1, bulk_in(0, 1)), Err(Errno::INVAL));
}

#[test]
fn async_requests_rejected_on_interrupt_endpoints() {
    let (_bus, device) = new_device();
    device
        .open_endpoint(2, Dir::In, EndpointKind::Interrupt)
        .unwrap();
    assert_eq!(device.do_request(2, bulk_in(8, 1)), Err(Errno::INVAL));
}

#[test]
fn reap_on_empty_queue_is_io_error() {
    let (_bus, device) = new_device();
    assert_eq!(device.get_completed(0), Err(Errno::IO));
}

#[test]
fn reap_on_unknown_endpoint_is_invalid() {
    let (_bus, device) = new_device();
    assert_eq!(device.get_completed(5), Err(Errno::INVAL));
}

#[test]
fn control_read_round_trip() {
    let (bus, device) = new_device();
    device.do_request(0, control_read(2, 42)).unwrap();
    assert!(!device.readable(0));

    bus.finish_first(RequestStatus::Normal, &[0x01, 0x00]);
    assert!(device.readable(0));

    let reaped = device.get_completed(0).unwrap();
    assert_eq!(reaped.context, 42);
    assert_eq!(reaped.status, RequestStatus::Normal);
    assert_eq!(reaped.actlen, 2);
    assert_eq!(&reaped.data[..2], &[0x01, 0x00]);
    assert!(!device.readable(0));
}

#[test]
fn reap_follows_bus_completion_order() {
    let (bus, device) = new_device();
    open_bulk(&device, 1);
    for context in [1, 2, 3] {
        device.do_request(1, bulk_in(16, context)).unwrap();
    }
    // The bus finishes them 2, 1, 3.
    bus.finish_nth(1, RequestStatus::Normal, &[0xb2; 16], 0);
    bus.finish_nth(0, RequestStatus::Normal, &[0xb1; 16], 0);
    bus.finish_nth(0, RequestStatus::Normal, &[0xb3; 16], 0);

    let order: Vec<usize> = (0..3)
        .map(|_| device.get_completed(1).unwrap().context)
        .collect();
    assert_eq!(order, vec![2, 1, 3]);
    assert_eq!(device.get_completed(1), Err(Errno::IO));
}

#[test]
fn cancel_in_flight_reaps_cancelled() {
    let (bus, device) = new_device();
    open_bulk(&device, 1);
    device.do_request(1, bulk_in(64, 7)).unwrap();

    device.cancel(1, 7).unwrap();
    assert_eq!(bus.pending_count(), 0);

    let reaped = device.get_completed(1).unwrap();
    assert_eq!(reaped.context, 7);
    assert_eq!(reaped.status, RequestStatus::Cancelled);
    assert_eq!(reaped.actlen, 0);
}

#[test]
fn cancel_after_completion_marks_record() {
    let (bus, device) = new_device();
    device.do_request(0, control_read(2, 11)).unwrap();
    bus.finish_first(RequestStatus::Normal, &[0xaa, 0xbb]);

    // The completion already fired; cancel still wins.
    device.cancel(0, 11).unwrap();
    let reaped = device.get_completed(0).unwrap();
    assert_eq!(reaped.status, RequestStatus::Cancelled);
    assert_eq!(reaped.actlen, 0);
}

#[test]
fn cancel_unknown_context_is_invalid() {
    let (bus, device) = new_device();
    device.do_request(0, control_read(2, 1)).unwrap();
    assert_eq!(device.cancel(0, 99), Err(Errno::INVAL));

    // Neither queue was disturbed.
    assert_eq!(bus.pending_count(), 1);
    bus.finish_first(RequestStatus::Normal, &[0, 0]);
    assert_eq!(device.get_completed(0).unwrap().context, 1);
}

#[test]
fn double_cancel_is_a_noop() {
    let (_bus, device) = new_device();
    open_bulk(&device, 1);
    device.do_request(1, bulk_in(8, 3)).unwrap();

    device.cancel(1, 3).unwrap();
    // The record now sits cancelled on the complete queue.
    device.cancel(1, 3).unwrap();

    assert_eq!(
        device.get_completed(1).unwrap().status,
        RequestStatus::Cancelled
    );
    assert_eq!(device.get_completed(1), Err(Errno::IO));
}

#[test]
fn duplicate_context_rejected_while_outstanding() {
    let (bus, device) = new_device();
    device.do_request(0, control_read(2, 5)).unwrap();
    assert_eq!(device.do_request(0, control_read(2, 5)), Err(Errno::INVAL));

    // Once reaped the context can be reused.
    bus.finish_first(RequestStatus::Normal, &[0, 0]);
    device.get_completed(0).unwrap();
    device.do_request(0, control_read(2, 5)).unwrap();
}

#[test]
fn short_read_clamps_and_copies() {
    let (bus, device) = new_device();
    let req = control_read(8, 1).with_flags(RequestFlags::SHORT_XFER_OK);
    device.do_request(0, req).unwrap();

    // Device delivered three of the eight requested bytes; with short
    // transfers tolerated the bus reports a normal completion.
    bus.finish_first(RequestStatus::Normal, &[1, 2, 3]);
    let reaped = device.get_completed(0).unwrap();
    assert_eq!(reaped.status, RequestStatus::Normal);
    assert_eq!(reaped.actlen, 3);
    assert_eq!(&reaped.data[..3], &[1, 2, 3]);
}

#[test]
fn short_status_propagates_without_data() {
    let (bus, device) = new_device();
    open_bulk(&device, 1);
    device.do_request(1, bulk_in(32, 4)).unwrap();

    bus.finish_first(RequestStatus::Short, &[9, 9]);
    let reaped = device.get_completed(1).unwrap();
    assert_eq!(reaped.status, RequestStatus::Short);
    assert_eq!(reaped.actlen, 0);
}

#[test]
fn stall_status_propagates() {
    let (bus, device) = new_device();
    open_bulk(&device, 1);
    device.do_request(1, bulk_in(1024, 6)).unwrap();

    bus.finish_first(RequestStatus::Stalled, &[]);
    assert_eq!(
        device.get_completed(1).unwrap().status,
        RequestStatus::Stalled
    );
}

#[test]
fn failed_submit_clears_stall_and_queues_nothing() {
    let (bus, device) = new_device();
    bus.fail_next_submit(RequestStatus::Stalled);

    assert_eq!(device.do_request(0, control_read(2, 1)), Err(Errno::IO));
    assert_eq!(bus.stalls_cleared(), 1);
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(device.get_completed(0), Err(Errno::IO));
}

#[test]
fn interrupted_submit_maps_to_eintr() {
    let (bus, device) = new_device();
    bus.fail_next_submit(RequestStatus::Interrupted);
    assert_eq!(device.do_request(0, control_read(2, 1)), Err(Errno::INTR));
}

#[test]
fn write_reports_bytes_accepted() {
    let (bus, device) = new_device();
    open_bulk(&device, 1);
    let req = Request::bulk(0, vec![0xcc; 5], false, 0, 8);
    device.do_request(1, req).unwrap();

    bus.finish_nth(0, RequestStatus::Normal, &[], 3);
    let reaped = device.get_completed(1).unwrap();
    assert_eq!(reaped.status, RequestStatus::Normal);
    assert_eq!(reaped.actlen, 3);
}

#[test]
fn timeout_reaches_the_bus_and_reaps_as_timeout() {
    let (bus, device) = new_device();
    let setup = SetupPacket::new(RT_READ_DEVICE, REQ_GET_STATUS, 0, 0, 2);
    let req = Request::control(0, setup, vec![0; 2], 10_000, 1);
    device.do_request(0, req).unwrap();
    assert_eq!(bus.timeout_of_first(), 10_000);

    // The deadline elapses with no device response.
    bus.finish_first(RequestStatus::TimedOut, &[]);
    assert_eq!(
        device.get_completed(0).unwrap().status,
        RequestStatus::TimedOut
    );
}

#[test]
fn wait_readable_observes_completion() {
    let (bus, device) = new_device();
    device.do_request(0, control_read(2, 1)).unwrap();
    assert!(!device.wait_readable(0, Some(Duration::from_millis(10))));

    let device = Arc::new(device);
    let waiter = {
        let device = device.clone();
        std::thread::spawn(move || device.wait_readable(0, Some(Duration::from_secs(5))))
    };
    bus.finish_first(RequestStatus::Normal, &[0, 0]);
    assert!(waiter.join().unwrap());
}

#[test]
fn teardown_aborts_everything_outstanding() {
    let (bus, device) = new_device();
    open_bulk(&device, 1);
    device.do_request(1, bulk_in(8, 1)).unwrap();
    device.do_request(1, bulk_in(8, 2)).unwrap();
    assert_eq!(bus.pending_count(), 2);

    device.close_endpoint(1).unwrap();
    assert_eq!(bus.pending_count(), 0);

    // The endpoint is gone along with its queues.
    assert_eq!(device.do_request(1, bulk_in(8, 3)), Err(Errno::INVAL));
    assert_eq!(device.get_completed(1), Err(Errno::INVAL));
}

#[test]
fn endpoint_settings() {
    let (_bus, device) = new_device();
    open_bulk(&device, 1);

    assert_eq!(device.set_short_xfer(0, true), Err(Errno::INVAL));
    device.set_short_xfer(1, true).unwrap();
    assert!(device.short_xfer_ok(1).unwrap());
    device.set_short_xfer(1, false).unwrap();
    assert!(!device.short_xfer_ok(1).unwrap());

    assert_eq!(device.set_timeout(9, 100), Err(Errno::INVAL));
    device.set_timeout(1, 250).unwrap();
    assert_eq!(device.timeout(1).unwrap(), 250);
}

#[test]
fn synchronous_request_round_trip() {
    let (bus, device) = new_device();
    let device = Arc::new(device);

    // A helper thread plays the device: it answers the request as soon as
    // it shows up on the bus.
    let responder = {
        let bus = bus.clone();
        std::thread::spawn(move || loop {
            if bus.pending_count() > 0 {
                bus.finish_first(RequestStatus::Normal, &[0x01, 0x00]);
                break;
            }
            std::thread::yield_now();
        })
    };

    let req = control_read(2, 0);
    let reaped = device.request_sync(req).unwrap();
    responder.join().unwrap();

    assert_eq!(reaped.status, RequestStatus::Normal);
    assert_eq!(reaped.actlen, 2);
    assert_eq!(&reaped.data[..2], &[0x01, 0x00]);
    assert_eq!(reaped.context, 0);
    // Nothing left behind on the queues.
    assert_eq!(device.get_completed(0), Err(Errno::IO));
}

#[test]
fn synchronous_request_uses_default_timeout() {
    let (bus, device) = new_device();
    let device = Arc::new(device);

    let responder = {
        let bus = bus.clone();
        std::thread::spawn(move || loop {
            if bus.pending_count() > 0 {
                assert_eq!(bus.timeout_of_first(), 5000);
                bus.finish_first(RequestStatus::Normal, &[0, 0]);
                break;
            }
            std::thread::yield_now();
        })
    };
    device.request_sync(control_read(2, 0)).unwrap();
    responder.join().unwrap();
}
