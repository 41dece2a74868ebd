//! The event pump.
//!
//! A thread is launched lazily when the first descriptor is registered. It
//! polls the registered device and endpoint nodes for readability (plus a
//! self-pipe for registration changes) and feeds the ready set to the
//! back-end's `handle_events`. The pump exits when its context is dropped.

use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{debug, error};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::io::Errno;
use rustix::pipe::{pipe_with, PipeFlags};
use slab::Slab;

use super::{ContextInner, ReadyEvent};

pub(crate) struct Pump {
    shared: Arc<PumpShared>,
    wake_tx: OwnedFd,
}

struct PumpShared {
    watches: Mutex<Slab<RawFd>>,
}

impl Pump {
    /// Create the pipe pair and launch the pump thread.
    pub(crate) fn start(ctx: Weak<ContextInner>) -> Pump {
        let shared = Arc::new(PumpShared {
            watches: Mutex::new(Slab::new()),
        });
        let (wake_rx, wake_tx) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)
            .expect("failed to create pump wake pipe");
        let thread_shared = shared.clone();
        thread::Builder::new()
            .name("ugen-pump".into())
            .spawn(move || pump_loop(thread_shared, ctx, wake_rx))
            .expect("failed to spawn pump thread");
        Pump { shared, wake_tx }
    }

    /// Watch a descriptor for readability.
    pub(crate) fn register(&self, fd: RawFd) {
        self.shared.watches.lock().unwrap().insert(fd);
        debug!("pump: watching fd {fd}");
        self.wake();
    }

    /// Stop watching a descriptor. Must happen before the fd is closed.
    pub(crate) fn unregister(&self, fd: RawFd) {
        self.shared.watches.lock().unwrap().retain(|_, f| *f != fd);
        debug!("pump: dropped fd {fd}");
        self.wake();
    }

    fn wake(&self) {
        let _ = rustix::io::write(&self.wake_tx, &[0]);
    }
}

fn pump_loop(shared: Arc<PumpShared>, ctx: Weak<ContextInner>, wake_rx: OwnedFd) {
    loop {
        // When the context (and with it the wake pipe's write end) goes
        // away, the read end polls readable and the upgrade below fails.
        if ctx.strong_count() == 0 {
            debug!("pump: context gone, exiting");
            return;
        }

        let fds: Vec<RawFd> = {
            let watches = shared.watches.lock().unwrap();
            watches.iter().map(|(_, fd)| *fd).collect()
        };

        let mut pollfds = Vec::with_capacity(fds.len() + 1);
        pollfds.push(PollFd::new(&wake_rx, PollFlags::IN));
        for fd in &fds {
            // The fds are owned by device handles; a stale watch shows up
            // as POLLNVAL and is skipped below.
            let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
            pollfds.push(PollFd::from_borrowed_fd(
                borrowed,
                PollFlags::IN | PollFlags::RDNORM,
            ));
        }

        match poll(&mut pollfds, None) {
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(e) => {
                error!("pump: poll failed: {e}");
                return;
            }
        }

        if !pollfds[0].revents().is_empty() {
            drain_wake_pipe(&wake_rx);
        }

        let mut ready = Vec::new();
        for (pollfd, fd) in pollfds[1..].iter().zip(&fds) {
            let revents = pollfd.revents();
            if revents.is_empty() || revents == PollFlags::NVAL {
                continue;
            }
            ready.push(ReadyEvent {
                fd: *fd,
                error: revents.intersects(PollFlags::ERR | PollFlags::HUP),
            });
        }
        if ready.is_empty() {
            continue;
        }

        let Some(ctx) = ctx.upgrade() else {
            return;
        };
        if let Err(e) = ctx.handle_events(&ready) {
            error!("pump: handle_events failed: {e}");
        }
    }
}

fn drain_wake_pipe(wake_rx: &OwnedFd) {
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(wake_rx, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("wake_fd", &self.wake_tx.as_raw_fd())
            .finish()
    }
}
