#![warn(missing_docs)]
//! Asynchronous transfers for the BSD generic USB character device.
//!
//! The generic driver (ugen) exposes a USB device to user space through
//! per-endpoint character nodes. Historically every transfer through those
//! nodes blocked; this crate implements the asynchronous subsystem grafted
//! onto that driver, as the pair of engines on the two sides of the device
//! node:
//!
//! - [`driver`]: the driver-side engine. Each endpoint carries a submit
//!   queue and a complete queue of outstanding requests; `DO_REQUEST`
//!   submits without blocking, the host controller's completion callback
//!   moves the finished request between queues and wakes pollers, and
//!   `GET_COMPLETED` reaps results in completion order. `CANCEL` aborts by
//!   context, and `SET_TIMEOUT` / `SET_SHORT_XFER` tune endpoint defaults.
//!   The host controller itself is abstract (the [`driver::Bus`] trait).
//! - [`backend`]: the user-space library back-end. It maps a USB library's
//!   generic submit/cancel/poll contract onto the same ioctls, registers
//!   every opened node with an event pump, and drains completions when the
//!   pump reports readability.
//!
//! The [`request`] module holds the control block the two engines exchange.
//! Its setup header travels as raw little-endian bytes
//! ([`SetupPacket`]), so the driver side never byteswaps.
//!
//! ## Logging
//!
//! This crate logs through the [`log`](https://docs.rs/log) facade. Use a
//! backend like `env_logger` and set `RUST_LOG=ugen=debug` to see submit,
//! completion, and pump activity.

pub mod backend;
pub mod driver;
mod error;
pub mod request;

pub use error::{Error, ErrorKind};
pub use request::{Request, RequestFlags, RequestStatus, SetupPacket};
