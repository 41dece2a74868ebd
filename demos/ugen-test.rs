//! Exercise one synchronous and one asynchronous control transfer against
//! a generic USB device node.
//!
//! ```text
//! ugen-test -d /dev/ugen0.00
//! ```

use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use ugen::backend::{Context, Transfer, TransferStatus};
use ugen::request::{REQ_GET_STATUS, RT_READ_DEVICE};
use ugen::SetupPacket;

fn usage() -> ! {
    eprintln!("usage: ugen-test -d devnode");
    exit(1);
}

fn get_status_setup() -> SetupPacket {
    SetupPacket::new(RT_READ_DEVICE, REQ_GET_STATUS, 0, 0, 2)
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mut devnode = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-d" => devnode = Some(args.next().unwrap_or_else(|| usage())),
            _ => usage(),
        }
    }
    let Some(devnode) = devnode else { usage() };

    // `/dev/ugen0.00` names device `ugen0`, control endpoint.
    let devname = Path::new(&devnode)
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split_once('.'))
        .map(|(name, _)| name.to_owned())
        .unwrap_or_else(|| {
            eprintln!("ugen-test: {devnode} is not a device node name");
            exit(1);
        });

    let ctx = Context::new();
    let device = match ctx.open_device(&devname, 0, 0) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("ugen-test: failed to open {devnode}: {e}");
            exit(1);
        }
    };

    // Synchronous GET_STATUS through the legacy request path.
    let mut buf = [0u8; 2];
    match device.control_sync(get_status_setup(), &mut buf, 0) {
        Ok(n) => println!("sync control: ok, {n} bytes: {buf:02x?}"),
        Err(e) => {
            eprintln!("ugen-test: synchronous control transfer failed: {e}");
            exit(1);
        }
    }

    // The same request submitted asynchronously and reaped via the pump.
    let transfer = Arc::new(Transfer::control(get_status_setup(), vec![0; 2], 5000));
    if let Err(e) = ctx.submit(&device, &transfer) {
        eprintln!("ugen-test: asynchronous submit failed: {e}");
        exit(1);
    }
    match transfer.wait(Some(Duration::from_secs(10))) {
        Some(TransferStatus::Completed) => {
            let data = transfer.data();
            println!(
                "async control: ok, {} bytes: {:02x?}",
                transfer.transferred(),
                &data[8..]
            );
        }
        Some(status) => {
            eprintln!("ugen-test: asynchronous control transfer failed: {status:?}");
            exit(1);
        }
        None => {
            eprintln!("ugen-test: asynchronous control transfer timed out");
            exit(1);
        }
    }
}
