#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jetstream::sim::StreamResponder;
use jetstream::{Context, ContextConfig, MemoryTransport, StreamConfig};

pub const STREAM: &str = "ORDERS";
pub const SUBJECT: &str = "ORDERS.new";

pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub responder: StreamResponder,
    pub js: Context,
}

/// Transport, responder with an `ORDERS` stream on `ORDERS.*`, and a context.
pub fn harness(config: ContextConfig) -> Harness {
    let transport = Arc::new(MemoryTransport::new());
    let responder = StreamResponder::start(transport.clone()).expect("responder");
    let js = Context::open(transport.clone(), config).expect("open context");
    js.add_stream(&StreamConfig::new(STREAM).subjects(["ORDERS.*"]))
        .expect("add stream");
    Harness {
        transport,
        responder,
        js,
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}
