mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{harness, wait_until, SUBJECT};
use jetstream::transport::{Subscription, Transport};
use jetstream::{Context, ContextConfig, Error, MemoryTransport, Message};

/// A subscriber that swallows every publish: sends succeed, no ack ever comes.
fn sink(transport: &MemoryTransport, subject: &str) -> Box<dyn Subscription> {
    transport
        .subscribe(subject, Box::new(|_| {}))
        .expect("sink subscription")
}

#[test]
fn publisher_past_max_pending_stalls_then_times_out() {
    let transport = Arc::new(MemoryTransport::new());
    let _sink = sink(&transport, "SINK");
    let js = Context::open(
        transport.clone(),
        ContextConfig::default()
            .with_max_pending(3)
            .with_stall_wait(Duration::from_millis(100)),
    )
    .expect("open");

    for _ in 0..3 {
        js.publish_async("SINK", "x").expect("within limit");
    }
    assert_eq!(js.pending_count(), 3);

    let start = Instant::now();
    let err = js
        .publish_async_message(Message::new("SINK", "fourth"))
        .unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err.error, Error::StallTimeout));
    assert!(err.error.to_string().contains("stalled"));
    let back = err.message.expect("message handed back");
    assert_eq!(&back.data[..], b"fourth");
    assert!(back.reply.is_none());
    assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    assert!(waited < Duration::from_secs(2), "waited {waited:?}");

    // The timed-out publish does not keep its slot.
    assert_eq!(js.pending_count(), 3);
    assert_eq!(js.stats().stalls, 1);
    assert_eq!(transport.published(), 3);
}

#[test]
fn failed_sends_never_fill_the_window() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_publishes(true);
    let js = Context::open(
        transport.clone(),
        ContextConfig::default()
            .with_max_pending(2)
            .with_stall_wait(Duration::from_millis(50)),
    )
    .expect("open");

    for n in 0..3 {
        let start = Instant::now();
        let err = js
            .publish_async_message(Message::new("ORDERS.new", format!("m{n}")))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(500));
        match err.error {
            Error::Transport(_) | Error::StallTimeout => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.message.is_some());
        assert!(js.pending_count() <= 2);
    }
    assert_eq!(js.pending_count(), 0);
}

#[test]
fn stalled_publisher_resumes_when_acks_arrive() -> jetstream::Result<()> {
    let h = harness(
        ContextConfig::default()
            .with_max_pending(2)
            .with_stall_wait(Duration::from_secs(5)),
    );
    h.responder.hold_acks(true);
    h.js.publish_async(SUBJECT, "1")?;
    h.js.publish_async(SUBJECT, "2")?;
    assert!(wait_until(Duration::from_secs(2), || h.responder.held() == 2));

    let handle = h.js.handle();
    let stalled = thread::spawn(move || handle.publish_async(SUBJECT, "3"));
    assert!(wait_until(Duration::from_secs(2), || h.js.stats().stalls == 1));
    assert!(!stalled.is_finished());

    h.responder.hold_acks(false);
    assert_eq!(h.responder.release_held()?, 2);
    stalled.join().expect("publisher thread")?;

    h.js.flush_async(Some(Duration::from_secs(5)))?;
    assert_eq!(h.js.stats().acks, 3);
    Ok(())
}

#[test]
fn stall_and_drain_waiters_share_one_condvar() -> jetstream::Result<()> {
    let h = harness(
        ContextConfig::default()
            .with_max_pending(1)
            .with_stall_wait(Duration::from_secs(5)),
    );
    h.responder.hold_acks(true);
    h.js.publish_async(SUBJECT, "1")?;
    assert!(wait_until(Duration::from_secs(2), || h.responder.held() == 1));

    let publisher = {
        let js = h.js.handle();
        thread::spawn(move || js.publish_async(SUBJECT, "2"))
    };
    assert!(wait_until(Duration::from_secs(2), || h.js.stats().stalls == 1));
    let drainer = {
        let js = h.js.handle();
        thread::spawn(move || js.flush_async(Some(Duration::from_secs(5))))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!publisher.is_finished());
    assert!(!drainer.is_finished());

    h.responder.hold_acks(false);
    h.responder.release_held()?;
    publisher.join().expect("publisher thread")?;
    drainer.join().expect("drainer thread")?;

    assert_eq!(h.js.pending_count(), 0);
    assert_eq!(h.js.stats().acks, 2);
    Ok(())
}

#[test]
fn unbounded_context_never_stalls() -> jetstream::Result<()> {
    let h = harness(ContextConfig::default());
    h.responder.hold_acks(true);
    for _ in 0..500 {
        h.js.publish_async(SUBJECT, "x")?;
    }
    assert_eq!(h.js.stats().stalls, 0);
    assert!(wait_until(Duration::from_secs(5), || h.responder.held() == 500));
    h.responder.hold_acks(false);
    h.responder.release_held()?;
    h.js.flush_async(Some(Duration::from_secs(5)))?;
    Ok(())
}

#[test]
fn huge_stall_wait_keeps_waiting_until_room() -> jetstream::Result<()> {
    let h = harness(
        ContextConfig::default()
            .with_max_pending(1)
            .with_stall_wait(Duration::MAX),
    );
    h.responder.hold_acks(true);
    h.js.publish_async(SUBJECT, "1")?;
    assert!(wait_until(Duration::from_secs(2), || h.responder.held() == 1));

    let handle = h.js.handle();
    let stalled = thread::spawn(move || handle.publish_async(SUBJECT, "2"));
    assert!(wait_until(Duration::from_secs(2), || h.js.stats().stalls == 1));
    thread::sleep(Duration::from_millis(20));
    assert!(!stalled.is_finished());

    h.responder.hold_acks(false);
    h.responder.release_held()?;
    stalled.join().expect("publisher thread")?;
    h.js.flush_async(Some(Duration::from_secs(5)))?;
    assert_eq!(h.js.stats().acks, 2);
    Ok(())
}
