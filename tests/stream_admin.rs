use std::sync::Arc;

use jetstream::api::{PurgeOptions, StorageType};
use jetstream::error::JS_STREAM_NOT_FOUND_ERR;
use jetstream::sim::{StreamResponder, STREAM_NAME_IN_USE_ERR};
use jetstream::{Context, ContextConfig, Error, MemoryTransport, StreamConfig};

fn setup(config: ContextConfig, prefix: &str) -> (Context, StreamResponder) {
    let transport = Arc::new(MemoryTransport::new());
    let responder = StreamResponder::with_prefix(transport.clone(), prefix).expect("responder");
    let js = Context::open(transport, config).expect("open");
    (js, responder)
}

#[test]
fn stream_lifecycle_through_the_api() -> jetstream::Result<()> {
    let (js, responder) = setup(ContextConfig::default(), "$JS.API");

    let cfg = StreamConfig::new("ORDERS")
        .subjects(["ORDERS.*"])
        .storage(StorageType::Memory);
    let info = js.add_stream(&cfg)?;
    assert_eq!(info.config.name, "ORDERS");
    assert_eq!(info.config.subjects, vec!["ORDERS.*".to_string()]);
    assert_eq!(info.config.storage, StorageType::Memory);
    assert_eq!(info.state.messages, 0);

    match js.add_stream(&cfg) {
        Err(Error::Api(api)) => assert_eq!(api.err_code, STREAM_NAME_IN_USE_ERR),
        other => panic!("unexpected {other:?}"),
    }

    for n in 0..10 {
        js.publish(&format!("ORDERS.{n}"), "x", None)?;
    }
    let info = js.stream_info("ORDERS")?;
    assert_eq!(info.state.messages, 10);
    assert_eq!(info.state.last_seq, 10);

    js.purge_stream(
        "ORDERS",
        Some(&PurgeOptions {
            keep: 4,
            ..PurgeOptions::default()
        }),
    )?;
    assert_eq!(js.stream_info("ORDERS")?.state.messages, 4);
    js.purge_stream("ORDERS", None)?;
    assert_eq!(js.stream_info("ORDERS")?.state.messages, 0);

    let updated = js.update_stream(&cfg.clone().subjects(["ORDERS.>"]))?;
    assert_eq!(updated.config.subjects, vec!["ORDERS.>".to_string()]);
    js.publish("ORDERS.eu.new", "x", None)?;

    let account = js.account_info()?;
    assert_eq!(account.streams, 1);
    assert!(account.memory > 0);

    js.delete_stream("ORDERS")?;
    assert!(responder.stream_names().is_empty());
    Ok(())
}

#[test]
fn unknown_stream_is_not_found() {
    let (js, _responder) = setup(ContextConfig::default(), "$JS.API");
    let err = js.stream_info("MISSING").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.err_code(), Some(JS_STREAM_NOT_FOUND_ERR));

    match js.delete_stream("MISSING") {
        Err(Error::Api(api)) => assert_eq!(api.err_code, JS_STREAM_NOT_FOUND_ERR),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn stream_without_subjects_binds_its_name() -> jetstream::Result<()> {
    let (js, responder) = setup(ContextConfig::default(), "$JS.API");
    let info = js.add_stream(&StreamConfig::new("foo"))?;
    assert_eq!(info.config.subjects, vec!["foo".to_string()]);
    let ack = js.publish("foo", "hello", None)?;
    assert_eq!(ack.stream, "foo");
    assert_eq!(responder.stream_state("foo").expect("state").bytes, 5);
    Ok(())
}

#[test]
fn domain_and_custom_prefixes_route_requests() -> jetstream::Result<()> {
    let (js, responder) = setup(ContextConfig::default().with_domain("hub"), "$JS.hub.API");
    assert_eq!(js.api_prefix(), "$JS.hub.API");
    js.add_stream(&StreamConfig::new("A"))?;
    assert_eq!(responder.api_requests(), 1);

    let (js, responder) = setup(ContextConfig::default().with_api_prefix("MY.API."), "MY.API");
    assert_eq!(js.api_prefix(), "MY.API");
    js.add_stream(&StreamConfig::new("B"))?;
    assert_eq!(responder.stream_names(), vec!["B".to_string()]);

    // Nobody serves the default prefix here.
    let (js, _responder) = setup(ContextConfig::default(), "OTHER.API");
    assert!(matches!(js.account_info(), Err(Error::NoResponders)));
    Ok(())
}

#[test]
fn stream_names_are_checked_locally() {
    let (js, responder) = setup(ContextConfig::default(), "$JS.API");
    assert!(matches!(js.stream_info(""), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        js.add_stream(&StreamConfig::new("a.b")),
        Err(Error::InvalidArgument(_))
    ));
    let bad_purge = PurgeOptions {
        sequence: 5,
        keep: 1,
        ..PurgeOptions::default()
    };
    assert!(matches!(
        js.purge_stream("ORDERS", Some(&bad_purge)),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(responder.api_requests(), 0);
}
