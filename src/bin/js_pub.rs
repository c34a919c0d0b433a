use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use clap::Parser;
use jetstream::api::StorageType;
use jetstream::sim::StreamResponder;
use jetstream::{Context, ContextConfig, Error, MemoryTransport, PubOptions, StreamConfig};

#[derive(Parser)]
#[command(name = "js-pub")]
#[command(about = "Publish into a stream through an in-process JetStream responder")]
struct Cli {
    /// Stream name; the stream's subject is the same name
    #[arg(long, default_value = "foo")]
    stream: String,

    /// Number of messages to send
    #[arg(long, default_value_t = 100_000)]
    count: u64,

    /// Payload size in bytes
    #[arg(long, default_value_t = 16)]
    size: usize,

    /// Publish asynchronously and drain at the end
    #[arg(long = "async")]
    async_publish: bool,

    /// Outstanding async publishes before publishers stall (0 = unbounded)
    #[arg(long, default_value_t = 4096)]
    max_pending: usize,

    /// Stall wait in milliseconds
    #[arg(long, default_value_t = 200)]
    stall_wait_ms: i64,

    /// Answer every n-th publish with an error (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Drop the ack of every n-th publish (0 = never)
    #[arg(long, default_value_t = 0)]
    drop_every: u64,

    /// Drain timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    drain_ms: i64,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let transport = Arc::new(MemoryTransport::new());
    let responder = StreamResponder::start(transport.clone())?;
    responder.fail_every(cli.fail_every);
    responder.drop_every(cli.drop_every);

    let errors = Arc::new(AtomicU64::new(0));
    let mut config = ContextConfig::default().with_max_pending(cli.max_pending);
    config.publish_async.stall_wait_ms = cli.stall_wait_ms;
    if cli.async_publish {
        let errors = Arc::clone(&errors);
        config = config.with_error_handler(move |_, err| {
            if errors.fetch_add(1, Ordering::Relaxed) < 10 {
                println!(
                    "Error: {} - Code: {} - Text: {}",
                    err.error, err.err_code, err.text
                );
            }
            Some(err.message)
        });
    }
    let js = Context::open(transport.clone(), config)?;

    let created = match js.stream_info(&cli.stream) {
        Ok(info) => {
            report(&info.config.name, info.state.messages, info.state.bytes);
            false
        }
        Err(Error::NotFound(_)) => {
            let cfg = StreamConfig::new(cli.stream.clone()).storage(StorageType::Memory);
            let info = js.add_stream(&cfg).context("creating stream")?;
            report(&info.config.name, info.state.messages, info.state.bytes);
            true
        }
        Err(err) => return Err(err.into()),
    };

    let payload = vec![b'x'; cli.size];
    println!("\nSending {} messages to subject '{}'", cli.count, cli.stream);
    let start = Instant::now();
    let mut stalls = 0u64;
    for _ in 0..cli.count {
        if cli.async_publish {
            match js.publish_async(&cli.stream, payload.clone()) {
                Ok(()) => {}
                // Acks were dropped and the window is full; keep going.
                Err(Error::StallTimeout) => stalls += 1,
                Err(err) => return Err(err.into()),
            }
        } else {
            match js.publish(&cli.stream, payload.clone(), None) {
                Ok(ack) if ack.duplicate => {
                    println!("Got a duplicate message! Sequence={}", ack.seq)
                }
                Ok(_) => {}
                Err(Error::Api(api)) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("publish rejected: {}", api.description);
                }
                Err(Error::Timeout) => stalls += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    if cli.async_publish {
        let opts = PubOptions {
            max_wait_ms: cli.drain_ms,
            ..PubOptions::default()
        };
        match js.publish_async_complete(Some(&opts)) {
            Ok(()) => {}
            Err(Error::DrainTimeout) => {
                println!("Drain timed out with {} pending", js.pending_count())
            }
            Err(err) => return Err(err.into()),
        }
    }

    let elapsed = start.elapsed();
    let rate = cli.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("Sent {} messages in {:?} ({:.0} msgs/sec)", cli.count, elapsed, rate);
    let stats = js.stats();
    log::info!(
        "acks={} errors={} stalls={} orphaned={}",
        stats.acks,
        stats.errors,
        stats.stalls,
        stats.orphaned
    );
    let errors = errors.load(Ordering::Relaxed);
    if errors != 0 {
        println!("There were {errors} asynchronous errors");
    }
    if stalls != 0 {
        println!("{stalls} publishes timed out");
    }

    let info = js.stream_info(&cli.stream)?;
    println!();
    report(&info.config.name, info.state.messages, info.state.bytes);

    if created {
        print!("\nDeleting stream {}: ", cli.stream);
        js.delete_stream(&cli.stream)?;
        println!("OK!");
    }

    js.close();
    drop(responder);
    Ok(())
}

fn report(name: &str, messages: u64, bytes: u64) {
    println!("Stream {name} has {messages} messages ({bytes} bytes)");
}
