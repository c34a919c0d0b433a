use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use jetstream::api::StorageType;
use jetstream::sim::StreamResponder;
use jetstream::{Context, ContextConfig, MemoryTransport, StreamConfig};

const MSG_SIZE: usize = 128;
const BATCH: u64 = 1_000;

fn setup(max_pending: usize) -> (Context, StreamResponder) {
    let transport = Arc::new(MemoryTransport::new());
    let responder = StreamResponder::start(transport.clone()).expect("responder");
    let js = Context::open(
        transport,
        ContextConfig::default().with_max_pending(max_pending),
    )
    .expect("context");
    js.add_stream(&StreamConfig::new("BENCH").storage(StorageType::Memory))
        .expect("stream");
    (js, responder)
}

fn bench_publish_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_async");
    group.throughput(Throughput::Elements(BATCH));
    let payload = vec![0u8; MSG_SIZE];

    for max_pending in [0usize, 256] {
        let (js, _responder) = setup(max_pending);
        group.bench_function(format!("batch_{BATCH}_max_pending_{max_pending}"), |b| {
            b.iter_batched(
                || payload.clone(),
                |payload| {
                    for _ in 0..BATCH {
                        js.publish_async("BENCH", black_box(payload.clone()))
                            .expect("publish");
                    }
                    js.flush_async(None).expect("flush");
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_publish_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_sync");
    group.throughput(Throughput::Elements(1));
    let (js, _responder) = setup(0);
    let payload = vec![0u8; MSG_SIZE];
    group.bench_function("request_ack", |b| {
        b.iter(|| {
            js.publish("BENCH", black_box(payload.clone()), None)
                .expect("publish")
        });
    });
    group.finish();
}

criterion_group!(benches, bench_publish_async, bench_publish_sync);
criterion_main!(benches);
