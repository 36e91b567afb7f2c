use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use feedwire::core::wire::{decode_batch, encode_batch, Command, EndSelector, Message};
use feedwire::core::{End, Entry, ManualClock, RetentionBuffer};
use feedwire::ipc::{Requester, Responder};

const PAYLOAD_SIZES: [usize; 3] = [64, 4096, 256 * 1024];
const BATCH_LEN: usize = 16;

fn batch(payload_size: usize) -> Vec<Entry> {
    (0..BATCH_LEN)
        .map(|i| Entry::new(vec![i as u8; payload_size], i as f64 * 0.01))
        .collect()
}

fn bench_batch_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_codec");
    for size in PAYLOAD_SIZES {
        let entries = batch(size);
        let body = encode_batch(&entries).expect("encode");
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &entries, |b, entries| {
            b.iter(|| encode_batch(black_box(entries)).expect("encode"))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &body, |b, body| {
            b.iter(|| decode_batch(black_box(body)).expect("decode"))
        });
        let message = Message::batch("frame", Command::PeekData, EndSelector::Latest, 1.0, &entries)
            .expect("message");
        let frame = message.encode().expect("frame");
        group.bench_with_input(BenchmarkId::new("message_decode", size), &frame, |b, frame| {
            b.iter(|| Message::decode(black_box(frame)).expect("decode"))
        });
    }
    group.finish();
}

fn bench_retention(c: &mut Criterion) {
    let mut group = c.benchmark_group("retention");
    group.bench_function("add_with_eviction", |b| {
        let mut buffer = RetentionBuffer::new("frame", 1.0);
        let payload: feedwire::Payload = vec![0u8; 256].into();
        let mut t = 0.0;
        b.iter(|| {
            t += 0.001;
            black_box(buffer.add(payload.clone(), t));
        })
    });
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let endpoint = format!("ipc://{}", dir.path().join("bench.sock").display());
    let responder = Responder::bind_with_clock(
        "bench",
        &endpoint,
        Duration::from_millis(100),
        ManualClock::new(0, 0),
    )
    .expect("responder");
    responder.add_topic("frame", 1.0).expect("topic");
    responder.put("frame", vec![0u8; 4096]).expect("put");
    let mut requester = Requester::connect("bench", &endpoint).expect("requester");

    let mut group = c.benchmark_group("round_trip");
    group.measurement_time(Duration::from_secs(10));
    group.bench_function("peek_latest_4k", |b| {
        b.iter(|| requester.peek("frame", End::Latest, 1).expect("peek"))
    });
    group.finish();
}

criterion_group!(benches, bench_batch_codec, bench_retention, bench_round_trip);
criterion_main!(benches);
