//! Benchmarks for the protocol codec.
//!
//! Run with: cargo bench -p stratus-proto

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stratus_proto::codec::{Codec, FRAME_HEADER_SIZE};
use stratus_proto::{Envelope, InvocationRequest, ParameterBinding, WireValue, WorkerMessage};

fn create_invocation_request(payload_size: usize) -> Envelope {
    let request = InvocationRequest::new(
        "inv-1",
        "fn-1",
        vec![ParameterBinding::new("body", WireValue::Bytes(vec![0u8; payload_size]))],
    );
    Envelope::new("req-1", WorkerMessage::InvocationRequest(request))
}

fn bench_encode_invocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_invocation");

    for size in [64, 1024, 8192, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut codec = Codec::new();
            let envelope = create_invocation_request(size);

            b.iter(|| {
                let result = codec.encode(black_box(&envelope));
                black_box(result.unwrap().len())
            });
        });
    }

    group.finish();
}

fn bench_decode_invocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_invocation");

    for size in [64, 1024, 8192, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut codec = Codec::new();
            let envelope = create_invocation_request(size);
            let bytes = codec.encode(&envelope).unwrap().to_vec();
            let payload = &bytes[FRAME_HEADER_SIZE..];

            b.iter(|| {
                let result = Codec::decode(black_box(payload)).unwrap();
                black_box(result)
            });
        });
    }

    group.finish();
}

fn bench_encode_status(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_status");

    group.bench_function("request", |b| {
        let mut codec = Codec::new();
        let envelope = Envelope::new("req-1", WorkerMessage::WorkerStatusRequest);

        b.iter(|| {
            let result = codec.encode(black_box(&envelope));
            black_box(result.unwrap().len())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_invocation,
    bench_decode_invocation,
    bench_encode_status,
);
criterion_main!(benches);
