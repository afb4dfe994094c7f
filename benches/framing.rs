// ABOUTME: Benchmark suite for the frame codec: encode, parse and header stamping
// ABOUTME: Measures the hot path a busy link runs for every packet

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use remex::codec::{self, PacketType, ProtocolState, ProtocolVersion, Role};
use std::io::Cursor;

fn bench_encode(c: &mut Criterion) {
    let ps = ProtocolState::new(ProtocolVersion::Legacy, 0, Role::Server);
    let mut group = c.benchmark_group("encode");
    for size in [64usize, 4096, 32 * 1024 - 4] {
        let payload = vec![0xA5u8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| codec::encode(&ps, PacketType::Data, black_box(payload)).unwrap());
        });
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let ps = ProtocolState::new(ProtocolVersion::Multiplexed, 42, Role::Server);
    let frame = codec::encode(&ps, PacketType::Stdout, &vec![0x5Au8; 4096]).unwrap();

    c.bench_function("parse_4k", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(frame.as_ref()));
            codec::parse(&mut cursor, ProtocolVersion::Multiplexed).unwrap()
        });
    });
}

fn bench_push_header(c: &mut Criterion) {
    let ps = ProtocolState::new(ProtocolVersion::Legacy, 0, Role::Client);

    c.bench_function("push_header_in_place", |b| {
        b.iter_with_setup(
            || {
                let mut buf = codec::payload_buffer(&ps);
                buf.extend_from_slice(&[0u8; 1024]);
                buf
            },
            |mut buf| {
                codec::push_header(&mut buf, &ps, PacketType::Stdin);
                black_box(buf);
            },
        );
    });
}

fn bench_request_parse(c: &mut Criterion) {
    let request = codec::Request::Command {
        user: "tester".into(),
        command: "echo benchmarking the request line".into(),
    };
    let payload = request.encode_payload().unwrap();
    let ps = ProtocolState::new(ProtocolVersion::Legacy, 0, Role::Client);
    let encoded = codec::encode(&ps, PacketType::Command, &payload).unwrap();

    c.bench_function("request_roundtrip", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(encoded.as_ref()));
            let frame = codec::parse(&mut cursor, ProtocolVersion::Legacy).unwrap();
            codec::Request::parse(&frame).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_parse,
    bench_push_header,
    bench_request_parse
);
criterion_main!(benches);
