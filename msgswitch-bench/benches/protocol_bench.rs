//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use msgswitch_protocol::frame::Frame;
use msgswitch_protocol::{
    Cursor, Decoder, Encoder, Message, MessageId, Reply, Request, Response, DEFAULT_CHUNK_SIZE,
};

fn create_send_request(payload_size: usize) -> Request {
    Request::Send {
        queue: "org.xen.xapi.storage".to_string(),
        message: Message::request("x".repeat(payload_size), "client-bench"),
    }
}

/// A transfer reply carrying `count` messages of `payload_size` bytes each.
fn create_transfer_reply(count: usize, payload_size: usize) -> Reply {
    let messages = (0..count)
        .map(|i| {
            (
                MessageId::new("org.xen.xapi.storage", i as i64 + 1),
                Message::request("x".repeat(payload_size), "client-bench"),
            )
        })
        .collect();
    Reply::ok(Response::Transfer {
        messages,
        next: Cursor::new(count.to_string()),
    })
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(payload.clone());

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(payload);
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");

    for size in [100, 1000, 10000] {
        let request = create_send_request(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.iter(|| black_box(Encoder::encode_request(request).unwrap()));
        });
    }

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");

    for size in [100, 1000, 10000] {
        let request = create_send_request(size);
        let encoded = Encoder::encode_request(&request).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_request().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_reply_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_encode");

    for chunk_size in [1024, DEFAULT_CHUNK_SIZE] {
        let reply = create_transfer_reply(64, 1000);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &reply,
            |b, reply| {
                b.iter(|| black_box(Encoder::encode_reply(reply, chunk_size).unwrap()));
            },
        );
    }

    group.finish();
}

/// Reassembly of a reply body split into many chunks, fed in read-sized pieces.
fn bench_chunked_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_reassembly");

    for chunk_size in [256, 4096, DEFAULT_CHUNK_SIZE] {
        let reply = create_transfer_reply(64, 1000);
        let encoded = Encoder::encode_reply(&reply, chunk_size).unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &encoded,
            |b, encoded| {
                b.iter(|| {
                    let mut decoder = Decoder::new();
                    let mut decoded = None;
                    for piece in encoded.chunks(8 * 1024) {
                        decoder.extend(piece);
                        if let Some(reply) = decoder.decode_reply().unwrap() {
                            decoded = Some(reply);
                        }
                    }
                    black_box(decoded.unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");

    for size in [100, 1000, 10000, 100000] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c::crc32c(data)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_request_encode,
    bench_request_decode,
    bench_reply_encode,
    bench_chunked_reassembly,
    bench_crc32c,
);

criterion_main!(benches);
