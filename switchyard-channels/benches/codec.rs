//! Performance benchmarks for envelope encoding and decoding

#![allow(missing_docs, clippy::unwrap_used)]

use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use std::hint::black_box;
use switchyard_channels::{Codec, Envelope, WireFormat};

fn create_test_envelope(reference: u64) -> Envelope {
    Envelope::new(
        "agents:lobby",
        "new_msg",
        json!({
            "body": format!("message {reference}"),
            "user": {"id": reference, "name": "agent"},
            "tags": ["alpha", "beta", "gamma"],
        }),
        Some(reference),
        Some(1),
    )
}

fn bench_encode(c: &mut Criterion) {
    let envelope = create_test_envelope(1234);
    let v2 = Codec::new(WireFormat::V2);
    let v1 = Codec::new(WireFormat::V1);

    c.bench_function("encode_v2", |b| b.iter(|| black_box(v2.encode(black_box(&envelope)))));
    c.bench_function("encode_v1", |b| b.iter(|| black_box(v1.encode(black_box(&envelope)))));
}

fn bench_decode(c: &mut Criterion) {
    let envelope = create_test_envelope(1234);

    for format in [WireFormat::V2, WireFormat::V1] {
        let codec = Codec::new(format);
        let frame = codec.encode(&envelope);
        c.bench_function(&format!("decode_{}", format.vsn()), |b| {
            b.iter(|| black_box(codec.decode(black_box(&frame)).unwrap()))
        });
    }
}

fn bench_reply_batch(c: &mut Criterion) {
    let codec = Codec::default();
    let frames: Vec<_> = (0..1000)
        .map(|reference| {
            let request = create_test_envelope(reference);
            codec.encode(&Envelope::reply(&request, "ok", json!({"accepted": true})))
        })
        .collect();

    c.bench_function("decode_reply_batch_1000", |b| {
        b.iter(|| {
            for frame in &frames {
                black_box(codec.decode(frame).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_reply_batch);
criterion_main!(benches);
