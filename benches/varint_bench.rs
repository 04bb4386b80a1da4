//! Microbenchmark for the varint codec (C1/§4.16's hot path: every frame
//! and packet header goes through this).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quicfuscate_core::varint;

fn bench_encode(c: &mut Criterion) {
    let values = [0u64, 37, 15293, 494_878_333, 151_288_809_941_952_652, varint::MAX];
    c.bench_function("varint_encode_mixed", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(8);
            for &v in &values {
                out.clear();
                varint::encode(black_box(v), &mut out).unwrap();
            }
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let mut encoded = Vec::new();
    for &v in &[0u64, 37, 15293, 494_878_333, 151_288_809_941_952_652, varint::MAX] {
        varint::encode(v, &mut encoded).unwrap();
    }
    c.bench_function("varint_decode_mixed", |b| {
        b.iter(|| {
            let mut pos = 0;
            while pos < encoded.len() {
                let (_, len) = varint::decode(&encoded[pos..]).unwrap();
                pos += len;
            }
            black_box(pos)
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
