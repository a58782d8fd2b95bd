// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Header and message codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quorumdb::wire::{Command, Header, Message, Operation};

fn prepare(body_len: usize) -> Message {
    let mut header = Header::new(1, Command::Prepare);
    header.op = 42;
    header.view = 3;
    header.operation = Operation::USER_MIN;
    Message::new(header, vec![0xAB; body_len])
}

fn bench_header_encode(c: &mut Criterion) {
    let message = prepare(0);
    c.bench_function("header_encode", |b| {
        b.iter(|| black_box(message.header.encode_le()));
    });
}

fn bench_header_decode_validate(c: &mut Criterion) {
    let encoded = prepare(0).header.encode_le();
    c.bench_function("header_decode_validate", |b| {
        b.iter(|| {
            let header = Header::decode_le(black_box(&encoded)).expect("decodes");
            black_box(header.valid_checksum())
        });
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let wire = prepare(1024).encode();
    c.bench_function("message_decode_1k", |b| {
        b.iter(|| Message::decode(1, black_box(&wire)).expect("valid"));
    });
}

criterion_group!(
    benches,
    bench_header_encode,
    bench_header_decode_validate,
    bench_message_decode
);
criterion_main!(benches);
