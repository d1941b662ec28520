//! Wire codec benchmarks

use auxlink_core::core::protocol::checksum::crc16_ccitt;
use auxlink_core::{Message, MessageKind, ReportType, Tlv, TlvTag};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

fn report_message() -> Message {
    let mut tlv = Tlv::new();
    tlv.insert(TlvTag::TestReport, "flash erase verified on all 64 sectors").unwrap();
    tlv.insert(TlvTag::FailureReason, vec![0xA5; 200]).unwrap();
    tlv.insert(TlvTag::TestParameter, 0x0001_0203u32).unwrap();
    Message::new(MessageKind::Report(ReportType::TestPass), 42, 3, 7).with_tlv(tlv)
}

fn message_benchmark(c: &mut Criterion) {
    let msg = report_message();
    let raw = msg.serialize();

    let mut group = c.benchmark_group("message");
    group.throughput(Throughput::Bytes(raw.len() as u64));

    group.bench_function("serialize", |b| {
        b.iter(|| black_box(black_box(&msg).serialize()))
    });

    group.bench_function("parse", |b| {
        b.iter(|| black_box(Message::parse(black_box(&raw)).unwrap()))
    });

    group.finish();
}

fn checksum_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("crc16_ccitt", |b| {
        b.iter(|| black_box(crc16_ccitt(black_box(&data))))
    });

    group.finish();
}

criterion_group!(benches, message_benchmark, checksum_benchmark);
criterion_main!(benches);
