//! Wire codec benchmarks: CRC throughput and frame encode/decode cost.
//!
//! ## Run
//! ```bash
//! cargo bench --bench bench_wire
//! ```

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use peertalk::wire::{
    crc, encode_frame, DiscoveryFlags, DiscoveryKind, DiscoveryPacket, MessageFlags, MessageKind,
    Transports,
};

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16_xmodem");
    for len in [64usize, 1024, 4096] {
        let data = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("{len}B"), |b| b.iter(|| crc::checksum(&data)));
    }
    group.finish();
}

fn bench_discovery_codec(c: &mut Criterion) {
    let packet = DiscoveryPacket {
        kind: DiscoveryKind::Announce,
        flags: DiscoveryFlags::HOST | DiscoveryFlags::ACCEPTING,
        sender_port: 7354,
        transports: Transports::TCP | Transports::UDP,
        name: "bench-peer".to_owned(),
    };
    let mut encoded = BytesMut::new();
    packet.encode(&mut encoded).unwrap();

    c.bench_function("discovery_encode", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            packet.encode(&mut buf).unwrap()
        });
    });
    c.bench_function("discovery_decode", |b| {
        b.iter(|| DiscoveryPacket::decode(&encoded).unwrap())
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let payload = vec![0xC3u8; 1024];
    let mut group = c.benchmark_group("stream_frame");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("encode_1KiB", |b| {
        let mut buf = BytesMut::with_capacity(2048);
        b.iter(|| {
            buf.clear();
            encode_frame(MessageKind::Data, MessageFlags::RELIABLE, 7, &payload, &mut buf)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_crc, bench_discovery_codec, bench_frame_encode);
criterion_main!(benches);
