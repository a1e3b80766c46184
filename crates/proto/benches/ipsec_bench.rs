//! IPsec Performance Benchmarks
//!
//! Benchmarks for ESP/AH throughput per transform, the full engine packet
//! path and transform lookup.
//!
//! Run with: `cargo bench --features ipsec --bench ipsec_bench`

#![cfg(feature = "ipsec")]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kestrel_proto::ipsec::{
    ah,
    esp::EspPacket,
    packet::proto,
    xform::{BuiltinDiscovery, TransformRegistry},
    EngineConfig, IpsecEngine, IpsecProtocol, OutboundVerdict, Packet, PolicyAction, SaConfig,
    SaId, SaLifetime, Selector, SecurityAssociation,
};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

const SIZES: [usize; 3] = [64, 512, 1500];
const CIPHERS: [&str; 3] = ["cipher-aes-cbc", "cipher-rc5-cbc", "cipher-rc6-cbc"];

fn dst() -> Ipv6Addr {
    "2001:db8::2".parse().unwrap()
}

/// ESP SA with HMAC-SHA1-96
fn create_esp_sa(registry: &TransformRegistry, cipher: &str) -> SecurityAssociation {
    SecurityAssociation::new(
        SaId::new(dst(), IpsecProtocol::Esp, 0x1001),
        Some(registry.digest_context("digest-sha1", &[0x22u8; 20], false).unwrap()),
        Some(registry.cipher_context(cipher, &[0x11u8; 16], false).unwrap()),
        SaLifetime::unlimited(),
        64,
    )
    .unwrap()
}

/// Benchmark ESP encapsulation per cipher and payload size
fn bench_esp_encryption(c: &mut Criterion) {
    let registry = TransformRegistry::with_builtins();
    let mut group = c.benchmark_group("esp_encrypt");

    for cipher in CIPHERS {
        let sa = create_esp_sa(&registry, cipher);
        for size in SIZES {
            let payload = vec![0x42u8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(cipher, size), &payload, |b, payload| {
                b.iter(|| EspPacket::encapsulate(&sa, black_box(payload), proto::UDP).unwrap());
            });
        }
    }

    group.finish();
}

/// Benchmark ESP decapsulation (replay check off, same record each time)
fn bench_esp_decryption(c: &mut Criterion) {
    let registry = TransformRegistry::with_builtins();
    let mut group = c.benchmark_group("esp_decrypt");

    for cipher in CIPHERS {
        let sa = create_esp_sa(&registry, cipher);
        for size in SIZES {
            let record = EspPacket::encapsulate(&sa, &vec![0x42u8; size], proto::UDP).unwrap();
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(cipher, size), &record, |b, record| {
                b.iter(|| black_box(record).decapsulate(&sa, false).unwrap());
            });
        }
    }

    group.finish();
}

/// Benchmark AH generation and verification of a 1500-byte packet
fn bench_ah(c: &mut Criterion) {
    let registry = TransformRegistry::with_builtins();
    let sa = SecurityAssociation::new(
        SaId::new(dst(), IpsecProtocol::Ah, 0x2002),
        Some(registry.digest_context("digest-sha256", &[0x33u8; 32], false).unwrap()),
        None,
        SaLifetime::unlimited(),
        64,
    )
    .unwrap();
    let packet = Packet::build(Ipv6Addr::LOCALHOST, dst(), proto::UDP, 64, &[0u8; 1460]).unwrap();

    let mut group = c.benchmark_group("ah");
    group.throughput(Throughput::Bytes(packet.len() as u64));

    group.bench_function("generate_1500bytes", |b| {
        b.iter(|| {
            let mut p = packet.clone();
            ah::output(&sa, &mut p).unwrap();
            p
        });
    });

    let mut protected = packet.clone();
    ah::output(&sa, &mut protected).unwrap();
    let at = protected.headers().unwrap()[0];
    let header = ah::AhHeader::from_bytes(&protected.as_bytes()[at.offset..]).unwrap();
    group.bench_function("verify_1500bytes", |b| {
        b.iter(|| ah::verify(&sa, black_box(&protected), &header, false).unwrap());
    });

    group.finish();
}

/// Benchmark outbound_encode + inbound_check through two engines
fn bench_engine_round_trip(c: &mut Criterion) {
    let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let id = SaId::new(dst(), IpsecProtocol::Esp, 0x1001);
    let flow = Selector::new(src, dst(), proto::NO_NEXT_HEADER);

    let make = |replay_protection: bool| {
        let engine = IpsecEngine::new(
            EngineConfig::builder()
                .with_replay_protection(replay_protection)
                .build()
                .unwrap(),
            Arc::new(TransformRegistry::with_builtins()),
        )
        .unwrap();
        let sa = SaConfig::builder()
            .with_id(id)
            .with_encryption("cipher-aes-cbc", vec![0x11u8; 32])
            .with_auth("digest-sha256", vec![0x22u8; 32])
            .build()
            .unwrap();
        engine.add_sa(sa).unwrap();
        engine
            .add_policy(flow, PolicyAction::Apply, None, Some(id))
            .unwrap();
        engine
    };
    let sender = make(true);
    let receiver = make(false);
    let OutboundVerdict::Apply(policy) = sender.outbound_check(&flow) else {
        panic!("expected apply verdict");
    };
    let packet = Packet::build(src, dst(), proto::NO_NEXT_HEADER, 64, &[0u8; 1400]).unwrap();

    let mut group = c.benchmark_group("engine");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));
    group.throughput(Throughput::Bytes(1400));
    group.bench_function("encode_and_check_1400bytes", |b| {
        b.iter(|| {
            let mut wire = sender.outbound_encode(packet.clone(), &policy).unwrap();
            receiver.inbound_check(&mut wire)
        });
    });
    group.finish();
}

/// Benchmark cipher lookup: registered, synthesized mode and discovered
fn bench_transform_lookup(c: &mut Criterion) {
    let registry = TransformRegistry::with_builtins();
    let discovering = TransformRegistry::with_discovery(Arc::new(BuiltinDiscovery));
    discovering.find_cipher("cipher-rc6-cbc", false).unwrap();

    let mut group = c.benchmark_group("registry");
    group.bench_function("find_registered", |b| {
        b.iter(|| registry.find_cipher(black_box("cipher-aes"), false).unwrap());
    });
    group.bench_function("find_synthesized_cbc", |b| {
        b.iter(|| registry.find_cipher(black_box("cipher-rc5-cbc"), false).unwrap());
    });
    group.bench_function("find_after_discovery", |b| {
        b.iter(|| discovering.find_cipher(black_box("cipher-rc6-cbc"), false).unwrap());
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_esp_encryption,
    bench_esp_decryption,
    bench_ah,
    bench_engine_round_trip,
    bench_transform_lookup,
);

criterion_main!(benches);
