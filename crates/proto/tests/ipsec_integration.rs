//! IPsec Integration Tests
//!
//! End-to-end flows through two engines (sender and receiver) sharing SA
//! keys, the way two hosts configured by the same key-management daemon
//! would.

#![cfg(feature = "ipsec")]

use cbc::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use kestrel_proto::ipsec::{
    packet::proto, xform, EngineConfig, Error, InboundVerdict, IpsecEngine, IpsecProtocol,
    OutboundVerdict, Packet, PolicyAction, SaConfig, SaId, SaLifetime, SaState, Selector,
    TransformRegistry,
};
use std::net::Ipv6Addr;
use std::sync::Arc;

const ESP_SPI: u32 = 0x1001;
const AH_SPI: u32 = 0x2002;
const AES_KEY: [u8; 32] = [0x5A; 32];
const AUTH_KEY: [u8; 32] = [0xC3; 32];

fn host_a() -> Ipv6Addr {
    "2001:db8:1::a".parse().unwrap()
}

fn host_b() -> Ipv6Addr {
    "2001:db8:2::b".parse().unwrap()
}

fn esp_id() -> SaId {
    SaId::new(host_b(), IpsecProtocol::Esp, ESP_SPI)
}

fn ah_id() -> SaId {
    SaId::new(host_b(), IpsecProtocol::Ah, AH_SPI)
}

fn new_engine() -> IpsecEngine {
    IpsecEngine::new(
        EngineConfig::default(),
        Arc::new(TransformRegistry::with_builtins()),
    )
    .expect("engine")
}

fn esp_config(cipher: &str, key: &[u8], auth: Option<&str>) -> SaConfig {
    let mut builder = SaConfig::builder()
        .with_id(esp_id())
        .with_encryption(cipher, key.to_vec());
    if let Some(auth) = auth {
        builder = builder.with_auth(auth, AUTH_KEY.to_vec());
    }
    builder.build().expect("ESP SA config")
}

fn ah_config() -> SaConfig {
    SaConfig::builder()
        .with_id(ah_id())
        .with_auth("digest-sha1", AUTH_KEY[..20].to_vec())
        .build()
        .expect("AH SA config")
}

/// Engine pair with one APPLY policy over `selector`
fn peers(selector: Selector, sas: &[SaConfig]) -> (IpsecEngine, IpsecEngine) {
    let make = || {
        let engine = new_engine();
        let mut ah = None;
        let mut esp = None;
        for sa in sas {
            let handle = engine.add_sa(sa.clone()).expect("add_sa");
            match handle.id().protocol {
                IpsecProtocol::Ah => ah = Some(sa.id),
                IpsecProtocol::Esp => esp = Some(sa.id),
            }
        }
        engine
            .add_policy(selector, PolicyAction::Apply, ah, esp)
            .expect("add_policy");
        engine
    };
    (make(), make())
}

fn udp_datagram(len: usize) -> Vec<u8> {
    assert!(len >= 8);
    let mut d = vec![0x9C, 0x40, 0x01, 0xF4];
    d.extend_from_slice(&(len as u16).to_be_bytes());
    d.extend_from_slice(&[0, 0]);
    d.extend((0..len - 8).map(|i| i as u8));
    d
}

fn udp_flow() -> Selector {
    Selector::new(host_a(), host_b(), proto::UDP).with_ports(40000, 500)
}

fn send(engine: &IpsecEngine, selector: &Selector, packet: Packet) -> Packet {
    match engine.outbound_check(selector) {
        OutboundVerdict::Apply(policy) => engine.outbound_encode(packet, &policy).expect("encode"),
        other => panic!("expected apply verdict, got {:?}", other),
    }
}

//
// Test Cases - ESP
//

#[test]
fn test_esp_37_byte_payload_scenario() {
    let flow = udp_flow();
    let sa = esp_config("cipher-aes-cbc", &AES_KEY, Some("digest-sha256"));
    let (sender, receiver) = peers(flow, &[sa]);

    let datagram = udp_datagram(37);
    let original = Packet::build(host_a(), host_b(), proto::UDP, 64, &datagram).unwrap();
    let mut wire = send(&sender, &flow, original.clone());

    // IPv6 | SPI, seq | IV(16) | ciphertext | ICV(16)
    let record_len = wire.len() - 40;
    let ct_len = record_len - 8 - 16 - 16;
    assert_eq!(ct_len % 16, 0);
    assert_eq!(ct_len, 48);
    assert_eq!(wire.next_header(), proto::ESP);
    assert_eq!(&wire.as_bytes()[40..44], &ESP_SPI.to_be_bytes());

    assert_eq!(receiver.inbound_check(&mut wire), InboundVerdict::Accept(proto::UDP));
    assert_eq!(wire, original);
    assert_eq!(&wire.as_bytes()[40..], datagram.as_slice());
}

#[test]
fn test_esp_aes_cbc_matches_reference_implementation() {
    let flow = udp_flow();
    let (sender, _) = peers(flow, &[esp_config("cipher-aes-cbc", &AES_KEY, None)]);

    let datagram = udp_datagram(37);
    let packet = Packet::build(host_a(), host_b(), proto::UDP, 64, &datagram).unwrap();
    let wire = send(&sender, &flow, packet);
    let bytes = wire.as_bytes();

    let iv = &bytes[48..64];
    let ciphertext = &bytes[64..];
    assert_eq!(ciphertext.len(), 48);

    // payload | 1..=9 | pad length | next header
    let mut plaintext = datagram.clone();
    plaintext.extend(1..=9u8);
    plaintext.push(9);
    plaintext.push(proto::UDP);
    assert_eq!(plaintext.len(), 48);

    let len = plaintext.len();
    let expected = cbc::Encryptor::<aes::Aes256>::new_from_slices(&AES_KEY, iv)
        .unwrap()
        .encrypt_padded_mut::<NoPadding>(&mut plaintext, len)
        .unwrap()
        .to_vec();
    assert_eq!(ciphertext, expected.as_slice());
}

#[test]
fn test_esp_round_trip_payload_lengths() {
    let flow = Selector::new(host_a(), host_b(), proto::NO_NEXT_HEADER);

    for cipher in ["cipher-aes-cbc", "cipher-rc5-cbc", "cipher-rc6-cbc", "cipher-null-cbc"] {
        let key = &AES_KEY[..16];
        let (sender, receiver) = peers(flow, &[esp_config(cipher, key, Some("digest-sha1"))]);
        let bs = sender
            .sadb()
            .find(&esp_id())
            .and_then(|sa| sa.enc().map(|c| c.block_size()))
            .unwrap();

        for len in [0, 1, bs - 1, bs, 4 * bs + 3] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let original =
                Packet::build(host_a(), host_b(), proto::NO_NEXT_HEADER, 64, &payload).unwrap();
            let mut wire = send(&sender, &flow, original.clone());
            assert_eq!(
                receiver.inbound_check(&mut wire),
                InboundVerdict::Accept(proto::NO_NEXT_HEADER),
                "{} payload length {}",
                cipher,
                len
            );
            assert_eq!(wire, original, "{} payload length {}", cipher, len);
        }
    }
}

#[test]
fn test_esp_sequence_numbers_increase() {
    let flow = udp_flow();
    let (sender, _) = peers(flow, &[esp_config("cipher-rc6-cbc", &AES_KEY, None)]);

    let mut previous = 0u32;
    for _ in 0..5 {
        let packet = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(12)).unwrap();
        let wire = send(&sender, &flow, packet);
        let b = &wire.as_bytes()[44..48];
        let seq = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        assert!(seq > previous);
        previous = seq;
    }
    assert_eq!(previous, 5);
}

#[test]
fn test_esp_tampered_ciphertext_dropped() {
    let flow = udp_flow();
    let sa = esp_config("cipher-aes-cbc", &AES_KEY, Some("digest-sha256"));
    let (sender, receiver) = peers(flow, &[sa]);

    let packet = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(20)).unwrap();
    let mut wire = send(&sender, &flow, packet);
    wire.as_bytes_mut()[70] ^= 0x80;
    assert!(matches!(
        receiver.inbound_check(&mut wire),
        InboundVerdict::Drop(Error::AuthenticationFailed(_))
    ));
    assert_eq!(receiver.metrics().snapshot().drops_auth, 1);
}

//
// Test Cases - AH
//

#[test]
fn test_ah_bit_flips_dropped() {
    let flow = udp_flow();
    let (sender, receiver) = peers(flow, &[ah_config()]);

    let original = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(24)).unwrap();
    let wire = send(&sender, &flow, original.clone());
    assert_eq!(wire.next_header(), proto::AH);

    // AH at 40: SPI at 44..48, sequence at 48..52; UDP data after the
    // 24-byte header (12 fixed + 12 ICV).
    let payload_at = 40 + 24 + 10;
    for (offset, mask) in [(payload_at, 0x01u8), (51, 0x02), (47, 0x10)] {
        let mut tampered = wire.clone();
        tampered.as_bytes_mut()[offset] ^= mask;
        assert!(
            !receiver.inbound_check(&mut tampered).is_accept(),
            "flip at byte {} accepted",
            offset
        );
    }

    let mut clean = wire;
    assert_eq!(receiver.inbound_check(&mut clean), InboundVerdict::Accept(proto::UDP));
    assert_eq!(clean, original);
}

#[test]
fn test_ah_ignores_hop_limit_change() {
    let flow = udp_flow();
    let (sender, receiver) = peers(flow, &[ah_config()]);

    let packet = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(16)).unwrap();
    let mut wire = send(&sender, &flow, packet);
    wire.set_hop_limit(3);
    assert!(receiver.inbound_check(&mut wire).is_accept());
}

#[test]
fn test_ah_and_esp_combined() {
    let flow = udp_flow();
    let sas = [
        ah_config(),
        esp_config("cipher-rc5-cbc", &AES_KEY[..24], Some("digest-sha1")),
    ];
    let (sender, receiver) = peers(flow, &sas);

    let original = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(100)).unwrap();
    let mut wire = send(&sender, &flow, original.clone());
    assert_eq!(wire.next_header(), proto::AH);
    assert_eq!(receiver.inbound_check(&mut wire), InboundVerdict::Accept(proto::UDP));
    assert_eq!(wire, original);
}

//
// Test Cases - SA lifetime
//

#[test]
fn test_sa_lifetime_soft_then_hard() {
    let flow = udp_flow();
    let sender = new_engine();
    sender.add_sa(esp_config("cipher-aes-cbc", &AES_KEY, None)).unwrap();
    sender
        .add_policy(flow, PolicyAction::Apply, None, Some(esp_id()))
        .unwrap();

    let lifetime = SaLifetime::unlimited().with_byte_limits(30, 60).unwrap();
    let receiver = new_engine();
    let mut sa = esp_config("cipher-aes-cbc", &AES_KEY, None);
    sa.lifetime = Some(lifetime);
    receiver.add_sa(sa).unwrap();
    receiver
        .add_policy(flow, PolicyAction::Apply, None, Some(esp_id()))
        .unwrap();

    // 20-byte datagrams: 20, 40 (soft), 60 (hard)
    let mut wires: Vec<Packet> = (0..4)
        .map(|_| {
            let p = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(20)).unwrap();
            send(&sender, &flow, p)
        })
        .collect();

    assert!(receiver.inbound_check(&mut wires[0]).is_accept());
    assert_eq!(receiver.get_sa_state(&esp_id()).unwrap().state, SaState::Mature);

    assert!(receiver.inbound_check(&mut wires[1]).is_accept());
    assert_eq!(receiver.get_sa_state(&esp_id()).unwrap().state, SaState::Dying);

    // the packet crossing the hard limit is still delivered
    assert!(receiver.inbound_check(&mut wires[2]).is_accept());
    let status = receiver.get_sa_state(&esp_id()).unwrap();
    assert_eq!(status.state, SaState::Dead);
    assert_eq!(status.packets, 3);

    assert!(matches!(
        receiver.inbound_check(&mut wires[3]),
        InboundVerdict::Drop(Error::SaNotFound(_))
    ));
    assert_eq!(receiver.metrics().snapshot().sa_expired, 1);
}

//
// Test Cases - Policy
//

#[test]
fn test_policy_verdicts() {
    let engine = new_engine();
    let udp = udp_flow();
    let tcp = Selector::new(host_a(), host_b(), proto::TCP).with_ports(40000, 443);
    engine.add_policy(udp, PolicyAction::Drop, None, None).unwrap();
    engine.add_policy(tcp, PolicyAction::Bypass, None, None).unwrap();

    assert!(matches!(engine.outbound_check(&udp), OutboundVerdict::Drop));
    assert!(matches!(engine.outbound_check(&tcp), OutboundVerdict::Bypass));

    let mut dropped = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(8)).unwrap();
    assert!(matches!(
        engine.inbound_check(&mut dropped),
        InboundVerdict::Drop(Error::PolicyDrop(_))
    ));

    let mut segment = vec![0x9C, 0x40, 0x01, 0xBB];
    segment.resize(20, 0);
    let mut passed = Packet::build(host_a(), host_b(), proto::TCP, 64, &segment).unwrap();
    assert_eq!(engine.inbound_check(&mut passed), InboundVerdict::Accept(proto::TCP));
}

#[test]
fn test_prefix_policy_covers_host_flow() {
    let net_a: Ipv6Addr = "2001:db8:1::".parse().unwrap();
    let net_b: Ipv6Addr = "2001:db8:2::".parse().unwrap();
    let wide = Selector::new(net_a, net_b, proto::UDP)
        .with_ports(40000, 500)
        .with_prefixes(48, 48);

    let engine = new_engine();
    engine.add_policy(wide, PolicyAction::Drop, None, None).unwrap();
    assert!(matches!(engine.outbound_check(&udp_flow()), OutboundVerdict::Drop));

    engine.add_policy(udp_flow(), PolicyAction::Bypass, None, None).unwrap();
    assert!(matches!(engine.outbound_check(&udp_flow()), OutboundVerdict::Bypass));
}

#[test]
fn test_unprotected_packet_on_protected_flow() {
    let flow = udp_flow();
    let (_, receiver) = peers(flow, &[esp_config("cipher-aes-cbc", &AES_KEY, None)]);
    let mut plain = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(8)).unwrap();
    assert!(matches!(
        receiver.inbound_check(&mut plain),
        InboundVerdict::Drop(Error::PolicyMismatch(_))
    ));
    assert_eq!(receiver.metrics().snapshot().drops_policy, 1);
}

//
// Test Cases - Registry
//

#[test]
fn test_unsuffixed_cipher_name_uses_cbc() {
    let flow = udp_flow();
    let (sender, receiver) = peers(flow, &[esp_config("cipher-aes", &AES_KEY, None)]);
    let sa = sender.sadb().find(&esp_id()).unwrap();
    assert_eq!(sa.enc().map(|c| c.iv_size()), Some(16));

    let original = Packet::build(host_a(), host_b(), proto::UDP, 64, &udp_datagram(30)).unwrap();
    let mut wire = send(&sender, &flow, original.clone());
    assert!(receiver.inbound_check(&mut wire).is_accept());
    assert_eq!(wire, original);
}

#[test]
fn test_engine_over_global_registry() {
    let registry = xform::init_global(Arc::new(xform::BuiltinDiscovery)).expect("init");
    let engine = IpsecEngine::with_global(EngineConfig::default()).expect("engine");
    assert!(Arc::ptr_eq(engine.registry(), &registry));

    engine
        .add_sa(esp_config("cipher-rc6-cbc", &AES_KEY, Some("digest-sha256")))
        .expect("add_sa through global registry");
    drop(engine);

    assert!(xform::shutdown_global().is_some());
    assert!(matches!(
        IpsecEngine::with_global(EngineConfig::default()),
        Err(Error::InvalidState(_))
    ));
}
