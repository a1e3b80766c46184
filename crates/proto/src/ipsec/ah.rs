//! AH (Authentication Header) Protocol
//!
//! Implements RFC 4302 - IP Authentication Header for IPv6.
//!
//! # AH Header Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Header   |  Payload Len  |          RESERVED             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Security Parameters Index (SPI)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Sequence Number Field                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                Integrity Check Value-ICV (variable)           |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Payload Len is the header length in 4-byte words minus 2. The whole
//! header is padded to a multiple of 8 bytes; the ICV occupies the first
//! bytes of the authentication data field and the rest is zero.
//!
//! # Canonical form
//!
//! The ICV covers the whole packet with every field that may change in
//! transit zeroed: traffic class, flow label, hop limit, the data of
//! hop-by-hop / destination options whose type has the 0x20 bit set, and
//! the authentication data itself.

use crate::ipsec::packet::{proto, walk_headers, HeaderInfo, Packet};
use crate::ipsec::sadb::{IpsecProtocol, SaHandle, SaId, Sadb, SecurityAssociation};
use crate::ipsec::xform::{digest_eq, DigestContext};
use crate::ipsec::{logging, Error, Result};

/// Fixed part of the AH header (next header .. sequence)
pub const AH_FIXED_LEN: usize = 12;

/// Option type bit marking data that may change en route
const OPT_MUTABLE: u8 = 0x20;

/// Option type of Pad1 (a lone byte without length)
const OPT_PAD1: u8 = 0;

/// AH header length for an ICV of `icv_len` bytes (IPv6: 8-byte aligned)
pub fn ah_header_len(icv_len: usize) -> usize {
    (AH_FIXED_LEN + icv_len + 7) / 8 * 8
}

/// Parsed AH header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AhHeader {
    /// Protocol of the header that follows
    pub next_header: u8,
    /// Security Parameters Index
    pub spi: u32,
    /// Sequence number
    pub sequence: u32,
    /// Authentication data field (ICV plus alignment padding)
    pub auth_data: Vec<u8>,
}

impl AhHeader {
    /// Header length in bytes
    pub fn len(&self) -> usize {
        AH_FIXED_LEN + self.auth_data.len()
    }

    /// Always false; the fixed part is present
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Serialize
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.push(self.next_header);
        bytes.push((self.len() / 4 - 2) as u8);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.spi.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.auth_data);
        bytes
    }

    /// Parse from the start of `data`
    ///
    /// # Errors
    ///
    /// - `BufferTooShort` if `data` is shorter than the header claims
    /// - `InvalidPacket` if the length is below 12 bytes or not 8-aligned
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < AH_FIXED_LEN {
            return Err(Error::BufferTooShort {
                required: AH_FIXED_LEN,
                available: data.len(),
            });
        }
        let len = (usize::from(data[1]) + 2) * 4;
        if len < AH_FIXED_LEN || len % 8 != 0 {
            return Err(Error::InvalidPacket(format!("AH length {}", len)));
        }
        if data.len() < len {
            return Err(Error::BufferTooShort {
                required: len,
                available: data.len(),
            });
        }

        Ok(AhHeader {
            next_header: data[0],
            spi: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            sequence: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            auth_data: data[AH_FIXED_LEN..len].to_vec(),
        })
    }
}

/// Zero every field that may change in transit, in place
///
/// Idempotent: canonicalizing a canonical packet changes nothing.
pub fn canonicalize(buf: &mut [u8]) -> Result<()> {
    let headers = walk_headers(buf)?;

    buf[0] &= 0xF0;
    buf[1] = 0;
    buf[2] = 0;
    buf[3] = 0;
    buf[7] = 0;

    for h in headers {
        let header = &mut buf[h.offset..h.offset + h.len];
        match h.kind {
            proto::HOP_BY_HOP | proto::DEST_OPTS => zero_mutable_options(header)?,
            proto::AH => {
                if header.len() < AH_FIXED_LEN {
                    return Err(Error::InvalidPacket(format!("AH length {}", header.len())));
                }
                header[AH_FIXED_LEN..].fill(0);
            }
            _ => {}
        }
    }
    Ok(())
}

fn zero_mutable_options(header: &mut [u8]) -> Result<()> {
    let mut i = 2;
    while i < header.len() {
        let kind = header[i];
        if kind == OPT_PAD1 {
            i += 1;
            continue;
        }
        let len = usize::from(*header.get(i + 1).ok_or_else(|| {
            Error::InvalidPacket("option header truncated".into())
        })?);
        let end = i + 2 + len;
        if end > header.len() {
            return Err(Error::InvalidPacket("option data runs past header".into()));
        }
        if kind & OPT_MUTABLE != 0 {
            header[i + 2..end].fill(0);
        }
        i = end;
    }
    Ok(())
}

/// Truncated ICV over the canonical form of `packet`
fn packet_icv(auth: &DigestContext, packet: &[u8]) -> Result<Vec<u8>> {
    let mut scratch = packet.to_vec();
    canonicalize(&mut scratch)?;
    auth.icv(&[&scratch])
}

/// Insert an AH header into `packet` and authenticate it
///
/// The header goes after hop-by-hop, routing and destination options (and so
/// in front of an ESP record already present). Returns the sequence number
/// used.
pub fn output(sa: &SecurityAssociation, packet: &mut Packet) -> Result<u32> {
    let auth = sa
        .auth()
        .ok_or_else(|| Error::Internal(format!("AH SA {} without digest", sa.id())))?;
    let (at, nh_offset) = packet.insertion_point()?;
    let next_header = packet.as_bytes()[nh_offset];
    let icv_len = auth.icv_len();
    let len = ah_header_len(icv_len);

    let mut st = sa.lock();
    sa.ensure_usable(&st)?;
    let sequence = st.next_sequence()?;

    let header = AhHeader {
        next_header,
        spi: sa.spi(),
        sequence,
        auth_data: vec![0; len - AH_FIXED_LEN],
    };
    packet.insert(at, &header.to_bytes())?;
    packet.set_next_header_at(nh_offset, proto::AH)?;
    packet.fix_payload_len()?;

    let icv = packet_icv(auth, packet.as_bytes())?;
    let icv_start = at + AH_FIXED_LEN;
    packet.as_bytes_mut()[icv_start..icv_start + icv_len].copy_from_slice(&icv);

    sa.record_use(&mut st, packet.len() as u64);
    drop(st);

    logging::log_ah_packet("generate", sa.spi(), sequence, packet.len());
    Ok(sequence)
}

/// Verify `packet` against `sa` without modifying it
///
/// The replay window is checked first but only advanced after the ICV
/// verifies, so forged packets cannot move it.
pub fn verify(
    sa: &SecurityAssociation,
    packet: &Packet,
    header: &AhHeader,
    replay_protection: bool,
) -> Result<()> {
    let auth = sa
        .auth()
        .ok_or_else(|| Error::Internal(format!("AH SA {} without digest", sa.id())))?;
    let icv_len = auth.icv_len();
    if header.auth_data.len() < icv_len {
        return Err(Error::InvalidLength {
            expected: icv_len,
            actual: header.auth_data.len(),
        });
    }

    let mut st = sa.lock();
    sa.ensure_usable(&st)?;

    if replay_protection && !st.replay().check(header.sequence) {
        return Err(Error::ReplayDetected(header.sequence));
    }

    let computed = packet_icv(auth, packet.as_bytes())?;
    if !digest_eq(&computed, &header.auth_data[..icv_len]) {
        return Err(Error::AuthenticationFailed(format!(
            "AH ICV mismatch for {}",
            sa.id()
        )));
    }

    if replay_protection {
        st.replay_mut().update(header.sequence);
    }
    sa.record_use(&mut st, packet.len() as u64);
    Ok(())
}

/// Process the AH header at `at`: look up its SA, verify, strip the header
///
/// On success the handle of the SA used is returned; the caller releases
/// it. On failure no handle is left checked out.
pub fn input(
    sadb: &Sadb,
    packet: &mut Packet,
    at: &HeaderInfo,
    replay_protection: bool,
) -> Result<SaHandle> {
    let header = AhHeader::from_bytes(&packet.as_bytes()[at.offset..])?;
    let id = SaId::new(packet.dst(), IpsecProtocol::Ah, header.spi);
    let sa = sadb
        .find(&id)
        .ok_or_else(|| Error::SaNotFound(id.to_string()))?;

    if let Err(e) = verify(&sa, packet, &header, replay_protection) {
        sadb.release(sa);
        return Err(e);
    }

    packet.remove(at.offset, header.len())?;
    packet.set_next_header_at(at.nh_offset, header.next_header)?;
    packet.fix_payload_len()?;

    logging::log_ah_packet("verify", header.spi, header.sequence, packet.len());
    Ok(sa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::sadb::SaLifetime;
    use crate::ipsec::xform::TransformRegistry;
    use std::net::Ipv6Addr;

    const SPI: u32 = 0x2002;

    fn a() -> Ipv6Addr {
        "2001:db8::a".parse().unwrap()
    }

    fn b() -> Ipv6Addr {
        "2001:db8::b".parse().unwrap()
    }

    fn ah_sa(spi: u32, lifetime: SaLifetime) -> SecurityAssociation {
        let registry = TransformRegistry::with_builtins();
        let auth = registry.digest_context("digest-sha1", &[0x42u8; 20], false).unwrap();
        SecurityAssociation::new(
            SaId::new(b(), IpsecProtocol::Ah, spi),
            Some(auth),
            None,
            lifetime,
            64,
        )
        .unwrap()
    }

    /// Hop-by-hop header with one mutable (0x3E) and one immutable (0x1E) option
    fn packet_with_options() -> Packet {
        let mut payload = vec![
            proto::UDP, 1, // nh, 16 bytes
            0x3E, 2, 0xAA, 0xBB, // mutable
            0x1E, 2, 0xCC, 0xDD, // immutable
            0x00, // Pad1
            1, 3, 0, 0, 0, // PadN
        ];
        payload.extend_from_slice(&[0x04, 0xD2, 0x16, 0x2E, 0, 13, 0, 0]);
        payload.extend_from_slice(b"hello");
        Packet::build(a(), b(), proto::HOP_BY_HOP, 64, &payload).unwrap()
    }

    fn protected() -> (Sadb, Packet, Vec<u8>) {
        let sadb = Sadb::new();
        let sa = sadb.insert(ah_sa(SPI, SaLifetime::default())).unwrap();
        let original = packet_with_options();
        let mut packet = original.clone();
        output(&sa, &mut packet).unwrap();
        (sadb, packet, original.into_bytes())
    }

    fn receive(sadb: &Sadb, packet: &mut Packet) -> Result<SaHandle> {
        let headers = packet.headers()?;
        let at = *headers.iter().find(|h| h.kind == proto::AH).unwrap();
        input(sadb, packet, &at, true)
    }

    #[test]
    fn test_header_len() {
        assert_eq!(ah_header_len(12), 24);
        assert_eq!(ah_header_len(16), 32);
        assert_eq!(ah_header_len(0), 16);
    }

    #[test]
    fn test_header_round_trip() {
        let header = AhHeader {
            next_header: proto::TCP,
            spi: 0xDEADBEEF,
            sequence: 7,
            auth_data: vec![0x11; 12],
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes[1], 4);
        assert_eq!(AhHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_parse_errors() {
        assert!(matches!(
            AhHeader::from_bytes(&[0u8; 8]),
            Err(Error::BufferTooShort { .. })
        ));
        // len byte 2 -> 16 bytes claimed, 12 present
        let mut short = vec![0u8; 12];
        short[1] = 2;
        assert!(matches!(
            AhHeader::from_bytes(&short),
            Err(Error::BufferTooShort { required: 16, .. })
        ));
        // len byte 3 -> 20 bytes, not 8-aligned
        let mut odd = vec![0u8; 20];
        odd[1] = 3;
        assert!(matches!(AhHeader::from_bytes(&odd), Err(Error::InvalidPacket(_))));
    }

    #[test]
    fn test_canonicalize_zeroes_mutable_fields() {
        let mut packet = packet_with_options();
        packet.set_traffic_class(0xFF);
        packet.set_flow_label(0x12345);
        let mut bytes = packet.into_bytes();
        canonicalize(&mut bytes).unwrap();

        assert_eq!(bytes[0], 0x60);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(bytes[7], 0);
        // mutable option data zeroed, immutable kept
        assert_eq!(&bytes[44..46], &[0, 0]);
        assert_eq!(&bytes[48..50], &[0xCC, 0xDD]);
        // payload length and addresses untouched
        assert_eq!(&bytes[4..6], &[0, 29]);
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let (_, packet, _) = protected();
        let mut once = packet.into_bytes();
        canonicalize(&mut once).unwrap();
        let mut twice = once.clone();
        canonicalize(&mut twice).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_output_layout() {
        let (_, packet, original) = protected();
        let headers = packet.headers().unwrap();
        let kinds: Vec<u8> = headers.iter().map(|h| h.kind).collect();
        assert_eq!(kinds, vec![proto::HOP_BY_HOP, proto::AH, proto::UDP]);

        let ah = headers[1];
        assert_eq!(ah.offset, 56);
        assert_eq!(ah.len, 24);
        let header = AhHeader::from_bytes(&packet.as_bytes()[ah.offset..]).unwrap();
        assert_eq!(header.next_header, proto::UDP);
        assert_eq!(header.spi, SPI);
        assert_eq!(header.sequence, 1);
        assert_eq!(packet.len(), original.len() + 24);
        assert_eq!(usize::from(packet.payload_len()), packet.len() - 40);
    }

    #[test]
    fn test_round_trip_accepts_and_strips() {
        let (sadb, mut packet, original) = protected();
        let sa = receive(&sadb, &mut packet).unwrap();
        assert_eq!(packet.as_bytes(), &original[..]);
        assert_eq!(sa.status().replay_last, 1);
        sadb.release(sa);
    }

    #[test]
    fn test_mutable_fields_do_not_break_icv() {
        let (sadb, mut packet, _) = protected();
        packet.set_hop_limit(3);
        packet.set_flow_label(0xFFFFF);
        packet.as_bytes_mut()[44] ^= 0xFF; // mutable option data
        assert!(receive(&sadb, &mut packet).is_ok());
    }

    #[test]
    fn test_bit_flips_are_dropped() {
        // payload byte, sequence byte, immutable option byte
        for offset in [packet_with_options().len() + 23, 56 + 11, 48] {
            let (sadb, mut packet, _) = protected();
            packet.as_bytes_mut()[offset] ^= 0x02;
            assert!(
                matches!(receive(&sadb, &mut packet), Err(Error::AuthenticationFailed(_))),
                "flip at {} not detected",
                offset
            );
        }
    }

    #[test]
    fn test_spi_flip_has_no_sa() {
        let (sadb, mut packet, _) = protected();
        packet.as_bytes_mut()[56 + 7] ^= 0x80;
        assert!(matches!(receive(&sadb, &mut packet), Err(Error::SaNotFound(_))));
    }

    #[test]
    fn test_replay_rejected() {
        let (sadb, packet, _) = protected();
        let mut first = packet.clone();
        let mut second = packet;
        receive(&sadb, &mut first).unwrap();
        assert_eq!(
            receive(&sadb, &mut second).err(),
            Some(Error::ReplayDetected(1))
        );
    }

    #[test]
    fn test_forged_packet_does_not_advance_window() {
        let (sadb, packet, _) = protected();
        let mut forged = packet.clone();
        let len = forged.len();
        forged.as_bytes_mut()[len - 1] ^= 0x01;
        assert!(receive(&sadb, &mut forged).is_err());

        let mut genuine = packet;
        assert!(receive(&sadb, &mut genuine).is_ok());
    }

    #[test]
    fn test_dead_sa_rejected() {
        let (sadb, packet, _) = protected();
        let id = SaId::new(b(), IpsecProtocol::Ah, SPI);
        sadb.find(&id).unwrap().mark_dead();
        let mut packet = packet;
        assert!(matches!(receive(&sadb, &mut packet), Err(Error::SaNotFound(_))));
    }

    #[test]
    fn test_sequence_increases() {
        let sa = ah_sa(SPI, SaLifetime::default());
        let mut last = 0;
        for _ in 0..5 {
            let mut packet = packet_with_options();
            let seq = output(&sa, &mut packet).unwrap();
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(last, 5);
    }
}
