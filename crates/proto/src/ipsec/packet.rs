//! IPv6 packet buffer
//!
//! Byte-addressable packet with the header accessors and insert/trim/extend
//! operations the AH and ESP processors need.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬──────────────────────┬────────────┬─────────────────┐
//! │ IPv6 (40 B)  │ HBH / Routing / Dst  │ AH / ESP   │ upper layer     │
//! └──────────────┴──────────────────────┴────────────┴─────────────────┘
//!                ↑ insertion point for AH and ESP
//! ```

use crate::ipsec::{Error, Result};
use std::net::Ipv6Addr;

/// Fixed IPv6 header length
pub const IPV6_HEADER_LEN: usize = 40;

/// Offset of the next-header byte in the IPv6 header
pub const IPV6_NEXT_HEADER_OFFSET: usize = 6;

/// Largest payload the 16-bit payload length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// IP protocol / next-header numbers
pub mod proto {
    /// IPv6 hop-by-hop options
    pub const HOP_BY_HOP: u8 = 0;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// IPv6 routing header
    pub const ROUTING: u8 = 43;
    /// IPv6 fragment header
    pub const FRAGMENT: u8 = 44;
    /// Encapsulating Security Payload
    pub const ESP: u8 = 50;
    /// Authentication Header
    pub const AH: u8 = 51;
    /// ICMPv6
    pub const ICMPV6: u8 = 58;
    /// No next header
    pub const NO_NEXT_HEADER: u8 = 59;
    /// IPv6 destination options
    pub const DEST_OPTS: u8 = 60;
}

/// One header in the chain following the fixed IPv6 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Protocol number of this header
    pub kind: u8,
    /// Offset of the header in the packet
    pub offset: usize,
    /// Header length (for the terminal header: everything to the end)
    pub len: usize,
    /// Offset of the next-header byte naming this header
    pub nh_offset: usize,
}

impl HeaderInfo {
    /// Whether this is an extension header the walker steps over
    pub fn is_extension(&self) -> bool {
        matches!(
            self.kind,
            proto::HOP_BY_HOP | proto::ROUTING | proto::FRAGMENT | proto::DEST_OPTS | proto::AH
        )
    }
}

/// Walk the header chain of a raw IPv6 packet
///
/// Stops at ESP (its length is not self-describing) or the first
/// non-extension header; that terminal entry spans the rest of the packet.
pub fn walk_headers(buf: &[u8]) -> Result<Vec<HeaderInfo>> {
    if buf.len() < IPV6_HEADER_LEN {
        return Err(Error::BufferTooShort {
            required: IPV6_HEADER_LEN,
            available: buf.len(),
        });
    }

    let mut headers = Vec::new();
    let mut kind = buf[IPV6_NEXT_HEADER_OFFSET];
    let mut nh_offset = IPV6_NEXT_HEADER_OFFSET;
    let mut offset = IPV6_HEADER_LEN;

    loop {
        let len = match kind {
            proto::HOP_BY_HOP | proto::ROUTING | proto::DEST_OPTS => {
                (usize::from(byte_at(buf, offset + 1)?) + 1) * 8
            }
            proto::FRAGMENT => 8,
            proto::AH => (usize::from(byte_at(buf, offset + 1)?) + 2) * 4,
            _ => {
                headers.push(HeaderInfo {
                    kind,
                    offset,
                    len: buf.len() - offset,
                    nh_offset,
                });
                return Ok(headers);
            }
        };

        if offset + len > buf.len() {
            return Err(Error::InvalidPacket(format!(
                "header {} at offset {} runs past end of packet",
                kind, offset
            )));
        }

        headers.push(HeaderInfo {
            kind,
            offset,
            len,
            nh_offset,
        });
        nh_offset = offset;
        kind = buf[offset];
        offset += len;
    }
}

fn byte_at(buf: &[u8], i: usize) -> Result<u8> {
    buf.get(i).copied().ok_or(Error::BufferTooShort {
        required: i + 1,
        available: buf.len(),
    })
}

/// IPv6 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Wrap a received packet
    ///
    /// # Errors
    ///
    /// - `BufferTooShort` if shorter than the IPv6 header
    /// - `InvalidPacket` if the version is not 6
    /// - `InvalidLength` if the payload length field disagrees with the buffer
    pub fn new(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < IPV6_HEADER_LEN {
            return Err(Error::BufferTooShort {
                required: IPV6_HEADER_LEN,
                available: buf.len(),
            });
        }
        if buf[0] >> 4 != 6 {
            return Err(Error::InvalidPacket(format!("IP version {}", buf[0] >> 4)));
        }
        let packet = Packet { buf };
        let expected = IPV6_HEADER_LEN + usize::from(packet.payload_len());
        if expected != packet.buf.len() {
            return Err(Error::InvalidLength {
                expected,
                actual: packet.buf.len(),
            });
        }
        Ok(packet)
    }

    /// Build a packet around `payload`
    pub fn build(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        next_header: u8,
        hop_limit: u8,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidLength {
                expected: MAX_PAYLOAD_LEN,
                actual: payload.len(),
            });
        }
        let mut buf = Vec::with_capacity(IPV6_HEADER_LEN + payload.len());
        buf.extend_from_slice(&[0x60, 0, 0, 0]);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.push(next_header);
        buf.push(hop_limit);
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());
        buf.extend_from_slice(payload);
        Ok(Packet { buf })
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Consume into raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Total length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Always false for a valid packet (the fixed header is present)
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Source address
    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(addr_bytes(&self.buf[8..24]))
    }

    /// Destination address
    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(addr_bytes(&self.buf[24..40]))
    }

    /// Next header of the fixed IPv6 header
    pub fn next_header(&self) -> u8 {
        self.buf[IPV6_NEXT_HEADER_OFFSET]
    }

    /// Hop limit
    pub fn hop_limit(&self) -> u8 {
        self.buf[7]
    }

    /// Set hop limit
    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        self.buf[7] = hop_limit;
    }

    /// Traffic class
    pub fn traffic_class(&self) -> u8 {
        (self.buf[0] << 4) | (self.buf[1] >> 4)
    }

    /// Set traffic class
    pub fn set_traffic_class(&mut self, tc: u8) {
        self.buf[0] = 0x60 | (tc >> 4);
        self.buf[1] = (tc << 4) | (self.buf[1] & 0x0F);
    }

    /// Flow label (20 bits)
    pub fn flow_label(&self) -> u32 {
        u32::from_be_bytes([0, self.buf[1] & 0x0F, self.buf[2], self.buf[3]])
    }

    /// Set flow label (low 20 bits of `label`)
    pub fn set_flow_label(&mut self, label: u32) {
        let b = label.to_be_bytes();
        self.buf[1] = (self.buf[1] & 0xF0) | (b[1] & 0x0F);
        self.buf[2] = b[2];
        self.buf[3] = b[3];
    }

    /// Payload length field
    pub fn payload_len(&self) -> u16 {
        u16::from_be_bytes([self.buf[4], self.buf[5]])
    }

    /// Rewrite the payload length field from the buffer length
    pub fn fix_payload_len(&mut self) -> Result<()> {
        let len = self.buf.len() - IPV6_HEADER_LEN;
        if len > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidLength {
                expected: MAX_PAYLOAD_LEN,
                actual: len,
            });
        }
        self.buf[4..6].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(())
    }

    /// Header chain after the fixed header
    pub fn headers(&self) -> Result<Vec<HeaderInfo>> {
        walk_headers(&self.buf)
    }

    /// Protocol and offset of the upper-layer header
    ///
    /// ESP counts as upper layer: nothing behind it is visible.
    pub fn upper_layer(&self) -> Result<(u8, usize)> {
        let headers = self.headers()?;
        match headers.last() {
            Some(h) => Ok((h.kind, h.offset)),
            None => Err(Error::Internal("empty header chain".into())),
        }
    }

    /// Source and destination ports for TCP/UDP, (0, 0) otherwise
    pub fn ports(&self) -> Result<(u16, u16)> {
        let (protocol, offset) = self.upper_layer()?;
        match protocol {
            proto::TCP | proto::UDP => {
                if self.buf.len() < offset + 4 {
                    return Err(Error::BufferTooShort {
                        required: offset + 4,
                        available: self.buf.len(),
                    });
                }
                let src = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]);
                let dst = u16::from_be_bytes([self.buf[offset + 2], self.buf[offset + 3]]);
                Ok((src, dst))
            }
            _ => Ok((0, 0)),
        }
    }

    /// Where AH or ESP goes: after hop-by-hop, routing and destination options
    ///
    /// Returns (offset, offset of the next-header byte that points there).
    pub fn insertion_point(&self) -> Result<(usize, usize)> {
        let headers = self.headers()?;
        for h in &headers {
            if !matches!(h.kind, proto::HOP_BY_HOP | proto::ROUTING | proto::DEST_OPTS) {
                return Ok((h.offset, h.nh_offset));
            }
        }
        Err(Error::Internal("header chain without terminal entry".into()))
    }

    /// Overwrite one next-header byte
    pub fn set_next_header_at(&mut self, nh_offset: usize, value: u8) -> Result<()> {
        let available = self.buf.len();
        let slot = self.buf.get_mut(nh_offset).ok_or(Error::BufferTooShort {
            required: nh_offset + 1,
            available,
        })?;
        *slot = value;
        Ok(())
    }

    /// Insert bytes at `offset`
    pub fn insert(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset > self.buf.len() {
            return Err(Error::BufferTooShort {
                required: offset,
                available: self.buf.len(),
            });
        }
        self.buf.splice(offset..offset, bytes.iter().copied());
        Ok(())
    }

    /// Remove `len` bytes at `offset`
    pub fn remove(&mut self, offset: usize, len: usize) -> Result<()> {
        if offset < IPV6_HEADER_LEN || offset + len > self.buf.len() {
            return Err(Error::BufferTooShort {
                required: offset + len,
                available: self.buf.len(),
            });
        }
        self.buf.drain(offset..offset + len);
        Ok(())
    }

    /// Cut the packet at `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len.max(IPV6_HEADER_LEN));
    }

    /// Drop `n` trailing bytes
    pub fn trim(&mut self, n: usize) -> Result<()> {
        if self.buf.len() < IPV6_HEADER_LEN + n {
            return Err(Error::BufferTooShort {
                required: IPV6_HEADER_LEN + n,
                available: self.buf.len(),
            });
        }
        self.buf.truncate(self.buf.len() - n);
        Ok(())
    }

    /// Append bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

fn addr_bytes(b: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(b);
    out
}
