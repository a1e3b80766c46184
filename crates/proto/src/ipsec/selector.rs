//! Traffic selectors
//!
//! A selector names a flow by source/destination prefix, upper-layer
//! protocol and ports. Policies are keyed by selector; packets are turned
//! into a host selector (/128 on both ends) for lookup.

use crate::ipsec::packet::Packet;
use crate::ipsec::{Error, Result};
use std::fmt;
use std::net::Ipv6Addr;

/// Whether `addr` falls inside `prefix/len`
pub fn prefix_contains(prefix: Ipv6Addr, len: u8, addr: Ipv6Addr) -> bool {
    let mask = prefix_mask(len);
    u128::from(prefix) & mask == u128::from(addr) & mask
}

fn prefix_mask(len: u8) -> u128 {
    match len {
        0 => 0,
        l if l >= 128 => u128::MAX,
        l => u128::MAX << (128 - u32::from(l)),
    }
}

/// Traffic selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector {
    /// Source address
    pub src: Ipv6Addr,
    /// Source prefix length (0..=128)
    pub src_prefix: u8,
    /// Destination address
    pub dst: Ipv6Addr,
    /// Destination prefix length (0..=128)
    pub dst_prefix: u8,
    /// Upper-layer protocol number
    pub protocol: u8,
    /// Source port (0 when the protocol has none)
    pub src_port: u16,
    /// Destination port (0 when the protocol has none)
    pub dst_port: u16,
}

impl Selector {
    /// Host-to-host selector without ports
    pub fn new(src: Ipv6Addr, dst: Ipv6Addr, protocol: u8) -> Self {
        Selector {
            src,
            src_prefix: 128,
            dst,
            dst_prefix: 128,
            protocol,
            src_port: 0,
            dst_port: 0,
        }
    }

    /// Set the ports
    pub fn with_ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    /// Set the prefix lengths
    pub fn with_prefixes(mut self, src_prefix: u8, dst_prefix: u8) -> Self {
        self.src_prefix = src_prefix;
        self.dst_prefix = dst_prefix;
        self
    }

    /// Selector of the flow a packet belongs to
    ///
    /// The packet must already be free of AH/ESP headers.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let (protocol, _) = packet.upper_layer()?;
        let (src_port, dst_port) = packet.ports()?;
        Ok(Selector::new(packet.src(), packet.dst(), protocol).with_ports(src_port, dst_port))
    }

    /// Check prefix lengths
    pub fn validate(&self) -> Result<()> {
        if self.src_prefix > 128 || self.dst_prefix > 128 {
            return Err(Error::InvalidParameter(format!(
                "prefix length out of range in selector {}",
                self
            )));
        }
        Ok(())
    }

    /// Whether this (possibly wider) selector covers `flow`
    pub fn covers(&self, flow: &Selector) -> bool {
        self.protocol == flow.protocol
            && self.src_port == flow.src_port
            && self.dst_port == flow.dst_port
            && prefix_contains(self.src, self.src_prefix, flow.src)
            && prefix_contains(self.dst, self.dst_prefix, flow.dst)
    }

    /// Specificity used to rank covering selectors
    pub fn specificity(&self) -> u16 {
        u16::from(self.src_prefix) + u16::from(self.dst_prefix)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{} -> {}/{}:{} proto {}",
            self.src,
            self.src_prefix,
            self.src_port,
            self.dst,
            self.dst_prefix,
            self.dst_port,
            self.protocol
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_prefix_contains() {
        let net = addr("2001:db8::");
        assert!(prefix_contains(net, 32, addr("2001:db8:1::5")));
        assert!(!prefix_contains(net, 32, addr("2001:db9::1")));
        assert!(prefix_contains(net, 0, addr("fe80::1")));
        assert!(prefix_contains(addr("2001:db8::1"), 128, addr("2001:db8::1")));
        assert!(!prefix_contains(addr("2001:db8::1"), 128, addr("2001:db8::2")));
        assert!(prefix_contains(net, 127, addr("2001:db8::1")));
    }

    #[test]
    fn test_covers() {
        let flow =
            Selector::new(addr("2001:db8::1"), addr("2001:db8:2::1"), 17).with_ports(500, 4500);
        let wide = Selector::new(addr("2001:db8::"), addr("2001:db8:2::"), 17)
            .with_prefixes(64, 48)
            .with_ports(500, 4500);
        assert!(wide.covers(&flow));
        assert!(flow.covers(&flow));

        let other_port = wide.with_ports(500, 4501);
        assert!(!other_port.covers(&flow));

        let other_proto = Selector { protocol: 6, ..wide };
        assert!(!other_proto.covers(&flow));
    }

    #[test]
    fn test_specificity() {
        let s = Selector::new(Ipv6Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED, 0)
            .with_prefixes(64, 48);
        assert_eq!(s.specificity(), 112);
    }

    #[test]
    fn test_validate() {
        let s = Selector::new(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 6).with_prefixes(129, 0);
        assert!(s.validate().is_err());
        assert!(Selector::new(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 6).validate().is_ok());
    }
}
