//! IPv6 IPsec transform engine (AH + ESP)
//!
//! This module implements the packet-transform core of IPsec:
//!
//! - **AH** (Authentication Header) - RFC 4302
//! - **ESP** (Encapsulating Security Payload) - RFC 4303
//! - **SADB / SPD** - Security Association and Security Policy databases
//! - **Transform registry** - named block ciphers (RC5, RC6, AES, null) and
//!   keyed digests, with ECB/CBC synthesis and lazy discovery
//!
//! Key exchange is out of scope: SAs and policies are installed through the
//! control-plane calls of [`IpsecEngine`] by whatever key-management daemon
//! sits above it.
//!
//! # Architecture
//!
//! ```text
//! Control plane                      Packet path
//!   add_sa / delete_sa  ──► SADB ◄── ah / esp processors
//!   add_policy          ──► SPD  ◄── inbound_check / outbound_check
//!                                      │
//!                         TransformRegistry (cipher / digest contexts)
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use kestrel_proto::ipsec::{
//!     EngineConfig, IpsecEngine, IpsecProtocol, PolicyAction, SaConfig, SaId, Selector,
//!     TransformRegistry,
//! };
//! use std::sync::Arc;
//!
//! let engine = IpsecEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(TransformRegistry::with_builtins()),
//! )
//! .unwrap();
//!
//! let peer = "2001:db8::2".parse().unwrap();
//! let id = SaId::new(peer, IpsecProtocol::Ah, 0x2002);
//! engine
//!     .add_sa(
//!         SaConfig::builder()
//!             .with_id(id)
//!             .with_auth("digest-sha1", vec![0x42; 20])
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let flow = Selector::new("2001:db8::1".parse().unwrap(), peer, 6).with_ports(40000, 443);
//! engine.add_policy(flow, PolicyAction::Apply, Some(id), None).unwrap();
//! ```
//!
//! # References
//!
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for IP
//! - [RFC 4302](https://datatracker.ietf.org/doc/html/rfc4302) - IP Authentication Header
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - IP Encapsulating Security Payload
//! - [RFC 2040](https://datatracker.ietf.org/doc/html/rfc2040) - RC5 and RC5-CBC
//!
//! # Security
//!
//! - No unsafe code
//! - Constant-time ICV comparison (`subtle`)
//! - Key schedules and configured keys zeroized on drop

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod ah;
pub mod config;
pub mod engine;
pub mod error;
pub mod esp;
pub mod logging;
pub mod metrics;
pub mod packet;
pub mod replay;
pub mod sadb;
pub mod selector;
pub mod spd;
pub mod xform;

// Re-export commonly used types
pub use config::{EngineConfig, EngineConfigBuilder, SaConfig, SaConfigBuilder, TransformKey};
pub use engine::{InboundVerdict, IpsecEngine, OutboundVerdict};
pub use error::{Error, Result};
pub use metrics::{IpsecMetrics, MetricsSnapshot};
pub use packet::{HeaderInfo, Packet};
pub use replay::ReplayWindow;
pub use sadb::{
    IpsecProtocol, SaHandle, SaId, SaLifetime, SaState, SaStatus, Sadb, SecurityAssociation,
};
pub use selector::Selector;
pub use spd::{PolicyAction, PolicyHandle, SecurityPolicy, Spd};
pub use xform::{TransformGroup, TransformRegistry};
