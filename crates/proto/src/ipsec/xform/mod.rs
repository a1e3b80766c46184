//! Cryptographic transform registry and implementations
//!
//! Transforms come in two groups: raw block ciphers ([`BlockCipher`]) and
//! keyed digests ([`DigestAlgorithm`]). SAs look them up by name in a
//! [`TransformRegistry`] when they are installed and bind a keyed context
//! ([`CipherContext`] / [`DigestContext`]) for their lifetime.
//!
//! # Names
//!
//! | Name            | Group  | Block | Keys     | ICV |
//! |-----------------|--------|-------|----------|-----|
//! | `cipher-rc5`    | cipher | 8     | 16/24/32 |     |
//! | `cipher-rc6`    | cipher | 16    | 16/24/32 |     |
//! | `cipher-aes`    | cipher | 16    | 16/24/32 |     |
//! | `cipher-null`   | cipher | 8     | 16/24/32 |     |
//! | `digest-sha1`   | digest | 64    | any      | 12  |
//! | `digest-sha256` | digest | 64    | any      | 16  |
//!
//! Cipher names take an optional `-cbc` or `-ecb` suffix selecting the
//! chaining mode (`cipher-rc6-cbc`).
//!
//! # Example
//!
//! ```
//! use kestrel_proto::ipsec::xform::{TransformRegistry, ChainMode};
//!
//! let registry = TransformRegistry::with_builtins();
//! let handle = registry.find_cipher("cipher-rc6-cbc", false).unwrap();
//! assert_eq!(handle.mode(), ChainMode::Cbc);
//!
//! let ctx = handle.instantiate(&[0u8; 16]).unwrap();
//! let ct = ctx.encrypt(&[0u8; 16], b"attack at dawn").unwrap();
//! assert_eq!(ct.len(), 16);
//! ```

pub mod aes;
pub mod chain;
pub mod cipher;
pub mod digest;
pub mod null;
pub mod rc5;
pub mod rc6;
pub mod registry;

pub use chain::ChainMode;
pub use cipher::{BlockCipher, CipherContext, KeySchedule, KeySizeMask};
pub use digest::{digest_eq, DigestAlgorithm, DigestContext, DigestState};
pub use registry::{
    global, init_global, shutdown_global, BuiltinDiscovery, CipherHandle, Discovery,
    DiscoveryOutcome, NoDiscovery, TransformRegistry,
};

use std::fmt;
use std::sync::Arc;

/// Transform group (separate namespaces)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformGroup {
    /// Block ciphers
    Cipher,
    /// Keyed digests
    Digest,
}

impl fmt::Display for TransformGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformGroup::Cipher => f.write_str("cipher"),
            TransformGroup::Digest => f.write_str("digest"),
        }
    }
}

/// A registrable transform
#[derive(Clone)]
pub enum Transform {
    /// Block cipher
    Cipher(Arc<dyn BlockCipher>),
    /// Keyed digest
    Digest(Arc<dyn DigestAlgorithm>),
}

impl Transform {
    /// Transform name
    pub fn name(&self) -> &str {
        match self {
            Transform::Cipher(c) => c.name(),
            Transform::Digest(d) => d.name(),
        }
    }

    /// Group this transform registers into
    pub fn group(&self) -> TransformGroup {
        match self {
            Transform::Cipher(_) => TransformGroup::Cipher,
            Transform::Digest(_) => TransformGroup::Digest,
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transform({}:{})", self.group(), self.name())
    }
}

/// Every transform compiled into this crate
pub fn builtin_transforms() -> Vec<Transform> {
    vec![
        Transform::Cipher(Arc::new(rc5::Rc5)),
        Transform::Cipher(Arc::new(rc6::Rc6)),
        Transform::Cipher(Arc::new(aes::Aes)),
        Transform::Cipher(Arc::new(null::NullCipher)),
        Transform::Digest(Arc::new(digest::HmacSha1)),
        Transform::Digest(Arc::new(digest::HmacSha256)),
    ]
}

/// Builtin transform with exactly this name and group
pub fn builtin(name: &str, group: TransformGroup) -> Option<Transform> {
    builtin_transforms()
        .into_iter()
        .find(|t| t.group() == group && t.name() == name)
}
