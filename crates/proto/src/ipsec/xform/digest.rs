//! Keyed digest transforms (HMAC) used for AH and ESP integrity

use crate::ipsec::{Error, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Keyed digest algorithm
pub trait DigestAlgorithm: Send + Sync {
    /// Unique transform name (e.g. `"digest-sha1"`)
    fn name(&self) -> &str;

    /// Hash block size in bytes
    fn block_size(&self) -> usize;

    /// Full output (working state) size in bytes
    fn output_size(&self) -> usize;

    /// Truncated ICV length carried on the wire
    fn icv_len(&self) -> usize;

    /// Whether the digest can run in a context that must not block
    fn is_atomic(&self) -> bool {
        true
    }

    /// Open a running keyed hash
    fn open(&self, key: &[u8]) -> Result<Box<dyn DigestState>>;

    /// One-shot keyed digest of `data` (full output)
    fn keyed_digest(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.open(key)?;
        state.update(data);
        Ok(state.finish())
    }
}

/// Running keyed hash
pub trait DigestState: Send {
    /// Absorb more input
    fn update(&mut self, data: &[u8]);

    /// Produce the full-length output
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// Compare two ICVs
///
/// Every ICV check goes through this function.
pub fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

macro_rules! hmac_digest {
    (
        $(#[$meta:meta])*
        $ty:ident, $state:ident, $hash:ty,
        name = $name:expr, block = $block:expr, output = $out:expr, icv = $icv:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        struct $state(Hmac<$hash>);

        impl DigestState for $state {
            fn update(&mut self, data: &[u8]) {
                Mac::update(&mut self.0, data);
            }

            fn finish(self: Box<Self>) -> Vec<u8> {
                self.0.finalize().into_bytes().to_vec()
            }
        }

        impl DigestAlgorithm for $ty {
            fn name(&self) -> &str {
                $name
            }

            fn block_size(&self) -> usize {
                $block
            }

            fn output_size(&self) -> usize {
                $out
            }

            fn icv_len(&self) -> usize {
                $icv
            }

            fn open(&self, key: &[u8]) -> Result<Box<dyn DigestState>> {
                if key.is_empty() {
                    return Err(Error::InvalidKeyLength {
                        algorithm: $name.to_string(),
                        actual: 0,
                    });
                }
                let mac = <Hmac<$hash> as Mac>::new_from_slice(key).map_err(|_| {
                    Error::InvalidKeyLength {
                        algorithm: $name.to_string(),
                        actual: key.len(),
                    }
                })?;
                Ok(Box::new($state(mac)))
            }
        }
    };
}

hmac_digest!(
    /// HMAC-SHA1-96 (RFC 2404)
    HmacSha1,
    HmacSha1State,
    Sha1,
    name = "digest-sha1",
    block = 64,
    output = 20,
    icv = 12
);

hmac_digest!(
    /// HMAC-SHA256-128 (RFC 4868)
    HmacSha256,
    HmacSha256State,
    Sha256,
    name = "digest-sha256",
    block = 64,
    output = 32,
    icv = 16
);

/// Keyed digest bound to an SA
pub struct DigestContext {
    transform: Arc<dyn DigestAlgorithm>,
    key: Zeroizing<Vec<u8>>,
}

impl DigestContext {
    /// Bind `key` to `transform`
    ///
    /// The key is checked by opening one hash state up front so a bad key
    /// fails at SA installation rather than on the first packet.
    pub fn new(transform: Arc<dyn DigestAlgorithm>, key: &[u8]) -> Result<Self> {
        drop(transform.open(key)?);
        Ok(DigestContext {
            transform,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    /// Transform name
    pub fn name(&self) -> &str {
        self.transform.name()
    }

    /// ICV length in bytes
    pub fn icv_len(&self) -> usize {
        self.transform.icv_len()
    }

    /// Truncated ICV over the concatenation of `parts`
    pub fn icv(&self, parts: &[&[u8]]) -> Result<Vec<u8>> {
        let mut state = self.transform.open(&self.key)?;
        for part in parts {
            state.update(part);
        }
        let mut out = state.finish();
        out.truncate(self.icv_len());
        Ok(out)
    }

    /// Recompute the ICV over `parts` and compare with `received`
    pub fn verify(&self, parts: &[&[u8]], received: &[u8]) -> Result<bool> {
        let computed = self.icv(parts)?;
        Ok(digest_eq(&computed, received))
    }

    pub(crate) fn transform(&self) -> &Arc<dyn DigestAlgorithm> {
        &self.transform
    }
}

impl fmt::Debug for DigestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestContext")
            .field("transform", &self.transform.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha1_rfc2202_case1() {
        let key = [0x0bu8; 20];
        let out = HmacSha1.keyed_digest(&key, b"Hi There").unwrap();
        assert_eq!(hex::encode(out), "b617318655057264e28bc0b6fb378c8ef146be00");
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case1() {
        let key = [0x0bu8; 20];
        let out = HmacSha256.keyed_digest(&key, b"Hi There").unwrap();
        assert_eq!(
            hex::encode(out),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_context_truncates_icv() {
        let ctx = DigestContext::new(Arc::new(HmacSha1), &[0x0bu8; 20]).unwrap();
        let icv = ctx.icv(&[b"Hi ", b"There"]).unwrap();
        assert_eq!(icv.len(), 12);
        assert_eq!(hex::encode(&icv), "b617318655057264e28bc0b6");
        assert!(ctx.verify(&[b"Hi There"], &icv).unwrap());
        assert!(!ctx.verify(&[b"Hi there"], &icv).unwrap());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            DigestContext::new(Arc::new(HmacSha256), &[]),
            Err(Error::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_digest_eq() {
        assert!(digest_eq(b"abc", b"abc"));
        assert!(!digest_eq(b"abc", b"abd"));
        assert!(!digest_eq(b"abc", b"ab"));
        assert!(digest_eq(b"", b""));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(HmacSha1.output_size(), 20);
        assert_eq!(HmacSha256.icv_len(), 16);
        assert_eq!(HmacSha256.block_size(), 64);
    }
}
