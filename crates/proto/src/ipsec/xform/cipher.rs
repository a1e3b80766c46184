//! Block cipher transform interface
//!
//! A cipher transform is a raw single-block primitive. The registry wraps it
//! in a [`ChainMode`] to get ECB or CBC over whole records; the primitive
//! itself never sees more than one block at a time.

use super::chain::{self, ChainMode};
use crate::ipsec::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Supported key lengths of a cipher
///
/// Bit `n - 1` set means an `n`-byte key is accepted, so one `u32` covers
/// keys of 1 to 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySizeMask(u32);

impl KeySizeMask {
    /// 16-byte (128-bit) keys
    pub const KEY_128: KeySizeMask = KeySizeMask(1 << 15);
    /// 24-byte (192-bit) keys
    pub const KEY_192: KeySizeMask = KeySizeMask(1 << 23);
    /// 32-byte (256-bit) keys
    pub const KEY_256: KeySizeMask = KeySizeMask(1 << 31);
    /// 16, 24 and 32-byte keys
    pub const KEY_128_192_256: KeySizeMask =
        KeySizeMask(Self::KEY_128.0 | Self::KEY_192.0 | Self::KEY_256.0);

    /// Build a mask from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        KeySizeMask(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Mask accepting both `self` and `other` key lengths
    pub const fn union(self, other: KeySizeMask) -> Self {
        KeySizeMask(self.0 | other.0)
    }

    /// Whether a key of `len` bytes is accepted
    pub fn allows(self, len: usize) -> bool {
        (1..=32).contains(&len) && self.0 & (1u32 << (len - 1)) != 0
    }

    /// Accepted key lengths in bytes, ascending
    pub fn lengths(self) -> Vec<usize> {
        (1..=32).filter(|&len| self.allows(len)).collect()
    }
}

/// Raw block cipher primitive
///
/// Implementations are registered once in the
/// [`TransformRegistry`](super::TransformRegistry) and shared by every SA
/// that binds them.
pub trait BlockCipher: Send + Sync {
    /// Unique transform name (e.g. `"cipher-rc6"`)
    fn name(&self) -> &str;

    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Size of the explicit IV carried in ESP records
    fn iv_size(&self) -> usize {
        self.block_size()
    }

    /// Accepted key lengths
    fn key_sizes(&self) -> KeySizeMask;

    /// Chaining mode used when a name carries no `-cbc`/`-ecb` suffix
    fn default_mode(&self) -> ChainMode {
        ChainMode::Cbc
    }

    /// Whether the primitive can run in a context that must not block
    fn is_atomic(&self) -> bool {
        true
    }

    /// Expand a key whose length has already been validated
    fn expand_key(&self, key: &[u8]) -> Result<Box<dyn KeySchedule>>;

    /// Validate `key` against [`key_sizes`](Self::key_sizes) and expand it
    fn set_key(&self, key: &[u8]) -> Result<Box<dyn KeySchedule>> {
        if !self.key_sizes().allows(key.len()) {
            return Err(Error::InvalidKeyLength {
                algorithm: self.name().to_string(),
                actual: key.len(),
            });
        }
        self.expand_key(key)
    }
}

/// Expanded key of a block cipher
///
/// Both operations work in place on exactly one block and do not allocate.
pub trait KeySchedule: Send + Sync {
    /// Encrypt one block in place
    fn encrypt_block(&self, block: &mut [u8]);

    /// Decrypt one block in place
    fn decrypt_block(&self, block: &mut [u8]);
}

/// Keyed cipher bound to an SA
///
/// Owns the expanded key schedule; dropping the context drops (and
/// zeroizes) the schedule and releases its hold on the transform.
pub struct CipherContext {
    transform: Arc<dyn BlockCipher>,
    mode: ChainMode,
    schedule: Box<dyn KeySchedule>,
}

impl CipherContext {
    /// Key `transform` for use in `mode`
    pub fn new(transform: Arc<dyn BlockCipher>, mode: ChainMode, key: &[u8]) -> Result<Self> {
        let schedule = transform.set_key(key)?;
        Ok(CipherContext {
            transform,
            mode,
            schedule,
        })
    }

    /// Transform name
    pub fn name(&self) -> &str {
        self.transform.name()
    }

    /// Chaining mode
    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.transform.block_size()
    }

    /// IV size in bytes (0 for ECB)
    pub fn iv_size(&self) -> usize {
        match self.mode {
            ChainMode::Ecb => 0,
            ChainMode::Cbc => self.transform.iv_size(),
        }
    }

    /// Encrypt `data`, zero-padding a short final block
    pub fn encrypt(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let bs = self.block_size();
        match self.mode {
            ChainMode::Ecb => Ok(chain::ecb_encrypt(self.schedule.as_ref(), bs, data)),
            ChainMode::Cbc => chain::cbc_encrypt(self.schedule.as_ref(), bs, iv, data),
        }
    }

    /// Decrypt `data`, which must be a whole number of blocks
    pub fn decrypt(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let bs = self.block_size();
        match self.mode {
            ChainMode::Ecb => chain::ecb_decrypt(self.schedule.as_ref(), bs, data),
            ChainMode::Cbc => chain::cbc_decrypt(self.schedule.as_ref(), bs, iv, data),
        }
    }

    pub(crate) fn transform(&self) -> &Arc<dyn BlockCipher> {
        &self.transform
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("transform", &self.transform.name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
