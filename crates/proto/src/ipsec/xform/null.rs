//! Pass-through cipher for tests and integrity-only ESP

use super::cipher::{BlockCipher, KeySchedule, KeySizeMask};
use crate::ipsec::Result;

/// `cipher-null`: 8-byte blocks copied unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl BlockCipher for NullCipher {
    fn name(&self) -> &str {
        "cipher-null"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn key_sizes(&self) -> KeySizeMask {
        KeySizeMask::KEY_128_192_256
    }

    fn expand_key(&self, _key: &[u8]) -> Result<Box<dyn KeySchedule>> {
        Ok(Box::new(NullSchedule))
    }
}

struct NullSchedule;

impl KeySchedule for NullSchedule {
    fn encrypt_block(&self, _block: &mut [u8]) {}

    fn decrypt_block(&self, _block: &mut [u8]) {}
}
