//! AES block primitive backed by the `aes` crate

use super::cipher::{BlockCipher, KeySchedule, KeySizeMask};
use crate::ipsec::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

/// AES transform (16-byte block, 16/24/32-byte keys)
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes;

impl BlockCipher for Aes {
    fn name(&self) -> &str {
        "cipher-aes"
    }

    fn block_size(&self) -> usize {
        16
    }

    fn key_sizes(&self) -> KeySizeMask {
        KeySizeMask::KEY_128_192_256
    }

    fn expand_key(&self, key: &[u8]) -> Result<Box<dyn KeySchedule>> {
        let bad_key = |_| Error::InvalidKeyLength {
            algorithm: "cipher-aes".to_string(),
            actual: key.len(),
        };
        let schedule = match key.len() {
            16 => AesSchedule::Aes128(Aes128::new_from_slice(key).map_err(bad_key)?),
            24 => AesSchedule::Aes192(Aes192::new_from_slice(key).map_err(bad_key)?),
            _ => AesSchedule::Aes256(Aes256::new_from_slice(key).map_err(bad_key)?),
        };
        Ok(Box::new(schedule))
    }
}

// Round keys are zeroized on drop by the aes crate (`zeroize` feature).
enum AesSchedule {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl KeySchedule for AesSchedule {
    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesSchedule::Aes128(c) => c.encrypt_block(block),
            AesSchedule::Aes192(c) => c.encrypt_block(block),
            AesSchedule::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesSchedule::Aes128(c) => c.decrypt_block(block),
            AesSchedule::Aes192(c) => c.decrypt_block(block),
            AesSchedule::Aes256(c) => c.decrypt_block(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes128_fips197_vector() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let schedule = Aes.set_key(&key).unwrap();
        let mut block = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        schedule.encrypt_block(&mut block);
        assert_eq!(hex::encode(&block), "69c4e0d86a7b0430d8cdb78070b4c55a");
        schedule.decrypt_block(&mut block);
        assert_eq!(hex::encode(&block), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_aes256_fips197_vector() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap();
        let schedule = Aes.set_key(&key).unwrap();
        let mut block = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        schedule.encrypt_block(&mut block);
        assert_eq!(hex::encode(&block), "8ea2b7ca516745bfeafc49904b496089");
    }

    #[test]
    fn test_aes_rejects_odd_key() {
        assert!(Aes.set_key(&[0u8; 20]).is_err());
    }
}
