//! ECB and CBC chaining over single-block primitives

use super::cipher::KeySchedule;
use crate::ipsec::{Error, Result};
use std::fmt;

/// Block chaining mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainMode {
    /// Electronic codebook (no chaining)
    Ecb,
    /// Cipher block chaining
    Cbc,
}

impl ChainMode {
    /// Name suffix selecting this mode (`"ecb"` / `"cbc"`)
    pub fn suffix(self) -> &'static str {
        match self {
            ChainMode::Ecb => "ecb",
            ChainMode::Cbc => "cbc",
        }
    }

    /// Parse a name suffix
    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "ecb" => Some(ChainMode::Ecb),
            "cbc" => Some(ChainMode::Cbc),
            _ => None,
        }
    }

    /// Split `cipher-foo-cbc` into (`cipher-foo`, Some(Cbc))
    pub fn split_name(name: &str) -> (&str, Option<Self>) {
        match name.rsplit_once('-') {
            Some((base, suffix)) => match Self::from_suffix(suffix) {
                Some(mode) => (base, Some(mode)),
                None => (name, None),
            },
            None => (name, None),
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Copy `data` into whole blocks, zero-filling the final one
fn padded(bs: usize, data: &[u8]) -> Vec<u8> {
    let len = (data.len() + bs - 1) / bs * bs;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(data);
    out.resize(len, 0);
    out
}

fn check_whole_blocks(bs: usize, data: &[u8]) -> Result<()> {
    if data.len() % bs != 0 {
        return Err(Error::MalformedCiphertext(format!(
            "{} bytes is not a multiple of the {}-byte block",
            data.len(),
            bs
        )));
    }
    Ok(())
}

fn check_iv(bs: usize, iv: &[u8]) -> Result<()> {
    if iv.len() != bs {
        return Err(Error::InvalidLength {
            expected: bs,
            actual: iv.len(),
        });
    }
    Ok(())
}

/// ECB encrypt
pub fn ecb_encrypt(schedule: &dyn KeySchedule, bs: usize, data: &[u8]) -> Vec<u8> {
    let mut out = padded(bs, data);
    for block in out.chunks_exact_mut(bs) {
        schedule.encrypt_block(block);
    }
    out
}

/// ECB decrypt
pub fn ecb_decrypt(schedule: &dyn KeySchedule, bs: usize, data: &[u8]) -> Result<Vec<u8>> {
    check_whole_blocks(bs, data)?;
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(bs) {
        schedule.decrypt_block(block);
    }
    Ok(out)
}

/// CBC encrypt
///
/// C\[0\] = E(P\[0\] ^ IV), C\[i\] = E(P\[i\] ^ C\[i-1\])
pub fn cbc_encrypt(
    schedule: &dyn KeySchedule,
    bs: usize,
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    check_iv(bs, iv)?;
    let mut out = padded(bs, data);
    let mut prev = iv.to_vec();
    for block in out.chunks_exact_mut(bs) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        schedule.encrypt_block(block);
        prev.copy_from_slice(block);
    }
    Ok(out)
}

/// CBC decrypt
///
/// P\[i\] = D(C\[i\]) ^ C\[i-1\], with C\[-1\] = IV
pub fn cbc_decrypt(
    schedule: &dyn KeySchedule,
    bs: usize,
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    check_iv(bs, iv)?;
    check_whole_blocks(bs, data)?;
    let mut out = data.to_vec();
    let mut prev = iv.to_vec();
    let mut saved = vec![0u8; bs];
    for block in out.chunks_exact_mut(bs) {
        saved.copy_from_slice(block);
        schedule.decrypt_block(block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        std::mem::swap(&mut prev, &mut saved);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Adds a constant to every byte; enough to observe chaining.
    struct AddOne;

    impl KeySchedule for AddOne {
        fn encrypt_block(&self, block: &mut [u8]) {
            for b in block {
                *b = b.wrapping_add(1);
            }
        }
        fn decrypt_block(&self, block: &mut [u8]) {
            for b in block {
                *b = b.wrapping_sub(1);
            }
        }
    }

    #[test]
    fn test_split_name() {
        assert_eq!(
            ChainMode::split_name("cipher-rc5-cbc"),
            ("cipher-rc5", Some(ChainMode::Cbc))
        );
        assert_eq!(
            ChainMode::split_name("cipher-rc5-ecb"),
            ("cipher-rc5", Some(ChainMode::Ecb))
        );
        assert_eq!(ChainMode::split_name("cipher-rc5"), ("cipher-rc5", None));
        assert_eq!(ChainMode::split_name("cbc"), ("cbc", None));
    }

    #[test]
    fn test_ecb_zero_pads_final_block() {
        let out = ecb_encrypt(&AddOne, 4, &[1, 2, 3, 4, 5]);
        assert_eq!(out, vec![2, 3, 4, 5, 6, 1, 1, 1]);
        let back = ecb_decrypt(&AddOne, 4, &out).unwrap();
        assert_eq!(back, vec![1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_cbc_chains_previous_block() {
        let iv = [0x10u8; 4];
        let out = cbc_encrypt(&AddOne, 4, &iv, &[0u8; 8]).unwrap();
        // first block: 0 ^ 0x10 + 1, second: 0 ^ 0x11 + 1
        assert_eq!(out, vec![0x11, 0x11, 0x11, 0x11, 0x12, 0x12, 0x12, 0x12]);
        let back = cbc_decrypt(&AddOne, 4, &iv, &out).unwrap();
        assert_eq!(back, vec![0u8; 8]);
    }

    #[test]
    fn test_decrypt_requires_whole_blocks() {
        assert!(matches!(
            ecb_decrypt(&AddOne, 4, &[0u8; 6]),
            Err(Error::MalformedCiphertext(_))
        ));
        assert!(matches!(
            cbc_decrypt(&AddOne, 4, &[0u8; 4], &[0u8; 7]),
            Err(Error::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_cbc_rejects_wrong_iv_length() {
        assert!(matches!(
            cbc_encrypt(&AddOne, 4, &[0u8; 3], &[0u8; 4]),
            Err(Error::InvalidLength { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(ecb_encrypt(&AddOne, 8, &[]).is_empty());
        assert!(cbc_decrypt(&AddOne, 8, &[0u8; 8], &[]).unwrap().is_empty());
    }
}
