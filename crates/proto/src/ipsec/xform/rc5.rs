//! RC5-32/12 block cipher (RFC 2040)
//!
//! 32-bit words, 12 rounds, 8-byte block, 16/24/32-byte keys.

use super::cipher::{BlockCipher, KeySchedule, KeySizeMask};
use crate::ipsec::Result;
use zeroize::Zeroize;

const ROUNDS: usize = 12;
/// Expanded key table size, 2 * (ROUNDS + 1)
const TABLE: usize = 2 * (ROUNDS + 1);

pub(crate) const P32: u32 = 0xB7E1_5163;
pub(crate) const Q32: u32 = 0x9E37_79B9;

/// Shared RC5/RC6 key expansion into `s`
pub(crate) fn expand(key: &[u8], s: &mut [u32]) {
    let c = ((key.len() + 3) / 4).max(1);
    let mut l = vec![0u32; c];
    for (i, &byte) in key.iter().enumerate().rev() {
        l[i / 4] = (l[i / 4] << 8).wrapping_add(u32::from(byte));
    }

    s[0] = P32;
    for i in 1..s.len() {
        s[i] = s[i - 1].wrapping_add(Q32);
    }

    let (mut a, mut b) = (0u32, 0u32);
    let (mut i, mut j) = (0usize, 0usize);
    for _ in 0..3 * s.len().max(c) {
        s[i] = s[i].wrapping_add(a).wrapping_add(b).rotate_left(3);
        a = s[i];
        l[j] = l[j].wrapping_add(a).wrapping_add(b).rotate_left(a.wrapping_add(b));
        b = l[j];
        i = (i + 1) % s.len();
        j = (j + 1) % c;
    }

    l.zeroize();
}

/// RC5-32/12 transform
#[derive(Debug, Default, Clone, Copy)]
pub struct Rc5;

impl BlockCipher for Rc5 {
    fn name(&self) -> &str {
        "cipher-rc5"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn key_sizes(&self) -> KeySizeMask {
        KeySizeMask::KEY_128_192_256
    }

    fn expand_key(&self, key: &[u8]) -> Result<Box<dyn KeySchedule>> {
        let mut s = [0u32; TABLE];
        expand(key, &mut s);
        Ok(Box::new(Rc5Schedule { s }))
    }
}

struct Rc5Schedule {
    s: [u32; TABLE],
}

impl KeySchedule for Rc5Schedule {
    fn encrypt_block(&self, block: &mut [u8]) {
        let s = &self.s;
        let mut a = word(block, 0).wrapping_add(s[0]);
        let mut b = word(block, 1).wrapping_add(s[1]);
        for i in 1..=ROUNDS {
            a = (a ^ b).rotate_left(b).wrapping_add(s[2 * i]);
            b = (b ^ a).rotate_left(a).wrapping_add(s[2 * i + 1]);
        }
        put_word(block, 0, a);
        put_word(block, 1, b);
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let s = &self.s;
        let mut a = word(block, 0);
        let mut b = word(block, 1);
        for i in (1..=ROUNDS).rev() {
            b = b.wrapping_sub(s[2 * i + 1]).rotate_right(a) ^ a;
            a = a.wrapping_sub(s[2 * i]).rotate_right(b) ^ b;
        }
        put_word(block, 0, a.wrapping_sub(s[0]));
        put_word(block, 1, b.wrapping_sub(s[1]));
    }
}

impl Drop for Rc5Schedule {
    fn drop(&mut self) {
        self.s.zeroize();
    }
}

/// Little-endian word `n` of `block`
pub(crate) fn word(block: &[u8], n: usize) -> u32 {
    let i = 4 * n;
    u32::from_le_bytes([block[i], block[i + 1], block[i + 2], block[i + 3]])
}

pub(crate) fn put_word(block: &mut [u8], n: usize, v: u32) {
    block[4 * n..4 * n + 4].copy_from_slice(&v.to_le_bytes());
}
