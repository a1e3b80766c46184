//! RC6-32/20 block cipher
//!
//! 32-bit words, 20 rounds, 16-byte block, 16/24/32-byte keys. Key expansion
//! is the RC5 schedule with a 44-word table.

use super::cipher::{BlockCipher, KeySchedule, KeySizeMask};
use super::rc5::{expand, put_word, word};
use crate::ipsec::Result;
use zeroize::Zeroize;

const ROUNDS: usize = 20;
const TABLE: usize = 2 * ROUNDS + 4;

/// RC6-32/20 transform
#[derive(Debug, Default, Clone, Copy)]
pub struct Rc6;

impl BlockCipher for Rc6 {
    fn name(&self) -> &str {
        "cipher-rc6"
    }

    fn block_size(&self) -> usize {
        16
    }

    fn key_sizes(&self) -> KeySizeMask {
        KeySizeMask::KEY_128_192_256
    }

    fn expand_key(&self, key: &[u8]) -> Result<Box<dyn KeySchedule>> {
        let mut s = [0u32; TABLE];
        expand(key, &mut s);
        Ok(Box::new(Rc6Schedule { s }))
    }
}

struct Rc6Schedule {
    s: [u32; TABLE],
}

#[inline]
fn f(x: u32) -> u32 {
    x.wrapping_mul(x.wrapping_mul(2).wrapping_add(1)).rotate_left(5)
}

impl KeySchedule for Rc6Schedule {
    fn encrypt_block(&self, block: &mut [u8]) {
        let s = &self.s;
        let mut a = word(block, 0);
        let mut b = word(block, 1).wrapping_add(s[0]);
        let mut c = word(block, 2);
        let mut d = word(block, 3).wrapping_add(s[1]);

        for i in 1..=ROUNDS {
            let t = f(b);
            let u = f(d);
            a = (a ^ t).rotate_left(u).wrapping_add(s[2 * i]);
            c = (c ^ u).rotate_left(t).wrapping_add(s[2 * i + 1]);
            (a, b, c, d) = (b, c, d, a);
        }

        a = a.wrapping_add(s[2 * ROUNDS + 2]);
        c = c.wrapping_add(s[2 * ROUNDS + 3]);

        put_word(block, 0, a);
        put_word(block, 1, b);
        put_word(block, 2, c);
        put_word(block, 3, d);
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let s = &self.s;
        let mut a = word(block, 0).wrapping_sub(s[2 * ROUNDS + 2]);
        let mut b = word(block, 1);
        let mut c = word(block, 2).wrapping_sub(s[2 * ROUNDS + 3]);
        let mut d = word(block, 3);

        for i in (1..=ROUNDS).rev() {
            (a, b, c, d) = (d, a, b, c);
            let u = f(d);
            let t = f(b);
            c = c.wrapping_sub(s[2 * i + 1]).rotate_right(t) ^ u;
            a = a.wrapping_sub(s[2 * i]).rotate_right(u) ^ t;
        }

        put_word(block, 0, a);
        put_word(block, 1, b.wrapping_sub(s[0]));
        put_word(block, 2, c);
        put_word(block, 3, d.wrapping_sub(s[1]));
    }
}

impl Drop for Rc6Schedule {
    fn drop(&mut self) {
        self.s.zeroize();
    }
}
