//! AES-CMAC
//!
//! RFC 4493 AES-CMAC over the `cmac` crate. 128-EIA2 truncates the tag to its
//! first 32 bits.

use aes::cipher::{generic_array::GenericArray, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// CMAC output size in bytes
pub const CMAC_SIZE: usize = 16;

/// Calculate AES-CMAC for a message
pub fn aes_cmac_calculate(key: &[u8; 16], msg: &[u8]) -> [u8; CMAC_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    mac.update(msg);
    let mut out = [0u8; CMAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time comparison of two tags of equal length
pub fn tag_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
