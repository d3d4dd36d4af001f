//! AES-128 counter mode
//!
//! Keystream generator used by 128-EEA2. CTR is symmetric, so the same call
//! ciphers and deciphers.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// XOR `data` in place with the AES-128-CTR keystream starting at `counter_block`.
///
/// The whole 128-bit block is incremented as a big-endian counter between
/// blocks, as required by TS 33.401 Annex B.1.3.
pub fn aes128_ctr_apply(key: &[u8; 16], counter_block: &[u8; 16], data: &mut [u8]) {
    if data.is_empty() {
        return;
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut counter = *counter_block;

    for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
        let mut keystream = GenericArray::clone_from_slice(&counter);
        cipher.encrypt_block(&mut keystream);
        for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= ks;
        }
        ctr128_inc(&mut counter);
    }
}

/// Increment a 128-bit big-endian counter
fn ctr128_inc(counter: &mut [u8; 16]) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A F.5.1 CTR-AES128.Encrypt
    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6,
        0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
    ];
    const COUNTER: [u8; 16] = [
        0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7,
        0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
    ];

    #[test]
    fn test_ctr_nist_two_blocks() {
        let mut data = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96,
            0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
            0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c,
            0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf, 0x8e, 0x51,
        ];
        aes128_ctr_apply(&KEY, &COUNTER, &mut data);
        assert_eq!(
            data,
            [
                0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26,
                0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d, 0xb6, 0xce,
                0x98, 0x06, 0xf6, 0x6b, 0x79, 0x70, 0xfd, 0xff,
                0x86, 0x17, 0x18, 0x7b, 0xb9, 0xff, 0xfd, 0xff,
            ]
        );
    }

    #[test]
    fn test_ctr_partial_block_roundtrip() {
        let original = b"short nas".to_vec();
        let mut data = original.clone();
        aes128_ctr_apply(&KEY, &COUNTER, &mut data);
        assert_ne!(data, original);
        aes128_ctr_apply(&KEY, &COUNTER, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_counter_carry() {
        let mut counter = [0xffu8; 16];
        counter[0] = 0x00;
        ctr128_inc(&mut counter);
        assert_eq!(counter[0], 0x01);
        assert!(counter[1..].iter().all(|b| *b == 0));
    }
}
