//! EPS NAS algorithm front-ends
//!
//! Dispatch on the EIA/EEA algorithm identity negotiated by security mode
//! control. Identity 0 is the null algorithm, identity 2 is the AES based
//! pair. 128-EIA1/EEA1 (SNOW 3G) and 128-EIA3/EEA3 (ZUC) are not provided.

use crate::aes::aes128_ctr_apply;
use crate::aes_cmac::aes_cmac_calculate;
use crate::error::{CryptError, CryptResult};

/// Null integrity / ciphering algorithm
pub const NAS_ALG_NULL: u8 = 0;
/// 128-EIA2 / 128-EEA2
pub const NAS_ALG_AES: u8 = 2;

/// NAS MAC length in bytes
pub const NAS_MAC_LEN: usize = 4;

/// Returns true if this library implements the algorithm identity
pub fn is_supported(alg: u8) -> bool {
    matches!(alg, NAS_ALG_NULL | NAS_ALG_AES)
}

/// COUNT || BEARER || DIRECTION || 0^26 as used by both EIA2 and EEA2
fn count_bearer_direction(count: u32, bearer: u8, direction: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&count.to_be_bytes());
    out[4] = ((bearer & 0x1f) << 3) | ((direction & 0x01) << 2);
    out
}

/// Compute the 32-bit NAS MAC
///
/// EIA0 yields an all-zero MAC.
pub fn nas_eia(
    alg: u8,
    key: &[u8; 16],
    count: u32,
    bearer: u8,
    direction: u8,
    msg: &[u8],
) -> CryptResult<[u8; NAS_MAC_LEN]> {
    match alg {
        NAS_ALG_NULL => Ok([0u8; NAS_MAC_LEN]),
        NAS_ALG_AES => {
            let prefix = count_bearer_direction(count, bearer, direction);
            let mut m = Vec::with_capacity(prefix.len() + msg.len());
            m.extend_from_slice(&prefix);
            m.extend_from_slice(msg);

            let cmac = aes_cmac_calculate(key, &m);
            let mut mac = [0u8; NAS_MAC_LEN];
            mac.copy_from_slice(&cmac[..NAS_MAC_LEN]);
            Ok(mac)
        }
        other => Err(CryptError::UnsupportedAlgorithm(other)),
    }
}

/// Cipher or decipher `data` in place
///
/// EEA0 leaves the data untouched.
pub fn nas_eea(
    alg: u8,
    key: &[u8; 16],
    count: u32,
    bearer: u8,
    direction: u8,
    data: &mut [u8],
) -> CryptResult<()> {
    match alg {
        NAS_ALG_NULL => Ok(()),
        NAS_ALG_AES => {
            let mut ivec = [0u8; 16];
            ivec[..8].copy_from_slice(&count_bearer_direction(count, bearer, direction));
            aes128_ctr_apply(key, &ivec, data);
            Ok(())
        }
        other => Err(CryptError::UnsupportedAlgorithm(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x42; 16];

    #[test]
    fn test_eia0_is_zero() {
        assert_eq!(nas_eia(0, &KEY, 7, 0, 1, b"abc").unwrap(), [0; 4]);
    }

    #[test]
    fn test_eia2_binds_count_and_direction() {
        let base = nas_eia(2, &KEY, 1, 0, 0, b"payload").unwrap();
        assert_ne!(base, nas_eia(2, &KEY, 2, 0, 0, b"payload").unwrap());
        assert_ne!(base, nas_eia(2, &KEY, 1, 0, 1, b"payload").unwrap());
        assert_eq!(base, nas_eia(2, &KEY, 1, 0, 0, b"payload").unwrap());
    }

    #[test]
    fn test_eia2_matches_cmac_prefix() {
        let mac = nas_eia(2, &KEY, 0x0102_0304, 0, 1, &[0xaa]).unwrap();
        let cmac = aes_cmac_calculate(&KEY, &[0x01, 0x02, 0x03, 0x04, 0x04, 0, 0, 0, 0xaa]);
        assert_eq!(mac[..], cmac[..4]);
    }

    #[test]
    fn test_eea2_roundtrip() {
        let original = b"esm message container".to_vec();
        let mut data = original.clone();
        nas_eea(2, &KEY, 9, 0, 1, &mut data).unwrap();
        assert_ne!(data, original);
        nas_eea(2, &KEY, 9, 0, 1, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_unsupported_algorithms() {
        let mut data = [0u8; 4];
        assert_eq!(nas_eia(1, &KEY, 0, 0, 0, &data), Err(CryptError::UnsupportedAlgorithm(1)));
        assert_eq!(nas_eea(3, &KEY, 0, 0, 0, &mut data), Err(CryptError::UnsupportedAlgorithm(3)));
        assert!(is_supported(0) && is_supported(2) && !is_supported(1));
    }
}
