//! Key Derivation Functions
//!
//! EPS key hierarchy below KASME, TS 33.401 Annex A, built on the generic
//! KDF of TS 33.220 clause B.2.0:
//!
//! ```text
//! derived = HMAC-SHA-256(Key, FC || P0 || L0 || P1 || L1 || ...)
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CryptError, CryptResult};

/// NAS key length in bytes
pub const OGS_KEY_LEN: usize = 16;
/// KASME / KeNB / NH length in bytes
pub const OGS_SHA256_DIGEST_SIZE: usize = 32;

const FC_FOR_KENB_DERIVATION: u8 = 0x11;
const FC_FOR_NH_ENB_DERIVATION: u8 = 0x12;
const FC_FOR_EPS_ALGORITHM_KEY_DERIVATION: u8 = 0x15;

// Algorithm Type Distinguishers
pub const OGS_KDF_NAS_ENC_ALG: u8 = 0x01;
pub const OGS_KDF_NAS_INT_ALG: u8 = 0x02;

type HmacSha256 = Hmac<Sha256>;

/// Generic KDF, TS 33.220 clause B.2.0
///
/// Each parameter is appended followed by its 16-bit big-endian length.
/// Empty parameters are skipped.
pub fn ogs_kdf_common(
    key: &[u8],
    fc: u8,
    params: &[&[u8]],
) -> CryptResult<[u8; OGS_SHA256_DIGEST_SIZE]> {
    let total: usize = 1 + params.iter().map(|p| p.len() + 2).sum::<usize>();
    let mut s = Vec::with_capacity(total);
    s.push(fc);

    for param in params.iter().filter(|p| !p.is_empty()) {
        let len = u16::try_from(param.len()).map_err(|_| CryptError::ParameterTooLong(param.len()))?;
        s.extend_from_slice(param);
        s.extend_from_slice(&len.to_be_bytes());
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptError::InvalidKeyLength {
        expected: OGS_SHA256_DIGEST_SIZE,
        actual: key.len(),
    })?;
    mac.update(&s);

    let mut output = [0u8; OGS_SHA256_DIGEST_SIZE];
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

/// TS33.401 Annex A.3: KeNB derivation function
///
/// Derives KeNB from KASME and the uplink NAS COUNT.
pub fn ogs_kdf_kenb(
    kasme: &[u8; OGS_SHA256_DIGEST_SIZE],
    ul_count: u32,
) -> CryptResult<[u8; OGS_SHA256_DIGEST_SIZE]> {
    ogs_kdf_common(kasme, FC_FOR_KENB_DERIVATION, &[&ul_count.to_be_bytes()])
}

/// TS33.401 Annex A.4: NH derivation function
///
/// The first NH uses KeNB as sync input, every following NH uses the
/// previous NH.
pub fn ogs_kdf_nh_enb(
    kasme: &[u8; OGS_SHA256_DIGEST_SIZE],
    sync_input: &[u8; OGS_SHA256_DIGEST_SIZE],
) -> CryptResult<[u8; OGS_SHA256_DIGEST_SIZE]> {
    ogs_kdf_common(kasme, FC_FOR_NH_ENB_DERIVATION, &[sync_input])
}

/// TS33.401 Annex A.7: Algorithm key derivation functions
///
/// Returns the 16-byte key taken from the lower half of the 32-byte output.
pub fn ogs_kdf_nas_eps(
    algorithm_type_distinguisher: u8,
    algorithm_identity: u8,
    kasme: &[u8; OGS_SHA256_DIGEST_SIZE],
) -> CryptResult<[u8; OGS_KEY_LEN]> {
    let output = ogs_kdf_common(
        kasme,
        FC_FOR_EPS_ALGORITHM_KEY_DERIVATION,
        &[&[algorithm_type_distinguisher], &[algorithm_identity]],
    )?;

    let mut knas = [0u8; OGS_KEY_LEN];
    knas.copy_from_slice(&output[16..]);
    Ok(knas)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KASME: [u8; 32] = [0x11; 32];

    #[test]
    fn test_kdf_common_matches_manual_hmac() {
        let derived = ogs_kdf_common(&KASME, 0x15, &[&[0x01], &[0x02]]).unwrap();

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&KASME).unwrap();
        mac.update(&[0x15, 0x01, 0x00, 0x01, 0x02, 0x00, 0x01]);
        let expected = mac.finalize().into_bytes();
        assert_eq!(&derived[..], &expected[..]);
    }

    #[test]
    fn test_kdf_common_skips_empty_params() {
        let with_empty = ogs_kdf_common(&KASME, 0x11, &[&[], &[1, 2, 3, 4]]).unwrap();
        let without = ogs_kdf_common(&KASME, 0x11, &[&[1, 2, 3, 4]]).unwrap();
        assert_eq!(with_empty, without);
    }

    #[test]
    fn test_kdf_common_rejects_oversized_param() {
        let big = vec![0u8; 70_000];
        assert_eq!(
            ogs_kdf_common(&KASME, 0x11, &[&big]),
            Err(CryptError::ParameterTooLong(70_000))
        );
    }

    #[test]
    fn test_nas_keys_differ_per_distinguisher() {
        let knas_enc = ogs_kdf_nas_eps(OGS_KDF_NAS_ENC_ALG, 2, &KASME).unwrap();
        let knas_int = ogs_kdf_nas_eps(OGS_KDF_NAS_INT_ALG, 2, &KASME).unwrap();
        assert_ne!(knas_enc, knas_int);
        assert_eq!(knas_int, ogs_kdf_nas_eps(OGS_KDF_NAS_INT_ALG, 2, &KASME).unwrap());
    }

    #[test]
    fn test_nas_key_is_lower_half_of_kdf_output() {
        let full = ogs_kdf_common(&KASME, 0x15, &[&[OGS_KDF_NAS_INT_ALG], &[2]]).unwrap();
        let knas_int = ogs_kdf_nas_eps(OGS_KDF_NAS_INT_ALG, 2, &KASME).unwrap();
        assert_eq!(&knas_int[..], &full[16..]);
    }

    #[test]
    fn test_kenb_depends_on_count() {
        assert_ne!(ogs_kdf_kenb(&KASME, 0).unwrap(), ogs_kdf_kenb(&KASME, 1).unwrap());
    }

    #[test]
    fn test_nh_chain() {
        let kenb = ogs_kdf_kenb(&KASME, 0).unwrap();
        let nh1 = ogs_kdf_nh_enb(&KASME, &kenb).unwrap();
        let nh2 = ogs_kdf_nh_enb(&KASME, &nh1).unwrap();
        assert_ne!(nh1, kenb);
        assert_ne!(nh1, nh2);
    }
}
