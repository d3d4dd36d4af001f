//! EPS Security Context Engine
//!
//! Pure derivation functions over a subscriber's NAS security context
//! (TS 33.401): algorithm selection, NAS key derivation, KeNB / NH chaining
//! and uplink/downlink NAS COUNT handling. No I/O.

use std::fmt;

use ogs_crypt::kdf::{
    ogs_kdf_kenb, ogs_kdf_nas_eps, ogs_kdf_nh_enb, OGS_KDF_NAS_ENC_ALG, OGS_KDF_NAS_INT_ALG,
    OGS_KEY_LEN, OGS_SHA256_DIGEST_SIZE,
};

use crate::config::SecurityPolicy;
use crate::error::SecurityError;

// ============================================================================
// Constants
// ============================================================================

/// Key set identifier value meaning "no key is available"
pub const KSI_NO_KEY: u8 = 7;

/// Highest assignable eKSI value
pub const KSI_MAX: u8 = 6;

/// Next hop chaining counter modulus
pub const NCC_MODULUS: u8 = 8;

// ============================================================================
// UE Network Capability
// ============================================================================

/// UE network capability (TS 24.301 Section 9.9.3.34)
///
/// Algorithm `n` is supported when bit `0x80 >> n` is set, so EEA0/EIA0 is
/// the most significant bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeNetworkCapability {
    /// EEA algorithms (bitmap)
    pub eea: u8,
    /// EIA algorithms (bitmap)
    pub eia: u8,
}

impl UeNetworkCapability {
    /// Create from algorithm bitmaps
    pub fn new(eea: u8, eia: u8) -> Self {
        Self { eea, eia }
    }

    /// Check if the UE supports ciphering algorithm `alg`
    pub fn supports_eea(&self, alg: u8) -> bool {
        alg < 8 && self.eea & (0x80 >> alg) != 0
    }

    /// Check if the UE supports integrity algorithm `alg`
    pub fn supports_eia(&self, alg: u8) -> bool {
        alg < 8 && self.eia & (0x80 >> alg) != 0
    }
}

// ============================================================================
// NAS COUNT
// ============================================================================

/// NAS COUNT: 16-bit overflow counter and 8-bit sequence number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NasCount {
    /// Overflow counter
    pub overflow: u16,
    /// Sequence number carried in the security header
    pub seq: u8,
}

impl NasCount {
    /// 24-bit COUNT value used as crypto input (upper 8 bits are zero)
    pub fn value(&self) -> u32 {
        ((self.overflow as u32) << 8) | self.seq as u32
    }

    /// Build a count from its 24-bit value
    pub fn from_value(value: u32) -> Self {
        Self {
            overflow: ((value >> 8) & 0xffff) as u16,
            seq: (value & 0xff) as u8,
        }
    }

    /// Advance by one; the overflow counter steps when the sequence wraps
    pub fn increment(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.overflow = self.overflow.wrapping_add(1);
        }
    }
}

impl fmt::Display for NasCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.overflow, self.seq)
    }
}

// ============================================================================
// Security Context
// ============================================================================

/// EPS security context type (TS 33.401 Section 3.1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityContextType {
    /// No context
    #[default]
    None,
    /// KASME established by authentication, not yet taken into use
    Partial,
    /// Native context after a successful security mode control
    FullNative,
    /// Context mapped from another system / imported from a peer MME
    Mapped,
}

/// NAS security context of one subscriber
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityContext {
    /// Context type
    pub ctx_type: SecurityContextType,
    /// Key set identifier (0-6, or KSI_NO_KEY)
    pub eksi: u8,
    /// Uplink NAS COUNT
    pub ul_count: NasCount,
    /// Downlink NAS COUNT
    pub dl_count: NasCount,
    /// KASME
    pub kasme: [u8; OGS_SHA256_DIGEST_SIZE],
    /// NAS integrity key
    pub knas_int: [u8; OGS_KEY_LEN],
    /// NAS encryption key
    pub knas_enc: [u8; OGS_KEY_LEN],
    /// Selected integrity algorithm
    pub eia: u8,
    /// Selected ciphering algorithm
    pub eea: u8,
    /// KeNB handed to the access stratum
    pub kenb: [u8; OGS_SHA256_DIGEST_SIZE],
    /// Next hop key
    pub nh: [u8; OGS_SHA256_DIGEST_SIZE],
    /// Next hop chaining counter (0-7)
    pub ncc: u8,
    /// NAS keys have been derived for the selected algorithms
    pub keys_derived: bool,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            ctx_type: SecurityContextType::None,
            eksi: KSI_NO_KEY,
            ul_count: NasCount::default(),
            dl_count: NasCount::default(),
            kasme: [0; OGS_SHA256_DIGEST_SIZE],
            knas_int: [0; OGS_KEY_LEN],
            knas_enc: [0; OGS_KEY_LEN],
            eia: 0,
            eea: 0,
            kenb: [0; OGS_SHA256_DIGEST_SIZE],
            nh: [0; OGS_SHA256_DIGEST_SIZE],
            ncc: 0,
            keys_derived: false,
        }
    }
}

// Key material stays out of logs
impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("ctx_type", &self.ctx_type)
            .field("eksi", &self.eksi)
            .field("ul_count", &self.ul_count)
            .field("dl_count", &self.dl_count)
            .field("eia", &self.eia)
            .field("eea", &self.eea)
            .field("ncc", &self.ncc)
            .field("keys_derived", &self.keys_derived)
            .finish()
    }
}

impl SecurityContext {
    /// Partial native context created by a successful authentication
    pub fn new_partial(eksi: u8, kasme: [u8; OGS_SHA256_DIGEST_SIZE]) -> Self {
        Self {
            ctx_type: SecurityContextType::Partial,
            eksi,
            kasme,
            ..Default::default()
        }
    }

    /// Check if a key set is available
    pub fn has_key(&self) -> bool {
        self.ctx_type != SecurityContextType::None && self.eksi != KSI_NO_KEY
    }

    /// Check if the context is in use for protecting NAS messages
    pub fn is_valid(&self) -> bool {
        matches!(
            self.ctx_type,
            SecurityContextType::FullNative | SecurityContextType::Mapped
        ) && self.keys_derived
    }

    /// Select integrity and ciphering algorithms
    ///
    /// Walks the configured priority lists and picks the first algorithm the
    /// UE also advertises. Null algorithms are only chosen when the policy
    /// allows them.
    pub fn select_algorithms(
        &mut self,
        ue: &UeNetworkCapability,
        policy: &SecurityPolicy,
    ) -> Result<(), SecurityError> {
        let eia = policy
            .integrity_order
            .iter()
            .copied()
            .filter(|alg| *alg != 0 || policy.allow_null_integrity)
            .find(|alg| ue.supports_eia(*alg))
            .ok_or(SecurityError::NoCommonAlgorithm("integrity"))?;
        let eea = policy
            .ciphering_order
            .iter()
            .copied()
            .filter(|alg| *alg != 0 || policy.allow_null_ciphering)
            .find(|alg| ue.supports_eea(*alg))
            .ok_or(SecurityError::NoCommonAlgorithm("ciphering"))?;

        self.eia = eia;
        self.eea = eea;
        self.keys_derived = false;
        Ok(())
    }

    /// Derive KNASint and KNASenc from KASME for the selected algorithms
    /// (TS 33.401 Annex A.7)
    pub fn derive_nas_keys(&mut self) -> Result<(), SecurityError> {
        self.knas_int = ogs_kdf_nas_eps(OGS_KDF_NAS_INT_ALG, self.eia, &self.kasme)?;
        self.knas_enc = ogs_kdf_nas_eps(OGS_KDF_NAS_ENC_ALG, self.eea, &self.kasme)?;
        self.keys_derived = true;
        Ok(())
    }

    /// Derive KeNB from the current uplink count and start a new NH chain
    ///
    /// The initial KeNB is used with NCC 0; the first NH (NCC 1) is derived
    /// from it for the next handover.
    pub fn derive_kenb(&mut self) -> Result<[u8; OGS_SHA256_DIGEST_SIZE], SecurityError> {
        let kenb = ogs_kdf_kenb(&self.kasme, self.ul_count.value())?;
        self.nh = ogs_kdf_nh_enb(&self.kasme, &kenb)?;
        self.kenb = kenb;
        self.ncc = 1;
        Ok(kenb)
    }

    /// Current NH / NCC pair
    pub fn current_hop(&self) -> ([u8; OGS_SHA256_DIGEST_SIZE], u8) {
        (self.nh, self.ncc)
    }

    /// Step the NH chain for a handover and return the new (NH, NCC)
    pub fn next_hop(&mut self) -> Result<([u8; OGS_SHA256_DIGEST_SIZE], u8), SecurityError> {
        self.nh = ogs_kdf_nh_enb(&self.kasme, &self.nh)?;
        self.ncc = (self.ncc + 1) % NCC_MODULUS;
        Ok((self.nh, self.ncc))
    }

    /// Reset both NAS counts, used when a new context is taken into use
    pub fn reset_counts(&mut self) {
        self.ul_count = NasCount::default();
        self.dl_count = NasCount::default();
    }

    /// Run `f` with the uplink COUNT matching `seq`, advancing the count only
    /// if `f` succeeds
    ///
    /// The compare, the verification done by `f` and the increment form one
    /// step; a failed check leaves the context untouched.
    pub fn with_uplink_count<T, E>(
        &mut self,
        seq: u8,
        f: impl FnOnce(&Self, u32) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<SecurityError>,
    {
        if seq != self.ul_count.seq {
            return Err(SecurityError::SequenceMismatch {
                expected: self.ul_count.seq,
                received: seq,
            }
            .into());
        }
        let count = self.ul_count.value();
        let result = f(self, count)?;
        self.ul_count.increment();
        Ok(result)
    }

    /// Return the downlink COUNT for the next message and advance it
    pub fn take_downlink_count(&mut self) -> u32 {
        let count = self.dl_count.value();
        self.dl_count.increment();
        count
    }

    /// Wipe keys and return to the "no context" state
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Next eKSI after `current`, cycling through 0..=6
pub fn next_eksi(current: u8) -> u8 {
    if current >= KSI_MAX {
        0
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(integrity: &[u8], ciphering: &[u8], null_int: bool, null_enc: bool) -> SecurityPolicy {
        SecurityPolicy {
            integrity_order: integrity.to_vec(),
            ciphering_order: ciphering.to_vec(),
            allow_null_integrity: null_int,
            allow_null_ciphering: null_enc,
        }
    }

    #[test]
    fn test_capability_bits() {
        let cap = UeNetworkCapability::new(0xe0, 0x60);
        assert!(cap.supports_eea(0));
        assert!(cap.supports_eea(2));
        assert!(!cap.supports_eea(3));
        assert!(!cap.supports_eia(0));
        assert!(cap.supports_eia(2));
        assert!(!cap.supports_eia(9));
    }

    #[test]
    fn test_select_prefers_configured_order() {
        let mut ctx = SecurityContext::new_partial(0, [1; 32]);
        let cap = UeNetworkCapability::new(0xf0, 0xf0);
        ctx.select_algorithms(&cap, &policy(&[2, 0], &[2, 0], true, true)).unwrap();
        assert_eq!((ctx.eia, ctx.eea), (2, 2));
    }

    #[test]
    fn test_null_integrity_requires_policy() {
        let mut ctx = SecurityContext::new_partial(0, [1; 32]);
        // UE only advertises EIA0
        let cap = UeNetworkCapability::new(0x80, 0x80);
        assert_eq!(
            ctx.select_algorithms(&cap, &policy(&[2, 0], &[0], false, true)),
            Err(SecurityError::NoCommonAlgorithm("integrity"))
        );
        ctx.select_algorithms(&cap, &policy(&[2, 0], &[0], true, true)).unwrap();
        assert_eq!((ctx.eia, ctx.eea), (0, 0));
    }

    #[test]
    fn test_nas_count_wrap() {
        let mut count = NasCount { overflow: 3, seq: 255 };
        count.increment();
        assert_eq!(count, NasCount { overflow: 4, seq: 0 });
        assert_eq!(count.value(), 0x0400);
        assert_eq!(NasCount::from_value(0x0400), count);
    }

    #[test]
    fn test_uplink_count_strict() {
        let mut ctx = SecurityContext::new_partial(0, [1; 32]);
        let r: Result<u32, SecurityError> = ctx.with_uplink_count(1, |_, c| Ok(c));
        assert_eq!(r, Err(SecurityError::SequenceMismatch { expected: 0, received: 1 }));
        assert_eq!(ctx.ul_count.seq, 0);

        let r: Result<u32, SecurityError> = ctx.with_uplink_count(0, |_, c| Ok(c));
        assert_eq!(r, Ok(0));
        assert_eq!(ctx.ul_count.seq, 1);
    }

    #[test]
    fn test_uplink_count_untouched_on_failure() {
        let mut ctx = SecurityContext::new_partial(0, [1; 32]);
        let r: Result<(), SecurityError> = ctx.with_uplink_count(0, |_, _| {
            Err(SecurityError::MacMismatch { computed: 1, received: 2 })
        });
        assert!(r.is_err());
        assert_eq!(ctx.ul_count, NasCount::default());
    }

    #[test]
    fn test_key_derivation_and_nh_chain() {
        let mut ctx = SecurityContext::new_partial(1, [7; 32]);
        ctx.eia = 2;
        ctx.eea = 2;
        ctx.derive_nas_keys().unwrap();
        assert!(ctx.keys_derived);
        assert_ne!(ctx.knas_int, ctx.knas_enc);

        let kenb = ctx.derive_kenb().unwrap();
        assert_eq!(ctx.ncc, 1);
        let (nh1, _) = ctx.current_hop();
        assert_ne!(kenb, nh1);

        for expected in [2u8, 3, 4, 5, 6, 7, 0, 1] {
            let (_, ncc) = ctx.next_hop().unwrap();
            assert_eq!(ncc, expected);
        }
    }

    #[test]
    fn test_validity() {
        let mut ctx = SecurityContext::new_partial(0, [1; 32]);
        assert!(ctx.has_key());
        assert!(!ctx.is_valid());
        ctx.derive_nas_keys().unwrap();
        ctx.ctx_type = SecurityContextType::FullNative;
        assert!(ctx.is_valid());
        ctx.clear();
        assert!(!ctx.has_key());
        assert_eq!(ctx.eksi, KSI_NO_KEY);
    }

    #[test]
    fn test_next_eksi_cycles() {
        assert_eq!(next_eksi(KSI_NO_KEY), 0);
        assert_eq!(next_eksi(0), 1);
        assert_eq!(next_eksi(6), 0);
    }
}
