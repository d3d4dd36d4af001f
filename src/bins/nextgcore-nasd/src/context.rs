//! EMM Context Store
//!
//! Per-subscriber mobility contexts and their identity indices. The store is
//! owned by the NAS task; every other component re-resolves a context by
//! handle on each event.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{NasError, NasResult};
use crate::procedure::ProcedureSet;
use crate::security::{SecurityContext, UeNetworkCapability};
use crate::sm::{EmmFsm, EmmState};

/// Subscriber handle assigned by the MME (MME UE S1AP ID)
pub type MmeUeId = u32;

// ============================================================================
// Basic Types
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    /// MCC digit 1
    pub mcc1: u8,
    /// MCC digit 2
    pub mcc2: u8,
    /// MCC digit 3
    pub mcc3: u8,
    /// MNC digit 1
    pub mnc1: u8,
    /// MNC digit 2
    pub mnc2: u8,
    /// MNC digit 3 (0xf if 2-digit MNC)
    pub mnc3: u8,
}

impl PlmnId {
    /// Create a new PLMN ID from decimal strings
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc: Vec<u8> = mcc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();
        let mnc: Vec<u8> = mnc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();

        Self {
            mcc1: mcc.first().copied().unwrap_or(0),
            mcc2: mcc.get(1).copied().unwrap_or(0),
            mcc3: mcc.get(2).copied().unwrap_or(0),
            mnc1: mnc.first().copied().unwrap_or(0),
            mnc2: mnc.get(1).copied().unwrap_or(0),
            mnc3: mnc.get(2).copied().unwrap_or(0xf),
        }
    }

    /// Encode as 3-byte BCD (TS 24.008 10.5.1.3)
    pub fn to_bytes(&self) -> [u8; 3] {
        [
            (self.mcc2 << 4) | self.mcc1,
            (self.mnc3 << 4) | self.mcc3,
            (self.mnc2 << 4) | self.mnc1,
        ]
    }

    /// Decode from 3-byte BCD
    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self {
            mcc1: bytes[0] & 0x0f,
            mcc2: bytes[0] >> 4,
            mcc3: bytes[1] & 0x0f,
            mnc1: bytes[2] & 0x0f,
            mnc2: bytes[2] >> 4,
            mnc3: bytes[1] >> 4,
        }
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}-{}{}", self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2)?;
        if self.mnc3 != 0xf {
            write!(f, "{}", self.mnc3)?;
        }
        Ok(())
    }
}

/// EPS TAI (Tracking Area Identity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsTai {
    /// PLMN ID
    pub plmn_id: PlmnId,
    /// TAC
    pub tac: u16,
}

/// GUMMEI: PLMN, MME group and MME code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Gummei {
    /// PLMN ID
    pub plmn_id: PlmnId,
    /// MME Group ID
    pub mme_gid: u16,
    /// MME Code
    pub mme_code: u8,
}

impl Gummei {
    /// Check if a GUTI was allocated by this MME
    pub fn owns(&self, guti: &EpsGuti) -> bool {
        guti.plmn_id == self.plmn_id && guti.mme_gid == self.mme_gid && guti.mme_code == self.mme_code
    }
}

/// EPS GUTI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    /// PLMN ID
    pub plmn_id: PlmnId,
    /// MME Group ID
    pub mme_gid: u16,
    /// MME Code
    pub mme_code: u8,
    /// M-TMSI
    pub m_tmsi: u32,
}

impl fmt::Display for EpsGuti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:04x}/{:02x}/{:08x}", self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi)
    }
}

// ============================================================================
// Optional field with validation state
// ============================================================================

/// Conditionally present context member
///
/// Distinguishes a value received from the UE but not yet trusted from one
/// confirmed by a security procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    /// Not known
    Absent,
    /// Received, not yet validated
    Present(T),
    /// Validated
    Valid(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Absent
    }
}

impl<T> Field<T> {
    /// Value if present or valid
    pub fn get(&self) -> Option<&T> {
        match self {
            Field::Absent => None,
            Field::Present(v) | Field::Valid(v) => Some(v),
        }
    }

    /// Check if the value is present
    pub fn is_present(&self) -> bool {
        !matches!(self, Field::Absent)
    }

    /// Check if the value has been validated
    pub fn is_valid(&self) -> bool {
        matches!(self, Field::Valid(_))
    }

    /// Store an unvalidated value
    pub fn set_present(&mut self, value: T) {
        *self = Field::Present(value);
    }

    /// Store a validated value
    pub fn set_valid(&mut self, value: T) {
        *self = Field::Valid(value);
    }

    /// Promote a present value to valid
    pub fn validate(&mut self) {
        if let Field::Present(_) = self {
            if let Field::Present(v) = std::mem::replace(self, Field::Absent) {
                *self = Field::Valid(v);
            }
        }
    }

    /// Forget the value
    pub fn clear(&mut self) {
        *self = Field::Absent;
    }
}

// ============================================================================
// Authentication vectors
// ============================================================================

/// E-UTRAN authentication vector
#[derive(Clone, PartialEq, Eq)]
pub struct AuthVector {
    /// RAND
    pub rand: [u8; 16],
    /// XRES (4-16 bytes)
    pub xres: Bytes,
    /// AUTN
    pub autn: [u8; 16],
    /// KASME
    pub kasme: [u8; 32],
}

impl fmt::Debug for AuthVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthVector").field("rand", &self.rand).finish_non_exhaustive()
    }
}

/// Bounded set of outstanding vectors with a selection index
#[derive(Debug, Clone, Default)]
pub struct AuthVectors {
    vectors: Vec<AuthVector>,
    index: usize,
}

impl AuthVectors {
    /// Replace the set, keeping at most `max` vectors
    pub fn store(&mut self, mut vectors: Vec<AuthVector>, max: usize) {
        vectors.truncate(max);
        self.vectors = vectors;
        self.index = 0;
    }

    /// Take the next unused vector
    pub fn next_unused(&mut self) -> Option<AuthVector> {
        let vector = self.vectors.get(self.index).cloned()?;
        self.index += 1;
        Some(vector)
    }

    /// Number of vectors not yet used
    pub fn remaining(&self) -> usize {
        self.vectors.len().saturating_sub(self.index)
    }

    /// Drop every vector
    pub fn clear(&mut self) {
        self.vectors.clear();
        self.index = 0;
    }
}

// ============================================================================
// EMM Context
// ============================================================================

/// Mobility context of one subscriber
#[derive(Debug)]
pub struct EmmContext {
    /// Subscriber handle
    pub ue_id: MmeUeId,
    /// IMSI
    pub imsi: Field<String>,
    /// IMEI / IMEISV
    pub imei: Field<String>,
    /// Current GUTI
    pub guti: Option<EpsGuti>,
    /// Previous GUTI, kept until the UE confirms the new one
    pub old_guti: Option<EpsGuti>,
    /// EMM state machine
    pub fsm: EmmFsm,
    /// Outstanding authentication vectors
    pub auth_vectors: AuthVectors,
    /// Synchronisation failure already handled in this authentication round
    pub auth_resync_attempted: bool,
    /// Current security context
    pub security: SecurityContext,
    /// Non-current security context (partial, awaiting security mode control)
    pub non_current_security: Option<SecurityContext>,
    /// UE network capability
    pub ue_network_capability: Field<UeNetworkCapability>,
    /// Active procedures
    pub procedures: ProcedureSet,
    /// ESM message buffered while the owning specific procedure runs
    pub pending_esm: Option<Bytes>,
    /// NAS signalling connection established
    pub connected: bool,
}

impl EmmContext {
    /// Create a new context in EMM-DEREGISTERED
    pub fn new(ue_id: MmeUeId) -> Self {
        Self {
            ue_id,
            imsi: Field::Absent,
            imei: Field::Absent,
            guti: None,
            old_guti: None,
            fsm: EmmFsm::new(ue_id),
            auth_vectors: AuthVectors::default(),
            auth_resync_attempted: false,
            security: SecurityContext::default(),
            non_current_security: None,
            ue_network_capability: Field::Absent,
            procedures: ProcedureSet::new(),
            pending_esm: None,
            connected: false,
        }
    }

    /// Current EMM state
    pub fn state(&self) -> EmmState {
        self.fsm.state()
    }

    /// IMSI for logging
    pub fn imsi_str(&self) -> &str {
        self.imsi.get().map(String::as_str).unwrap_or("-")
    }
}

// ============================================================================
// Context Store
// ============================================================================

/// Owner of every EMM context, indexed by handle, IMSI and GUTI
#[derive(Debug)]
pub struct ContextStore {
    contexts: HashMap<MmeUeId, EmmContext>,
    imsi_index: HashMap<String, MmeUeId>,
    guti_index: HashMap<EpsGuti, MmeUeId>,
    gummei: Gummei,
    next_m_tmsi: u32,
}

impl ContextStore {
    /// Create an empty store allocating GUTIs under `gummei`
    pub fn new(gummei: Gummei) -> Self {
        Self {
            contexts: HashMap::new(),
            imsi_index: HashMap::new(),
            guti_index: HashMap::new(),
            gummei,
            next_m_tmsi: 1,
        }
    }

    /// Served GUMMEI
    pub fn gummei(&self) -> &Gummei {
        &self.gummei
    }

    /// Get a context by handle
    pub fn get(&self, ue_id: MmeUeId) -> NasResult<&EmmContext> {
        self.contexts.get(&ue_id).ok_or(NasError::UnknownSubscriber(ue_id))
    }

    /// Get a mutable context by handle
    pub fn get_mut(&mut self, ue_id: MmeUeId) -> NasResult<&mut EmmContext> {
        self.contexts.get_mut(&ue_id).ok_or(NasError::UnknownSubscriber(ue_id))
    }

    /// Check if a handle has a context
    pub fn contains(&self, ue_id: MmeUeId) -> bool {
        self.contexts.contains_key(&ue_id)
    }

    /// Find a handle by IMSI
    pub fn get_by_imsi(&self, imsi: &str) -> Option<MmeUeId> {
        self.imsi_index.get(imsi).copied()
    }

    /// Find a handle by current or old GUTI
    pub fn get_by_guti(&self, guti: &EpsGuti) -> Option<MmeUeId> {
        self.guti_index.get(guti).copied()
    }

    /// Insert a context, replacing any context under the same handle
    pub fn add(&mut self, ctx: EmmContext) {
        let ue_id = ctx.ue_id;
        if self.contexts.contains_key(&ue_id) {
            log::warn!("[ue_id={}] Replacing existing EMM context", ue_id);
            self.remove(ue_id);
        }
        if let Some(imsi) = ctx.imsi.get() {
            self.imsi_index.insert(imsi.clone(), ue_id);
        }
        for guti in ctx.guti.iter().chain(ctx.old_guti.iter()) {
            self.guti_index.insert(*guti, ue_id);
        }
        log::debug!("[ue_id={}] EMM context added (total: {})", ue_id, self.contexts.len() + 1);
        self.contexts.insert(ue_id, ctx);
    }

    /// Remove a context, clearing every index entry first
    pub fn remove(&mut self, ue_id: MmeUeId) -> Option<EmmContext> {
        let ctx = self.contexts.get(&ue_id)?;

        if let Some(imsi) = ctx.imsi.get() {
            if self.imsi_index.get(imsi) == Some(&ue_id) {
                self.imsi_index.remove(imsi);
            }
        }
        for guti in ctx.guti.iter().chain(ctx.old_guti.iter()) {
            if self.guti_index.get(guti) == Some(&ue_id) {
                self.guti_index.remove(guti);
            }
        }

        let ctx = self.contexts.remove(&ue_id);
        log::debug!("[ue_id={}] EMM context removed (total: {})", ue_id, self.contexts.len());
        ctx
    }

    /// Bind an IMSI to a handle
    ///
    /// Idempotent: re-binding the same IMSI overwrites the index entry.
    /// Returns the handle that previously owned the IMSI, if different.
    pub fn upsert_imsi(&mut self, ue_id: MmeUeId, imsi: &str) -> NasResult<Option<MmeUeId>> {
        let ctx = self.contexts.get_mut(&ue_id).ok_or(NasError::UnknownSubscriber(ue_id))?;

        if let Some(old) = ctx.imsi.get() {
            if old != imsi && self.imsi_index.get(old) == Some(&ue_id) {
                self.imsi_index.remove(old);
            }
        }
        if ctx.imsi.get().map(String::as_str) != Some(imsi) {
            ctx.imsi.set_present(imsi.to_string());
        }

        let previous = self.imsi_index.insert(imsi.to_string(), ue_id);
        log::debug!("[ue_id={}] IMSI index updated: {}", ue_id, imsi);
        Ok(previous.filter(|prev| *prev != ue_id))
    }

    /// Make `guti` the current GUTI; the previous one becomes the old GUTI
    pub fn set_guti(&mut self, ue_id: MmeUeId, guti: EpsGuti) -> NasResult<()> {
        let ctx = self.contexts.get_mut(&ue_id).ok_or(NasError::UnknownSubscriber(ue_id))?;

        if let Some(stale) = ctx.old_guti.take() {
            if self.guti_index.get(&stale) == Some(&ue_id) {
                self.guti_index.remove(&stale);
            }
        }
        ctx.old_guti = ctx.guti.replace(guti);
        self.guti_index.insert(guti, ue_id);
        Ok(())
    }

    /// Forget the old GUTI once the UE acknowledged the new one
    pub fn clear_old_guti(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(&ue_id).ok_or(NasError::UnknownSubscriber(ue_id))?;
        if let Some(old) = ctx.old_guti.take() {
            if Some(old) != ctx.guti && self.guti_index.get(&old) == Some(&ue_id) {
                self.guti_index.remove(&old);
            }
        }
        Ok(())
    }

    /// Allocate a fresh GUTI under the served GUMMEI and make it current
    pub fn allocate_guti(&mut self, ue_id: MmeUeId) -> NasResult<EpsGuti> {
        if !self.contexts.contains_key(&ue_id) {
            return Err(NasError::UnknownSubscriber(ue_id));
        }

        let mut guti = EpsGuti {
            plmn_id: self.gummei.plmn_id,
            mme_gid: self.gummei.mme_gid,
            mme_code: self.gummei.mme_code,
            m_tmsi: self.next_m_tmsi,
        };
        while self.guti_index.contains_key(&guti) {
            guti.m_tmsi = guti.m_tmsi.wrapping_add(1).max(1);
        }
        self.next_m_tmsi = guti.m_tmsi.wrapping_add(1).max(1);

        self.set_guti(ue_id, guti)?;
        log::debug!("[ue_id={}] GUTI allocated: {}", ue_id, guti);
        Ok(guti)
    }

    /// Move a context to a new handle
    pub fn rebind(&mut self, from: MmeUeId, to: MmeUeId) -> NasResult<()> {
        if from == to {
            return Ok(());
        }
        let mut ctx = self.remove(from).ok_or(NasError::UnknownSubscriber(from))?;
        ctx.ue_id = to;
        ctx.fsm.rebind(to);
        self.add(ctx);
        log::info!("[ue_id={}] EMM context rebound from ue_id={}", to, from);
        Ok(())
    }

    /// Handles of every context
    pub fn ids(&self) -> Vec<MmeUeId> {
        let mut ids: Vec<_> = self.contexts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of contexts
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Remove every context (task shutdown)
    pub fn drain(&mut self) -> Vec<EmmContext> {
        self.imsi_index.clear();
        self.guti_index.clear();
        self.contexts.drain().map(|(_, ctx)| ctx).collect()
    }

    /// Number of IMSI index entries
    pub fn imsi_index_len(&self) -> usize {
        self.imsi_index.len()
    }

    /// Number of GUTI index entries
    pub fn guti_index_len(&self) -> usize {
        self.guti_index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContextStore {
        ContextStore::new(Gummei {
            plmn_id: PlmnId::new("001", "01"),
            mme_gid: 2,
            mme_code: 1,
        })
    }

    #[test]
    fn test_plmn_bcd_roundtrip() {
        let plmn = PlmnId::new("208", "93");
        assert_eq!(plmn.to_bytes(), [0x02, 0xf8, 0x39]);
        assert_eq!(PlmnId::from_bytes(plmn.to_bytes()), plmn);
        assert_eq!(plmn.to_string(), "208-93");
    }

    #[test]
    fn test_get_unknown_is_error() {
        let store = store();
        assert!(matches!(store.get(99), Err(NasError::UnknownSubscriber(99))));
    }

    #[test]
    fn test_upsert_imsi_idempotent() {
        let mut store = store();
        store.add(EmmContext::new(1));
        assert_eq!(store.upsert_imsi(1, "001010000000001").unwrap(), None);
        assert_eq!(store.upsert_imsi(1, "001010000000001").unwrap(), None);
        assert_eq!(store.imsi_index_len(), 1);
        assert_eq!(store.get_by_imsi("001010000000001"), Some(1));
    }

    #[test]
    fn test_upsert_imsi_reports_previous_owner() {
        let mut store = store();
        store.add(EmmContext::new(1));
        store.add(EmmContext::new(2));
        store.upsert_imsi(1, "001010000000001").unwrap();
        assert_eq!(store.upsert_imsi(2, "001010000000001").unwrap(), Some(1));
        assert_eq!(store.get_by_imsi("001010000000001"), Some(2));
    }

    #[test]
    fn test_guti_current_and_old() {
        let mut store = store();
        store.add(EmmContext::new(1));
        let g1 = store.allocate_guti(1).unwrap();
        let g2 = store.allocate_guti(1).unwrap();
        assert_ne!(g1, g2);
        assert_eq!(store.get_by_guti(&g1), Some(1));
        assert_eq!(store.get_by_guti(&g2), Some(1));

        // A third GUTI pushes the first one out of the index
        let g3 = store.allocate_guti(1).unwrap();
        assert_eq!(store.get_by_guti(&g1), None);
        assert_eq!(store.guti_index_len(), 2);

        store.clear_old_guti(1).unwrap();
        assert_eq!(store.get_by_guti(&g2), None);
        assert_eq!(store.get_by_guti(&g3), Some(1));
    }

    #[test]
    fn test_remove_clears_indices() {
        let mut store = store();
        store.add(EmmContext::new(7));
        store.upsert_imsi(7, "001010000000007").unwrap();
        store.allocate_guti(7).unwrap();
        store.allocate_guti(7).unwrap();

        assert!(store.remove(7).is_some());
        assert_eq!(store.imsi_index_len(), 0);
        assert_eq!(store.guti_index_len(), 0);
        assert!(store.remove(7).is_none());
    }

    #[test]
    fn test_rebind_moves_indices() {
        let mut store = store();
        store.add(EmmContext::new(1));
        store.upsert_imsi(1, "001010000000001").unwrap();
        let guti = store.allocate_guti(1).unwrap();

        store.rebind(1, 5).unwrap();
        assert!(!store.contains(1));
        assert_eq!(store.get(5).unwrap().ue_id, 5);
        assert_eq!(store.get_by_guti(&guti), Some(5));
        assert_eq!(store.get_by_imsi("001010000000001"), Some(5));
    }

    #[test]
    fn test_field_validation() {
        let mut field = Field::Absent;
        assert!(!field.is_present());
        field.set_present(3u8);
        assert!(field.is_present() && !field.is_valid());
        field.validate();
        assert!(field.is_valid());
        assert_eq!(field.get(), Some(&3));
    }

    #[test]
    fn test_auth_vectors_bounded() {
        let vector = AuthVector {
            rand: [1; 16],
            xres: Bytes::from_static(&[1, 2, 3, 4]),
            autn: [2; 16],
            kasme: [3; 32],
        };
        let mut vectors = AuthVectors::default();
        vectors.store(vec![vector.clone(), vector.clone(), vector], 2);
        assert_eq!(vectors.remaining(), 2);
        assert!(vectors.next_unused().is_some());
        assert!(vectors.next_unused().is_some());
        assert!(vectors.next_unused().is_none());
    }
}
