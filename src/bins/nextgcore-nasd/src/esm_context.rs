//! ESM Session Context Store
//!
//! Per-subscriber PDN connections and EPS bearers, plus the network-initiated
//! ESM transactions (T3485/T3486/T3495) running on them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use bytes::Bytes;

use crate::context::MmeUeId;
use crate::error::{CodecError, EsmCause};
use crate::timer::{NasTimer, TimerId};

/// EPS bearer identity
pub type Ebi = u8;

/// Lowest assignable EBI
pub const MIN_EBI: Ebi = 5;
/// Highest assignable EBI
pub const MAX_EBI: Ebi = 15;

// ============================================================================
// Session types
// ============================================================================

/// PDN type (TS 24.301 Section 9.9.4.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdnType {
    #[default]
    Ipv4 = 1,
    Ipv6 = 2,
    Ipv4v6 = 3,
}

impl TryFrom<u8> for PdnType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ipv4),
            2 => Ok(Self::Ipv6),
            3 => Ok(Self::Ipv4v6),
            _ => Err(CodecError::InvalidIe("PDN type")),
        }
    }
}

/// PDN address allocation
///
/// IPv6 allocations carry their prefix length explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paa {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 prefix
    Ipv6 { prefix: Ipv6Addr, prefix_len: u8 },
    /// Dual stack
    Ipv4v6 { ipv4: Ipv4Addr, prefix: Ipv6Addr, prefix_len: u8 },
}

impl Paa {
    /// PDN type of this allocation
    pub fn pdn_type(&self) -> PdnType {
        match self {
            Paa::Ipv4(_) => PdnType::Ipv4,
            Paa::Ipv6 { .. } => PdnType::Ipv6,
            Paa::Ipv4v6 { .. } => PdnType::Ipv4v6,
        }
    }
}

impl fmt::Display for Paa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Paa::Ipv4(v4) => write!(f, "{v4}"),
            Paa::Ipv6 { prefix, prefix_len } => write!(f, "{prefix}/{prefix_len}"),
            Paa::Ipv4v6 { ipv4, prefix, prefix_len } => write!(f, "{ipv4},{prefix}/{prefix_len}"),
        }
    }
}

/// Aggregate maximum bit rate (bps)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ambr {
    /// Uplink
    pub uplink: u64,
    /// Downlink
    pub downlink: u64,
}

/// Bitrate (bps)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitrate {
    /// Uplink bitrate
    pub uplink: u64,
    /// Downlink bitrate
    pub downlink: u64,
}

/// ARP (Allocation and Retention Priority)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arp {
    /// Priority level (1-15)
    pub priority_level: u8,
    /// Pre-emption capability
    pub pre_emption_capability: bool,
    /// Pre-emption vulnerability
    pub pre_emption_vulnerability: bool,
}

/// Bearer level QoS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BearerQos {
    /// QCI (QoS Class Identifier)
    pub qci: u8,
    /// ARP
    pub arp: Arp,
    /// MBR (Maximum Bit Rate)
    pub mbr: Bitrate,
    /// GBR (Guaranteed Bit Rate)
    pub gbr: Bitrate,
}

/// Fully qualified tunnel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fteid {
    /// Tunnel endpoint identifier
    pub teid: u32,
    /// Endpoint address
    pub addr: IpAddr,
}

// ============================================================================
// Bearer Context
// ============================================================================

/// Bearer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BearerState {
    /// Created at the gateway, not yet signalled to the UE
    CreatedAtGateway,
    /// Activation request built by the MME
    CreatedAtMme,
    /// Radio bearer set up by the access network
    CreatedAtAccess,
    /// Accepted by the UE and set up in the access network
    Active,
    /// Signalling connection released, bearer kept in the core
    AccessReleased,
}

/// EPS bearer context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerContext {
    /// EPS bearer identity
    pub ebi: Ebi,
    /// QoS
    pub qos: BearerQos,
    /// Traffic flow template (opaque)
    pub tft: Bytes,
    /// Lifecycle state
    pub state: BearerState,
    /// UE accepted the activation
    pub nas_accepted: bool,
    /// eNB S1-U endpoint
    pub enb_fteid: Option<Fteid>,
    /// SGW S1-U endpoint
    pub sgw_fteid: Option<Fteid>,
    /// PGW S5-U endpoint
    pub pgw_fteid: Option<Fteid>,
}

impl BearerContext {
    /// Create a bearer as reported by the gateway
    pub fn new(ebi: Ebi, qos: BearerQos) -> Self {
        Self {
            ebi,
            qos,
            tft: Bytes::new(),
            state: BearerState::CreatedAtGateway,
            nas_accepted: false,
            enb_fteid: None,
            sgw_fteid: None,
            pgw_fteid: None,
        }
    }

    /// Activation request sent towards the UE
    pub fn mark_created_at_mme(&mut self) {
        if self.state == BearerState::CreatedAtGateway {
            self.state = BearerState::CreatedAtMme;
        }
    }

    /// Access network reported the radio bearer
    pub fn on_access_setup(&mut self, enb_fteid: Option<Fteid>) -> BearerState {
        if enb_fteid.is_some() {
            self.enb_fteid = enb_fteid;
        }
        match self.state {
            BearerState::CreatedAtMme | BearerState::AccessReleased => {
                self.state = if self.nas_accepted {
                    BearerState::Active
                } else {
                    BearerState::CreatedAtAccess
                };
            }
            _ => {}
        }
        self.state
    }

    /// UE accepted the activation
    pub fn on_nas_accept(&mut self) -> BearerState {
        self.nas_accepted = true;
        if self.state == BearerState::CreatedAtAccess {
            self.state = BearerState::Active;
        }
        self.state
    }

    /// Signalling connection released
    pub fn on_access_release(&mut self) {
        if matches!(self.state, BearerState::Active | BearerState::CreatedAtAccess) {
            self.state = BearerState::AccessReleased;
            self.enb_fteid = None;
        }
    }
}

// ============================================================================
// PDN Context
// ============================================================================

/// PDN connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnContext {
    /// Access point name
    pub apn: String,
    /// PDN type
    pub pdn_type: PdnType,
    /// Allocated address(es)
    pub paa: Paa,
    /// Default bearer identity
    pub default_ebi: Ebi,
    /// APN-AMBR
    pub ambr: Ambr,
    /// Bearers of this connection, default bearer included
    pub bearers: BTreeMap<Ebi, BearerContext>,
}

impl PdnContext {
    /// Default bearer
    pub fn default_bearer(&self) -> Option<&BearerContext> {
        self.bearers.get(&self.default_ebi)
    }
}

/// Parameters of a PDN connection established by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnSetup {
    /// Access point name
    pub apn: String,
    /// Allocated address(es)
    pub paa: Paa,
    /// APN-AMBR
    pub ambr: Ambr,
    /// Default bearer QoS
    pub qos: BearerQos,
    /// SGW S1-U endpoint
    pub sgw_fteid: Option<Fteid>,
    /// PGW S5-U endpoint
    pub pgw_fteid: Option<Fteid>,
}

// ============================================================================
// ESM transactions
// ============================================================================

/// Network-initiated ESM procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsmProcedure {
    /// Activate default EPS bearer context (standalone PDN connectivity)
    ActivateDefault,
    /// Activate dedicated EPS bearer context
    ActivateDedicated,
    /// Modify EPS bearer context
    Modify,
    /// Deactivate EPS bearer context
    Deactivate,
}

impl EsmProcedure {
    /// Guard timer
    pub fn timer(&self) -> NasTimer {
        match self {
            Self::ActivateDefault | Self::ActivateDedicated => NasTimer::T3485,
            Self::Modify => NasTimer::T3486,
            Self::Deactivate => NasTimer::T3495,
        }
    }
}

/// Outstanding ESM transaction on one bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmTransaction {
    /// Bearer
    pub ebi: Ebi,
    /// Procedure transaction identity
    pub pti: u8,
    /// Procedure
    pub procedure: EsmProcedure,
    /// Armed guard timer
    pub timer: Option<TimerId>,
    /// Retransmissions done
    pub retries: u32,
    /// Retransmission bound
    pub max_retries: u32,
    /// Timer duration
    pub duration: Duration,
    /// Encoded ESM message, resent on expiry
    pub message: Bytes,
}

// ============================================================================
// Per-subscriber sessions
// ============================================================================

/// Removal result of a bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovedBearer {
    /// Dedicated bearer removed
    Dedicated(BearerContext),
    /// Default bearer removed together with its PDN connection
    Pdn(PdnContext),
}

/// Sessions of one subscriber
///
/// PDN connections are keyed by their default EBI; the EBI index keeps every
/// bearer identity unique across connections.
#[derive(Debug, Clone, Default)]
pub struct UeSessions {
    pdns: BTreeMap<Ebi, PdnContext>,
    apn_index: BTreeMap<String, Ebi>,
    ebi_index: BTreeMap<Ebi, Ebi>,
    transactions: BTreeMap<Ebi, EsmTransaction>,
}

impl UeSessions {
    /// Lowest free EBI
    pub fn allocate_ebi(&self) -> Option<Ebi> {
        (MIN_EBI..=MAX_EBI).find(|ebi| !self.ebi_index.contains_key(ebi))
    }

    /// Create a PDN connection with its default bearer
    pub fn create_pdn(&mut self, setup: PdnSetup) -> Result<Ebi, EsmCause> {
        if self.apn_index.contains_key(&setup.apn) {
            return Err(EsmCause::MultiplePdnForApnNotAllowed);
        }
        let ebi = self.allocate_ebi().ok_or(EsmCause::InsufficientResources)?;

        let mut bearer = BearerContext::new(ebi, setup.qos);
        bearer.sgw_fteid = setup.sgw_fteid;
        bearer.pgw_fteid = setup.pgw_fteid;

        let mut bearers = BTreeMap::new();
        bearers.insert(ebi, bearer);

        self.insert_pdn(PdnContext {
            apn: setup.apn,
            pdn_type: setup.paa.pdn_type(),
            paa: setup.paa,
            default_ebi: ebi,
            ambr: setup.ambr,
            bearers,
        });
        Ok(ebi)
    }

    /// Insert a fully built PDN connection (context transfer)
    pub fn import_pdn(&mut self, pdn: PdnContext) -> Result<(), EsmCause> {
        if self.apn_index.contains_key(&pdn.apn) {
            return Err(EsmCause::MultiplePdnForApnNotAllowed);
        }
        if !pdn.bearers.contains_key(&pdn.default_ebi) {
            return Err(EsmCause::InvalidEpsBearerIdentity);
        }
        for ebi in pdn.bearers.keys() {
            if !(MIN_EBI..=MAX_EBI).contains(ebi) || self.ebi_index.contains_key(ebi) {
                return Err(EsmCause::InvalidEpsBearerIdentity);
            }
        }
        self.insert_pdn(pdn);
        Ok(())
    }

    fn insert_pdn(&mut self, pdn: PdnContext) {
        let default_ebi = pdn.default_ebi;
        for ebi in pdn.bearers.keys() {
            self.ebi_index.insert(*ebi, default_ebi);
        }
        self.apn_index.insert(pdn.apn.clone(), default_ebi);
        self.pdns.insert(default_ebi, pdn);
    }

    /// Add a dedicated bearer to the PDN connection owning `linked_ebi`
    pub fn add_bearer(&mut self, linked_ebi: Ebi, qos: BearerQos, tft: Bytes) -> Result<Ebi, EsmCause> {
        let default_ebi = *self.ebi_index.get(&linked_ebi).ok_or(EsmCause::InvalidEpsBearerIdentity)?;
        let ebi = self.allocate_ebi().ok_or(EsmCause::InsufficientResources)?;
        let pdn = self.pdns.get_mut(&default_ebi).ok_or(EsmCause::InvalidEpsBearerIdentity)?;

        let mut bearer = BearerContext::new(ebi, qos);
        bearer.tft = tft;
        if let Some(default) = pdn.bearers.get(&default_ebi) {
            bearer.sgw_fteid = default.sgw_fteid;
            bearer.pgw_fteid = default.pgw_fteid;
        }
        pdn.bearers.insert(ebi, bearer);
        self.ebi_index.insert(ebi, default_ebi);
        Ok(ebi)
    }

    /// PDN connection by default EBI
    pub fn pdn(&self, default_ebi: Ebi) -> Option<&PdnContext> {
        self.pdns.get(&default_ebi)
    }

    /// PDN connection by APN
    pub fn pdn_by_apn(&self, apn: &str) -> Option<&PdnContext> {
        self.apn_index.get(apn).and_then(|ebi| self.pdns.get(ebi))
    }

    /// PDN connection owning bearer `ebi`
    pub fn pdn_by_ebi(&self, ebi: Ebi) -> Option<&PdnContext> {
        self.ebi_index.get(&ebi).and_then(|default| self.pdns.get(default))
    }

    /// Bearer by EBI
    pub fn bearer(&self, ebi: Ebi) -> Option<&BearerContext> {
        self.pdn_by_ebi(ebi).and_then(|pdn| pdn.bearers.get(&ebi))
    }

    /// Mutable bearer by EBI
    pub fn bearer_mut(&mut self, ebi: Ebi) -> Option<&mut BearerContext> {
        let default = *self.ebi_index.get(&ebi)?;
        self.pdns.get_mut(&default)?.bearers.get_mut(&ebi)
    }

    /// Remove a bearer; removing a default bearer removes its PDN connection
    pub fn remove_bearer(&mut self, ebi: Ebi) -> Option<RemovedBearer> {
        let default = *self.ebi_index.get(&ebi)?;
        if default == ebi {
            return self.remove_pdn(ebi).map(RemovedBearer::Pdn);
        }
        let bearer = self.pdns.get_mut(&default)?.bearers.remove(&ebi)?;
        self.ebi_index.remove(&ebi);
        Some(RemovedBearer::Dedicated(bearer))
    }

    /// Remove a PDN connection and all its bearers
    pub fn remove_pdn(&mut self, default_ebi: Ebi) -> Option<PdnContext> {
        let pdn = self.pdns.remove(&default_ebi)?;
        for ebi in pdn.bearers.keys() {
            self.ebi_index.remove(ebi);
        }
        self.apn_index.remove(&pdn.apn);
        Some(pdn)
    }

    /// Move every active bearer to access-released
    pub fn release_access(&mut self) {
        for pdn in self.pdns.values_mut() {
            for bearer in pdn.bearers.values_mut() {
                bearer.on_access_release();
            }
        }
    }

    /// PDN connections in default-EBI order
    pub fn pdns(&self) -> impl Iterator<Item = &PdnContext> {
        self.pdns.values()
    }

    /// Every bearer identity in use
    pub fn ebis(&self) -> Vec<Ebi> {
        self.ebi_index.keys().copied().collect()
    }

    /// Number of PDN connections
    pub fn pdn_count(&self) -> usize {
        self.pdns.len()
    }

    /// Number of bearers across all PDN connections
    pub fn bearer_count(&self) -> usize {
        self.pdns.values().map(|pdn| pdn.bearers.len()).sum()
    }

    /// Start tracking an ESM transaction; replaces one on the same bearer
    pub fn start_transaction(&mut self, transaction: EsmTransaction) -> Option<EsmTransaction> {
        self.transactions.insert(transaction.ebi, transaction)
    }

    /// Transaction on `ebi`
    pub fn transaction(&self, ebi: Ebi) -> Option<&EsmTransaction> {
        self.transactions.get(&ebi)
    }

    /// Mutable transaction on `ebi`
    pub fn transaction_mut(&mut self, ebi: Ebi) -> Option<&mut EsmTransaction> {
        self.transactions.get_mut(&ebi)
    }

    /// Finish the transaction on `ebi`
    pub fn take_transaction(&mut self, ebi: Ebi) -> Option<EsmTransaction> {
        self.transactions.remove(&ebi)
    }

    /// Finish every transaction
    pub fn take_transactions(&mut self) -> Vec<EsmTransaction> {
        std::mem::take(&mut self.transactions).into_values().collect()
    }

    /// Check if there is nothing left
    pub fn is_empty(&self) -> bool {
        self.pdns.is_empty() && self.transactions.is_empty()
    }
}

// ============================================================================
// Session Store
// ============================================================================

/// Sessions of every subscriber
#[derive(Debug, Default)]
pub struct SessionStore {
    ues: HashMap<MmeUeId, UeSessions>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions of a subscriber
    pub fn get(&self, ue_id: MmeUeId) -> Option<&UeSessions> {
        self.ues.get(&ue_id)
    }

    /// Mutable sessions of a subscriber
    pub fn get_mut(&mut self, ue_id: MmeUeId) -> Option<&mut UeSessions> {
        self.ues.get_mut(&ue_id)
    }

    /// Sessions of a subscriber, created on first use
    pub fn entry(&mut self, ue_id: MmeUeId) -> &mut UeSessions {
        self.ues.entry(ue_id).or_default()
    }

    /// Remove all sessions of a subscriber
    pub fn remove(&mut self, ue_id: MmeUeId) -> Option<UeSessions> {
        self.ues.remove(&ue_id)
    }

    /// Move sessions to a new handle
    pub fn rebind(&mut self, from: MmeUeId, to: MmeUeId) {
        if from == to {
            return;
        }
        if let Some(sessions) = self.ues.remove(&from) {
            self.ues.insert(to, sessions);
        }
    }

    /// Number of subscribers with session state
    pub fn len(&self) -> usize {
        self.ues.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.ues.is_empty()
    }

    /// Remove everything (task shutdown)
    pub fn clear(&mut self) {
        self.ues.clear();
    }
}
