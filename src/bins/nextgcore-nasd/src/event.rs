//! NAS Core Events and Primitives
//!
//! Inbound events queued to the NAS task and the outbound primitives it emits
//! towards the access stratum, the core network and the session layer. Every
//! primitive is keyed by the subscriber handle.

use std::fmt;

use bytes::Bytes;

use crate::context::{AuthVector, EpsGuti, EpsTai, MmeUeId, PlmnId};
use crate::error::{EmmCause, EsmCause};
use crate::esm_context::{BearerQos, Ebi, Fteid, PdnContext, PdnSetup, PdnType};
use crate::procedure::ProcId;
use crate::security::{SecurityContext, UeNetworkCapability};
use crate::timer::TimerId;

// ============================================================================
// Shared shapes
// ============================================================================

/// Lower layer notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerLayerKind {
    /// NAS message delivered
    Success,
    /// NAS message delivery failed
    Failure,
    /// NAS message not delivered (e.g. due to handover)
    NonDelivery,
    /// Signalling connection released
    Release,
}

impl fmt::Display for LowerLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerLayerKind::Success => write!(f, "SUCCESS"),
            LowerLayerKind::Failure => write!(f, "FAILURE"),
            LowerLayerKind::NonDelivery => write!(f, "NON_DELIVERY"),
            LowerLayerKind::Release => write!(f, "RELEASE"),
        }
    }
}

/// Handover target identification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetId {
    /// Target eNB
    Enb {
        plmn_id: PlmnId,
        /// Macro (20 bit) or home (28 bit) eNB ID
        enb_id: u32,
        tai: EpsTai,
    },
    /// Target RNC
    Rnc {
        plmn_id: PlmnId,
        lac: u16,
        rac: Option<u8>,
        rnc_id: u16,
        extended_rnc_id: Option<u16>,
    },
}

/// Bearer handed to the access network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerSetupItem {
    /// EPS bearer identity
    pub ebi: Ebi,
    /// QoS
    pub qos: BearerQos,
    /// SGW S1-U endpoint
    pub sgw_fteid: Option<Fteid>,
}

/// Detach request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachParams {
    /// Detach type (EPS, IMSI, combined)
    pub detach_type: u8,
    /// Cause given by the requester, logged only
    pub cause: Option<EmmCause>,
    /// UE is switched off; no DETACH ACCEPT is sent
    pub switch_off: bool,
}

/// Subscriber state received from a peer MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTransfer {
    /// IMSI
    pub imsi: String,
    /// Security context (native or mapped)
    pub security: SecurityContext,
    /// UE network capability
    pub ue_network_capability: UeNetworkCapability,
    /// PDN connections with their bearers
    pub pdns: Vec<PdnContext>,
}

/// Timer target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Procedure guard timer
    Procedure(ProcId),
    /// ESM transaction guard timer
    EsmTransaction(Ebi),
}

/// Payload of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Subscriber
    pub ue_id: MmeUeId,
    /// What expired
    pub target: TimerTarget,
}

// ============================================================================
// Inbound
// ============================================================================

/// Core network primitives towards EMM (EMM-CN SAP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmCnPrimitive {
    /// Authentication parameters from the HSS, or the failure cause
    AuthInfoAnswer {
        ue_id: MmeUeId,
        result: Result<Vec<AuthVector>, u8>,
    },
    /// Context transfer result from the peer MME
    ContextResponse {
        ue_id: MmeUeId,
        result: Result<Box<ContextTransfer>, u8>,
    },
    /// HSS cancelled the subscription
    DeregisterSubscriber { ue_id: MmeUeId },
    /// Implicit detach (e.g. mobile reachable timer)
    ImplicitDetach { ue_id: MmeUeId },
    /// Security mode failure reported by the core network
    SecurityModeFailure { ue_id: MmeUeId, cause: u8 },
}

/// Session layer primitives towards ESM (ESM-SAP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPrimitive {
    /// Subscription data for the session layer retrieved
    SessionConfigResult {
        ue_id: MmeUeId,
        result: Result<(), u8>,
    },
    /// PDN connection established by the gateways
    ConnectivityResult {
        ue_id: MmeUeId,
        pti: u8,
        result: Result<PdnSetup, EsmCause>,
    },
    /// PDN connection released by the gateways
    DisconnectResult {
        ue_id: MmeUeId,
        pti: u8,
        ebi: Ebi,
        result: Result<(), EsmCause>,
    },
    /// Gateway requests a dedicated bearer
    BearerActivateRequest {
        ue_id: MmeUeId,
        linked_ebi: Ebi,
        qos: BearerQos,
        tft: Bytes,
    },
    /// Gateway requests a bearer modification
    BearerModifyRequest {
        ue_id: MmeUeId,
        ebi: Ebi,
        qos: BearerQos,
        tft: Bytes,
    },
    /// Gateway requests a bearer deactivation
    BearerDeactivateRequest {
        ue_id: MmeUeId,
        ebi: Ebi,
        cause: EsmCause,
    },
}

/// Event consumed by the NAS task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasEvent {
    /// Initial NAS message on a new signalling connection
    EstablishRequest { ue_id: MmeUeId, pdu: Bytes },
    /// Uplink NAS message
    DataIndication { ue_id: MmeUeId, pdu: Bytes },
    /// Signalling connection released by the access network
    ReleaseIndication { ue_id: MmeUeId },
    /// Lower layer delivery notification
    LowerLayer {
        ue_id: MmeUeId,
        kind: LowerLayerKind,
        pdu: Option<Bytes>,
    },
    /// Radio bearers set up by the access network
    BearerSetupResponse {
        ue_id: MmeUeId,
        bearers: Vec<(Ebi, Fteid)>,
    },
    /// Access network requests handover preparation
    HandoverRequired { ue_id: MmeUeId, target: TargetId },
    /// Detach requested by the session layer or management
    Detach { ue_id: MmeUeId, params: DetachParams },
    /// EMM-CN SAP
    Cn(EmmCnPrimitive),
    /// ESM-SAP
    Session(SessionPrimitive),
    /// Timer expiry
    Timer { id: TimerId, event: TimerEvent },
}

impl NasEvent {
    /// Subscriber the event concerns
    pub fn ue_id(&self) -> MmeUeId {
        match self {
            NasEvent::EstablishRequest { ue_id, .. }
            | NasEvent::DataIndication { ue_id, .. }
            | NasEvent::ReleaseIndication { ue_id }
            | NasEvent::LowerLayer { ue_id, .. }
            | NasEvent::BearerSetupResponse { ue_id, .. }
            | NasEvent::HandoverRequired { ue_id, .. }
            | NasEvent::Detach { ue_id, .. } => *ue_id,
            NasEvent::Cn(primitive) => match primitive {
                EmmCnPrimitive::AuthInfoAnswer { ue_id, .. }
                | EmmCnPrimitive::ContextResponse { ue_id, .. }
                | EmmCnPrimitive::DeregisterSubscriber { ue_id }
                | EmmCnPrimitive::ImplicitDetach { ue_id }
                | EmmCnPrimitive::SecurityModeFailure { ue_id, .. } => *ue_id,
            },
            NasEvent::Session(primitive) => match primitive {
                SessionPrimitive::SessionConfigResult { ue_id, .. }
                | SessionPrimitive::ConnectivityResult { ue_id, .. }
                | SessionPrimitive::DisconnectResult { ue_id, .. }
                | SessionPrimitive::BearerActivateRequest { ue_id, .. }
                | SessionPrimitive::BearerModifyRequest { ue_id, .. }
                | SessionPrimitive::BearerDeactivateRequest { ue_id, .. } => *ue_id,
            },
            NasEvent::Timer { event, .. } => event.ue_id,
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Primitive emitted by the NAS task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasPrimitive {
    /// Downlink NAS transport
    DataRequest { ue_id: MmeUeId, pdu: Bytes },
    /// Initial context setup carrying the AS key material
    EstablishConfirm {
        ue_id: MmeUeId,
        pdu: Bytes,
        kenb: [u8; 32],
        nh: [u8; 32],
        ncc: u8,
        bearers: Vec<BearerSetupItem>,
    },
    /// Reject on the signalling connection, then release
    EstablishReject { ue_id: MmeUeId, pdu: Bytes },
    /// EMM STATUS towards the UE
    StatusIndication {
        ue_id: MmeUeId,
        cause: EmmCause,
        pdu: Bytes,
    },
    /// Release the signalling connection
    ReleaseRequest { ue_id: MmeUeId },
    /// Set up radio bearers
    BearerSetupRequest {
        ue_id: MmeUeId,
        bearers: Vec<BearerSetupItem>,
    },
    /// Modify a radio bearer
    BearerModifyRequest {
        ue_id: MmeUeId,
        ebi: Ebi,
        qos: BearerQos,
    },
    /// Release radio bearers
    BearerReleaseRequest { ue_id: MmeUeId, ebis: Vec<Ebi> },
    /// Handover preparation with fresh NH/NCC
    HandoverPreparation {
        ue_id: MmeUeId,
        nh: [u8; 32],
        ncc: u8,
        target: TargetId,
    },
    /// Request authentication vectors from the HSS
    AuthInfoRequest {
        ue_id: MmeUeId,
        imsi: String,
        num_vectors: u8,
        /// RAND || AUTS after a synchronisation failure
        resync: Option<Bytes>,
    },
    /// Request the UE context from the peer MME owning `guti`
    ContextRequest { ue_id: MmeUeId, guti: EpsGuti },
    /// Retrieve session subscription data
    SessionConfigRequest { ue_id: MmeUeId, imsi: String },
    /// Establish a PDN connection
    ConnectivityRequest {
        ue_id: MmeUeId,
        pti: u8,
        apn: String,
        pdn_type: PdnType,
    },
    /// Release a PDN connection
    DisconnectRequest { ue_id: MmeUeId, pti: u8, ebi: Ebi },
    /// Outcome of a dedicated/default bearer activation
    BearerActivateResult {
        ue_id: MmeUeId,
        ebi: Ebi,
        result: Result<(), EsmCause>,
    },
    /// Outcome of a bearer modification
    BearerModifyResult {
        ue_id: MmeUeId,
        ebi: Ebi,
        result: Result<(), EsmCause>,
    },
    /// Outcome of a bearer deactivation
    BearerDeactivateResult {
        ue_id: MmeUeId,
        ebi: Ebi,
        result: Result<(), EsmCause>,
    },
    /// Subscriber cleanup completed; session layer drops its state
    DetachIndication { ue_id: MmeUeId },
}

impl NasPrimitive {
    /// Subscriber the primitive concerns
    pub fn ue_id(&self) -> MmeUeId {
        match self {
            NasPrimitive::DataRequest { ue_id, .. }
            | NasPrimitive::EstablishConfirm { ue_id, .. }
            | NasPrimitive::EstablishReject { ue_id, .. }
            | NasPrimitive::StatusIndication { ue_id, .. }
            | NasPrimitive::ReleaseRequest { ue_id }
            | NasPrimitive::BearerSetupRequest { ue_id, .. }
            | NasPrimitive::BearerModifyRequest { ue_id, .. }
            | NasPrimitive::BearerReleaseRequest { ue_id, .. }
            | NasPrimitive::HandoverPreparation { ue_id, .. }
            | NasPrimitive::AuthInfoRequest { ue_id, .. }
            | NasPrimitive::ContextRequest { ue_id, .. }
            | NasPrimitive::SessionConfigRequest { ue_id, .. }
            | NasPrimitive::ConnectivityRequest { ue_id, .. }
            | NasPrimitive::DisconnectRequest { ue_id, .. }
            | NasPrimitive::BearerActivateResult { ue_id, .. }
            | NasPrimitive::BearerModifyResult { ue_id, .. }
            | NasPrimitive::BearerDeactivateResult { ue_id, .. }
            | NasPrimitive::DetachIndication { ue_id } => *ue_id,
        }
    }

    /// Primitive name for logs
    pub fn name(&self) -> &'static str {
        match self {
            NasPrimitive::DataRequest { .. } => "AS-DATA-REQ",
            NasPrimitive::EstablishConfirm { .. } => "AS-ESTABLISH-CNF",
            NasPrimitive::EstablishReject { .. } => "AS-ESTABLISH-REJ",
            NasPrimitive::StatusIndication { .. } => "AS-STATUS-IND",
            NasPrimitive::ReleaseRequest { .. } => "AS-RELEASE-REQ",
            NasPrimitive::BearerSetupRequest { .. } => "AS-BEARER-SETUP-REQ",
            NasPrimitive::BearerModifyRequest { .. } => "AS-BEARER-MODIFY-REQ",
            NasPrimitive::BearerReleaseRequest { .. } => "AS-BEARER-RELEASE-REQ",
            NasPrimitive::HandoverPreparation { .. } => "AS-HANDOVER-PREP",
            NasPrimitive::AuthInfoRequest { .. } => "CN-AUTH-INFO-REQ",
            NasPrimitive::ContextRequest { .. } => "CN-CONTEXT-REQ",
            NasPrimitive::SessionConfigRequest { .. } => "ESM-SESSION-CONFIG-REQ",
            NasPrimitive::ConnectivityRequest { .. } => "ESM-CONNECTIVITY-REQ",
            NasPrimitive::DisconnectRequest { .. } => "ESM-DISCONNECT-REQ",
            NasPrimitive::BearerActivateResult { .. } => "ESM-BEARER-ACTIVATE-RSP",
            NasPrimitive::BearerModifyResult { .. } => "ESM-BEARER-MODIFY-RSP",
            NasPrimitive::BearerDeactivateResult { .. } => "ESM-BEARER-DEACTIVATE-RSP",
            NasPrimitive::DetachIndication { .. } => "ESM-DETACH-IND",
        }
    }
}

impl fmt::Display for NasPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [ue_id={}]", self.name(), self.ue_id())
    }
}
