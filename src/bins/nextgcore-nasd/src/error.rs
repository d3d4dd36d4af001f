//! NAS core error types
//!
//! Error taxonomy of the EMM/ESM core:
//! - decode errors surfaced by the NAS codec
//! - EMM and ESM protocol causes (TS 24.301 9.9.3.9 / 9.9.4.4)
//! - core network failures carrying a peer-supplied cause
//! - subscriber lookup, procedure conflicts and security failures

use std::fmt;

use ogs_crypt::CryptError;
use thiserror::Error;

use crate::context::MmeUeId;
use crate::procedure::{ProcId, SpecificKind};
use crate::sm::{EmmSignal, EmmState};

// ============================================================================
// Protocol causes
// ============================================================================

/// EMM cause values (TS 24.301 Section 9.9.3.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EmmCause {
    ImsiUnknownInHss = 2,
    IllegalUe = 3,
    IllegalMe = 6,
    EpsServicesNotAllowed = 7,
    EpsAndNonEpsServicesNotAllowed = 8,
    UeIdentityCannotBeDerived = 9,
    ImplicitlyDetached = 10,
    PlmnNotAllowed = 11,
    TrackingAreaNotAllowed = 12,
    NetworkFailure = 17,
    EsmFailure = 19,
    MacFailure = 20,
    SynchFailure = 21,
    Congestion = 22,
    UeSecurityCapabilitiesMismatch = 23,
    SecurityModeRejected = 24,
    NonEpsAuthenticationUnacceptable = 26,
    SemanticallyIncorrectMessage = 95,
    InvalidMandatoryInformation = 96,
    MessageTypeNonExistent = 97,
    MessageTypeNotCompatible = 98,
    InformationElementNonExistent = 99,
    ConditionalIeError = 100,
    ProtocolErrorUnspecified = 111,
}

impl TryFrom<u8> for EmmCause {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::ImsiUnknownInHss),
            3 => Ok(Self::IllegalUe),
            6 => Ok(Self::IllegalMe),
            7 => Ok(Self::EpsServicesNotAllowed),
            8 => Ok(Self::EpsAndNonEpsServicesNotAllowed),
            9 => Ok(Self::UeIdentityCannotBeDerived),
            10 => Ok(Self::ImplicitlyDetached),
            11 => Ok(Self::PlmnNotAllowed),
            12 => Ok(Self::TrackingAreaNotAllowed),
            17 => Ok(Self::NetworkFailure),
            19 => Ok(Self::EsmFailure),
            20 => Ok(Self::MacFailure),
            21 => Ok(Self::SynchFailure),
            22 => Ok(Self::Congestion),
            23 => Ok(Self::UeSecurityCapabilitiesMismatch),
            24 => Ok(Self::SecurityModeRejected),
            26 => Ok(Self::NonEpsAuthenticationUnacceptable),
            95 => Ok(Self::SemanticallyIncorrectMessage),
            96 => Ok(Self::InvalidMandatoryInformation),
            97 => Ok(Self::MessageTypeNonExistent),
            98 => Ok(Self::MessageTypeNotCompatible),
            99 => Ok(Self::InformationElementNonExistent),
            100 => Ok(Self::ConditionalIeError),
            111 => Ok(Self::ProtocolErrorUnspecified),
            _ => Err(CodecError::InvalidCause(value)),
        }
    }
}

impl EmmCause {
    /// Map a peer-supplied cause code, falling back to network failure
    pub fn from_peer(value: u8) -> Self {
        Self::try_from(value).unwrap_or(Self::NetworkFailure)
    }
}

impl fmt::Display for EmmCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

/// ESM cause values (TS 24.301 Section 9.9.4.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EsmCause {
    OperatorDeterminedBarring = 8,
    InsufficientResources = 26,
    UnknownOrMissingApn = 27,
    UnknownPdnType = 28,
    UserAuthenticationFailed = 29,
    RequestRejectedByGateway = 30,
    RequestRejectedUnspecified = 31,
    ServiceOptionNotSupported = 32,
    PtiAlreadyInUse = 35,
    RegularDeactivation = 36,
    NetworkFailure = 38,
    InvalidEpsBearerIdentity = 43,
    SemanticErrorsInTft = 44,
    InvalidPti = 47,
    LastPdnDisconnectionNotAllowed = 49,
    PdnTypeIpv4OnlyAllowed = 50,
    PdnTypeIpv6OnlyAllowed = 51,
    MultiplePdnForApnNotAllowed = 55,
    InvalidMandatoryInformation = 96,
    MessageTypeNonExistent = 97,
    MessageTypeNotCompatible = 98,
    ProtocolErrorUnspecified = 111,
}

impl TryFrom<u8> for EsmCause {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Self::OperatorDeterminedBarring),
            26 => Ok(Self::InsufficientResources),
            27 => Ok(Self::UnknownOrMissingApn),
            28 => Ok(Self::UnknownPdnType),
            29 => Ok(Self::UserAuthenticationFailed),
            30 => Ok(Self::RequestRejectedByGateway),
            31 => Ok(Self::RequestRejectedUnspecified),
            32 => Ok(Self::ServiceOptionNotSupported),
            35 => Ok(Self::PtiAlreadyInUse),
            36 => Ok(Self::RegularDeactivation),
            38 => Ok(Self::NetworkFailure),
            43 => Ok(Self::InvalidEpsBearerIdentity),
            44 => Ok(Self::SemanticErrorsInTft),
            47 => Ok(Self::InvalidPti),
            49 => Ok(Self::LastPdnDisconnectionNotAllowed),
            50 => Ok(Self::PdnTypeIpv4OnlyAllowed),
            51 => Ok(Self::PdnTypeIpv6OnlyAllowed),
            55 => Ok(Self::MultiplePdnForApnNotAllowed),
            96 => Ok(Self::InvalidMandatoryInformation),
            97 => Ok(Self::MessageTypeNonExistent),
            98 => Ok(Self::MessageTypeNotCompatible),
            111 => Ok(Self::ProtocolErrorUnspecified),
            _ => Err(CodecError::InvalidCause(value)),
        }
    }
}

impl fmt::Display for EsmCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

// ============================================================================
// Component errors
// ============================================================================

/// NAS codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer too short for decoding
    #[error("Buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Invalid protocol discriminator
    #[error("Invalid protocol discriminator: {0}")]
    InvalidProtocolDiscriminator(u8),

    /// Invalid or unsupported message type
    #[error("Invalid message type: 0x{0:02x}")]
    InvalidMessageType(u8),

    /// Invalid security header type
    #[error("Invalid security header type: {0}")]
    InvalidSecurityHeaderType(u8),

    /// Invalid mobile identity type
    #[error("Invalid mobile identity type: {0}")]
    InvalidMobileIdentityType(u8),

    /// Unknown cause value
    #[error("Invalid cause value: {0}")]
    InvalidCause(u8),

    /// Malformed information element
    #[error("Invalid IE: {0}")]
    InvalidIe(&'static str),
}

/// NAS security errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Message requires a security context that does not exist
    #[error("No security context available")]
    NoSecurityContext,

    /// Computed MAC does not match the received one
    #[error("MAC mismatch: computed 0x{computed:08x}, received 0x{received:08x}")]
    MacMismatch { computed: u32, received: u32 },

    /// Uplink sequence number out of order
    #[error("NAS sequence mismatch: expected {expected}, received {received}")]
    SequenceMismatch { expected: u8, received: u8 },

    /// Message type must be integrity protected
    #[error("Message type 0x{0:02x} requires integrity protection")]
    ProtectionRequired(u8),

    /// No common algorithm between UE and network
    #[error("No common {0} algorithm")]
    NoCommonAlgorithm(&'static str),

    /// Crypto primitive failure
    #[error("Crypto error: {0}")]
    Crypt(#[from] CryptError),
}

/// Procedure manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcedureError {
    /// No such procedure
    #[error("Procedure {0} not found")]
    NotFound(ProcId),

    /// Parent already owns a child procedure
    #[error("Procedure {parent} already owns child {child}")]
    ChildActive { parent: ProcId, child: ProcId },

    /// No specific procedure to hang a child procedure on
    #[error("No active specific procedure")]
    NoSpecific,
}

/// EMM FSM errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    /// Signal not allowed in the current state
    #[error("EMM signal {signal:?} not allowed in state {state}")]
    InvalidTransition { state: EmmState, signal: EmmSignal },

    /// A detach is already in flight
    #[error("Detach already initiated")]
    DetachAlreadyInitiated,
}

// ============================================================================
// Top-level error
// ============================================================================

/// NAS core error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NasError {
    /// Malformed, truncated or unexpected information element
    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    /// EMM protocol cause
    #[error("EMM cause {0}")]
    Emm(EmmCause),

    /// ESM protocol cause
    #[error("ESM cause {0}")]
    Esm(EsmCause),

    /// Core network procedure failed with a peer-supplied cause
    #[error("CN failure in {procedure}: cause {cause}")]
    CnFailure { procedure: &'static str, cause: u8 },

    /// Event references a subscriber handle with no context
    #[error("Unknown subscriber: ue_id={0}")]
    UnknownSubscriber(MmeUeId),

    /// Procedure of the same kind already running
    #[error("Procedure already in progress")]
    ProcedureInProgress,

    /// Specific procedure collides with an active one
    #[error("Specific procedure conflict: {requested:?} while {active:?} is active")]
    Conflict { active: SpecificKind, requested: SpecificKind },

    /// Integrity / security failure
    #[error("Integrity error: {0}")]
    Integrity(#[from] SecurityError),

    /// Procedure manager failure
    #[error("Procedure error: {0}")]
    Procedure(#[from] ProcedureError),

    /// EMM FSM failure
    #[error("FSM error: {0}")]
    Fsm(#[from] FsmError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CryptError> for NasError {
    fn from(e: CryptError) -> Self {
        NasError::Integrity(SecurityError::Crypt(e))
    }
}

/// NAS core result type
pub type NasResult<T> = Result<T, NasError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emm_cause_roundtrip() {
        for cause in [
            EmmCause::UeIdentityCannotBeDerived,
            EmmCause::UeSecurityCapabilitiesMismatch,
            EmmCause::ProtocolErrorUnspecified,
        ] {
            assert_eq!(EmmCause::try_from(cause as u8), Ok(cause));
        }
        assert_eq!(EmmCause::try_from(0), Err(CodecError::InvalidCause(0)));
    }

    #[test]
    fn test_emm_cause_from_peer_fallback() {
        assert_eq!(EmmCause::from_peer(3), EmmCause::IllegalUe);
        assert_eq!(EmmCause::from_peer(250), EmmCause::NetworkFailure);
    }

    #[test]
    fn test_esm_cause_values() {
        assert_eq!(EsmCause::MultiplePdnForApnNotAllowed as u8, 55);
        assert_eq!(EsmCause::try_from(43), Ok(EsmCause::InvalidEpsBearerIdentity));
    }

    #[test]
    fn test_error_display() {
        let err = NasError::UnknownSubscriber(7);
        assert_eq!(err.to_string(), "Unknown subscriber: ue_id=7");
        let err: NasError = SecurityError::NoSecurityContext.into();
        assert!(matches!(err, NasError::Integrity(_)));
    }
}
