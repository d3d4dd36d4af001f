//! NAS Security Functions
//!
//! Security header handling for EPS NAS messages (TS 24.301 Section 9.3.1):
//! header selection for outbound messages, integrity protection and ciphering,
//! and the inbound verification gate that decides whether a message may reach
//! a procedure handler at all.

use bytes::{BufMut, Bytes, BytesMut};
use ogs_crypt::nas_alg::{nas_eea, nas_eia, NAS_MAC_LEN};

use crate::context::EpsGuti;
use crate::error::{CodecError, NasError, NasResult, SecurityError};
use crate::nas_codec::{Direction, EmmMessage, MobileIdentity, NasMessage, PD_EMM};
use crate::security::SecurityContext;

// ============================================================================
// Constants
// ============================================================================

/// NAS security bearer (always 0 for NAS)
pub const NAS_SECURITY_BEARER: u8 = 0;

/// Security header length: octet 1, MAC, sequence number
pub const NAS_SECURITY_HEADER_LEN: usize = 2 + NAS_MAC_LEN;

// ============================================================================
// Security Header Type
// ============================================================================

/// Security header type (TS 24.301 Section 9.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecurityHeaderType {
    /// Plain NAS message
    Plain = 0,
    /// Integrity protected
    IntegrityProtected = 1,
    /// Integrity protected and ciphered
    IntegrityProtectedCiphered = 2,
    /// Integrity protected with new EPS security context
    IntegrityProtectedNewContext = 3,
    /// Integrity protected and ciphered with new EPS security context
    IntegrityProtectedCipheredNewContext = 4,
}

impl TryFrom<u8> for SecurityHeaderType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::IntegrityProtected),
            2 => Ok(Self::IntegrityProtectedCiphered),
            3 => Ok(Self::IntegrityProtectedNewContext),
            4 => Ok(Self::IntegrityProtectedCipheredNewContext),
            _ => Err(CodecError::InvalidSecurityHeaderType(value)),
        }
    }
}

impl SecurityHeaderType {
    /// Check if the header refers to a new security context
    pub fn is_new_context(&self) -> bool {
        matches!(
            self,
            Self::IntegrityProtectedNewContext | Self::IntegrityProtectedCipheredNewContext
        )
    }

    /// Check if the payload is ciphered
    pub fn is_ciphered(&self) -> bool {
        matches!(
            self,
            Self::IntegrityProtectedCiphered | Self::IntegrityProtectedCipheredNewContext
        )
    }
}

/// Pick the minimal sufficient header for an outbound message
///
/// Without a key set the message goes out plain. A message taking a new
/// context into use (security mode command) is integrity protected with the
/// new-context header and never ciphered. Otherwise a valid context protects
/// the message, ciphered unless the null ciphering algorithm was selected.
pub fn select_header_type(ctx: &SecurityContext, new_context: bool) -> SecurityHeaderType {
    if !ctx.has_key() || !ctx.keys_derived {
        return SecurityHeaderType::Plain;
    }
    if new_context {
        return SecurityHeaderType::IntegrityProtectedNewContext;
    }
    if !ctx.is_valid() {
        return SecurityHeaderType::Plain;
    }
    if ctx.eea != 0 {
        SecurityHeaderType::IntegrityProtectedCiphered
    } else {
        SecurityHeaderType::IntegrityProtected
    }
}

// ============================================================================
// Unprotected message policy
// ============================================================================

/// Messages the network processes without integrity protection
/// (TS 24.301 Section 4.4.4.3)
pub fn is_allowed_unprotected(msg: &NasMessage) -> bool {
    matches!(
        msg,
        NasMessage::Emm(
            EmmMessage::AttachRequest { .. }
                | EmmMessage::IdentityResponse { .. }
                | EmmMessage::AuthenticationResponse { .. }
                | EmmMessage::AuthenticationFailure { .. }
                | EmmMessage::SecurityModeReject { .. }
                | EmmMessage::DetachRequestUl { .. }
                | EmmMessage::DetachAccept
                | EmmMessage::TauRequest { .. }
        )
    )
}

// ============================================================================
// Protect
// ============================================================================

fn take_count(ctx: &mut SecurityContext, direction: Direction) -> u32 {
    match direction {
        Direction::Downlink => ctx.take_downlink_count(),
        Direction::Uplink => {
            let count = ctx.ul_count.value();
            ctx.ul_count.increment();
            count
        }
    }
}

/// Wrap a plain NAS message in a security header
///
/// Consumes one NAS COUNT of `direction` for protected headers.
pub fn protect(
    ctx: &mut SecurityContext,
    header: SecurityHeaderType,
    plain: &[u8],
    direction: Direction,
) -> Result<Bytes, SecurityError> {
    if header == SecurityHeaderType::Plain {
        return Ok(Bytes::copy_from_slice(plain));
    }
    if !ctx.has_key() || !ctx.keys_derived {
        return Err(SecurityError::NoSecurityContext);
    }

    let count = take_count(ctx, direction);
    let seq = (count & 0xff) as u8;

    let mut body = plain.to_vec();
    if header.is_ciphered() {
        nas_eea(ctx.eea, &ctx.knas_enc, count, NAS_SECURITY_BEARER, direction.bit(), &mut body)?;
    }

    let mut mac_input = Vec::with_capacity(body.len() + 1);
    mac_input.push(seq);
    mac_input.extend_from_slice(&body);
    let mac = nas_eia(ctx.eia, &ctx.knas_int, count, NAS_SECURITY_BEARER, direction.bit(), &mac_input)?;

    let mut buf = BytesMut::with_capacity(NAS_SECURITY_HEADER_LEN + body.len());
    buf.put_u8(((header as u8) << 4) | PD_EMM);
    buf.put_slice(&mac);
    buf.put_u8(seq);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

// ============================================================================
// Unprotect
// ============================================================================

/// Integrity verdict of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// Not protected, or protection could not be verified; only messages on
    /// the unprotected allow-list get this far
    NotProtected,
    /// Verified against the current security context
    Verified,
    /// Verified against the non-current (new) security context
    NewContextVerified,
}

/// Inbound NAS PDU after the security gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPdu {
    /// Received security header type
    pub header_type: SecurityHeaderType,
    /// Integrity verdict
    pub integrity: Integrity,
    /// Plain message
    pub message: NasMessage,
}

fn verify(
    ctx: &mut SecurityContext,
    header: SecurityHeaderType,
    pdu: &[u8],
    direction: Direction,
) -> NasResult<NasMessage> {
    if !ctx.has_key() || !ctx.keys_derived {
        return Err(SecurityError::NoSecurityContext.into());
    }
    let received = u32::from_be_bytes([pdu[1], pdu[2], pdu[3], pdu[4]]);
    let seq = pdu[5];

    ctx.with_uplink_count(seq, |ctx, count| {
        let mac = nas_eia(ctx.eia, &ctx.knas_int, count, NAS_SECURITY_BEARER, direction.bit(), &pdu[5..])?;
        let computed = u32::from_be_bytes(mac);
        if computed != received {
            return Err(NasError::from(SecurityError::MacMismatch { computed, received }));
        }

        let mut body = pdu[NAS_SECURITY_HEADER_LEN..].to_vec();
        if header.is_ciphered() {
            nas_eea(ctx.eea, &ctx.knas_enc, count, NAS_SECURITY_BEARER, direction.bit(), &mut body)?;
        }
        Ok(NasMessage::decode(&body, direction)?)
    })
}

/// Run an inbound PDU through the security gate
///
/// A message is handed on only if its MAC verifies against the context named
/// by the header, or if it is on the unprotected allow-list. Every rejection
/// happens before any counter moves.
pub fn unprotect(
    current: &mut SecurityContext,
    non_current: Option<&mut SecurityContext>,
    pdu: &[u8],
    direction: Direction,
) -> NasResult<DecodedPdu> {
    let first = *pdu.first().ok_or(CodecError::BufferTooShort { expected: 2, actual: 0 })?;

    let header_type = if first & 0x0f == PD_EMM {
        SecurityHeaderType::try_from(first >> 4)?
    } else {
        SecurityHeaderType::Plain
    };

    if header_type == SecurityHeaderType::Plain {
        let message = NasMessage::decode(pdu, direction)?;
        if !is_allowed_unprotected(&message) {
            return Err(SecurityError::ProtectionRequired(message.message_type()).into());
        }
        return Ok(DecodedPdu { header_type, integrity: Integrity::NotProtected, message });
    }

    if pdu.len() <= NAS_SECURITY_HEADER_LEN {
        return Err(CodecError::BufferTooShort {
            expected: NAS_SECURITY_HEADER_LEN + 1,
            actual: pdu.len(),
        }
        .into());
    }

    let (ctx, verified) = if header_type.is_new_context() {
        match non_current {
            Some(ctx) => (Some(ctx), Integrity::NewContextVerified),
            None => (None, Integrity::NewContextVerified),
        }
    } else {
        (Some(current), Integrity::Verified)
    };

    let outcome = match ctx {
        Some(ctx) => verify(ctx, header_type, pdu, direction),
        None => Err(SecurityError::NoSecurityContext.into()),
    };

    match outcome {
        Ok(message) => Ok(DecodedPdu { header_type, integrity: verified, message }),
        Err(NasError::Integrity(err)) if !header_type.is_ciphered() => {
            let message = NasMessage::decode(&pdu[NAS_SECURITY_HEADER_LEN..], direction)?;
            if is_allowed_unprotected(&message) {
                log::debug!("Integrity check failed ({}), processing {:#04x} unprotected", err, message.message_type());
                Ok(DecodedPdu { header_type, integrity: Integrity::NotProtected, message })
            } else {
                Err(NasError::Integrity(err))
            }
        }
        Err(err) => Err(err),
    }
}

/// Extract the GUTI an initial NAS message identifies the UE with
///
/// Initial messages are never ciphered, so the payload is readable without a
/// context.
pub fn peek_initial_guti(pdu: &[u8]) -> Option<EpsGuti> {
    let first = *pdu.first()?;
    if first & 0x0f != PD_EMM {
        return None;
    }
    let header = SecurityHeaderType::try_from(first >> 4).ok()?;
    let plain = match header {
        SecurityHeaderType::Plain => pdu,
        h if h.is_ciphered() => return None,
        _ => pdu.get(NAS_SECURITY_HEADER_LEN..)?,
    };
    match NasMessage::decode(plain, Direction::Uplink).ok()? {
        NasMessage::Emm(EmmMessage::AttachRequest { identity: MobileIdentity::Guti(guti), .. })
        | NasMessage::Emm(EmmMessage::DetachRequestUl { identity: MobileIdentity::Guti(guti), .. }) => Some(guti),
        NasMessage::Emm(EmmMessage::TauRequest { old_guti, .. }) => Some(old_guti),
        _ => None,
    }
}
