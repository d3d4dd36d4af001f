//! NAS Message Codec
//!
//! Plain EMM and ESM messages (TS 24.301 Section 8) as used by the NAS core.
//! Only the IEs the core acts upon are carried; optional IEs it does not know
//! are skipped on decode.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::context::{EpsGuti, PlmnId};
use crate::error::{CodecError, EmmCause, EsmCause};
use crate::esm_context::{Ambr, BearerQos, Bitrate, Ebi, Paa, PdnType};
use crate::security::UeNetworkCapability;

/// Protocol discriminator: EPS mobility management
pub const PD_EMM: u8 = 0x07;
/// Protocol discriminator: EPS session management
pub const PD_ESM: u8 = 0x02;

/// Identity type 2 requested in IDENTITY REQUEST (TS 24.301 9.9.3.29)
pub const IDENTITY_TYPE_IMSI: u8 = 1;
/// IMEI
pub const IDENTITY_TYPE_IMEI: u8 = 2;
/// IMEISV
pub const IDENTITY_TYPE_IMEISV: u8 = 3;
/// GUTI
pub const IDENTITY_TYPE_GUTI: u8 = 6;

/// EPS attach result: EPS only
pub const EPS_ATTACH_RESULT_EPS: u8 = 1;
/// EPS update result: TA updated
pub const EPS_UPDATE_RESULT_TA_UPDATED: u8 = 0;

/// Detach type: EPS detach
pub const DETACH_TYPE_EPS: u8 = 1;
/// Detach type: IMSI detach
pub const DETACH_TYPE_IMSI: u8 = 2;
/// Detach type: combined EPS/IMSI detach
pub const DETACH_TYPE_COMBINED: u8 = 3;
/// Downlink detach type: re-attach required
pub const DETACH_TYPE_REATTACH_REQUIRED: u8 = 1;
/// Downlink detach type: re-attach not required
pub const DETACH_TYPE_REATTACH_NOT_REQUIRED: u8 = 2;

/// Message direction, needed where uplink and downlink layouts differ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// UE to network
    Uplink,
    /// Network to UE
    Downlink,
}

impl Direction {
    /// Direction bit used by the NAS security algorithms
    pub fn bit(&self) -> u8 {
        match self {
            Direction::Uplink => 0,
            Direction::Downlink => 1,
        }
    }
}

// ============================================================================
// Message types
// ============================================================================

/// EMM message types (TS 24.301 Section 9.8)
pub mod emm_type {
    pub const ATTACH_REQUEST: u8 = 0x41;
    pub const ATTACH_ACCEPT: u8 = 0x42;
    pub const ATTACH_COMPLETE: u8 = 0x43;
    pub const ATTACH_REJECT: u8 = 0x44;
    pub const DETACH_REQUEST: u8 = 0x45;
    pub const DETACH_ACCEPT: u8 = 0x46;
    pub const TAU_REQUEST: u8 = 0x48;
    pub const TAU_ACCEPT: u8 = 0x49;
    pub const TAU_COMPLETE: u8 = 0x4a;
    pub const TAU_REJECT: u8 = 0x4b;
    pub const AUTHENTICATION_REQUEST: u8 = 0x52;
    pub const AUTHENTICATION_RESPONSE: u8 = 0x53;
    pub const AUTHENTICATION_REJECT: u8 = 0x54;
    pub const IDENTITY_REQUEST: u8 = 0x55;
    pub const IDENTITY_RESPONSE: u8 = 0x56;
    pub const AUTHENTICATION_FAILURE: u8 = 0x5c;
    pub const SECURITY_MODE_COMMAND: u8 = 0x5d;
    pub const SECURITY_MODE_COMPLETE: u8 = 0x5e;
    pub const SECURITY_MODE_REJECT: u8 = 0x5f;
    pub const EMM_STATUS: u8 = 0x60;
}

/// ESM message types (TS 24.301 Section 9.8)
pub mod esm_type {
    pub const ACTIVATE_DEFAULT_BEARER_REQUEST: u8 = 0xc1;
    pub const ACTIVATE_DEFAULT_BEARER_ACCEPT: u8 = 0xc2;
    pub const ACTIVATE_DEFAULT_BEARER_REJECT: u8 = 0xc3;
    pub const ACTIVATE_DEDICATED_BEARER_REQUEST: u8 = 0xc5;
    pub const ACTIVATE_DEDICATED_BEARER_ACCEPT: u8 = 0xc6;
    pub const ACTIVATE_DEDICATED_BEARER_REJECT: u8 = 0xc7;
    pub const MODIFY_BEARER_REQUEST: u8 = 0xc9;
    pub const MODIFY_BEARER_ACCEPT: u8 = 0xca;
    pub const MODIFY_BEARER_REJECT: u8 = 0xcb;
    pub const DEACTIVATE_BEARER_REQUEST: u8 = 0xcd;
    pub const DEACTIVATE_BEARER_ACCEPT: u8 = 0xce;
    pub const PDN_CONNECTIVITY_REQUEST: u8 = 0xd0;
    pub const PDN_CONNECTIVITY_REJECT: u8 = 0xd1;
    pub const PDN_DISCONNECT_REQUEST: u8 = 0xd2;
    pub const PDN_DISCONNECT_REJECT: u8 = 0xd3;
    pub const ESM_STATUS: u8 = 0xe8;
}

// ============================================================================
// Decode helpers
// ============================================================================

fn need(buf: &Bytes, expected: usize) -> Result<(), CodecError> {
    if buf.remaining() < expected {
        return Err(CodecError::BufferTooShort { expected, actual: buf.remaining() });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_array<const N: usize>(buf: &mut Bytes) -> Result<[u8; N], CodecError> {
    need(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_lv(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u8(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_lv_e(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn put_lv(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

fn put_lv_e(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

/// Skip an unknown optional IE; half-octet IEs (IEI 0x8_-0xF_) carry no length
fn skip_optional(buf: &mut Bytes, iei: u8) -> Result<(), CodecError> {
    if iei >= 0x80 {
        return Ok(());
    }
    get_lv(buf).map(|_| ())
}

/// Unknown EMM causes received from the UE are treated as protocol error
fn emm_cause(value: u8) -> EmmCause {
    EmmCause::try_from(value).unwrap_or(EmmCause::ProtocolErrorUnspecified)
}

fn esm_cause(value: u8) -> EsmCause {
    EsmCause::try_from(value).unwrap_or(EsmCause::ProtocolErrorUnspecified)
}

// ============================================================================
// Mobile identity (TS 24.301 9.9.3.12 / TS 24.008 10.5.1.4)
// ============================================================================

/// EPS mobile identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobileIdentity {
    /// IMSI digits
    Imsi(String),
    /// GUTI
    Guti(EpsGuti),
    /// IMEI digits
    Imei(String),
    /// IMEISV digits
    Imeisv(String),
}

impl MobileIdentity {
    fn encode_digits(buf: &mut BytesMut, digits: &str, identity_type: u8) {
        let digits: Vec<u8> = digits.bytes().filter(u8::is_ascii_digit).map(|d| d - b'0').collect();
        let odd = digits.len() % 2 == 1;
        let mut value = Vec::with_capacity(digits.len() / 2 + 1);
        let first = digits.first().copied().unwrap_or(0);
        let odd_flag = if odd { 0x08 } else { 0 };
        value.push((first << 4) | odd_flag | identity_type);
        for pair in digits[1.min(digits.len())..].chunks(2) {
            let low = pair[0];
            let high = pair.get(1).copied().unwrap_or(0x0f);
            value.push((high << 4) | low);
        }
        put_lv(buf, &value);
    }

    fn decode_digits(value: &[u8]) -> String {
        let mut digits = String::new();
        let Some(first) = value.first() else {
            return digits;
        };
        let odd = first & 0x08 != 0;
        digits.push(char::from(b'0' + (first >> 4)));
        for (i, octet) in value[1..].iter().enumerate() {
            digits.push(char::from(b'0' + (octet & 0x0f)));
            let high = octet >> 4;
            let last = i == value.len() - 2;
            if high != 0x0f && !(last && !odd) {
                digits.push(char::from(b'0' + high));
            }
        }
        digits
    }

    /// Encode as LV
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            MobileIdentity::Imsi(imsi) => Self::encode_digits(buf, imsi, IDENTITY_TYPE_IMSI),
            MobileIdentity::Imei(imei) => Self::encode_digits(buf, imei, IDENTITY_TYPE_IMEI),
            MobileIdentity::Imeisv(imeisv) => Self::encode_digits(buf, imeisv, IDENTITY_TYPE_IMEISV),
            MobileIdentity::Guti(guti) => {
                let mut value = Vec::with_capacity(11);
                value.push(0xf0 | IDENTITY_TYPE_GUTI);
                value.extend_from_slice(&guti.plmn_id.to_bytes());
                value.extend_from_slice(&guti.mme_gid.to_be_bytes());
                value.push(guti.mme_code);
                value.extend_from_slice(&guti.m_tmsi.to_be_bytes());
                put_lv(buf, &value);
            }
        }
    }

    /// Decode from LV
    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let value = get_lv(buf)?;
        let first = *value.first().ok_or(CodecError::InvalidIe("mobile identity"))?;
        match first & 0x07 {
            IDENTITY_TYPE_IMSI => Ok(MobileIdentity::Imsi(Self::decode_digits(&value))),
            IDENTITY_TYPE_IMEI => Ok(MobileIdentity::Imei(Self::decode_digits(&value))),
            IDENTITY_TYPE_IMEISV => Ok(MobileIdentity::Imeisv(Self::decode_digits(&value))),
            IDENTITY_TYPE_GUTI => {
                if value.len() != 11 {
                    return Err(CodecError::InvalidIe("GUTI"));
                }
                Ok(MobileIdentity::Guti(EpsGuti {
                    plmn_id: PlmnId::from_bytes([value[1], value[2], value[3]]),
                    mme_gid: u16::from_be_bytes([value[4], value[5]]),
                    mme_code: value[6],
                    m_tmsi: u32::from_be_bytes([value[7], value[8], value[9], value[10]]),
                }))
            }
            other => Err(CodecError::InvalidMobileIdentityType(other)),
        }
    }
}

fn encode_ue_capability(buf: &mut BytesMut, cap: &UeNetworkCapability) {
    put_lv(buf, &[cap.eea, cap.eia]);
}

fn decode_ue_capability(buf: &mut Bytes) -> Result<UeNetworkCapability, CodecError> {
    let value = get_lv(buf)?;
    if value.len() < 2 {
        return Err(CodecError::InvalidIe("UE network capability"));
    }
    Ok(UeNetworkCapability::new(value[0], value[1]))
}

// ============================================================================
// EMM messages
// ============================================================================

/// EMM message (plain)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmMessage {
    AttachRequest {
        eps_attach_type: u8,
        nas_ksi: u8,
        identity: MobileIdentity,
        ue_network_capability: UeNetworkCapability,
        esm_container: Bytes,
    },
    AttachAccept {
        result: u8,
        t3412: u8,
        guti: Option<EpsGuti>,
        esm_container: Bytes,
    },
    AttachComplete {
        esm_container: Bytes,
    },
    AttachReject {
        cause: EmmCause,
        esm_container: Option<Bytes>,
    },
    /// UE originating detach
    DetachRequestUl {
        detach_type: u8,
        switch_off: bool,
        nas_ksi: u8,
        identity: MobileIdentity,
    },
    /// UE terminated detach
    DetachRequestDl {
        detach_type: u8,
        cause: Option<EmmCause>,
    },
    DetachAccept,
    TauRequest {
        update_type: u8,
        nas_ksi: u8,
        old_guti: EpsGuti,
        ue_network_capability: Option<UeNetworkCapability>,
    },
    TauAccept {
        result: u8,
        guti: Option<EpsGuti>,
    },
    TauComplete,
    TauReject {
        cause: EmmCause,
    },
    AuthenticationRequest {
        nas_ksi: u8,
        rand: [u8; 16],
        autn: [u8; 16],
    },
    AuthenticationResponse {
        res: Bytes,
    },
    AuthenticationReject,
    AuthenticationFailure {
        cause: EmmCause,
        auts: Option<[u8; 14]>,
    },
    IdentityRequest {
        identity_type: u8,
    },
    IdentityResponse {
        identity: MobileIdentity,
    },
    SecurityModeCommand {
        eea: u8,
        eia: u8,
        nas_ksi: u8,
        replayed_capability: UeNetworkCapability,
        imeisv_request: bool,
    },
    SecurityModeComplete {
        imeisv: Option<MobileIdentity>,
    },
    SecurityModeReject {
        cause: EmmCause,
    },
    EmmStatus {
        cause: EmmCause,
    },
}

impl EmmMessage {
    /// Message type octet
    pub fn message_type(&self) -> u8 {
        use emm_type::*;
        match self {
            EmmMessage::AttachRequest { .. } => ATTACH_REQUEST,
            EmmMessage::AttachAccept { .. } => ATTACH_ACCEPT,
            EmmMessage::AttachComplete { .. } => ATTACH_COMPLETE,
            EmmMessage::AttachReject { .. } => ATTACH_REJECT,
            EmmMessage::DetachRequestUl { .. } | EmmMessage::DetachRequestDl { .. } => DETACH_REQUEST,
            EmmMessage::DetachAccept => DETACH_ACCEPT,
            EmmMessage::TauRequest { .. } => TAU_REQUEST,
            EmmMessage::TauAccept { .. } => TAU_ACCEPT,
            EmmMessage::TauComplete => TAU_COMPLETE,
            EmmMessage::TauReject { .. } => TAU_REJECT,
            EmmMessage::AuthenticationRequest { .. } => AUTHENTICATION_REQUEST,
            EmmMessage::AuthenticationResponse { .. } => AUTHENTICATION_RESPONSE,
            EmmMessage::AuthenticationReject => AUTHENTICATION_REJECT,
            EmmMessage::AuthenticationFailure { .. } => AUTHENTICATION_FAILURE,
            EmmMessage::IdentityRequest { .. } => IDENTITY_REQUEST,
            EmmMessage::IdentityResponse { .. } => IDENTITY_RESPONSE,
            EmmMessage::SecurityModeCommand { .. } => SECURITY_MODE_COMMAND,
            EmmMessage::SecurityModeComplete { .. } => SECURITY_MODE_COMPLETE,
            EmmMessage::SecurityModeReject { .. } => SECURITY_MODE_REJECT,
            EmmMessage::EmmStatus { .. } => EMM_STATUS,
        }
    }

    /// Encode the message body (without header)
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            EmmMessage::AttachRequest {
                eps_attach_type,
                nas_ksi,
                identity,
                ue_network_capability,
                esm_container,
            } => {
                buf.put_u8((nas_ksi << 4) | (eps_attach_type & 0x07));
                identity.encode(buf);
                encode_ue_capability(buf, ue_network_capability);
                put_lv_e(buf, esm_container);
            }
            EmmMessage::AttachAccept { result, t3412, guti, esm_container } => {
                buf.put_u8(result & 0x07);
                buf.put_u8(*t3412);
                put_lv_e(buf, esm_container);
                if let Some(guti) = guti {
                    buf.put_u8(0x50);
                    MobileIdentity::Guti(*guti).encode(buf);
                }
            }
            EmmMessage::AttachComplete { esm_container } => put_lv_e(buf, esm_container),
            EmmMessage::AttachReject { cause, esm_container } => {
                buf.put_u8(*cause as u8);
                if let Some(esm) = esm_container {
                    buf.put_u8(0x78);
                    put_lv_e(buf, esm);
                }
            }
            EmmMessage::DetachRequestUl { detach_type, switch_off, nas_ksi, identity } => {
                let switch_off = if *switch_off { 0x08 } else { 0 };
                buf.put_u8((nas_ksi << 4) | switch_off | (detach_type & 0x07));
                identity.encode(buf);
            }
            EmmMessage::DetachRequestDl { detach_type, cause } => {
                buf.put_u8(detach_type & 0x07);
                if let Some(cause) = cause {
                    buf.put_u8(0x53);
                    buf.put_u8(*cause as u8);
                }
            }
            EmmMessage::DetachAccept | EmmMessage::TauComplete | EmmMessage::AuthenticationReject => {}
            EmmMessage::TauRequest { update_type, nas_ksi, old_guti, ue_network_capability } => {
                buf.put_u8((nas_ksi << 4) | (update_type & 0x0f));
                MobileIdentity::Guti(*old_guti).encode(buf);
                if let Some(cap) = ue_network_capability {
                    buf.put_u8(0x58);
                    encode_ue_capability(buf, cap);
                }
            }
            EmmMessage::TauAccept { result, guti } => {
                buf.put_u8(result & 0x07);
                if let Some(guti) = guti {
                    buf.put_u8(0x50);
                    MobileIdentity::Guti(*guti).encode(buf);
                }
            }
            EmmMessage::TauReject { cause }
            | EmmMessage::SecurityModeReject { cause }
            | EmmMessage::EmmStatus { cause } => buf.put_u8(*cause as u8),
            EmmMessage::AuthenticationRequest { nas_ksi, rand, autn } => {
                buf.put_u8(nas_ksi & 0x0f);
                buf.put_slice(rand);
                put_lv(buf, autn);
            }
            EmmMessage::AuthenticationResponse { res } => put_lv(buf, res),
            EmmMessage::AuthenticationFailure { cause, auts } => {
                buf.put_u8(*cause as u8);
                if let Some(auts) = auts {
                    buf.put_u8(0x30);
                    put_lv(buf, auts);
                }
            }
            EmmMessage::IdentityRequest { identity_type } => buf.put_u8(identity_type & 0x07),
            EmmMessage::IdentityResponse { identity } => identity.encode(buf),
            EmmMessage::SecurityModeCommand { eea, eia, nas_ksi, replayed_capability, imeisv_request } => {
                buf.put_u8(((eea & 0x07) << 4) | (eia & 0x07));
                buf.put_u8(nas_ksi & 0x0f);
                encode_ue_capability(buf, replayed_capability);
                if *imeisv_request {
                    buf.put_u8(0xc1);
                }
            }
            EmmMessage::SecurityModeComplete { imeisv } => {
                if let Some(imeisv) = imeisv {
                    buf.put_u8(0x23);
                    imeisv.encode(buf);
                }
            }
        }
    }

    /// Decode the message body for `message_type`
    pub fn decode_body(message_type: u8, buf: &mut Bytes, direction: Direction) -> Result<Self, CodecError> {
        use emm_type::*;
        let msg = match message_type {
            ATTACH_REQUEST => {
                let octet = get_u8(buf)?;
                EmmMessage::AttachRequest {
                    eps_attach_type: octet & 0x07,
                    nas_ksi: octet >> 4,
                    identity: MobileIdentity::decode(buf)?,
                    ue_network_capability: decode_ue_capability(buf)?,
                    esm_container: get_lv_e(buf)?,
                }
            }
            ATTACH_ACCEPT => {
                let result = get_u8(buf)? & 0x07;
                let t3412 = get_u8(buf)?;
                let esm_container = get_lv_e(buf)?;
                let mut guti = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x50 => match MobileIdentity::decode(buf)? {
                            MobileIdentity::Guti(g) => guti = Some(g),
                            _ => return Err(CodecError::InvalidIe("GUTI")),
                        },
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::AttachAccept { result, t3412, guti, esm_container }
            }
            ATTACH_COMPLETE => EmmMessage::AttachComplete { esm_container: get_lv_e(buf)? },
            ATTACH_REJECT => {
                let cause = emm_cause(get_u8(buf)?);
                let mut esm_container = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x78 => esm_container = Some(get_lv_e(buf)?),
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::AttachReject { cause, esm_container }
            }
            DETACH_REQUEST => match direction {
                Direction::Uplink => {
                    let octet = get_u8(buf)?;
                    EmmMessage::DetachRequestUl {
                        detach_type: octet & 0x07,
                        switch_off: octet & 0x08 != 0,
                        nas_ksi: octet >> 4,
                        identity: MobileIdentity::decode(buf)?,
                    }
                }
                Direction::Downlink => {
                    let detach_type = get_u8(buf)? & 0x07;
                    let mut cause = None;
                    while buf.has_remaining() {
                        match get_u8(buf)? {
                            0x53 => cause = Some(emm_cause(get_u8(buf)?)),
                            iei => skip_optional(buf, iei)?,
                        }
                    }
                    EmmMessage::DetachRequestDl { detach_type, cause }
                }
            },
            DETACH_ACCEPT => EmmMessage::DetachAccept,
            TAU_REQUEST => {
                let octet = get_u8(buf)?;
                let old_guti = match MobileIdentity::decode(buf)? {
                    MobileIdentity::Guti(guti) => guti,
                    _ => return Err(CodecError::InvalidIe("old GUTI")),
                };
                let mut ue_network_capability = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x58 => ue_network_capability = Some(decode_ue_capability(buf)?),
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::TauRequest {
                    update_type: octet & 0x0f,
                    nas_ksi: octet >> 4,
                    old_guti,
                    ue_network_capability,
                }
            }
            TAU_ACCEPT => {
                let result = get_u8(buf)? & 0x07;
                let mut guti = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x50 => match MobileIdentity::decode(buf)? {
                            MobileIdentity::Guti(g) => guti = Some(g),
                            _ => return Err(CodecError::InvalidIe("GUTI")),
                        },
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::TauAccept { result, guti }
            }
            TAU_COMPLETE => EmmMessage::TauComplete,
            TAU_REJECT => EmmMessage::TauReject { cause: emm_cause(get_u8(buf)?) },
            AUTHENTICATION_REQUEST => {
                let nas_ksi = get_u8(buf)? & 0x0f;
                let rand = get_array::<16>(buf)?;
                let autn_lv = get_lv(buf)?;
                let autn = <[u8; 16]>::try_from(&autn_lv[..]).map_err(|_| CodecError::InvalidIe("AUTN"))?;
                EmmMessage::AuthenticationRequest { nas_ksi, rand, autn }
            }
            AUTHENTICATION_RESPONSE => {
                let res = get_lv(buf)?;
                if !(4..=16).contains(&res.len()) {
                    return Err(CodecError::InvalidIe("RES"));
                }
                EmmMessage::AuthenticationResponse { res }
            }
            AUTHENTICATION_REJECT => EmmMessage::AuthenticationReject,
            AUTHENTICATION_FAILURE => {
                let cause = emm_cause(get_u8(buf)?);
                let mut auts = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x30 => {
                            let value = get_lv(buf)?;
                            auts = Some(
                                <[u8; 14]>::try_from(&value[..]).map_err(|_| CodecError::InvalidIe("AUTS"))?,
                            );
                        }
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::AuthenticationFailure { cause, auts }
            }
            IDENTITY_REQUEST => EmmMessage::IdentityRequest { identity_type: get_u8(buf)? & 0x07 },
            IDENTITY_RESPONSE => EmmMessage::IdentityResponse { identity: MobileIdentity::decode(buf)? },
            SECURITY_MODE_COMMAND => {
                let algs = get_u8(buf)?;
                let nas_ksi = get_u8(buf)? & 0x0f;
                let replayed_capability = decode_ue_capability(buf)?;
                let mut imeisv_request = false;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        iei if iei & 0xf0 == 0xc0 => imeisv_request = iei & 0x07 == 1,
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::SecurityModeCommand {
                    eea: (algs >> 4) & 0x07,
                    eia: algs & 0x07,
                    nas_ksi,
                    replayed_capability,
                    imeisv_request,
                }
            }
            SECURITY_MODE_COMPLETE => {
                let mut imeisv = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x23 => imeisv = Some(MobileIdentity::decode(buf)?),
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EmmMessage::SecurityModeComplete { imeisv }
            }
            SECURITY_MODE_REJECT => EmmMessage::SecurityModeReject { cause: emm_cause(get_u8(buf)?) },
            EMM_STATUS => EmmMessage::EmmStatus { cause: emm_cause(get_u8(buf)?) },
            other => return Err(CodecError::InvalidMessageType(other)),
        };
        Ok(msg)
    }
}

// ============================================================================
// ESM messages
// ============================================================================

fn encode_qos(buf: &mut BytesMut, qos: &BearerQos) {
    let mut value = BytesMut::with_capacity(17);
    value.put_u8(qos.qci);
    if qos.mbr != Bitrate::default() || qos.gbr != Bitrate::default() {
        for bps in [qos.mbr.uplink, qos.mbr.downlink, qos.gbr.uplink, qos.gbr.downlink] {
            value.put_u32((bps / 1000).min(u32::MAX as u64) as u32);
        }
    }
    put_lv(buf, &value);
}

fn decode_qos(buf: &mut Bytes) -> Result<BearerQos, CodecError> {
    let mut value = get_lv(buf)?;
    let qci = get_u8(&mut value)?;
    let mut qos = BearerQos { qci, ..Default::default() };
    if value.has_remaining() {
        need(&value, 16)?;
        qos.mbr = Bitrate { uplink: value.get_u32() as u64 * 1000, downlink: value.get_u32() as u64 * 1000 };
        qos.gbr = Bitrate { uplink: value.get_u32() as u64 * 1000, downlink: value.get_u32() as u64 * 1000 };
    }
    Ok(qos)
}

fn encode_paa(buf: &mut BytesMut, paa: &Paa) {
    let mut value = BytesMut::with_capacity(22);
    value.put_u8(paa.pdn_type() as u8);
    match paa {
        Paa::Ipv4(v4) => value.put_slice(&v4.octets()),
        Paa::Ipv6 { prefix, prefix_len } => {
            value.put_u8(*prefix_len);
            value.put_slice(&prefix.octets());
        }
        Paa::Ipv4v6 { ipv4, prefix, prefix_len } => {
            value.put_u8(*prefix_len);
            value.put_slice(&prefix.octets());
            value.put_slice(&ipv4.octets());
        }
    }
    put_lv(buf, &value);
}

fn decode_paa(buf: &mut Bytes) -> Result<Paa, CodecError> {
    let mut value = get_lv(buf)?;
    let pdn_type = PdnType::try_from(get_u8(&mut value)? & 0x07)?;
    let paa = match pdn_type {
        PdnType::Ipv4 => Paa::Ipv4(Ipv4Addr::from(get_array::<4>(&mut value)?)),
        PdnType::Ipv6 => {
            let prefix_len = get_u8(&mut value)?;
            Paa::Ipv6 { prefix: Ipv6Addr::from(get_array::<16>(&mut value)?), prefix_len }
        }
        PdnType::Ipv4v6 => {
            let prefix_len = get_u8(&mut value)?;
            let prefix = Ipv6Addr::from(get_array::<16>(&mut value)?);
            Paa::Ipv4v6 { ipv4: Ipv4Addr::from(get_array::<4>(&mut value)?), prefix, prefix_len }
        }
    };
    if matches!(paa, Paa::Ipv6 { prefix_len, .. } | Paa::Ipv4v6 { prefix_len, .. } if prefix_len > 128) {
        return Err(CodecError::InvalidIe("PAA prefix length"));
    }
    Ok(paa)
}

fn encode_ambr(buf: &mut BytesMut, ambr: &Ambr) {
    let mut value = [0u8; 8];
    value[..4].copy_from_slice(&((ambr.uplink / 1000).min(u32::MAX as u64) as u32).to_be_bytes());
    value[4..].copy_from_slice(&((ambr.downlink / 1000).min(u32::MAX as u64) as u32).to_be_bytes());
    put_lv(buf, &value);
}

fn decode_ambr(buf: &mut Bytes) -> Result<Ambr, CodecError> {
    let mut value = get_lv(buf)?;
    need(&value, 8)?;
    Ok(Ambr {
        uplink: value.get_u32() as u64 * 1000,
        downlink: value.get_u32() as u64 * 1000,
    })
}

fn decode_apn(buf: &mut Bytes) -> Result<String, CodecError> {
    let value = get_lv(buf)?;
    String::from_utf8(value.to_vec()).map_err(|_| CodecError::InvalidIe("APN"))
}

/// ESM message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsmBody {
    PdnConnectivityRequest {
        pdn_type: PdnType,
        request_type: u8,
        apn: Option<String>,
    },
    PdnConnectivityReject {
        cause: EsmCause,
    },
    PdnDisconnectRequest {
        linked_ebi: Ebi,
    },
    PdnDisconnectReject {
        cause: EsmCause,
    },
    ActivateDefaultBearerRequest {
        qos: BearerQos,
        apn: String,
        paa: Paa,
        ambr: Ambr,
    },
    ActivateDefaultBearerAccept,
    ActivateDefaultBearerReject {
        cause: EsmCause,
    },
    ActivateDedicatedBearerRequest {
        linked_ebi: Ebi,
        qos: BearerQos,
        tft: Bytes,
    },
    ActivateDedicatedBearerAccept,
    ActivateDedicatedBearerReject {
        cause: EsmCause,
    },
    ModifyBearerRequest {
        qos: BearerQos,
        tft: Bytes,
    },
    ModifyBearerAccept,
    ModifyBearerReject {
        cause: EsmCause,
    },
    DeactivateBearerRequest {
        cause: EsmCause,
    },
    DeactivateBearerAccept,
    EsmStatus {
        cause: EsmCause,
    },
}

/// ESM message with its header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmMessage {
    /// EPS bearer identity (0 when not bearer specific)
    pub ebi: Ebi,
    /// Procedure transaction identity (0 for network-initiated without PTI)
    pub pti: u8,
    /// Body
    pub body: EsmBody,
}

impl EsmMessage {
    /// Message type octet
    pub fn message_type(&self) -> u8 {
        use esm_type::*;
        match &self.body {
            EsmBody::PdnConnectivityRequest { .. } => PDN_CONNECTIVITY_REQUEST,
            EsmBody::PdnConnectivityReject { .. } => PDN_CONNECTIVITY_REJECT,
            EsmBody::PdnDisconnectRequest { .. } => PDN_DISCONNECT_REQUEST,
            EsmBody::PdnDisconnectReject { .. } => PDN_DISCONNECT_REJECT,
            EsmBody::ActivateDefaultBearerRequest { .. } => ACTIVATE_DEFAULT_BEARER_REQUEST,
            EsmBody::ActivateDefaultBearerAccept => ACTIVATE_DEFAULT_BEARER_ACCEPT,
            EsmBody::ActivateDefaultBearerReject { .. } => ACTIVATE_DEFAULT_BEARER_REJECT,
            EsmBody::ActivateDedicatedBearerRequest { .. } => ACTIVATE_DEDICATED_BEARER_REQUEST,
            EsmBody::ActivateDedicatedBearerAccept => ACTIVATE_DEDICATED_BEARER_ACCEPT,
            EsmBody::ActivateDedicatedBearerReject { .. } => ACTIVATE_DEDICATED_BEARER_REJECT,
            EsmBody::ModifyBearerRequest { .. } => MODIFY_BEARER_REQUEST,
            EsmBody::ModifyBearerAccept => MODIFY_BEARER_ACCEPT,
            EsmBody::ModifyBearerReject { .. } => MODIFY_BEARER_REJECT,
            EsmBody::DeactivateBearerRequest { .. } => DEACTIVATE_BEARER_REQUEST,
            EsmBody::DeactivateBearerAccept => DEACTIVATE_BEARER_ACCEPT,
            EsmBody::EsmStatus { .. } => ESM_STATUS,
        }
    }

    /// Encode header and body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.ebi << 4) | PD_ESM);
        buf.put_u8(self.pti);
        buf.put_u8(self.message_type());
        match &self.body {
            EsmBody::PdnConnectivityRequest { pdn_type, request_type, apn } => {
                buf.put_u8(((*pdn_type as u8) << 4) | (request_type & 0x07));
                if let Some(apn) = apn {
                    buf.put_u8(0x28);
                    put_lv(buf, apn.as_bytes());
                }
            }
            EsmBody::PdnDisconnectRequest { linked_ebi } => buf.put_u8(linked_ebi & 0x0f),
            EsmBody::PdnConnectivityReject { cause }
            | EsmBody::PdnDisconnectReject { cause }
            | EsmBody::ActivateDefaultBearerReject { cause }
            | EsmBody::ActivateDedicatedBearerReject { cause }
            | EsmBody::ModifyBearerReject { cause }
            | EsmBody::DeactivateBearerRequest { cause }
            | EsmBody::EsmStatus { cause } => buf.put_u8(*cause as u8),
            EsmBody::ActivateDefaultBearerRequest { qos, apn, paa, ambr } => {
                encode_qos(buf, qos);
                put_lv(buf, apn.as_bytes());
                encode_paa(buf, paa);
                encode_ambr(buf, ambr);
            }
            EsmBody::ActivateDedicatedBearerRequest { linked_ebi, qos, tft } => {
                buf.put_u8(linked_ebi & 0x0f);
                encode_qos(buf, qos);
                put_lv(buf, tft);
            }
            EsmBody::ModifyBearerRequest { qos, tft } => {
                encode_qos(buf, qos);
                put_lv(buf, tft);
            }
            EsmBody::ActivateDefaultBearerAccept
            | EsmBody::ActivateDedicatedBearerAccept
            | EsmBody::ModifyBearerAccept
            | EsmBody::DeactivateBearerAccept => {}
        }
    }

    /// Encode to a new buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode header and body
    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        use esm_type::*;
        need(buf, 3)?;
        let octet = buf.get_u8();
        if octet & 0x0f != PD_ESM {
            return Err(CodecError::InvalidProtocolDiscriminator(octet & 0x0f));
        }
        let ebi = octet >> 4;
        let pti = buf.get_u8();
        let body = match buf.get_u8() {
            PDN_CONNECTIVITY_REQUEST => {
                let octet = get_u8(buf)?;
                let mut apn = None;
                while buf.has_remaining() {
                    match get_u8(buf)? {
                        0x28 => apn = Some(decode_apn(buf)?),
                        iei => skip_optional(buf, iei)?,
                    }
                }
                EsmBody::PdnConnectivityRequest {
                    pdn_type: PdnType::try_from((octet >> 4) & 0x07)?,
                    request_type: octet & 0x07,
                    apn,
                }
            }
            PDN_CONNECTIVITY_REJECT => EsmBody::PdnConnectivityReject { cause: esm_cause(get_u8(buf)?) },
            PDN_DISCONNECT_REQUEST => EsmBody::PdnDisconnectRequest { linked_ebi: get_u8(buf)? & 0x0f },
            PDN_DISCONNECT_REJECT => EsmBody::PdnDisconnectReject { cause: esm_cause(get_u8(buf)?) },
            ACTIVATE_DEFAULT_BEARER_REQUEST => EsmBody::ActivateDefaultBearerRequest {
                qos: decode_qos(buf)?,
                apn: decode_apn(buf)?,
                paa: decode_paa(buf)?,
                ambr: decode_ambr(buf)?,
            },
            ACTIVATE_DEFAULT_BEARER_ACCEPT => EsmBody::ActivateDefaultBearerAccept,
            ACTIVATE_DEFAULT_BEARER_REJECT => {
                EsmBody::ActivateDefaultBearerReject { cause: esm_cause(get_u8(buf)?) }
            }
            ACTIVATE_DEDICATED_BEARER_REQUEST => EsmBody::ActivateDedicatedBearerRequest {
                linked_ebi: get_u8(buf)? & 0x0f,
                qos: decode_qos(buf)?,
                tft: get_lv(buf)?,
            },
            ACTIVATE_DEDICATED_BEARER_ACCEPT => EsmBody::ActivateDedicatedBearerAccept,
            ACTIVATE_DEDICATED_BEARER_REJECT => {
                EsmBody::ActivateDedicatedBearerReject { cause: esm_cause(get_u8(buf)?) }
            }
            MODIFY_BEARER_REQUEST => EsmBody::ModifyBearerRequest {
                qos: decode_qos(buf)?,
                tft: get_lv(buf)?,
            },
            MODIFY_BEARER_ACCEPT => EsmBody::ModifyBearerAccept,
            MODIFY_BEARER_REJECT => EsmBody::ModifyBearerReject { cause: esm_cause(get_u8(buf)?) },
            DEACTIVATE_BEARER_REQUEST => EsmBody::DeactivateBearerRequest { cause: esm_cause(get_u8(buf)?) },
            DEACTIVATE_BEARER_ACCEPT => EsmBody::DeactivateBearerAccept,
            ESM_STATUS => EsmBody::EsmStatus { cause: esm_cause(get_u8(buf)?) },
            other => return Err(CodecError::InvalidMessageType(other)),
        };
        Ok(Self { ebi, pti, body })
    }

    /// Decode from a slice
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        Self::decode(&mut Bytes::copy_from_slice(data))
    }
}

// ============================================================================
// NAS message
// ============================================================================

/// Plain NAS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasMessage {
    /// EPS mobility management
    Emm(EmmMessage),
    /// EPS session management
    Esm(EsmMessage),
}

impl NasMessage {
    /// Message type octet
    pub fn message_type(&self) -> u8 {
        match self {
            NasMessage::Emm(msg) => msg.message_type(),
            NasMessage::Esm(msg) => msg.message_type(),
        }
    }

    /// Encode as a plain NAS message
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            NasMessage::Emm(msg) => {
                buf.put_u8(PD_EMM);
                buf.put_u8(msg.message_type());
                msg.encode_body(&mut buf);
            }
            NasMessage::Esm(msg) => msg.encode(&mut buf),
        }
        buf.freeze()
    }

    /// Decode a plain NAS message (security header type 0)
    pub fn decode(data: &[u8], direction: Direction) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(data);
        need(&buf, 2)?;
        let octet = buf.chunk()[0];
        match octet & 0x0f {
            PD_EMM => {
                if octet >> 4 != 0 {
                    return Err(CodecError::InvalidSecurityHeaderType(octet >> 4));
                }
                buf.advance(1);
                let message_type = buf.get_u8();
                Ok(NasMessage::Emm(EmmMessage::decode_body(message_type, &mut buf, direction)?))
            }
            PD_ESM => Ok(NasMessage::Esm(EsmMessage::decode(&mut buf)?)),
            other => Err(CodecError::InvalidProtocolDiscriminator(other)),
        }
    }
}

impl From<EmmMessage> for NasMessage {
    fn from(msg: EmmMessage) -> Self {
        NasMessage::Emm(msg)
    }
}

impl From<EsmMessage> for NasMessage {
    fn from(msg: EsmMessage) -> Self {
        NasMessage::Esm(msg)
    }
}
