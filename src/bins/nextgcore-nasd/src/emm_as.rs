//! EMM-AS SAP
//!
//! Entry point for NAS PDUs from the access stratum. Every PDU passes the
//! security gate before it is routed; a PDU that fails the gate is dropped
//! without touching the subscriber.

use bytes::Bytes;

use crate::context::{EmmContext, MmeUeId};
use crate::error::{CodecError, EmmCause, NasError, NasResult, SecurityError};
use crate::event::{DetachParams, NasPrimitive, TargetId};
use crate::nas_codec::{Direction, EmmMessage, NasMessage};
use crate::nas_security::{peek_initial_guti, unprotect, Integrity};
use crate::nas_task::NasCore;
use crate::sm::EmmState;

/// EMM cause reported for a PDU the codec could not read
fn decode_cause(err: &CodecError) -> EmmCause {
    match err {
        CodecError::InvalidMessageType(_) => EmmCause::MessageTypeNonExistent,
        CodecError::InvalidProtocolDiscriminator(_) | CodecError::InvalidSecurityHeaderType(_) => {
            EmmCause::ProtocolErrorUnspecified
        }
        CodecError::InvalidCause(_) => EmmCause::SemanticallyIncorrectMessage,
        _ => EmmCause::InvalidMandatoryInformation,
    }
}

impl NasCore {
    /// Initial NAS message on a new signalling connection
    ///
    /// A subscriber known under a different handle (by the GUTI it presents)
    /// is moved to the new handle only when the message verifies with that
    /// subscriber's current security context. Anything else is handled on a
    /// fresh context and the known subscriber stays where it is.
    pub(crate) fn establish_request(&mut self, ue_id: MmeUeId, pdu: Bytes) -> NasResult<()> {
        if let Some(guti) = peek_initial_guti(&pdu) {
            if let Some(known) = self.contexts.get_by_guti(&guti) {
                if known != ue_id && !self.contexts.contains(ue_id) {
                    if self.verifies_with(known, &pdu) {
                        log::info!("[ue_id={}] GUTI {} known as ue_id={}, rebinding", ue_id, guti, known);
                        self.rebind(known, ue_id)?;
                    } else {
                        log::warn!(
                            "[ue_id={}] GUTI {} of ue_id={} presented without valid integrity, not rebinding",
                            ue_id,
                            guti,
                            known
                        );
                    }
                }
            }
        }

        let created = !self.contexts.contains(ue_id);
        if created {
            self.contexts.add(EmmContext::new(ue_id));
        }
        self.contexts.get_mut(ue_id)?.connected = true;

        let result = self.data_indication(ue_id, pdu);
        if result.is_err() && created {
            // Nothing was learnt from a rejected initial message
            if let Ok(ctx) = self.contexts.get(ue_id) {
                if ctx.procedures.is_empty() && ctx.state() == EmmState::Deregistered {
                    self.contexts.remove(ue_id);
                }
            }
        }
        result
    }

    /// Trial verification of an initial PDU against the current context of
    /// `known`; the subscriber's counters are not touched
    fn verifies_with(&self, known: MmeUeId, pdu: &[u8]) -> bool {
        let Ok(ctx) = self.contexts.get(known) else {
            return false;
        };
        if !ctx.security.is_valid() {
            return false;
        }
        let mut trial = ctx.security.clone();
        matches!(
            unprotect(&mut trial, None, pdu, Direction::Uplink),
            Ok(decoded) if decoded.integrity == Integrity::Verified
        )
    }

    /// Uplink NAS message
    pub(crate) fn data_indication(&mut self, ue_id: MmeUeId, pdu: Bytes) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let decoded = unprotect(&mut ctx.security, ctx.non_current_security.as_mut(), &pdu, Direction::Uplink);

        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(NasError::Decode(err)) => {
                log::warn!("[ue_id={}] Undecodable NAS message: {}", ue_id, err);
                if ctx.security.is_valid() {
                    self.send_emm_status(ue_id, decode_cause(&err))?;
                }
                return Err(NasError::Decode(err));
            }
            Err(err) => {
                log::warn!("[ue_id={}] NAS message discarded: {}", ue_id, err);
                return Err(err);
            }
        };

        log::debug!(
            "[ue_id={}] Received {:#04x} ({:?}, {:?})",
            ue_id,
            decoded.message.message_type(),
            decoded.header_type,
            decoded.integrity
        );

        match decoded.message {
            NasMessage::Emm(message) => self.emm_message(ue_id, message, decoded.integrity, pdu),
            NasMessage::Esm(message) => self.esm_message(ue_id, message),
        }
    }

    fn emm_message(
        &mut self,
        ue_id: MmeUeId,
        message: EmmMessage,
        integrity: Integrity,
        pdu: Bytes,
    ) -> NasResult<()> {
        match message {
            EmmMessage::AttachRequest {
                eps_attach_type,
                identity,
                ue_network_capability,
                esm_container,
                ..
            } => self.attach_request(ue_id, eps_attach_type, identity, ue_network_capability, esm_container),
            EmmMessage::AttachComplete { esm_container } => self.attach_complete(ue_id, esm_container),
            EmmMessage::DetachRequestUl { detach_type, switch_off, .. } => {
                log::info!(
                    "[ue_id={}] Detach request: type {} switch_off {}",
                    ue_id,
                    detach_type,
                    switch_off
                );
                self.detach(ue_id, DetachParams { detach_type, cause: None, switch_off })
            }
            EmmMessage::DetachAccept => self.detach_accept(ue_id),
            EmmMessage::TauRequest {
                update_type,
                old_guti,
                ue_network_capability,
                ..
            } => self.tau_request(ue_id, update_type, old_guti, ue_network_capability, integrity, pdu),
            EmmMessage::TauComplete => self.tau_complete(ue_id),
            EmmMessage::AuthenticationResponse { res } => self.authentication_response(ue_id, res),
            EmmMessage::AuthenticationFailure { cause, auts } => {
                self.authentication_failure(ue_id, cause, auts)
            }
            EmmMessage::IdentityResponse { identity } => self.identity_response(ue_id, identity),
            EmmMessage::SecurityModeComplete { imeisv } => {
                if integrity != Integrity::NewContextVerified {
                    log::warn!("[ue_id={}] Security mode complete not protected with the new context", ue_id);
                    return Err(SecurityError::NoSecurityContext.into());
                }
                self.security_mode_complete(ue_id, imeisv)
            }
            EmmMessage::SecurityModeReject { cause } => self.security_mode_reject(ue_id, cause),
            EmmMessage::EmmStatus { cause } => {
                log::warn!("[ue_id={}] EMM STATUS received, cause {}", ue_id, cause);
                Ok(())
            }
            other => {
                log::warn!(
                    "[ue_id={}] Downlink-only message {:#04x} received",
                    ue_id,
                    other.message_type()
                );
                self.send_emm_status(ue_id, EmmCause::MessageTypeNotCompatible)
            }
        }
    }

    /// Handover preparation with a fresh NH/NCC pair
    pub(crate) fn handover_required(&mut self, ue_id: MmeUeId, target: TargetId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        if !ctx.security.is_valid() {
            log::warn!("[ue_id={}] Handover without a valid security context", ue_id);
            return Err(SecurityError::NoSecurityContext.into());
        }
        let (nh, ncc) = ctx.security.next_hop()?;
        log::info!("[ue_id={}] Handover required [IMSI:{}] NCC {}", ue_id, ctx.imsi_str(), ncc);
        self.emit(NasPrimitive::HandoverPreparation { ue_id, nh, ncc, target });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NasConfig;
    use crate::context::{EpsTai, PlmnId};
    use crate::security::{SecurityContext, SecurityContextType};

    fn core() -> NasCore {
        NasCore::new(NasConfig::default()).unwrap()
    }

    #[test]
    fn test_garbage_initial_message_leaves_no_context() {
        let mut core = core();
        let result = core.establish_request(3, Bytes::from_static(&[0x07]));
        assert!(matches!(result, Err(NasError::Decode(_))));
        assert!(!core.contexts().contains(3));
    }

    #[test]
    fn test_protected_message_without_context_is_dropped() {
        let mut core = core();
        core.contexts.add(EmmContext::new(3));
        let plain = NasMessage::from(EmmMessage::TauComplete).encode();
        let result = core.data_indication(3, plain);
        assert!(matches!(
            result,
            Err(NasError::Integrity(SecurityError::ProtectionRequired(_)))
        ));
        assert!(core.take_outbound().is_empty());
    }

    #[test]
    fn test_handover_steps_ncc() {
        let mut core = core();
        let mut ctx = EmmContext::new(5);
        let mut security = SecurityContext::new_partial(0, [0x22; 32]);
        security.eia = 2;
        security.derive_nas_keys().unwrap();
        security.ctx_type = SecurityContextType::FullNative;
        security.derive_kenb().unwrap();
        ctx.security = security;
        core.contexts.add(ctx);

        let target = TargetId::Enb {
            plmn_id: PlmnId::new("001", "01"),
            enb_id: 0x1234,
            tai: EpsTai { plmn_id: PlmnId::new("001", "01"), tac: 7 },
        };
        core.handover_required(5, target).unwrap();
        core.handover_required(5, target).unwrap();
        let ncc: Vec<u8> = core
            .take_outbound()
            .into_iter()
            .filter_map(|p| match p {
                NasPrimitive::HandoverPreparation { ncc, .. } => Some(ncc),
                _ => None,
            })
            .collect();
        assert_eq!(ncc, vec![2, 3]);
    }

    #[test]
    fn test_handover_requires_security() {
        let mut core = core();
        core.contexts.add(EmmContext::new(5));
        let target = TargetId::Rnc {
            plmn_id: PlmnId::new("001", "01"),
            lac: 1,
            rac: None,
            rnc_id: 40,
            extended_rnc_id: Some(4096),
        };
        assert!(core.handover_required(5, target).is_err());
    }
}
