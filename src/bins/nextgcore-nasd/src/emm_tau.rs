//! EMM Tracking Area Update Procedure
//!
//! Normal and periodic TAU (TS 24.301 Section 5.5.3). A request that passes
//! integrity with the current context is accepted right away; otherwise the
//! subscriber is re-authenticated, or its context is fetched from the old
//! MME when the GUTI is foreign.

use bytes::Bytes;

use crate::context::{EpsGuti, MmeUeId};
use crate::error::{EmmCause, NasResult, ProcedureError};
use crate::event::NasPrimitive;
use crate::nas_codec::{Direction, EmmMessage, EPS_UPDATE_RESULT_TA_UPDATED};
use crate::nas_security::{unprotect, Integrity};
use crate::nas_task::NasCore;
use crate::procedure::{Continuation, Outcome, ProcId, ProcedureData, ProcedureKind, ProcedureSpec, SpecificKind, TauData};
use crate::security::UeNetworkCapability;
use crate::sm::{EmmSignal, EmmState, Fsm};
use crate::timer::NasTimer;

impl NasCore {
    /// TRACKING AREA UPDATE REQUEST
    pub(crate) fn tau_request(
        &mut self,
        ue_id: MmeUeId,
        update_type: u8,
        old_guti: EpsGuti,
        capability: Option<UeNetworkCapability>,
        integrity: Integrity,
        pdu: Bytes,
    ) -> NasResult<()> {
        let spec = ProcedureSpec::new(self.config.timers.get(NasTimer::T3450))
            .on_failure(Continuation::TauFailed)
            .data(ProcedureData::Tau(TauData { update_type, old_guti, pdu }));

        let ctx = self.contexts.get_mut(ue_id)?;
        let id = ctx.procedures.create_specific(SpecificKind::Tau, spec)?;
        if let Some(capability) = capability {
            if ctx.ue_network_capability.get() != Some(&capability) {
                ctx.ue_network_capability.set_present(capability);
            }
        }
        log::info!(
            "[ue_id={}] Tracking area update request, type {}, GUTI {} ({:?})",
            ue_id,
            update_type,
            old_guti,
            integrity
        );

        let result = if integrity == Integrity::Verified && ctx.security.is_valid() {
            self.tau_accept(ue_id, id)
        } else if self.contexts.gummei().owns(&old_guti) {
            self.tau_authenticate(ue_id, id)
        } else {
            self.start_context_request(
                ue_id,
                id,
                old_guti,
                Continuation::TauContextImported,
                Continuation::TauContextFailed,
            )
        };
        self.fail_on_error(ue_id, id, result)
    }

    fn tau_authenticate(&mut self, ue_id: MmeUeId, tau_id: ProcId) -> NasResult<()> {
        if self.contexts.get(ue_id)?.imsi.is_present() {
            self.start_authentication(ue_id, tau_id, Continuation::TauAuthenticated)
        } else {
            log::warn!("[ue_id={}] Unknown native GUTI in tracking area update", ue_id);
            self.finish_procedure(ue_id, tau_id, Outcome::Rejected(EmmCause::UeIdentityCannotBeDerived))
        }
    }

    /// Context imported from the old MME: verify the request with it
    pub(crate) fn tau_context_imported(&mut self, ue_id: MmeUeId, tau_id: ProcId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let pdu = match ctx.procedures.get(tau_id).map(|p| &p.data) {
            Some(ProcedureData::Tau(data)) => data.pdu.clone(),
            _ => return Err(ProcedureError::NotFound(tau_id).into()),
        };

        let verified = match unprotect(&mut ctx.security, None, &pdu, Direction::Uplink) {
            Ok(decoded) => decoded.integrity == Integrity::Verified,
            Err(err) => {
                log::info!("[ue_id={}] Request not verified with the imported context: {}", ue_id, err);
                false
            }
        };

        if verified && ctx.security.is_valid() {
            log::info!("[ue_id={}] Request verified with the imported context [IMSI:{}]", ue_id, ctx.imsi_str());
            self.tau_accept(ue_id, tau_id)
        } else {
            self.tau_authenticate(ue_id, tau_id)
        }
    }

    /// Assign a new GUTI and send TRACKING AREA UPDATE ACCEPT
    pub(crate) fn tau_accept(&mut self, ue_id: MmeUeId, tau_id: ProcId) -> NasResult<()> {
        let guti = self.contexts.allocate_guti(ue_id)?;
        log::info!(
            "[ue_id={}] Tracking area update accept [IMSI:{}] GUTI {}",
            ue_id,
            self.contexts.get(ue_id)?.imsi_str(),
            guti
        );
        let message = EmmMessage::TauAccept { result: EPS_UPDATE_RESULT_TA_UPDATED, guti: Some(guti) };
        self.send_procedure_message(ue_id, tau_id, message, false)
    }

    /// TRACKING AREA UPDATE COMPLETE
    pub(crate) fn tau_complete(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let ctx = self.contexts.get(ue_id)?;
        let id = match ctx.procedures.specific() {
            Some(p) if p.kind == ProcedureKind::Specific(SpecificKind::Tau) && p.pending.is_some() => p.id,
            _ => {
                log::warn!("[ue_id={}] Tracking area update complete without a pending accept, ignored", ue_id);
                return Ok(());
            }
        };

        self.contexts.clear_old_guti(ue_id)?;
        let ctx = self.contexts.get_mut(ue_id)?;
        ctx.imsi.validate();
        ctx.ue_network_capability.validate();
        ctx.fsm.dispatch(EmmSignal::TauConfirmed)?;
        log::info!("[ue_id={}] Tracking area update complete [IMSI:{}]", ue_id, ctx.imsi_str());
        self.finish_procedure(ue_id, id, Outcome::Success)
    }

    /// TAU failed: reject with a cause, keep a registered subscriber on timeout
    pub(crate) fn tau_failed(&mut self, ue_id: MmeUeId, outcome: Outcome) -> NasResult<()> {
        match outcome {
            Outcome::Rejected(cause) => {
                let pdu = self.protect_or_plain(ue_id, EmmMessage::TauReject { cause });
                log::warn!("[ue_id={}] Tracking area update reject, cause {}", ue_id, cause);
                self.emit(NasPrimitive::DataRequest { ue_id, pdu });
                self.implicit_detach(ue_id)
            }
            Outcome::Failed | Outcome::Success => {
                if self.contexts.get(ue_id)?.state() == EmmState::Registered {
                    log::info!("[ue_id={}] Tracking area update abandoned, subscriber stays registered", ue_id);
                    Ok(())
                } else {
                    self.implicit_detach(ue_id)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NasConfig;
    use crate::context::{EmmContext, PlmnId};
    use crate::nas_codec::NasMessage;

    fn core() -> NasCore {
        NasCore::new(NasConfig::default()).unwrap()
    }

    fn native_guti(core: &NasCore, m_tmsi: u32) -> EpsGuti {
        let gummei = core.contexts().gummei();
        EpsGuti { plmn_id: gummei.plmn_id, mme_gid: gummei.mme_gid, mme_code: gummei.mme_code, m_tmsi }
    }

    #[test]
    fn test_unknown_native_guti_is_rejected() {
        let mut core = core();
        core.contexts.add(EmmContext::new(4));
        let guti = native_guti(&core, 0xdead);
        core.tau_request(4, 0, guti, None, Integrity::NotProtected, Bytes::new()).unwrap();

        let out = core.take_outbound();
        let reject = out
            .iter()
            .find_map(|p| match p {
                NasPrimitive::DataRequest { pdu, .. } => Some(NasMessage::decode(pdu, Direction::Downlink).unwrap()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            reject,
            NasMessage::from(EmmMessage::TauReject { cause: EmmCause::UeIdentityCannotBeDerived })
        );
        assert!(out.contains(&NasPrimitive::DetachIndication { ue_id: 4 }));
        assert!(!core.contexts().contains(4));
    }

    #[test]
    fn test_foreign_guti_requests_context() {
        let mut core = core();
        core.contexts.add(EmmContext::new(4));
        let guti = EpsGuti { plmn_id: PlmnId::new("999", "70"), mme_gid: 1, mme_code: 2, m_tmsi: 3 };
        core.tau_request(4, 0, guti, None, Integrity::NotProtected, Bytes::new()).unwrap();
        assert_eq!(core.take_outbound(), vec![NasPrimitive::ContextRequest { ue_id: 4, guti }]);
    }

    #[test]
    fn test_complete_without_accept_is_ignored() {
        let mut core = core();
        core.contexts.add(EmmContext::new(4));
        core.tau_complete(4).unwrap();
        assert!(core.take_outbound().is_empty());
        assert_eq!(core.contexts().get(4).unwrap().state(), EmmState::Deregistered);
    }
}
