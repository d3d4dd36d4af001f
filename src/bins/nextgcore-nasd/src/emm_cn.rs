//! EMM-CN SAP
//!
//! Answers from the HSS (S6a) and from peer MMEs (S10), and subscriber
//! management requests from the core network.

use crate::context::{AuthVector, EpsGuti, MmeUeId};
use crate::error::{EmmCause, NasError, NasResult, SecurityError};
use crate::event::{ContextTransfer, EmmCnPrimitive, NasPrimitive};
use crate::nas_codec::DETACH_TYPE_REATTACH_NOT_REQUIRED;
use crate::nas_task::NasCore;
use crate::procedure::{
    CnKind, CommonKind, Continuation, Outcome, PendingMessage, ProcId, ProcedureKind, ProcedureSpec, SpecificKind,
};
use crate::security::SecurityContextType;
use crate::timer::NasTimer;

impl NasCore {
    /// Dispatch a core network primitive
    pub(crate) fn emm_cn(&mut self, primitive: EmmCnPrimitive) -> NasResult<()> {
        match primitive {
            EmmCnPrimitive::AuthInfoAnswer { ue_id, result } => self.auth_info_answer(ue_id, result),
            EmmCnPrimitive::ContextResponse { ue_id, result } => self.context_response(ue_id, result),
            EmmCnPrimitive::DeregisterSubscriber { ue_id } => {
                log::info!("[ue_id={}] Subscriber deregistered by the core network", ue_id);
                self.network_detach(ue_id, DETACH_TYPE_REATTACH_NOT_REQUIRED, None)
            }
            EmmCnPrimitive::ImplicitDetach { ue_id } => self.implicit_detach(ue_id),
            EmmCnPrimitive::SecurityModeFailure { ue_id, cause } => self.security_mode_failure(ue_id, cause),
        }
    }

    fn auth_info_answer(&mut self, ue_id: MmeUeId, result: Result<Vec<AuthVector>, u8>) -> NasResult<()> {
        let max_vectors = usize::from(self.config.max_auth_vectors);
        let Ok(ctx) = self.contexts.get_mut(ue_id) else {
            log::warn!("[ue_id={}] Authentication information answer for an unknown subscriber", ue_id);
            return Ok(());
        };
        let Some(id) = ctx.procedures.find(ProcedureKind::Cn(CnKind::AuthInfo)) else {
            log::warn!("[ue_id={}] Unsolicited authentication information answer, discarded", ue_id);
            return Ok(());
        };

        match result {
            Ok(vectors) if vectors.is_empty() => {
                log::warn!("[ue_id={}] HSS returned no authentication vectors", ue_id);
                self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::NetworkFailure))
            }
            Ok(vectors) => {
                log::debug!("[ue_id={}] {} authentication vectors received", ue_id, vectors.len());
                ctx.auth_vectors.store(vectors, max_vectors);
                self.finish_procedure(ue_id, id, Outcome::Success)
            }
            Err(cause) => {
                log::warn!("[ue_id={}] {}", ue_id, NasError::CnFailure { procedure: "S6a AIR", cause });
                self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::from_peer(cause)))
            }
        }
    }

    /// Ask the MME owning `guti` for the subscriber's context
    pub(crate) fn start_context_request(
        &mut self,
        ue_id: MmeUeId,
        parent: ProcId,
        guti: EpsGuti,
        on_success: Continuation,
        on_failure: Continuation,
    ) -> NasResult<()> {
        let spec = ProcedureSpec::new(self.config.timers.get(NasTimer::S10))
            .on_success(on_success)
            .on_failure(on_failure);
        let ctx = self.contexts.get_mut(ue_id)?;
        let id = ctx
            .procedures
            .create_child(Some(parent), ProcedureKind::Cn(CnKind::ContextRequest), spec)?;
        ctx.procedures
            .set_pending(id, PendingMessage::Cn(NasPrimitive::ContextRequest { ue_id, guti }))?;
        log::info!("[ue_id={}] Context request for GUTI {}", ue_id, guti);
        self.transmit(ue_id, id)
    }

    fn context_response(&mut self, ue_id: MmeUeId, result: Result<Box<ContextTransfer>, u8>) -> NasResult<()> {
        let Ok(ctx) = self.contexts.get(ue_id) else {
            log::warn!("[ue_id={}] Context response for an unknown subscriber", ue_id);
            return Ok(());
        };
        let Some(id) = ctx.procedures.find(ProcedureKind::Cn(CnKind::ContextRequest)) else {
            log::warn!("[ue_id={}] Unsolicited context response, discarded", ue_id);
            return Ok(());
        };
        let for_tau = ctx.procedures.specific_kind() == Some(SpecificKind::Tau);

        match result {
            Ok(transfer) => match self.import_context(ue_id, *transfer, for_tau) {
                Ok(()) => self.finish_procedure(ue_id, id, Outcome::Success),
                Err(err) => {
                    log::warn!("[ue_id={}] Context import failed: {}", ue_id, err);
                    self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::UeIdentityCannotBeDerived))
                }
            },
            Err(cause) => {
                log::warn!("[ue_id={}] {}", ue_id, NasError::CnFailure { procedure: "S10 context request", cause });
                self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::UeIdentityCannotBeDerived))
            }
        }
    }

    /// Take over identity, security and (for TAU) sessions from a peer MME
    fn import_context(&mut self, ue_id: MmeUeId, transfer: ContextTransfer, with_sessions: bool) -> NasResult<()> {
        if !transfer.security.has_key() {
            return Err(SecurityError::NoSecurityContext.into());
        }
        self.bind_imsi(ue_id, &transfer.imsi)?;

        let ctx = self.contexts.get_mut(ue_id)?;
        let mut security = transfer.security;
        if !matches!(security.ctx_type, SecurityContextType::FullNative | SecurityContextType::Mapped) {
            security.ctx_type = SecurityContextType::Mapped;
        }
        if !security.keys_derived {
            security.derive_nas_keys()?;
        }
        ctx.security = security;
        ctx.ue_network_capability.set_valid(transfer.ue_network_capability);
        log::info!("[ue_id={}] Context imported [IMSI:{}]", ue_id, transfer.imsi);

        if with_sessions {
            let sessions = self.sessions.entry(ue_id);
            for pdn in transfer.pdns {
                let apn = pdn.apn.clone();
                if let Err(cause) = sessions.import_pdn(pdn) {
                    log::warn!("[ue_id={}] PDN connection {} not imported, cause {}", ue_id, apn, cause);
                }
            }
        }
        Ok(())
    }

    fn security_mode_failure(&mut self, ue_id: MmeUeId, cause: u8) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(id) = ctx
            .procedures
            .find(ProcedureKind::Common(CommonKind::SecurityModeControl))
        else {
            log::warn!("[ue_id={}] Security mode failure without a running security mode control", ue_id);
            return Ok(());
        };
        log::warn!("[ue_id={}] {}", ue_id, NasError::CnFailure { procedure: "security mode control", cause });
        ctx.non_current_security = None;
        self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::UeSecurityCapabilitiesMismatch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NasConfig;
    use crate::context::EmmContext;
    use crate::event::NasEvent;
    use crate::procedure::ProcedureData;
    use crate::security::{SecurityContext, UeNetworkCapability};
    use crate::sm::EmmState;
    use bytes::Bytes;

    fn core() -> NasCore {
        NasCore::new(NasConfig::default()).unwrap()
    }

    fn vector(seed: u8) -> AuthVector {
        AuthVector {
            rand: [seed; 16],
            xres: Bytes::from(vec![seed; 8]),
            autn: [seed; 16],
            kasme: [seed; 32],
        }
    }

    #[test]
    fn test_unsolicited_answer_is_discarded() {
        let mut core = core();
        core.handle_event(NasEvent::Cn(EmmCnPrimitive::AuthInfoAnswer { ue_id: 9, result: Ok(vec![vector(1)]) }))
            .unwrap();
        assert!(core.take_outbound().is_empty());
        assert!(!core.contexts().contains(9));
    }

    #[test]
    fn test_answer_resumes_authentication() {
        let mut core = core();
        let mut ctx = EmmContext::new(1);
        ctx.imsi.set_present("001010000000001".to_string());
        core.contexts.add(ctx);
        let spec = ProcedureSpec::new(core.config().timers.t3450);
        let attach = core
            .contexts
            .get_mut(1)
            .unwrap()
            .procedures
            .create_specific(SpecificKind::Attach, spec)
            .unwrap();
        core.start_authentication(1, attach, Continuation::AttachAuthenticated).unwrap();
        core.take_outbound();

        core.emm_cn(EmmCnPrimitive::AuthInfoAnswer { ue_id: 1, result: Ok(vec![vector(3)]) }).unwrap();
        let ctx = core.contexts().get(1).unwrap();
        let auth = ctx
            .procedures
            .find(ProcedureKind::Common(CommonKind::Authentication))
            .and_then(|id| ctx.procedures.get(id))
            .unwrap();
        assert!(matches!(&auth.data, ProcedureData::Authentication(data) if data.vector == Some(vector(3))));
        assert!(ctx.procedures.find(ProcedureKind::Cn(CnKind::AuthInfo)).is_none());
        assert_eq!(core.take_outbound().len(), 1);
    }

    #[test]
    fn test_import_requires_key() {
        let mut core = core();
        core.contexts.add(EmmContext::new(2));
        let transfer = ContextTransfer {
            imsi: "001010000000002".into(),
            security: SecurityContext::default(),
            ue_network_capability: UeNetworkCapability::new(0x80, 0x20),
            pdns: Vec::new(),
        };
        assert!(core.import_context(2, transfer, false).is_err());
        assert_eq!(core.contexts().get(2).unwrap().state(), EmmState::Deregistered);
        assert!(core.contexts().get_by_imsi("001010000000002").is_none());
    }
}
