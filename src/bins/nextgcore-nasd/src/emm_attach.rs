//! EMM Attach Procedure
//!
//! Network side of the attach procedure (TS 24.301 Section 5.5.1):
//! identity resolution, authentication, security mode control, default PDN
//! connection and the ATTACH ACCEPT / ATTACH COMPLETE exchange.

use bytes::Bytes;

use crate::context::MmeUeId;
use crate::error::{EmmCause, EsmCause, NasError, NasResult, ProcedureError};
use crate::esm_context::{Ebi, PdnSetup, PdnType};
use crate::event::{BearerSetupItem, NasPrimitive};
use crate::nas_codec::{EmmMessage, EsmBody, EsmMessage, MobileIdentity, NasMessage, EPS_ATTACH_RESULT_EPS};
use crate::nas_task::NasCore;
use crate::procedure::{
    AttachData, AttachPhase, Continuation, Outcome, PendingMessage, ProcId, Procedure, ProcedureData,
    ProcedureSet, ProcedureSpec, SpecificKind,
};
use crate::security::UeNetworkCapability;
use crate::sm::{EmmSignal, EmmState, Fsm};
use crate::timer::NasTimer;

/// Periodic TAU timer sent in ATTACH ACCEPT (GPRS timer, 9 x 6 minutes)
pub const T3412_DEFAULT: u8 = 0x49;

fn attach_data(procedures: &mut ProcedureSet, id: ProcId) -> NasResult<&mut AttachData> {
    match procedures.get_mut(id).map(|p| &mut p.data) {
        Some(ProcedureData::Attach(data)) => Ok(data),
        _ => Err(ProcedureError::NotFound(id).into()),
    }
}

fn pdn_connectivity_reject(pti: u8, cause: EsmCause) -> Bytes {
    EsmMessage { ebi: 0, pti, body: EsmBody::PdnConnectivityReject { cause } }.to_bytes()
}

impl NasCore {
    /// ATTACH REQUEST
    pub(crate) fn attach_request(
        &mut self,
        ue_id: MmeUeId,
        attach_type: u8,
        identity: MobileIdentity,
        capability: UeNetworkCapability,
        esm_container: Bytes,
    ) -> NasResult<()> {
        let spec = ProcedureSpec::new(self.config.timers.get(NasTimer::T3450))
            .on_failure(Continuation::AttachFailed)
            .data(ProcedureData::Attach(AttachData {
                attach_type,
                phase: AttachPhase::Securing,
                pti: 0,
                apn: String::new(),
                pdn_type: PdnType::default(),
                esm_reject: None,
            }));

        let ctx = self.contexts.get_mut(ue_id)?;
        let id = match ctx.procedures.create_specific(SpecificKind::Attach, spec) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("[ue_id={}] Attach request refused: {}", ue_id, err);
                return Err(err);
            }
        };
        ctx.ue_network_capability.set_present(capability);
        ctx.pending_esm = Some(esm_container);
        let registered = ctx.state() == EmmState::Registered;

        log::info!("[ue_id={}] Attach request, type {}, identity {:?}", ue_id, attach_type, identity);
        if registered {
            log::info!("[ue_id={}] Re-attach of a registered subscriber, releasing sessions", ue_id);
            self.release_sessions(ue_id);
        }

        let result = match identity {
            MobileIdentity::Imsi(imsi) => {
                self.bind_imsi(ue_id, &imsi).and_then(|()| self.attach_authenticate(ue_id, id))
            }
            MobileIdentity::Guti(guti) if self.contexts.gummei().owns(&guti) => {
                if self.contexts.get(ue_id)?.imsi.is_present() {
                    self.attach_authenticate(ue_id, id)
                } else {
                    self.start_identification(ue_id, id, Continuation::AttachIdentified)
                }
            }
            MobileIdentity::Guti(guti) => self.start_context_request(
                ue_id,
                id,
                guti,
                Continuation::AttachIdentified,
                Continuation::AttachContextFailed,
            ),
            MobileIdentity::Imei(imei) | MobileIdentity::Imeisv(imei) => {
                self.contexts.get_mut(ue_id)?.imei.set_present(imei);
                self.start_identification(ue_id, id, Continuation::AttachIdentified)
            }
        };
        self.fail_on_error(ue_id, id, result)
    }

    /// Reject a specific procedure that could not make progress
    pub(crate) fn fail_on_error(&mut self, ue_id: MmeUeId, id: ProcId, result: NasResult<()>) -> NasResult<()> {
        let Err(err) = result else {
            return Ok(());
        };
        let running = self
            .contexts
            .get(ue_id)
            .map(|ctx| ctx.procedures.get(id).is_some())
            .unwrap_or(false);
        if running {
            log::warn!("[ue_id={}] {} aborted: {}", ue_id, id, err);
            let cause = match err {
                NasError::Emm(cause) => cause,
                _ => EmmCause::NetworkFailure,
            };
            self.finish_procedure(ue_id, id, Outcome::Rejected(cause))?;
        }
        Err(err)
    }

    pub(crate) fn attach_authenticate(&mut self, ue_id: MmeUeId, attach_id: ProcId) -> NasResult<()> {
        self.start_authentication(ue_id, attach_id, Continuation::AttachAuthenticated)
    }

    /// Security established: ask the session layer for the default PDN
    pub(crate) fn attach_session_setup(&mut self, ue_id: MmeUeId, attach_id: ProcId) -> NasResult<()> {
        let default_apn = self.config.default_apn.clone();
        let ctx = self.contexts.get_mut(ue_id)?;
        let request = ctx.pending_esm.take().map(|esm| EsmMessage::from_bytes(&esm));

        let (pti, pdn_type, apn) = match request {
            Some(Ok(EsmMessage { pti, body: EsmBody::PdnConnectivityRequest { pdn_type, apn, .. }, .. })) => {
                (pti, pdn_type, apn.unwrap_or(default_apn))
            }
            other => {
                let pti = match &other {
                    Some(Ok(message)) => message.pti,
                    _ => 0,
                };
                log::warn!("[ue_id={}] Attach without PDN connectivity request: {:?}", ue_id, other);
                attach_data(&mut ctx.procedures, attach_id)?.esm_reject =
                    Some(pdn_connectivity_reject(pti, EsmCause::InvalidMandatoryInformation));
                return self.finish_procedure(ue_id, attach_id, Outcome::Rejected(EmmCause::EsmFailure));
            }
        };

        let imsi = ctx.imsi.get().cloned().ok_or(NasError::Emm(EmmCause::UeIdentityCannotBeDerived))?;
        let data = attach_data(&mut ctx.procedures, attach_id)?;
        data.phase = AttachPhase::SessionConfig;
        data.pti = pti;
        data.apn = apn;
        data.pdn_type = pdn_type;

        log::info!("[ue_id={}] Attach secured, requesting session configuration [IMSI:{}]", ue_id, imsi);
        self.emit(NasPrimitive::SessionConfigRequest { ue_id, imsi });
        Ok(())
    }

    /// Attach procedure waiting in `phase`
    pub(crate) fn attach_in_phase(&self, ue_id: MmeUeId, phase: AttachPhase) -> Option<(ProcId, AttachData)> {
        let procedure = self.contexts.get(ue_id).ok()?.procedures.specific()?;
        match &procedure.data {
            ProcedureData::Attach(data) if data.phase == phase => Some((procedure.id, data.clone())),
            _ => None,
        }
    }

    /// Session configuration for the default PDN retrieved
    pub(crate) fn attach_session_configured(&mut self, ue_id: MmeUeId, result: Result<(), u8>) -> NasResult<()> {
        let Some((id, data)) = self.attach_in_phase(ue_id, AttachPhase::SessionConfig) else {
            log::warn!("[ue_id={}] Session configuration without a waiting attach, ignored", ue_id);
            return Ok(());
        };
        let ctx = self.contexts.get_mut(ue_id)?;

        match result {
            Ok(()) => {
                attach_data(&mut ctx.procedures, id)?.phase = AttachPhase::Connectivity;
                log::info!("[ue_id={}] Default PDN connectivity request, APN {}", ue_id, data.apn);
                self.emit(NasPrimitive::ConnectivityRequest {
                    ue_id,
                    pti: data.pti,
                    apn: data.apn,
                    pdn_type: data.pdn_type,
                });
                Ok(())
            }
            Err(cause) => {
                let cause = EsmCause::try_from(cause).unwrap_or(EsmCause::RequestRejectedUnspecified);
                log::warn!("[ue_id={}] Session configuration failed, cause {}", ue_id, cause);
                attach_data(&mut ctx.procedures, id)?.esm_reject = Some(pdn_connectivity_reject(data.pti, cause));
                self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::EsmFailure))
            }
        }
    }

    /// Default PDN connection result: build and send ATTACH ACCEPT
    pub(crate) fn attach_connectivity(
        &mut self,
        ue_id: MmeUeId,
        attach_id: ProcId,
        result: Result<PdnSetup, EsmCause>,
    ) -> NasResult<()> {
        let pti = attach_data(&mut self.contexts.get_mut(ue_id)?.procedures, attach_id)?.pti;

        let setup = match result {
            Ok(setup) => setup,
            Err(cause) => return self.attach_esm_rejected(ue_id, attach_id, pti, cause),
        };
        let ebi = match self.sessions.entry(ue_id).create_pdn(setup.clone()) {
            Ok(ebi) => ebi,
            Err(cause) => return self.attach_esm_rejected(ue_id, attach_id, pti, cause),
        };
        if let Some(bearer) = self.sessions.entry(ue_id).bearer_mut(ebi) {
            bearer.mark_created_at_mme();
        }

        let activate = EsmMessage {
            ebi,
            pti,
            body: EsmBody::ActivateDefaultBearerRequest {
                qos: setup.qos,
                apn: setup.apn.clone(),
                paa: setup.paa,
                ambr: setup.ambr,
            },
        }
        .to_bytes();

        let guti = self.contexts.allocate_guti(ue_id)?;
        let plain = NasMessage::from(EmmMessage::AttachAccept {
            result: EPS_ATTACH_RESULT_EPS,
            t3412: T3412_DEFAULT,
            guti: Some(guti),
            esm_container: activate,
        })
        .encode();
        let pdu = self.protect_for(ue_id, &plain, false)?;

        let ctx = self.contexts.get_mut(ue_id)?;
        let kenb = ctx.security.derive_kenb()?;
        let (nh, ncc) = ctx.security.current_hop();
        attach_data(&mut ctx.procedures, attach_id)?.phase = AttachPhase::AwaitComplete;
        ctx.procedures
            .set_pending(attach_id, PendingMessage::Nas { plain, new_context: false })?;
        ctx.procedures.record_digest(attach_id, &pdu);
        let duration = ctx
            .procedures
            .get(attach_id)
            .map(|p| p.duration)
            .ok_or(ProcedureError::NotFound(attach_id))?;

        log::info!(
            "[ue_id={}] Attach accept [IMSI:{}] GUTI {} APN {} EBI {} PAA {}",
            ue_id,
            ctx.imsi_str(),
            guti,
            setup.apn,
            ebi,
            setup.paa
        );
        self.emit(NasPrimitive::EstablishConfirm {
            ue_id,
            pdu,
            kenb,
            nh,
            ncc,
            bearers: vec![BearerSetupItem { ebi, qos: setup.qos, sgw_fteid: setup.sgw_fteid }],
        });
        self.arm_procedure_timer(ue_id, attach_id, duration)
    }

    fn attach_esm_rejected(&mut self, ue_id: MmeUeId, attach_id: ProcId, pti: u8, cause: EsmCause) -> NasResult<()> {
        log::warn!("[ue_id={}] Default PDN connection failed, cause {}", ue_id, cause);
        let ctx = self.contexts.get_mut(ue_id)?;
        attach_data(&mut ctx.procedures, attach_id)?.esm_reject = Some(pdn_connectivity_reject(pti, cause));
        self.finish_procedure(ue_id, attach_id, Outcome::Rejected(EmmCause::EsmFailure))
    }

    /// ATTACH COMPLETE
    pub(crate) fn attach_complete(&mut self, ue_id: MmeUeId, esm_container: Bytes) -> NasResult<()> {
        let Some((id, _)) = self.attach_in_phase(ue_id, AttachPhase::AwaitComplete) else {
            log::warn!("[ue_id={}] Attach complete without a pending attach accept, ignored", ue_id);
            return Ok(());
        };

        match EsmMessage::from_bytes(&esm_container) {
            Ok(EsmMessage { ebi, body: EsmBody::ActivateDefaultBearerAccept, .. }) => {
                self.default_bearer_accepted(ue_id, ebi);
            }
            Ok(EsmMessage { ebi, body: EsmBody::ActivateDefaultBearerReject { cause }, .. }) => {
                log::warn!("[ue_id={}] Default bearer {} rejected, cause {}", ue_id, ebi, cause);
                self.release_bearer(ue_id, ebi);
            }
            Ok(other) => log::warn!("[ue_id={}] Unexpected ESM message in attach complete: {:?}", ue_id, other),
            Err(err) => log::warn!("[ue_id={}] Undecodable ESM container in attach complete: {}", ue_id, err),
        }

        self.contexts.clear_old_guti(ue_id)?;
        let ctx = self.contexts.get_mut(ue_id)?;
        ctx.imsi.validate();
        ctx.fsm.dispatch(EmmSignal::AttachConfirmed)?;
        log::info!("[ue_id={}] Attach complete [IMSI:{}]", ue_id, ctx.imsi_str());
        self.finish_procedure(ue_id, id, Outcome::Success)
    }

    fn default_bearer_accepted(&mut self, ue_id: MmeUeId, ebi: Ebi) {
        match self.sessions.get_mut(ue_id).and_then(|sessions| sessions.bearer_mut(ebi)) {
            Some(bearer) => {
                let state = bearer.on_nas_accept();
                log::debug!("[ue_id={}] Default bearer {} accepted ({:?})", ue_id, ebi, state);
            }
            None => log::warn!("[ue_id={}] Accept for unknown default bearer {}", ue_id, ebi),
        }
    }

    /// Attach failed: tell the UE if there is a cause, then clean up
    pub(crate) fn attach_failed(&mut self, ue_id: MmeUeId, procedure: &Procedure, outcome: Outcome) -> NasResult<()> {
        if let Outcome::Rejected(cause) = outcome {
            let esm_container = match &procedure.data {
                ProcedureData::Attach(data) => data.esm_reject.clone(),
                _ => None,
            };
            let pdu = self.protect_or_plain(ue_id, EmmMessage::AttachReject { cause, esm_container });
            log::warn!("[ue_id={}] Attach reject, cause {}", ue_id, cause);
            self.emit(NasPrimitive::EstablishReject { ue_id, pdu });
            if let Ok(ctx) = self.contexts.get_mut(ue_id) {
                ctx.connected = false;
            }
        }

        if let Ok(ctx) = self.contexts.get_mut(ue_id) {
            if let Err(err) = ctx.fsm.dispatch(EmmSignal::RegistrationRejected) {
                log::debug!("[ue_id={}] {}", ue_id, err);
            }
        }
        self.release_subscriber(ue_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NasConfig;
    use crate::context::EmmContext;

    fn core() -> NasCore {
        NasCore::new(NasConfig::default()).unwrap()
    }

    fn attach_request(identity: MobileIdentity) -> (MobileIdentity, UeNetworkCapability, Bytes) {
        let esm = EsmMessage {
            ebi: 0,
            pti: 1,
            body: EsmBody::PdnConnectivityRequest { pdn_type: PdnType::Ipv4, request_type: 1, apn: None },
        }
        .to_bytes();
        (identity, UeNetworkCapability::new(0xa0, 0x20), esm)
    }

    #[test]
    fn test_attach_with_imsi_requests_vectors() {
        let mut core = core();
        core.contexts.add(EmmContext::new(1));
        let (identity, cap, esm) = attach_request(MobileIdentity::Imsi("001010000000001".into()));
        core.attach_request(1, 1, identity, cap, esm).unwrap();

        let out = core.take_outbound();
        assert!(matches!(
            out.as_slice(),
            [NasPrimitive::AuthInfoRequest { ue_id: 1, num_vectors: 1, resync: None, .. }]
        ));
        assert_eq!(core.contexts().get_by_imsi("001010000000001"), Some(1));
        assert_eq!(core.contexts().get(1).unwrap().state(), EmmState::CommonProcedureInitiated);
    }

    #[test]
    fn test_attach_with_unknown_native_guti_asks_identity() {
        let mut core = core();
        core.contexts.add(EmmContext::new(1));
        let guti = crate::context::EpsGuti {
            plmn_id: core.contexts().gummei().plmn_id,
            mme_gid: core.contexts().gummei().mme_gid,
            mme_code: core.contexts().gummei().mme_code,
            m_tmsi: 0x1234,
        };
        let (identity, cap, esm) = attach_request(MobileIdentity::Guti(guti));
        core.attach_request(1, 1, identity, cap, esm).unwrap();

        let out = core.take_outbound();
        assert_eq!(out.len(), 1);
        let NasPrimitive::DataRequest { pdu, .. } = &out[0] else {
            panic!("expected identity request, got {:?}", out[0]);
        };
        assert_eq!(
            NasMessage::decode(pdu, crate::nas_codec::Direction::Downlink).unwrap(),
            NasMessage::from(EmmMessage::IdentityRequest { identity_type: 1 })
        );
    }

    #[test]
    fn test_attach_with_foreign_guti_requests_context() {
        let mut core = core();
        core.contexts.add(EmmContext::new(1));
        let guti = crate::context::EpsGuti {
            plmn_id: crate::context::PlmnId::new("001", "01"),
            mme_gid: 9,
            mme_code: 9,
            m_tmsi: 0x77,
        };
        let (identity, cap, esm) = attach_request(MobileIdentity::Guti(guti));
        core.attach_request(1, 1, identity, cap, esm).unwrap();
        assert_eq!(core.take_outbound(), vec![NasPrimitive::ContextRequest { ue_id: 1, guti }]);
    }

    #[test]
    fn test_second_attach_conflicts() {
        let mut core = core();
        core.contexts.add(EmmContext::new(1));
        let (identity, cap, esm) = attach_request(MobileIdentity::Imsi("001010000000001".into()));
        core.attach_request(1, 1, identity.clone(), cap, esm.clone()).unwrap();
        core.take_outbound();

        let err = core.attach_request(1, 1, identity, cap, esm).unwrap_err();
        assert_eq!(
            err,
            NasError::Conflict { active: SpecificKind::Attach, requested: SpecificKind::Attach }
        );
        assert!(core.take_outbound().is_empty());
        assert_eq!(core.contexts().get(1).unwrap().procedures.len(), 3);
    }
}
