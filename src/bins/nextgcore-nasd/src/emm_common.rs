//! EMM Common Procedures
//!
//! Identification, authentication and security mode control
//! (TS 24.301 Section 5.4). Each runs as a child of a specific procedure and
//! reports back through the continuations it was started with.

use bytes::{BufMut, Bytes, BytesMut};
use ogs_crypt::aes_cmac::tag_eq;

use crate::context::MmeUeId;
use crate::error::{EmmCause, NasError, NasResult, ProcedureError};
use crate::event::NasPrimitive;
use crate::nas_codec::{EmmMessage, MobileIdentity, IDENTITY_TYPE_IMSI};
use crate::nas_task::NasCore;
use crate::procedure::{
    AuthData, CnKind, CommonKind, Continuation, Outcome, PendingMessage, ProcId, ProcedureData,
    ProcedureKind, ProcedureSpec,
};
use crate::security::{next_eksi, SecurityContext, SecurityContextType};
use crate::sm::{EmmSignal, Fsm};
use crate::timer::NasTimer;

impl NasCore {
    /// Create a common procedure under `parent` and enter
    /// EMM-COMMON-PROCEDURE-INITIATED
    fn begin_common(
        &mut self,
        ue_id: MmeUeId,
        parent: ProcId,
        kind: CommonKind,
        spec: ProcedureSpec,
    ) -> NasResult<ProcId> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let id = ctx.procedures.create_child(Some(parent), ProcedureKind::Common(kind), spec)?;
        if let Err(err) = ctx.fsm.dispatch(EmmSignal::CommonProcRequested) {
            ctx.procedures.resolve(id)?;
            return Err(err.into());
        }
        log::debug!("[ue_id={}] {} {} started", ue_id, ProcedureKind::Common(kind), id);
        Ok(id)
    }

    /// Bind a permanent identity, evicting any other context holding it
    pub(crate) fn bind_imsi(&mut self, ue_id: MmeUeId, imsi: &str) -> NasResult<()> {
        if let Some(previous) = self.contexts.upsert_imsi(ue_id, imsi)? {
            log::info!(
                "[ue_id={}] IMSI {} was held by ue_id={}, detaching it implicitly",
                ue_id,
                imsi,
                previous
            );
            self.implicit_detach(previous)?;
        }
        Ok(())
    }

    // ========================================================================
    // Identification
    // ========================================================================

    /// Ask the UE for its IMSI
    pub(crate) fn start_identification(
        &mut self,
        ue_id: MmeUeId,
        parent: ProcId,
        on_success: Continuation,
    ) -> NasResult<()> {
        let spec = ProcedureSpec::new(self.config.timers.get(NasTimer::T3470))
            .on_success(on_success)
            .on_failure(Continuation::FailParent);
        let id = self.begin_common(ue_id, parent, CommonKind::Identification, spec)?;

        log::info!("[ue_id={}] Identity request", ue_id);
        let message = EmmMessage::IdentityRequest { identity_type: IDENTITY_TYPE_IMSI };
        self.send_procedure_message(ue_id, id, message, false)
    }

    pub(crate) fn identity_response(&mut self, ue_id: MmeUeId, identity: MobileIdentity) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(id) = ctx.procedures.find(ProcedureKind::Common(CommonKind::Identification)) else {
            log::warn!("[ue_id={}] Identity response without identification, ignored", ue_id);
            return Ok(());
        };

        match identity {
            MobileIdentity::Imsi(imsi) => {
                log::info!("[ue_id={}] Identity response [IMSI:{}]", ue_id, imsi);
                self.bind_imsi(ue_id, &imsi)?;
                self.finish_procedure(ue_id, id, Outcome::Success)
            }
            other => {
                log::warn!("[ue_id={}] Identity response with {:?} instead of IMSI", ue_id, other);
                if let MobileIdentity::Imei(imei) | MobileIdentity::Imeisv(imei) = other {
                    ctx.imei.set_present(imei);
                }
                self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::UeIdentityCannotBeDerived))
            }
        }
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Run EPS AKA, fetching vectors from the HSS if none are left
    pub(crate) fn start_authentication(
        &mut self,
        ue_id: MmeUeId,
        parent: ProcId,
        on_success: Continuation,
    ) -> NasResult<()> {
        let timer = self.config.timers.get(NasTimer::T3460);
        let ctx = self.contexts.get_mut(ue_id)?;
        let eksi = next_eksi(ctx.security.eksi);
        ctx.auth_resync_attempted = false;

        let spec = ProcedureSpec::new(timer)
            .on_success(on_success)
            .on_failure(Continuation::FailParent)
            .data(ProcedureData::Authentication(AuthData { eksi, vector: None }));
        let id = self.begin_common(ue_id, parent, CommonKind::Authentication, spec)?;

        if self.contexts.get(ue_id)?.auth_vectors.remaining() == 0 {
            self.request_auth_vectors(ue_id, id, None)
        } else {
            self.send_auth_challenge(ue_id, id)
        }
    }

    /// Ask the HSS for authentication vectors on behalf of `auth_id`
    fn request_auth_vectors(&mut self, ue_id: MmeUeId, auth_id: ProcId, resync: Option<Bytes>) -> NasResult<()> {
        let timer = self.config.timers.get(NasTimer::S6a);
        let num_vectors = self.config.max_auth_vectors;
        let ctx = self.contexts.get_mut(ue_id)?;
        let imsi = ctx
            .imsi
            .get()
            .cloned()
            .ok_or(NasError::Emm(EmmCause::UeIdentityCannotBeDerived))?;

        let spec = ProcedureSpec::new(timer)
            .on_success(Continuation::AuthVectorsReady)
            .on_failure(Continuation::FailParent);
        let id = ctx
            .procedures
            .create_child(Some(auth_id), ProcedureKind::Cn(CnKind::AuthInfo), spec)?;

        log::info!(
            "[ue_id={}] Authentication information request [IMSI:{}] resync={}",
            ue_id,
            imsi,
            resync.is_some()
        );
        let request = NasPrimitive::AuthInfoRequest { ue_id, imsi, num_vectors, resync };
        ctx.procedures.set_pending(id, PendingMessage::Cn(request))?;
        self.transmit(ue_id, id)
    }

    /// Challenge the UE with the next unused vector
    pub(crate) fn send_auth_challenge(&mut self, ue_id: MmeUeId, auth_id: ProcId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(vector) = ctx.auth_vectors.next_unused() else {
            log::warn!("[ue_id={}] No authentication vector available", ue_id);
            return self.finish_procedure(ue_id, auth_id, Outcome::Rejected(EmmCause::NetworkFailure));
        };

        let procedure = ctx.procedures.get_mut(auth_id).ok_or(ProcedureError::NotFound(auth_id))?;
        let ProcedureData::Authentication(data) = &mut procedure.data else {
            return Err(ProcedureError::NotFound(auth_id).into());
        };
        let message = EmmMessage::AuthenticationRequest {
            nas_ksi: data.eksi,
            rand: vector.rand,
            autn: vector.autn,
        };
        data.vector = Some(vector);

        log::info!("[ue_id={}] Authentication request [IMSI:{}]", ue_id, ctx.imsi_str());
        self.send_procedure_message(ue_id, auth_id, message, false)
    }

    pub(crate) fn authentication_response(&mut self, ue_id: MmeUeId, res: Bytes) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(id) = ctx.procedures.find(ProcedureKind::Common(CommonKind::Authentication)) else {
            log::warn!("[ue_id={}] Authentication response without authentication, ignored", ue_id);
            return Ok(());
        };
        let (eksi, vector) = match ctx.procedures.get(id).map(|p| &p.data) {
            Some(ProcedureData::Authentication(AuthData { eksi, vector: Some(vector) })) => {
                (*eksi, vector.clone())
            }
            _ => {
                log::warn!("[ue_id={}] Authentication response before the challenge, ignored", ue_id);
                return Ok(());
            }
        };

        if !tag_eq(&res, &vector.xres) {
            log::warn!("[ue_id={}] Authentication failed [IMSI:{}]: RES mismatch", ue_id, ctx.imsi_str());
            self.send_nas(ue_id, EmmMessage::AuthenticationReject)?;
            return self.finish_procedure(ue_id, id, Outcome::Failed);
        }

        log::info!("[ue_id={}] Authentication succeeded [IMSI:{}] eKSI {}", ue_id, ctx.imsi_str(), eksi);
        ctx.non_current_security = Some(SecurityContext::new_partial(eksi, vector.kasme));
        self.finish_procedure(ue_id, id, Outcome::Success)
    }

    pub(crate) fn authentication_failure(
        &mut self,
        ue_id: MmeUeId,
        cause: EmmCause,
        auts: Option<[u8; 14]>,
    ) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(id) = ctx.procedures.find(ProcedureKind::Common(CommonKind::Authentication)) else {
            log::warn!("[ue_id={}] Authentication failure without authentication, ignored", ue_id);
            return Ok(());
        };
        let rand = match ctx.procedures.get(id).map(|p| &p.data) {
            Some(ProcedureData::Authentication(AuthData { vector: Some(vector), .. })) => Some(vector.rand),
            _ => None,
        };
        log::warn!("[ue_id={}] Authentication failure, cause {}", ue_id, cause);

        match (cause, auts, rand) {
            (EmmCause::SynchFailure, Some(auts), Some(rand)) if !ctx.auth_resync_attempted => {
                ctx.auth_resync_attempted = true;
                ctx.auth_vectors.clear();
                if let Some(timer) = ctx.procedures.disarm(id) {
                    self.timers.cancel(timer);
                }
                let mut resync = BytesMut::with_capacity(rand.len() + auts.len());
                resync.put_slice(&rand);
                resync.put_slice(&auts);
                self.request_auth_vectors(ue_id, id, Some(resync.freeze()))
            }
            _ => {
                self.send_nas(ue_id, EmmMessage::AuthenticationReject)?;
                self.finish_procedure(ue_id, id, Outcome::Failed)
            }
        }
    }

    // ========================================================================
    // Security mode control
    // ========================================================================

    /// Take the authenticated key set into use
    pub(crate) fn start_security_mode(
        &mut self,
        ue_id: MmeUeId,
        parent: ProcId,
        on_success: Continuation,
    ) -> NasResult<()> {
        let ctx = self.contexts.get(ue_id)?;
        let Some(capability) = ctx.ue_network_capability.get().copied() else {
            log::warn!("[ue_id={}] No UE network capability for security mode control", ue_id);
            return self.finish_procedure(ue_id, parent, Outcome::Rejected(EmmCause::UeSecurityCapabilitiesMismatch));
        };
        if ctx.non_current_security.is_none() {
            log::warn!("[ue_id={}] No authenticated key set for security mode control", ue_id);
            return self.finish_procedure(ue_id, parent, Outcome::Rejected(EmmCause::NetworkFailure));
        }
        let imeisv_request = !ctx.imei.is_present();

        let spec = ProcedureSpec::new(self.config.timers.get(NasTimer::T3460))
            .on_success(on_success)
            .on_failure(Continuation::FailParent);
        let id = self.begin_common(ue_id, parent, CommonKind::SecurityModeControl, spec)?;

        let ctx = self.contexts.get_mut(ue_id)?;
        let security = ctx.non_current_security.as_mut().ok_or(ProcedureError::NotFound(id))?;
        if let Err(err) = security.select_algorithms(&capability, &self.policy) {
            log::warn!("[ue_id={}] Security mode control impossible: {}", ue_id, err);
            return self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::UeSecurityCapabilitiesMismatch));
        }
        security.derive_nas_keys()?;
        security.reset_counts();

        log::info!(
            "[ue_id={}] Security mode command: EEA{} EIA{} eKSI {}",
            ue_id,
            security.eea,
            security.eia,
            security.eksi
        );
        let message = EmmMessage::SecurityModeCommand {
            eea: security.eea,
            eia: security.eia,
            nas_ksi: security.eksi,
            replayed_capability: capability,
            imeisv_request,
        };
        self.send_procedure_message(ue_id, id, message, true)
    }

    /// SECURITY MODE COMPLETE, already verified against the new context
    pub(crate) fn security_mode_complete(&mut self, ue_id: MmeUeId, imeisv: Option<MobileIdentity>) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(id) = ctx.procedures.find(ProcedureKind::Common(CommonKind::SecurityModeControl)) else {
            log::warn!("[ue_id={}] Security mode complete without security mode control, ignored", ue_id);
            return Ok(());
        };
        let Some(mut security) = ctx.non_current_security.take() else {
            return Err(ProcedureError::NotFound(id).into());
        };

        security.ctx_type = SecurityContextType::FullNative;
        ctx.security = security;
        if let Some(MobileIdentity::Imeisv(imei) | MobileIdentity::Imei(imei)) = imeisv {
            ctx.imei.set_valid(imei);
        }
        ctx.imsi.validate();
        ctx.ue_network_capability.validate();

        log::info!("[ue_id={}] Security mode complete [IMSI:{}]", ue_id, ctx.imsi_str());
        self.finish_procedure(ue_id, id, Outcome::Success)
    }

    pub(crate) fn security_mode_reject(&mut self, ue_id: MmeUeId, cause: EmmCause) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let Some(id) = ctx.procedures.find(ProcedureKind::Common(CommonKind::SecurityModeControl)) else {
            log::warn!("[ue_id={}] Security mode reject without security mode control, ignored", ue_id);
            return Ok(());
        };
        log::warn!("[ue_id={}] Security mode reject, cause {}", ue_id, cause);
        ctx.non_current_security = None;
        self.finish_procedure(ue_id, id, Outcome::Rejected(EmmCause::SecurityModeRejected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NasConfig;
    use crate::context::{AuthVector, EmmContext};
    use crate::event::EmmCnPrimitive;
    use crate::nas_codec::{Direction, NasMessage, PD_EMM};
    use crate::nas_security::NAS_SECURITY_HEADER_LEN;
    use crate::procedure::SpecificKind;
    use crate::security::UeNetworkCapability;

    const IMSI: &str = "001010000000001";

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

    /// Subscriber 1 on a live connection with an attach running
    fn attaching(core: &mut NasCore) -> ProcId {
        let mut ctx = EmmContext::new(1);
        ctx.ue_network_capability.set_present(UeNetworkCapability::new(0xa0, 0x20));
        ctx.connected = true;
        core.contexts.add(ctx);
        let spec = ProcedureSpec::new(core.config().timers.t3450).on_failure(Continuation::AttachFailed);
        core.contexts
            .get_mut(1)
            .unwrap()
            .procedures
            .create_specific(SpecificKind::Attach, spec)
            .unwrap()
    }

    /// Attach running with one vector cached and the challenge sent
    fn challenged(core: &mut NasCore) -> ProcId {
        let attach = attaching(core);
        core.bind_imsi(1, IMSI).unwrap();
        core.contexts.get_mut(1).unwrap().auth_vectors.store(vec![vector(3)], 5);
        core.start_authentication(1, attach, Continuation::AttachAuthenticated).unwrap();
        assert_eq!(
            emm_messages(&core.take_outbound()),
            vec![EmmMessage::AuthenticationRequest { nas_ksi: 0, rand: [3; 16], autn: [3; 16] }]
        );
        attach
    }

    fn emm_messages(out: &[NasPrimitive]) -> Vec<EmmMessage> {
        out.iter()
            .filter_map(|primitive| match primitive {
                NasPrimitive::DataRequest { pdu, .. } | NasPrimitive::EstablishReject { pdu, .. } => {
                    let protected = pdu[0] & 0x0f == PD_EMM && pdu[0] >> 4 != 0;
                    let plain = if protected { &pdu[NAS_SECURITY_HEADER_LEN..] } else { &pdu[..] };
                    match NasMessage::decode(plain, Direction::Downlink) {
                        Ok(NasMessage::Emm(message)) => Some(message),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    fn running_auth(core: &NasCore) -> Option<ProcId> {
        core.contexts()
            .get(1)
            .ok()
            .and_then(|ctx| ctx.procedures.find(ProcedureKind::Common(CommonKind::Authentication)))
    }

    #[test]
    fn test_res_mismatch_rejects_authentication_and_attach() {
        let mut core = core();
        challenged(&mut core);

        core.authentication_response(1, Bytes::from_static(&[0; 8])).unwrap();
        let out = core.take_outbound();
        assert_eq!(emm_messages(&out), vec![EmmMessage::AuthenticationReject]);
        assert!(out.contains(&NasPrimitive::DetachIndication { ue_id: 1 }));
        assert!(!core.contexts().contains(1));
        assert_eq!(core.contexts().get_by_imsi(IMSI), None);
        assert_eq!(core.armed_timers(), 0);
    }

    #[test]
    fn test_matching_res_keeps_key_set_aside() {
        let mut core = core();
        let attach = challenged(&mut core);
        // Stop after authentication
        let auth = running_auth(&core).unwrap();
        core.contexts.get_mut(1).unwrap().procedures.get_mut(auth).unwrap().on_success = Continuation::Noop;

        core.authentication_response(1, Bytes::from(vec![3; 8])).unwrap();
        let ctx = core.contexts().get(1).unwrap();
        let pending = ctx.non_current_security.as_ref().unwrap();
        assert_eq!(pending.kasme, [3; 32]);
        assert!(!ctx.security.is_valid());
        assert!(ctx.procedures.get(attach).is_some());
        assert_eq!(running_auth(&core), None);
    }

    #[test]
    fn test_synch_failure_requests_vectors_with_resync() {
        let mut core = core();
        challenged(&mut core);

        core.authentication_failure(1, EmmCause::SynchFailure, Some([0xaa; 14])).unwrap();
        let out = core.take_outbound();
        let mut expected = vec![3u8; 16];
        expected.extend_from_slice(&[0xaa; 14]);
        assert!(
            out.iter().any(|primitive| matches!(
                primitive,
                NasPrimitive::AuthInfoRequest { ue_id: 1, imsi, resync: Some(resync), .. }
                    if imsi == IMSI && resync[..] == expected[..]
            )),
            "unexpected {:?}",
            out
        );
        assert!(emm_messages(&out).is_empty());

        let ctx = core.contexts().get(1).unwrap();
        assert!(ctx.auth_resync_attempted);
        assert_eq!(ctx.auth_vectors.remaining(), 0);
        assert!(running_auth(&core).is_some());
    }

    #[test]
    fn test_second_synch_failure_rejects() {
        let mut core = core();
        challenged(&mut core);
        core.authentication_failure(1, EmmCause::SynchFailure, Some([0xaa; 14])).unwrap();
        core.take_outbound();

        core.emm_cn(EmmCnPrimitive::AuthInfoAnswer { ue_id: 1, result: Ok(vec![vector(4)]) }).unwrap();
        assert_eq!(
            emm_messages(&core.take_outbound()),
            vec![EmmMessage::AuthenticationRequest { nas_ksi: 0, rand: [4; 16], autn: [4; 16] }]
        );

        core.authentication_failure(1, EmmCause::SynchFailure, Some([0xbb; 14])).unwrap();
        let out = core.take_outbound();
        assert_eq!(emm_messages(&out), vec![EmmMessage::AuthenticationReject]);
        assert!(!out.iter().any(|primitive| matches!(primitive, NasPrimitive::AuthInfoRequest { .. })));
        assert!(!core.contexts().contains(1));
    }

    #[test]
    fn test_mac_failure_rejects_without_resync() {
        let mut core = core();
        challenged(&mut core);

        core.authentication_failure(1, EmmCause::MacFailure, None).unwrap();
        let out = core.take_outbound();
        assert_eq!(emm_messages(&out), vec![EmmMessage::AuthenticationReject]);
        assert!(!core.contexts().contains(1));
    }

    /// Attach running with an authenticated key set and SMC sent
    fn securing(core: &mut NasCore) -> ProcId {
        let attach = attaching(core);
        core.bind_imsi(1, IMSI).unwrap();
        core.contexts.get_mut(1).unwrap().non_current_security = Some(SecurityContext::new_partial(1, [0x77; 32]));
        core.start_security_mode(1, attach, Continuation::AttachSecured).unwrap();
        let out = core.take_outbound();
        assert!(matches!(
            emm_messages(&out).as_slice(),
            [EmmMessage::SecurityModeCommand { eia: 2, nas_ksi: 1, .. }]
        ));
        attach
    }

    #[test]
    fn test_security_mode_reject_fails_attach() {
        let mut core = core();
        securing(&mut core);

        core.security_mode_reject(1, EmmCause::UeSecurityCapabilitiesMismatch).unwrap();
        let out = core.take_outbound();
        assert_eq!(
            emm_messages(&out),
            vec![EmmMessage::AttachReject { cause: EmmCause::SecurityModeRejected, esm_container: None }]
        );
        assert!(!core.contexts().contains(1));
    }

    #[test]
    fn test_security_mode_failure_from_core_network() {
        let mut core = core();
        securing(&mut core);

        core.emm_cn(EmmCnPrimitive::SecurityModeFailure { ue_id: 1, cause: 1 }).unwrap();
        let out = core.take_outbound();
        assert_eq!(
            emm_messages(&out),
            vec![EmmMessage::AttachReject { cause: EmmCause::UeSecurityCapabilitiesMismatch, esm_container: None }]
        );
        assert!(!core.contexts().contains(1));
    }

    #[test]
    fn test_security_mode_without_capability_is_rejected() {
        let mut core = core();
        let attach = attaching(&mut core);
        core.contexts.get_mut(1).unwrap().ue_network_capability.clear();
        core.start_security_mode(1, attach, Continuation::AttachSecured).unwrap();
        assert_eq!(
            emm_messages(&core.take_outbound()),
            vec![EmmMessage::AttachReject { cause: EmmCause::UeSecurityCapabilitiesMismatch, esm_container: None }]
        );
    }

    #[test]
    fn test_identity_response_with_imei_fails_attach() {
        let mut core = core();
        let attach = attaching(&mut core);
        core.start_identification(1, attach, Continuation::AttachIdentified).unwrap();
        assert!(matches!(
            emm_messages(&core.take_outbound()).as_slice(),
            [EmmMessage::IdentityRequest { identity_type: IDENTITY_TYPE_IMSI }]
        ));

        core.identity_response(1, MobileIdentity::Imei("356938035643809".to_string())).unwrap();
        let out = core.take_outbound();
        assert_eq!(
            emm_messages(&out),
            vec![EmmMessage::AttachReject { cause: EmmCause::UeIdentityCannotBeDerived, esm_container: None }]
        );
        assert!(!core.contexts().contains(1));
    }

    #[test]
    fn test_identity_response_evicts_previous_imsi_holder() {
        let mut core = core();
        core.contexts.add(EmmContext::new(2));
        core.bind_imsi(2, IMSI).unwrap();

        let attach = attaching(&mut core);
        core.start_identification(1, attach, Continuation::Noop).unwrap();
        core.take_outbound();

        core.identity_response(1, MobileIdentity::Imsi(IMSI.to_string())).unwrap();
        let out = core.take_outbound();
        assert!(out.contains(&NasPrimitive::DetachIndication { ue_id: 2 }));
        assert!(!core.contexts().contains(2));
        assert_eq!(core.contexts().get_by_imsi(IMSI), Some(1));
        let ctx = core.contexts().get(1).unwrap();
        assert_eq!(ctx.imsi.get().map(String::as_str), Some(IMSI));
        assert!(ctx.procedures.find(ProcedureKind::Common(CommonKind::Identification)).is_none());
        assert!(ctx.procedures.get(attach).is_some());
    }

    #[test]
    fn test_bind_same_imsi_twice_is_idempotent() {
        let mut core = core();
        core.contexts.add(EmmContext::new(2));
        core.bind_imsi(2, IMSI).unwrap();
        core.bind_imsi(2, IMSI).unwrap();
        assert!(core.take_outbound().is_empty());
        assert_eq!(core.contexts().get_by_imsi(IMSI), Some(2));
    }
}
