//! EMM Detach Procedure
//!
//! UE-initiated, network-initiated and implicit detach, and the release of
//! everything a subscriber holds.

use crate::context::MmeUeId;
use crate::error::{EmmCause, FsmError, NasError, NasResult};
use crate::event::{DetachParams, NasPrimitive};
use crate::nas_codec::EmmMessage;
use crate::nas_task::NasCore;
use crate::procedure::{Continuation, Outcome, ProcedureData, ProcedureKind, ProcedureSpec, SpecificKind};
use crate::sm::{EmmSignal, Fsm};
use crate::timer::NasTimer;

impl NasCore {
    /// Detach requested by the UE or by management
    pub(crate) fn detach(&mut self, ue_id: MmeUeId, params: DetachParams) -> NasResult<()> {
        let Ok(ctx) = self.contexts.get_mut(ue_id) else {
            log::info!("[ue_id={}] Detach of an unknown subscriber, releasing sessions", ue_id);
            self.release_sessions(ue_id);
            self.emit(NasPrimitive::DetachIndication { ue_id });
            return Ok(());
        };

        match ctx.fsm.dispatch(EmmSignal::DetachInitiated) {
            Ok(_) => {}
            Err(FsmError::DetachAlreadyInitiated) => {
                log::warn!("[ue_id={}] Detach already in progress", ue_id);
                return Err(NasError::ProcedureInProgress);
            }
            Err(err) => return Err(err.into()),
        }
        log::info!(
            "[ue_id={}] Detach [IMSI:{}] type {} switch_off {}",
            ue_id,
            ctx.imsi_str(),
            params.detach_type,
            params.switch_off
        );

        self.abort_procedures(ue_id)?;
        if !params.switch_off {
            if let Err(err) = self.send_nas(ue_id, EmmMessage::DetachAccept) {
                log::warn!("[ue_id={}] Detach accept not sent: {}", ue_id, err);
            }
        }
        self.release_subscriber(ue_id)
    }

    /// DETACH ACCEPT for a network-initiated detach
    pub(crate) fn detach_accept(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let ctx = self.contexts.get(ue_id)?;
        let id = match ctx.procedures.specific() {
            Some(p) if p.kind == ProcedureKind::Specific(SpecificKind::Detach) => p.id,
            _ => {
                log::warn!("[ue_id={}] Detach accept without a detach request, ignored", ue_id);
                return Ok(());
            }
        };
        self.finish_procedure(ue_id, id, Outcome::Success)
    }

    /// Network-initiated detach (TS 24.301 Section 5.5.2.3)
    ///
    /// A subscriber without a signalling connection is detached implicitly.
    pub(crate) fn network_detach(
        &mut self,
        ue_id: MmeUeId,
        detach_type: u8,
        cause: Option<EmmCause>,
    ) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        if !ctx.connected {
            log::info!("[ue_id={}] Subscriber not connected, detaching implicitly", ue_id);
            return self.implicit_detach(ue_id);
        }
        match ctx.fsm.dispatch(EmmSignal::DetachInitiated) {
            Ok(_) => {}
            Err(FsmError::DetachAlreadyInitiated) => return Err(NasError::ProcedureInProgress),
            Err(err) => return Err(err.into()),
        }

        let spec = ProcedureSpec::new(self.config.timers.get(NasTimer::T3422))
            .on_success(Continuation::DetachCompleted)
            .on_failure(Continuation::DetachCompleted)
            .data(ProcedureData::Detach { detach_type });
        let id = match ctx.procedures.create_specific(SpecificKind::Detach, spec.clone()) {
            Ok(id) => id,
            Err(NasError::Conflict { active, .. }) => {
                log::info!("[ue_id={}] {:?} aborted by network detach", ue_id, active);
                self.abort_procedures(ue_id)?;
                self.contexts
                    .get_mut(ue_id)?
                    .procedures
                    .create_specific(SpecificKind::Detach, spec)?
            }
            Err(err) => return Err(err),
        };

        log::info!("[ue_id={}] Detach request to UE, type {}", ue_id, detach_type);
        self.send_procedure_message(ue_id, id, EmmMessage::DetachRequestDl { detach_type, cause }, false)
    }

    /// Local detach without signalling to the UE
    pub(crate) fn implicit_detach(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let Ok(ctx) = self.contexts.get_mut(ue_id) else {
            return Ok(());
        };
        if let Err(err) = ctx.fsm.dispatch(EmmSignal::DetachInitiated) {
            log::debug!("[ue_id={}] {}", ue_id, err);
        }
        log::info!("[ue_id={}] Implicit detach [IMSI:{}]", ue_id, ctx.imsi_str());
        self.abort_procedures(ue_id)?;
        self.release_subscriber(ue_id)
    }

    /// Drop every PDN connection and ESM transaction of a subscriber
    pub(crate) fn release_sessions(&mut self, ue_id: MmeUeId) {
        let Some(mut sessions) = self.sessions.remove(ue_id) else {
            return;
        };
        for transaction in sessions.take_transactions() {
            if let Some(timer) = transaction.timer {
                self.timers.cancel(timer);
            }
        }
        log::debug!(
            "[ue_id={}] {} PDN connections, {} bearers released",
            ue_id,
            sessions.pdn_count(),
            sessions.bearer_count()
        );
    }

    /// Release sessions, security and context of a subscriber
    ///
    /// Emits exactly one detach indication when there was anything to release.
    pub(crate) fn release_subscriber(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let had_sessions = self.sessions.get(ue_id).is_some();
        self.release_sessions(ue_id);

        let had_context = match self.contexts.get_mut(ue_id) {
            Ok(ctx) => {
                ctx.security.clear();
                ctx.non_current_security = None;
                ctx.auth_vectors.clear();
                if let Err(err) = ctx.fsm.dispatch(EmmSignal::DetachConfirmed) {
                    log::debug!("[ue_id={}] {}", ue_id, err);
                }
                self.abort_procedures(ue_id)?;
                if let Some(ctx) = self.contexts.remove(ue_id) {
                    log::info!("[ue_id={}] Subscriber released [IMSI:{}]", ue_id, ctx.imsi_str());
                    if ctx.connected {
                        self.emit(NasPrimitive::ReleaseRequest { ue_id });
                    }
                }
                true
            }
            Err(_) => false,
        };

        if had_context || had_sessions {
            self.emit(NasPrimitive::DetachIndication { ue_id });
        }
        Ok(())
    }
}
