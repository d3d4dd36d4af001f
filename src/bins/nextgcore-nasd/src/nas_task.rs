//! NAS Task
//!
//! The single owner of every EMM and ESM context. Events enter through an
//! ordered queue and are handled one at a time; timer expiries are polled
//! from a cooperative wheel and queued like any other event. Outbound
//! primitives collect in an outbox drained by the hosting runtime.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::{NasConfig, SecurityPolicy};
use crate::context::{ContextStore, MmeUeId};
use crate::error::{EmmCause, NasError, NasResult, ProcedureError, SecurityError};
use crate::esm_context::SessionStore;
use crate::event::{LowerLayerKind, NasEvent, NasPrimitive, TimerEvent, TimerTarget};
use crate::nas_codec::{Direction, EmmMessage, NasMessage};
use crate::nas_security::{protect, select_header_type};
use crate::procedure::{Continuation, Expiry, Outcome, PendingMessage, ProcId, Procedure, ProcedureKind};
use crate::sm::{EmmSignal, Fsm};
use crate::timer::{TimerId, TimerWheel};

/// NAS core: contexts, procedures and SAP dispatch
#[derive(Debug)]
pub struct NasCore {
    pub(crate) config: NasConfig,
    pub(crate) policy: SecurityPolicy,
    pub(crate) contexts: ContextStore,
    pub(crate) sessions: SessionStore,
    pub(crate) timers: TimerWheel<TimerEvent>,
    now: Instant,
    inbound: VecDeque<NasEvent>,
    outbox: Vec<NasPrimitive>,
}

impl NasCore {
    /// Create the core from a validated configuration
    pub fn new(config: NasConfig) -> NasResult<Self> {
        config.validate()?;
        let policy = config.security.policy()?;
        let contexts = ContextStore::new(config.gummei.gummei());
        log::info!(
            "NAS core initialized (integrity {:?}, ciphering {:?})",
            policy.integrity_order,
            policy.ciphering_order
        );
        Ok(Self {
            config,
            policy,
            contexts,
            sessions: SessionStore::new(),
            timers: TimerWheel::new(),
            now: Instant::now(),
            inbound: VecDeque::new(),
            outbox: Vec::new(),
        })
    }

    // ========================================================================
    // Queue and clock
    // ========================================================================

    /// Queue an inbound event
    pub fn enqueue(&mut self, event: NasEvent) {
        self.inbound.push_back(event);
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Handle every queued event in arrival order
    ///
    /// Errors are scoped to the event that raised them; they are logged and
    /// the queue keeps draining.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.inbound.pop_front() {
            let ue_id = event.ue_id();
            if let Err(err) = self.handle_event(event) {
                log::warn!("[ue_id={}] Event dropped: {}", ue_id, err);
            }
            handled += 1;
        }
        handled
    }

    /// Current time of the task clock
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue an event for every timer due at the current time
    pub fn poll_timers(&mut self) -> usize {
        let fired = self.timers.expired(self.now);
        let count = fired.len();
        for (id, event) in fired {
            self.inbound.push_back(NasEvent::Timer { id, event });
        }
        count
    }

    /// Move the clock forward, then handle due timers and queued events
    pub fn advance(&mut self, by: Duration) -> usize {
        self.now += by;
        self.poll_timers();
        self.run_pending()
    }

    /// Move the clock to `now` (never backwards), then run
    pub fn advance_to(&mut self, now: Instant) -> usize {
        if now > self.now {
            self.now = now;
        }
        self.poll_timers();
        self.run_pending()
    }

    /// Earliest armed timer deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Take every primitive emitted so far
    pub fn take_outbound(&mut self) -> Vec<NasPrimitive> {
        std::mem::take(&mut self.outbox)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Mobility contexts
    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    /// Session contexts
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Active configuration
    pub fn config(&self) -> &NasConfig {
        &self.config
    }

    /// Number of armed timers
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Targets of the timers armed for a subscriber
    pub fn timer_targets(&self, ue_id: MmeUeId) -> Vec<TimerTarget> {
        self.timers
            .payloads()
            .filter(|event| event.ue_id == ue_id)
            .map(|event| event.target)
            .collect()
    }

    /// Drop every context and timer (task shutdown)
    pub fn shutdown(&mut self) {
        let contexts = self.contexts.drain();
        log::info!(
            "NAS core shutdown: {} contexts, {} session owners, {} timers, {} queued events dropped",
            contexts.len(),
            self.sessions.len(),
            self.timers.len(),
            self.inbound.len()
        );
        self.sessions.clear();
        self.timers.clear();
        self.inbound.clear();
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle one event
    pub fn handle_event(&mut self, event: NasEvent) -> NasResult<()> {
        match event {
            NasEvent::EstablishRequest { ue_id, pdu } => self.establish_request(ue_id, pdu),
            NasEvent::DataIndication { ue_id, pdu } => self.data_indication(ue_id, pdu),
            NasEvent::ReleaseIndication { ue_id } => self.lower_layer(ue_id, LowerLayerKind::Release, None),
            NasEvent::LowerLayer { ue_id, kind, pdu } => self.lower_layer(ue_id, kind, pdu),
            NasEvent::BearerSetupResponse { ue_id, bearers } => self.bearer_setup_response(ue_id, bearers),
            NasEvent::HandoverRequired { ue_id, target } => self.handover_required(ue_id, target),
            NasEvent::Detach { ue_id, params } => self.detach(ue_id, params),
            NasEvent::Cn(primitive) => self.emm_cn(primitive),
            NasEvent::Session(primitive) => self.esm_sap(primitive),
            NasEvent::Timer { id, event } => self.on_timer(id, event),
        }
    }

    fn on_timer(&mut self, timer: TimerId, event: TimerEvent) -> NasResult<()> {
        match event.target {
            TimerTarget::Procedure(id) => self.on_procedure_timer(event.ue_id, id, timer),
            TimerTarget::EsmTransaction(ebi) => self.on_esm_timer(event.ue_id, ebi, timer),
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    pub(crate) fn emit(&mut self, primitive: NasPrimitive) {
        log::debug!("Sending {}", primitive);
        self.outbox.push(primitive);
    }

    /// Protect a plain downlink message with the subscriber's context
    ///
    /// `new_context` selects the non-current context (security mode command).
    pub(crate) fn protect_for(&mut self, ue_id: MmeUeId, plain: &[u8], new_context: bool) -> NasResult<Bytes> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let security = if new_context {
            ctx.non_current_security.as_mut().ok_or(SecurityError::NoSecurityContext)?
        } else {
            &mut ctx.security
        };
        let header = select_header_type(security, new_context);
        Ok(protect(security, header, plain, Direction::Downlink)?)
    }

    /// Protect and send a downlink NAS message
    pub(crate) fn send_nas(&mut self, ue_id: MmeUeId, message: impl Into<NasMessage>) -> NasResult<Bytes> {
        let plain = message.into().encode();
        let pdu = self.protect_for(ue_id, &plain, false)?;
        self.emit(NasPrimitive::DataRequest { ue_id, pdu: pdu.clone() });
        Ok(pdu)
    }

    /// Encode and protect a reject; falls back to a plain message when the
    /// subscriber or its context is gone
    pub(crate) fn protect_or_plain(&mut self, ue_id: MmeUeId, message: impl Into<NasMessage>) -> Bytes {
        let plain = message.into().encode();
        match self.protect_for(ue_id, &plain, false) {
            Ok(pdu) => pdu,
            Err(err) => {
                log::debug!("[ue_id={}] Sending plain: {}", ue_id, err);
                plain
            }
        }
    }

    /// Report a protocol error to the UE without touching its procedures
    pub(crate) fn send_emm_status(&mut self, ue_id: MmeUeId, cause: EmmCause) -> NasResult<()> {
        let plain = NasMessage::from(EmmMessage::EmmStatus { cause }).encode();
        let pdu = self.protect_for(ue_id, &plain, false)?;
        log::info!("[ue_id={}] EMM STATUS sent, cause {}", ue_id, cause);
        self.emit(NasPrimitive::StatusIndication { ue_id, cause, pdu });
        Ok(())
    }

    // ========================================================================
    // Procedure lifecycle
    // ========================================================================

    /// Send the pending message of a procedure and arm its guard timer
    pub(crate) fn transmit(&mut self, ue_id: MmeUeId, id: ProcId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let procedure = ctx.procedures.get(id).ok_or(ProcedureError::NotFound(id))?;
        let pending = procedure.pending.clone();
        let duration = procedure.duration;
        let kind = procedure.kind;

        match pending {
            Some(PendingMessage::Nas { plain, new_context }) => {
                let pdu = self.protect_for(ue_id, &plain, new_context)?;
                self.contexts.get_mut(ue_id)?.procedures.record_digest(id, &pdu);
                self.emit(NasPrimitive::DataRequest { ue_id, pdu });
            }
            Some(PendingMessage::Cn(primitive)) => self.emit(primitive),
            None => log::debug!("[ue_id={}] {} has nothing to send", ue_id, kind),
        }
        self.arm_procedure_timer(ue_id, id, duration)
    }

    /// Make `message` the pending message of a procedure and send it
    pub(crate) fn send_procedure_message(
        &mut self,
        ue_id: MmeUeId,
        id: ProcId,
        message: impl Into<NasMessage>,
        new_context: bool,
    ) -> NasResult<()> {
        let plain = message.into().encode();
        self.contexts
            .get_mut(ue_id)?
            .procedures
            .set_pending(id, PendingMessage::Nas { plain, new_context })?;
        self.transmit(ue_id, id)
    }

    /// Arm (or re-arm) the guard timer of a procedure
    pub(crate) fn arm_procedure_timer(&mut self, ue_id: MmeUeId, id: ProcId, after: Duration) -> NasResult<()> {
        let timer = self.timers.start(
            self.now,
            after,
            TimerEvent { ue_id, target: TimerTarget::Procedure(id) },
        );
        let armed = self
            .contexts
            .get_mut(ue_id)
            .and_then(|ctx| ctx.procedures.arm(id, timer).map_err(NasError::from));
        match armed {
            Ok(replaced) => {
                if let Some(old) = replaced {
                    self.timers.cancel(old);
                }
                log::debug!("[ue_id={}] {} armed for {} ({:?})", ue_id, timer, id, after);
                Ok(())
            }
            Err(err) => {
                self.timers.cancel(timer);
                Err(err)
            }
        }
    }

    /// Resolve a procedure and run its continuation
    ///
    /// Timers of the procedure and of every torn-down descendant are
    /// cancelled before the continuation runs.
    pub(crate) fn finish_procedure(&mut self, ue_id: MmeUeId, id: ProcId, outcome: Outcome) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let resolved = ctx.procedures.resolve(id)?;

        if let ProcedureKind::Common(_) = resolved.procedure.kind {
            let signal = if outcome.is_success() {
                EmmSignal::CommonProcConfirmed
            } else {
                EmmSignal::CommonProcRejected
            };
            if let Err(err) = ctx.fsm.dispatch(signal) {
                log::debug!("[ue_id={}] {} not applied: {}", ue_id, resolved.procedure.kind, err);
            }
        }

        for timer in resolved.timers() {
            self.timers.cancel(timer);
        }
        for child in &resolved.torn_down {
            log::debug!("[ue_id={}] {} {} torn down with {}", ue_id, child.kind, child.id, id);
        }
        log::info!("[ue_id={}] {} {} finished: {:?}", ue_id, resolved.procedure.kind, id, outcome);

        let continuation = resolved.procedure.continuation(outcome);
        self.run_continuation(ue_id, &resolved.procedure, outcome, continuation)
    }

    fn run_continuation(
        &mut self,
        ue_id: MmeUeId,
        procedure: &Procedure,
        outcome: Outcome,
        continuation: Continuation,
    ) -> NasResult<()> {
        let parent = || procedure.parent.ok_or(ProcedureError::NoSpecific);

        match continuation {
            Continuation::Noop => Ok(()),
            Continuation::AttachIdentified => self.attach_authenticate(ue_id, parent()?),
            Continuation::AttachContextFailed => {
                self.start_identification(ue_id, parent()?, Continuation::AttachIdentified)
            }
            Continuation::AttachAuthenticated => {
                self.start_security_mode(ue_id, parent()?, Continuation::AttachSecured)
            }
            Continuation::AttachSecured => self.attach_session_setup(ue_id, parent()?),
            Continuation::AttachFailed => self.attach_failed(ue_id, procedure, outcome),
            Continuation::TauContextImported => self.tau_context_imported(ue_id, parent()?),
            Continuation::TauContextFailed => self.finish_procedure(
                ue_id,
                parent()?,
                Outcome::Rejected(EmmCause::UeIdentityCannotBeDerived),
            ),
            Continuation::TauAuthenticated => {
                self.start_security_mode(ue_id, parent()?, Continuation::TauSecured)
            }
            Continuation::TauSecured => self.tau_accept(ue_id, parent()?),
            Continuation::TauFailed => self.tau_failed(ue_id, outcome),
            Continuation::AuthVectorsReady => self.send_auth_challenge(ue_id, parent()?),
            Continuation::FailParent => match procedure.parent {
                Some(parent) => self.finish_procedure(ue_id, parent, outcome),
                None => Ok(()),
            },
            Continuation::ImplicitDetach => self.implicit_detach(ue_id),
            Continuation::DetachCompleted => self.release_subscriber(ue_id),
        }
    }

    fn on_procedure_timer(&mut self, ue_id: MmeUeId, id: ProcId, timer: TimerId) -> NasResult<()> {
        let Ok(ctx) = self.contexts.get_mut(ue_id) else {
            log::debug!("[ue_id={}] {} expired for a released subscriber", ue_id, timer);
            return Ok(());
        };
        let expiry = ctx.procedures.on_expiry(id, timer);
        let kind = ctx.procedures.get(id).map(|p| p.kind);

        match (expiry, kind) {
            (Expiry::Retransmit { attempt }, Some(kind)) => {
                log::info!(
                    "[ue_id={}] {} expired for {}, retransmission #{}",
                    ue_id,
                    kind.timer(),
                    kind,
                    attempt
                );
                self.transmit(ue_id, id)
            }
            (Expiry::Exhausted, Some(kind)) => {
                log::warn!("[ue_id={}] {} expired for {}, retries exhausted", ue_id, kind.timer(), kind);
                self.finish_procedure(ue_id, id, kind.timeout_outcome())
            }
            _ => {
                log::debug!("[ue_id={}] Stale {} for {} ignored", ue_id, timer, id);
                Ok(())
            }
        }
    }

    /// Retransmit on behalf of the lower layer, sharing the retry budget
    pub(crate) fn retry_procedure(&mut self, ue_id: MmeUeId, id: ProcId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let kind = ctx.procedures.get(id).map(|p| p.kind).ok_or(ProcedureError::NotFound(id))?;
        match ctx.procedures.retry(id)? {
            Expiry::Retransmit { attempt } => {
                log::info!("[ue_id={}] Resending {} message, attempt #{}", ue_id, kind, attempt);
                self.transmit(ue_id, id)
            }
            Expiry::Exhausted => {
                log::warn!("[ue_id={}] {} undeliverable, retries exhausted", ue_id, kind);
                self.finish_procedure(ue_id, id, kind.timeout_outcome())
            }
            Expiry::Stale => Ok(()),
        }
    }

    /// Drop every procedure of a subscriber without running continuations
    pub(crate) fn abort_procedures(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        ctx.pending_esm = None;
        for procedure in ctx.procedures.abort_all() {
            log::info!("[ue_id={}] {} {} aborted", ue_id, procedure.kind, procedure.id);
            if let Some(timer) = procedure.timer {
                self.timers.cancel(timer);
            }
        }
        Ok(())
    }

    /// Move a subscriber to a new handle, timers included
    pub(crate) fn rebind(&mut self, from: MmeUeId, to: MmeUeId) -> NasResult<()> {
        self.contexts.rebind(from, to)?;
        self.sessions.rebind(from, to);
        for event in self.timers.payloads_mut().filter(|event| event.ue_id == from) {
            event.ue_id = to;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DetachParams, EmmCnPrimitive};
    use crate::nas_codec::DETACH_TYPE_EPS;

    fn core() -> NasCore {
        NasCore::new(NasConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = NasConfig { max_auth_vectors: 0, ..NasConfig::default() };
        assert!(matches!(NasCore::new(config), Err(NasError::Config(_))));
    }

    #[test]
    fn test_errors_do_not_stop_the_queue() {
        let mut core = core();
        core.enqueue(NasEvent::DataIndication { ue_id: 1, pdu: Bytes::from_static(&[0x07, 0x41]) });
        core.enqueue(NasEvent::Detach {
            ue_id: 2,
            params: DetachParams { detach_type: DETACH_TYPE_EPS, cause: None, switch_off: true },
        });
        assert_eq!(core.run_pending(), 2);
        assert_eq!(core.take_outbound(), vec![NasPrimitive::DetachIndication { ue_id: 2 }]);
        assert_eq!(core.pending(), 0);
    }

    #[test]
    fn test_unmatched_cn_response_is_discarded() {
        let mut core = core();
        core.enqueue(NasEvent::Cn(EmmCnPrimitive::AuthInfoAnswer { ue_id: 9, result: Ok(Vec::new()) }));
        core.run_pending();
        assert!(core.take_outbound().is_empty());
        assert!(core.contexts().is_empty());
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let mut core = core();
        let start = core.now();
        core.advance(Duration::from_secs(3));
        core.advance_to(start);
        assert_eq!(core.now(), start + Duration::from_secs(3));
    }

    #[test]
    fn test_shutdown_clears_state() {
        let mut core = core();
        core.contexts.add(crate::context::EmmContext::new(4));
        core.sessions.entry(4);
        core.shutdown();
        assert!(core.contexts().is_empty());
        assert!(core.sessions().is_empty());
        assert_eq!(core.armed_timers(), 0);
    }
}
