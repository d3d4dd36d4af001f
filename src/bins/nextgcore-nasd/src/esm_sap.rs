//! ESM SAP
//!
//! EPS session management towards the UE (TS 24.301 Section 6): UE-requested
//! PDN connectivity and disconnect, and the network-initiated bearer
//! activation, modification and deactivation procedures with their T3485,
//! T3486 and T3495 retransmissions.

use bytes::Bytes;

use crate::context::MmeUeId;
use crate::error::{EsmCause, NasError, NasResult};
use crate::esm_context::{
    BearerQos, Ebi, EsmProcedure, EsmTransaction, Fteid, PdnSetup, PdnType, RemovedBearer,
};
use crate::event::{BearerSetupItem, NasPrimitive, SessionPrimitive, TimerEvent, TimerTarget};
use crate::nas_codec::{EsmBody, EsmMessage};
use crate::nas_task::NasCore;
use crate::procedure::AttachPhase;
use crate::sm::EmmState;
use crate::timer::TimerId;

impl NasCore {
    // ========================================================================
    // From the UE
    // ========================================================================

    /// Standalone ESM message from a registered UE
    pub(crate) fn esm_message(&mut self, ue_id: MmeUeId, message: EsmMessage) -> NasResult<()> {
        let state = self.contexts.get(ue_id)?.state();
        if !matches!(state, EmmState::Registered | EmmState::CommonProcedureInitiated) {
            log::warn!("[ue_id={}] ESM message {:#04x} in {}, discarded", ue_id, message.message_type(), state);
            return Err(NasError::Esm(EsmCause::MessageTypeNotCompatible));
        }

        let EsmMessage { ebi, pti, body } = message;
        match body {
            EsmBody::PdnConnectivityRequest { pdn_type, apn, .. } => {
                self.pdn_connectivity_request(ue_id, pti, pdn_type, apn)
            }
            EsmBody::PdnDisconnectRequest { linked_ebi } => self.pdn_disconnect_request(ue_id, pti, linked_ebi),
            EsmBody::ActivateDefaultBearerAccept => {
                self.bearer_activate_accepted(ue_id, ebi, EsmProcedure::ActivateDefault)
            }
            EsmBody::ActivateDedicatedBearerAccept => {
                self.bearer_activate_accepted(ue_id, ebi, EsmProcedure::ActivateDedicated)
            }
            EsmBody::ActivateDefaultBearerReject { cause } => {
                self.bearer_activate_rejected(ue_id, ebi, EsmProcedure::ActivateDefault, cause)
            }
            EsmBody::ActivateDedicatedBearerReject { cause } => {
                self.bearer_activate_rejected(ue_id, ebi, EsmProcedure::ActivateDedicated, cause)
            }
            EsmBody::ModifyBearerAccept => self.bearer_modify_accepted(ue_id, ebi),
            EsmBody::ModifyBearerReject { cause } => self.bearer_modify_rejected(ue_id, ebi, cause),
            EsmBody::DeactivateBearerAccept => self.bearer_deactivate_accepted(ue_id, ebi),
            EsmBody::EsmStatus { cause } => {
                log::warn!("[ue_id={}] ESM STATUS received for EBI {}, cause {}", ue_id, ebi, cause);
                Ok(())
            }
            other => {
                log::warn!("[ue_id={}] Network-only ESM message received: {:?}", ue_id, other);
                self.send_esm(
                    ue_id,
                    EsmMessage { ebi, pti, body: EsmBody::EsmStatus { cause: EsmCause::MessageTypeNotCompatible } },
                )
            }
        }
    }

    fn send_esm(&mut self, ue_id: MmeUeId, message: EsmMessage) -> NasResult<()> {
        self.send_nas(ue_id, message).map(|_| ())
    }

    fn pdn_connectivity_request(
        &mut self,
        ue_id: MmeUeId,
        pti: u8,
        pdn_type: PdnType,
        apn: Option<String>,
    ) -> NasResult<()> {
        let apn = apn.unwrap_or_else(|| self.config.default_apn.clone());
        if self.sessions.get(ue_id).and_then(|s| s.pdn_by_apn(&apn)).is_some() {
            log::warn!("[ue_id={}] PDN connection to {} already exists", ue_id, apn);
            return self.send_esm(
                ue_id,
                EsmMessage {
                    ebi: 0,
                    pti,
                    body: EsmBody::PdnConnectivityReject { cause: EsmCause::MultiplePdnForApnNotAllowed },
                },
            );
        }
        log::info!("[ue_id={}] PDN connectivity request, APN {} PTI {}", ue_id, apn, pti);
        self.emit(NasPrimitive::ConnectivityRequest { ue_id, pti, apn, pdn_type });
        Ok(())
    }

    fn pdn_disconnect_request(&mut self, ue_id: MmeUeId, pti: u8, linked_ebi: Ebi) -> NasResult<()> {
        let sessions = self.sessions.get(ue_id);
        let cause = match sessions.map(|s| (s.pdn(linked_ebi).is_some(), s.pdn_count())) {
            Some((true, count)) if count > 1 => None,
            Some((true, _)) => Some(EsmCause::LastPdnDisconnectionNotAllowed),
            _ => Some(EsmCause::InvalidEpsBearerIdentity),
        };
        if let Some(cause) = cause {
            log::warn!("[ue_id={}] PDN disconnect of EBI {} rejected, cause {}", ue_id, linked_ebi, cause);
            return self.send_esm(ue_id, EsmMessage { ebi: 0, pti, body: EsmBody::PdnDisconnectReject { cause } });
        }
        log::info!("[ue_id={}] PDN disconnect request, EBI {} PTI {}", ue_id, linked_ebi, pti);
        self.emit(NasPrimitive::DisconnectRequest { ue_id, pti, ebi: linked_ebi });
        Ok(())
    }

    fn bearer_activate_accepted(&mut self, ue_id: MmeUeId, ebi: Ebi, procedure: EsmProcedure) -> NasResult<()> {
        if self.take_esm_transaction(ue_id, ebi, procedure).is_none() {
            return Ok(());
        }
        if let Some(bearer) = self.sessions.get_mut(ue_id).and_then(|s| s.bearer_mut(ebi)) {
            let state = bearer.on_nas_accept();
            log::info!("[ue_id={}] Bearer {} accepted ({:?})", ue_id, ebi, state);
        }
        self.emit(NasPrimitive::BearerActivateResult { ue_id, ebi, result: Ok(()) });
        Ok(())
    }

    fn bearer_activate_rejected(
        &mut self,
        ue_id: MmeUeId,
        ebi: Ebi,
        procedure: EsmProcedure,
        cause: EsmCause,
    ) -> NasResult<()> {
        if self.take_esm_transaction(ue_id, ebi, procedure).is_none() {
            return Ok(());
        }
        log::warn!("[ue_id={}] Bearer {} activation rejected, cause {}", ue_id, ebi, cause);
        self.release_bearer(ue_id, ebi);
        self.emit(NasPrimitive::BearerActivateResult { ue_id, ebi, result: Err(cause) });
        Ok(())
    }

    fn bearer_modify_accepted(&mut self, ue_id: MmeUeId, ebi: Ebi) -> NasResult<()> {
        let Some(transaction) = self.take_esm_transaction(ue_id, ebi, EsmProcedure::Modify) else {
            return Ok(());
        };
        if let Ok(EsmMessage { body: EsmBody::ModifyBearerRequest { qos, tft }, .. }) =
            EsmMessage::from_bytes(&transaction.message)
        {
            if let Some(bearer) = self.sessions.get_mut(ue_id).and_then(|s| s.bearer_mut(ebi)) {
                bearer.qos = qos;
                if !tft.is_empty() {
                    bearer.tft = tft;
                }
            }
        }
        log::info!("[ue_id={}] Bearer {} modified", ue_id, ebi);
        self.emit(NasPrimitive::BearerModifyResult { ue_id, ebi, result: Ok(()) });
        Ok(())
    }

    fn bearer_modify_rejected(&mut self, ue_id: MmeUeId, ebi: Ebi, cause: EsmCause) -> NasResult<()> {
        if self.take_esm_transaction(ue_id, ebi, EsmProcedure::Modify).is_none() {
            return Ok(());
        }
        log::warn!("[ue_id={}] Bearer {} modification rejected, cause {}", ue_id, ebi, cause);
        self.emit(NasPrimitive::BearerModifyResult { ue_id, ebi, result: Err(cause) });
        Ok(())
    }

    fn bearer_deactivate_accepted(&mut self, ue_id: MmeUeId, ebi: Ebi) -> NasResult<()> {
        if self.take_esm_transaction(ue_id, ebi, EsmProcedure::Deactivate).is_none() {
            return Ok(());
        }
        log::info!("[ue_id={}] Bearer {} deactivated", ue_id, ebi);
        self.release_bearer(ue_id, ebi);
        self.emit(NasPrimitive::BearerDeactivateResult { ue_id, ebi, result: Ok(()) });
        Ok(())
    }

    // ========================================================================
    // From the session layer
    // ========================================================================

    /// Dispatch a session layer primitive
    pub(crate) fn esm_sap(&mut self, primitive: SessionPrimitive) -> NasResult<()> {
        match primitive {
            SessionPrimitive::SessionConfigResult { ue_id, result } => self.attach_session_configured(ue_id, result),
            SessionPrimitive::ConnectivityResult { ue_id, pti, result } => {
                match self.attach_in_phase(ue_id, AttachPhase::Connectivity) {
                    Some((id, data)) if data.pti == pti => self.attach_connectivity(ue_id, id, result),
                    _ => self.pdn_connectivity_result(ue_id, pti, result),
                }
            }
            SessionPrimitive::DisconnectResult { ue_id, pti, ebi, result } => {
                self.pdn_disconnect_result(ue_id, pti, ebi, result)
            }
            SessionPrimitive::BearerActivateRequest { ue_id, linked_ebi, qos, tft } => {
                self.bearer_activate_request(ue_id, linked_ebi, qos, tft)
            }
            SessionPrimitive::BearerModifyRequest { ue_id, ebi, qos, tft } => {
                self.bearer_modify_request(ue_id, ebi, qos, tft)
            }
            SessionPrimitive::BearerDeactivateRequest { ue_id, ebi, cause } => {
                self.bearer_deactivate_request(ue_id, ebi, cause)
            }
        }
    }

    fn pdn_connectivity_result(&mut self, ue_id: MmeUeId, pti: u8, result: Result<PdnSetup, EsmCause>) -> NasResult<()> {
        self.contexts.get(ue_id)?;
        let setup = match result {
            Ok(setup) => setup,
            Err(cause) => {
                log::warn!("[ue_id={}] PDN connectivity rejected by the session layer, cause {}", ue_id, cause);
                return self.send_esm(ue_id, EsmMessage { ebi: 0, pti, body: EsmBody::PdnConnectivityReject { cause } });
            }
        };

        let sessions = self.sessions.entry(ue_id);
        let ebi = match sessions.create_pdn(setup.clone()) {
            Ok(ebi) => ebi,
            Err(cause) => {
                log::warn!("[ue_id={}] PDN connection to {} not created, cause {}", ue_id, setup.apn, cause);
                return self.send_esm(ue_id, EsmMessage { ebi: 0, pti, body: EsmBody::PdnConnectivityReject { cause } });
            }
        };
        if let Some(bearer) = sessions.bearer_mut(ebi) {
            bearer.mark_created_at_mme();
        }

        log::info!("[ue_id={}] PDN connection to {} on EBI {}, PAA {}", ue_id, setup.apn, ebi, setup.paa);
        self.emit(NasPrimitive::BearerSetupRequest {
            ue_id,
            bearers: vec![BearerSetupItem { ebi, qos: setup.qos, sgw_fteid: setup.sgw_fteid }],
        });
        let message = EsmMessage {
            ebi,
            pti,
            body: EsmBody::ActivateDefaultBearerRequest {
                qos: setup.qos,
                apn: setup.apn,
                paa: setup.paa,
                ambr: setup.ambr,
            },
        };
        self.start_esm_transaction(ue_id, ebi, pti, EsmProcedure::ActivateDefault, message)
    }

    fn pdn_disconnect_result(
        &mut self,
        ue_id: MmeUeId,
        pti: u8,
        ebi: Ebi,
        result: Result<(), EsmCause>,
    ) -> NasResult<()> {
        match result {
            Ok(()) => {
                let message = EsmMessage {
                    ebi,
                    pti,
                    body: EsmBody::DeactivateBearerRequest { cause: EsmCause::RegularDeactivation },
                };
                self.start_esm_transaction(ue_id, ebi, pti, EsmProcedure::Deactivate, message)
            }
            Err(cause) => {
                log::warn!("[ue_id={}] PDN disconnect of EBI {} failed, cause {}", ue_id, ebi, cause);
                self.send_esm(ue_id, EsmMessage { ebi: 0, pti, body: EsmBody::PdnDisconnectReject { cause } })
            }
        }
    }

    fn bearer_activate_request(&mut self, ue_id: MmeUeId, linked_ebi: Ebi, qos: BearerQos, tft: Bytes) -> NasResult<()> {
        self.contexts.get(ue_id)?;
        let added = self
            .sessions
            .get_mut(ue_id)
            .ok_or(EsmCause::InvalidEpsBearerIdentity)
            .and_then(|sessions| sessions.add_bearer(linked_ebi, qos, tft.clone()));
        let ebi = match added {
            Ok(ebi) => ebi,
            Err(cause) => {
                log::warn!("[ue_id={}] Dedicated bearer on EBI {} refused, cause {}", ue_id, linked_ebi, cause);
                self.emit(NasPrimitive::BearerActivateResult { ue_id, ebi: linked_ebi, result: Err(cause) });
                return Ok(());
            }
        };

        let mut sgw_fteid = None;
        if let Some(bearer) = self.sessions.get_mut(ue_id).and_then(|s| s.bearer_mut(ebi)) {
            bearer.mark_created_at_mme();
            sgw_fteid = bearer.sgw_fteid;
        }
        log::info!("[ue_id={}] Dedicated bearer {} linked to {}, QCI {}", ue_id, ebi, linked_ebi, qos.qci);
        self.emit(NasPrimitive::BearerSetupRequest { ue_id, bearers: vec![BearerSetupItem { ebi, qos, sgw_fteid }] });

        let message = EsmMessage { ebi, pti: 0, body: EsmBody::ActivateDedicatedBearerRequest { linked_ebi, qos, tft } };
        self.start_esm_transaction(ue_id, ebi, 0, EsmProcedure::ActivateDedicated, message)
    }

    fn bearer_modify_request(&mut self, ue_id: MmeUeId, ebi: Ebi, qos: BearerQos, tft: Bytes) -> NasResult<()> {
        self.contexts.get(ue_id)?;
        if self.sessions.get(ue_id).and_then(|s| s.bearer(ebi)).is_none() {
            log::warn!("[ue_id={}] Modification of unknown bearer {}", ue_id, ebi);
            self.emit(NasPrimitive::BearerModifyResult { ue_id, ebi, result: Err(EsmCause::InvalidEpsBearerIdentity) });
            return Ok(());
        }
        log::info!("[ue_id={}] Bearer {} modification, QCI {}", ue_id, ebi, qos.qci);
        self.emit(NasPrimitive::BearerModifyRequest { ue_id, ebi, qos });
        let message = EsmMessage {
            ebi,
            pti: 0,
            body: EsmBody::ModifyBearerRequest { qos, tft },
        };
        self.start_esm_transaction(ue_id, ebi, 0, EsmProcedure::Modify, message)
    }

    fn bearer_deactivate_request(&mut self, ue_id: MmeUeId, ebi: Ebi, cause: EsmCause) -> NasResult<()> {
        let connected = self.contexts.get(ue_id).map(|ctx| ctx.connected).unwrap_or(false);
        if self.sessions.get(ue_id).and_then(|s| s.bearer(ebi)).is_none() {
            log::warn!("[ue_id={}] Deactivation of unknown bearer {}", ue_id, ebi);
            self.emit(NasPrimitive::BearerDeactivateResult {
                ue_id,
                ebi,
                result: Err(EsmCause::InvalidEpsBearerIdentity),
            });
            return Ok(());
        }
        if !connected {
            log::info!("[ue_id={}] Subscriber not connected, releasing bearer {} locally", ue_id, ebi);
            if let Some(transaction) = self.sessions.get_mut(ue_id).and_then(|s| s.take_transaction(ebi)) {
                self.cancel_esm_timer(&transaction);
            }
            self.release_bearer(ue_id, ebi);
            self.emit(NasPrimitive::BearerDeactivateResult { ue_id, ebi, result: Ok(()) });
            return Ok(());
        }
        let message = EsmMessage { ebi, pti: 0, body: EsmBody::DeactivateBearerRequest { cause } };
        self.start_esm_transaction(ue_id, ebi, 0, EsmProcedure::Deactivate, message)
    }

    /// Radio bearers reported by the access network
    pub(crate) fn bearer_setup_response(&mut self, ue_id: MmeUeId, bearers: Vec<(Ebi, Fteid)>) -> NasResult<()> {
        let sessions = self.sessions.get_mut(ue_id).ok_or(NasError::UnknownSubscriber(ue_id))?;
        for (ebi, fteid) in bearers {
            match sessions.bearer_mut(ebi) {
                Some(bearer) => {
                    let state = bearer.on_access_setup(Some(fteid));
                    log::debug!("[ue_id={}] Bearer {} set up in the access network ({:?})", ue_id, ebi, state);
                }
                None => log::warn!("[ue_id={}] Access setup for unknown bearer {}", ue_id, ebi),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn start_esm_transaction(
        &mut self,
        ue_id: MmeUeId,
        ebi: Ebi,
        pti: u8,
        procedure: EsmProcedure,
        message: EsmMessage,
    ) -> NasResult<()> {
        let value = self.config.timers.get(procedure.timer());
        let transaction = EsmTransaction {
            ebi,
            pti,
            procedure,
            timer: None,
            retries: 0,
            max_retries: value.max_retries,
            duration: value.duration(),
            message: message.to_bytes(),
        };
        if let Some(previous) = self.sessions.entry(ue_id).start_transaction(transaction) {
            log::info!("[ue_id={}] {:?} on bearer {} replaced by {:?}", ue_id, previous.procedure, ebi, procedure);
            self.cancel_esm_timer(&previous);
        }
        self.transmit_esm(ue_id, ebi)
    }

    fn transmit_esm(&mut self, ue_id: MmeUeId, ebi: Ebi) -> NasResult<()> {
        let transaction = self
            .sessions
            .get(ue_id)
            .and_then(|s| s.transaction(ebi))
            .ok_or(NasError::Esm(EsmCause::InvalidEpsBearerIdentity))?;
        let (message, duration) = (transaction.message.clone(), transaction.duration);

        let pdu = self.protect_for(ue_id, &message, false)?;
        self.emit(NasPrimitive::DataRequest { ue_id, pdu });

        let now = self.now();
        let timer = self.timers.start(now, duration, TimerEvent { ue_id, target: TimerTarget::EsmTransaction(ebi) });
        match self.sessions.get_mut(ue_id).and_then(|s| s.transaction_mut(ebi)) {
            Some(transaction) => {
                if let Some(old) = transaction.timer.replace(timer) {
                    self.timers.cancel(old);
                }
            }
            None => {
                self.timers.cancel(timer);
            }
        }
        Ok(())
    }

    /// Guard timer of an ESM transaction expired
    pub(crate) fn on_esm_timer(&mut self, ue_id: MmeUeId, ebi: Ebi, timer: TimerId) -> NasResult<()> {
        let Some(transaction) = self.sessions.get_mut(ue_id).and_then(|s| s.transaction_mut(ebi)) else {
            log::debug!("[ue_id={}] {} expired for a finished transaction on bearer {}", ue_id, timer, ebi);
            return Ok(());
        };
        if transaction.timer != Some(timer) {
            log::debug!("[ue_id={}] Stale {} for bearer {} ignored", ue_id, timer, ebi);
            return Ok(());
        }
        transaction.timer = None;

        if transaction.retries < transaction.max_retries {
            transaction.retries += 1;
            log::info!(
                "[ue_id={}] {} expired for {:?} on bearer {}, retransmission #{}",
                ue_id,
                transaction.procedure.timer(),
                transaction.procedure,
                ebi,
                transaction.retries
            );
            return self.transmit_esm(ue_id, ebi);
        }

        let Some(transaction) = self.sessions.get_mut(ue_id).and_then(|s| s.take_transaction(ebi)) else {
            return Ok(());
        };
        log::warn!(
            "[ue_id={}] {} expired for {:?} on bearer {}, retries exhausted",
            ue_id,
            transaction.procedure.timer(),
            transaction.procedure,
            ebi
        );
        self.esm_transaction_failed(ue_id, transaction);
        Ok(())
    }

    /// Give up on a transaction and report the outcome to the session layer
    fn esm_transaction_failed(&mut self, ue_id: MmeUeId, transaction: EsmTransaction) {
        let ebi = transaction.ebi;
        match transaction.procedure {
            EsmProcedure::ActivateDefault | EsmProcedure::ActivateDedicated => {
                self.release_bearer(ue_id, ebi);
                self.emit(NasPrimitive::BearerActivateResult { ue_id, ebi, result: Err(EsmCause::NetworkFailure) });
            }
            EsmProcedure::Modify => {
                self.emit(NasPrimitive::BearerModifyResult { ue_id, ebi, result: Err(EsmCause::NetworkFailure) });
            }
            EsmProcedure::Deactivate => {
                self.release_bearer(ue_id, ebi);
                self.emit(NasPrimitive::BearerDeactivateResult { ue_id, ebi, result: Ok(()) });
            }
        }
    }

    /// Abandon every ESM transaction of a subscriber (connection lost)
    pub(crate) fn abort_esm_transactions(&mut self, ue_id: MmeUeId) {
        let transactions = match self.sessions.get_mut(ue_id) {
            Some(sessions) => sessions.take_transactions(),
            None => return,
        };
        for transaction in transactions {
            log::info!("[ue_id={}] {:?} on bearer {} aborted", ue_id, transaction.procedure, transaction.ebi);
            self.cancel_esm_timer(&transaction);
            self.esm_transaction_failed(ue_id, transaction);
        }
    }

    /// Finish the transaction on `ebi` if it runs `procedure`
    fn take_esm_transaction(&mut self, ue_id: MmeUeId, ebi: Ebi, procedure: EsmProcedure) -> Option<EsmTransaction> {
        let sessions = self.sessions.get_mut(ue_id)?;
        match sessions.transaction(ebi) {
            Some(transaction) if transaction.procedure == procedure => {}
            other => {
                log::warn!(
                    "[ue_id={}] {:?} answer on bearer {} without a matching transaction ({:?})",
                    ue_id,
                    procedure,
                    ebi,
                    other.map(|t| t.procedure)
                );
                return None;
            }
        }
        let transaction = sessions.take_transaction(ebi)?;
        self.cancel_esm_timer(&transaction);
        Some(transaction)
    }

    fn cancel_esm_timer(&mut self, transaction: &EsmTransaction) {
        if let Some(timer) = transaction.timer {
            self.timers.cancel(timer);
        }
    }

    /// Remove a bearer (a default bearer takes its PDN connection along) and
    /// release it in the access network
    pub(crate) fn release_bearer(&mut self, ue_id: MmeUeId, ebi: Ebi) -> Vec<Ebi> {
        let Some(sessions) = self.sessions.get_mut(ue_id) else {
            return Vec::new();
        };
        let ebis: Vec<Ebi> = match sessions.remove_bearer(ebi) {
            Some(RemovedBearer::Dedicated(bearer)) => vec![bearer.ebi],
            Some(RemovedBearer::Pdn(pdn)) => {
                log::info!("[ue_id={}] PDN connection to {} released", ue_id, pdn.apn);
                pdn.bearers.keys().copied().collect()
            }
            None => Vec::new(),
        };

        let orphaned: Vec<EsmTransaction> = ebis
            .iter()
            .filter(|released| **released != ebi)
            .filter_map(|released| sessions.take_transaction(*released))
            .collect();
        for transaction in &orphaned {
            self.cancel_esm_timer(transaction);
        }

        let connected = self.contexts.get(ue_id).map(|ctx| ctx.connected).unwrap_or(false);
        if connected && !ebis.is_empty() {
            self.emit(NasPrimitive::BearerReleaseRequest { ue_id, ebis: ebis.clone() });
        }
        ebis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NasConfig;
    use crate::context::EmmContext;
    use crate::esm_context::{Ambr, Paa};
    use crate::sm::{EmmSignal, Fsm};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn qos(qci: u8) -> BearerQos {
        BearerQos { qci, ..Default::default() }
    }

    fn setup(apn: &str) -> PdnSetup {
        PdnSetup {
            apn: apn.to_string(),
            paa: Paa::Ipv4(Ipv4Addr::new(10, 45, 0, 2)),
            ambr: Ambr::default(),
            qos: qos(9),
            sgw_fteid: Some(Fteid { teid: 1, addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)) }),
            pgw_fteid: None,
        }
    }

    /// Registered subscriber with one PDN connection on EBI 5
    fn registered_core() -> NasCore {
        let mut core = NasCore::new(NasConfig::default()).unwrap();
        let mut ctx = EmmContext::new(1);
        ctx.connected = true;
        ctx.fsm.dispatch(EmmSignal::AttachConfirmed).unwrap();
        core.contexts.add(ctx);
        core.sessions.entry(1).create_pdn(setup("internet")).unwrap();
        core
    }

    fn sent_esm(core: &mut NasCore) -> Vec<EsmBody> {
        core.take_outbound()
            .into_iter()
            .filter_map(|p| match p {
                NasPrimitive::DataRequest { pdu, .. } => EsmMessage::from_bytes(&pdu).ok().map(|m| m.body),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_duplicate_apn_is_rejected() {
        let mut core = registered_core();
        let request = EsmMessage {
            ebi: 0,
            pti: 2,
            body: EsmBody::PdnConnectivityRequest {
                pdn_type: PdnType::Ipv4,
                request_type: 1,
                apn: Some("internet".into()),
            },
        };
        core.esm_message(1, request).unwrap();
        assert_eq!(
            sent_esm(&mut core),
            vec![EsmBody::PdnConnectivityReject { cause: EsmCause::MultiplePdnForApnNotAllowed }]
        );
    }

    #[test]
    fn test_last_pdn_cannot_be_disconnected() {
        let mut core = registered_core();
        core.esm_message(1, EsmMessage { ebi: 0, pti: 3, body: EsmBody::PdnDisconnectRequest { linked_ebi: 5 } })
            .unwrap();
        assert_eq!(
            sent_esm(&mut core),
            vec![EsmBody::PdnDisconnectReject { cause: EsmCause::LastPdnDisconnectionNotAllowed }]
        );

        core.esm_message(1, EsmMessage { ebi: 0, pti: 4, body: EsmBody::PdnDisconnectRequest { linked_ebi: 9 } })
            .unwrap();
        assert_eq!(
            sent_esm(&mut core),
            vec![EsmBody::PdnDisconnectReject { cause: EsmCause::InvalidEpsBearerIdentity }]
        );
    }

    #[test]
    fn test_dedicated_bearer_activation() {
        let mut core = registered_core();
        core.esm_sap(SessionPrimitive::BearerActivateRequest {
            ue_id: 1,
            linked_ebi: 5,
            qos: qos(1),
            tft: Bytes::from_static(&[0x21]),
        })
        .unwrap();
        let out = core.take_outbound();
        assert!(matches!(&out[0], NasPrimitive::BearerSetupRequest { bearers, .. } if bearers[0].ebi == 6));
        assert_eq!(core.armed_timers(), 1);

        core.esm_message(1, EsmMessage { ebi: 6, pti: 0, body: EsmBody::ActivateDedicatedBearerAccept })
            .unwrap();
        assert_eq!(
            core.take_outbound(),
            vec![NasPrimitive::BearerActivateResult { ue_id: 1, ebi: 6, result: Ok(()) }]
        );
        assert_eq!(core.armed_timers(), 0);
        assert!(core.sessions().get(1).unwrap().bearer(6).unwrap().nas_accepted);
    }

    #[test]
    fn test_activation_gives_up_after_retries() {
        let mut core = registered_core();
        core.esm_sap(SessionPrimitive::BearerActivateRequest { ue_id: 1, linked_ebi: 5, qos: qos(1), tft: Bytes::new() })
            .unwrap();
        core.take_outbound();

        let t3485 = core.config().timers.t3485;
        for _ in 0..t3485.max_retries {
            core.advance(t3485.duration() + Duration::from_millis(1));
            assert_eq!(sent_esm(&mut core).len(), 1);
        }
        core.advance(t3485.duration() + Duration::from_millis(1));
        let out = core.take_outbound();
        assert!(out.contains(&NasPrimitive::BearerReleaseRequest { ue_id: 1, ebis: vec![6] }));
        assert!(out.contains(&NasPrimitive::BearerActivateResult {
            ue_id: 1,
            ebi: 6,
            result: Err(EsmCause::NetworkFailure)
        }));
        assert!(core.sessions().get(1).unwrap().bearer(6).is_none());
        assert_eq!(core.armed_timers(), 0);
    }

    #[test]
    fn test_idle_deactivation_is_local() {
        let mut core = registered_core();
        core.contexts.get_mut(1).unwrap().connected = false;
        core.sessions.entry(1).add_bearer(5, qos(2), Bytes::new()).unwrap();
        core.esm_sap(SessionPrimitive::BearerDeactivateRequest { ue_id: 1, ebi: 6, cause: EsmCause::RegularDeactivation })
            .unwrap();
        assert_eq!(
            core.take_outbound(),
            vec![NasPrimitive::BearerDeactivateResult { ue_id: 1, ebi: 6, result: Ok(()) }]
        );
        assert_eq!(core.sessions().get(1).unwrap().bearer_count(), 1);
    }

    #[test]
    fn test_esm_refused_before_registration() {
        let mut core = NasCore::new(NasConfig::default()).unwrap();
        core.contexts.add(EmmContext::new(2));
        let result = core.esm_message(2, EsmMessage { ebi: 5, pti: 0, body: EsmBody::DeactivateBearerAccept });
        assert_eq!(result, Err(NasError::Esm(EsmCause::MessageTypeNotCompatible)));
    }
}
