//! Lower Layer Indications
//!
//! Delivery notifications and connection release reported by the access
//! stratum.

use bytes::Bytes;

use crate::context::MmeUeId;
use crate::error::NasResult;
use crate::event::LowerLayerKind;
use crate::nas_task::NasCore;
use crate::sm::{EmmSignal, EmmState, Fsm};

impl NasCore {
    /// Lower layer indication for `pdu` (or for the connection when absent)
    pub(crate) fn lower_layer(&mut self, ue_id: MmeUeId, kind: LowerLayerKind, pdu: Option<Bytes>) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        let signal = match kind {
            LowerLayerKind::Success => EmmSignal::LowerLayerSuccess,
            LowerLayerKind::Failure => EmmSignal::LowerLayerFailure,
            LowerLayerKind::NonDelivery => EmmSignal::LowerLayerNonDelivery,
            LowerLayerKind::Release => EmmSignal::LowerLayerRelease,
        };
        if let Err(err) = ctx.fsm.dispatch(signal) {
            log::debug!("[ue_id={}] {}", ue_id, err);
        }

        match kind {
            LowerLayerKind::Success => {
                log::debug!("[ue_id={}] NAS message delivered", ue_id);
                Ok(())
            }
            LowerLayerKind::Failure | LowerLayerKind::NonDelivery => {
                let Some(pdu) = pdu else {
                    log::debug!("[ue_id={}] {:?} without a PDU", ue_id, kind);
                    return Ok(());
                };
                match ctx.procedures.find_by_digest(&pdu) {
                    Some(id) => {
                        log::info!("[ue_id={}] {:?} for message of {}", ue_id, kind, id);
                        self.retry_procedure(ue_id, id)
                    }
                    None => {
                        log::debug!("[ue_id={}] {:?} for a message no procedure owns", ue_id, kind);
                        Ok(())
                    }
                }
            }
            LowerLayerKind::Release => self.connection_released(ue_id),
        }
    }

    fn connection_released(&mut self, ue_id: MmeUeId) -> NasResult<()> {
        let ctx = self.contexts.get_mut(ue_id)?;
        ctx.connected = false;
        let state = ctx.state();
        log::info!("[ue_id={}] Signalling connection released [IMSI:{}] in {}", ue_id, ctx.imsi_str(), state);

        if state == EmmState::DeregisteredInitiated {
            return self.release_subscriber(ue_id);
        }

        self.abort_procedures(ue_id)?;
        self.abort_esm_transactions(ue_id);

        if state == EmmState::Registered {
            if let Some(sessions) = self.sessions.get_mut(ue_id) {
                sessions.release_access();
            }
            Ok(())
        } else {
            self.release_subscriber(ue_id)
        }
    }
}
