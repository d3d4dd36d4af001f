//! EMM State Machine
//!
//! Coarse per-subscriber registration state (TS 24.301 Section 5.1.3.4).
//! Procedures drive it with signals; the machine itself only guards
//! transitions and keeps the state to return to after a common procedure.

use std::fmt;

use crate::context::MmeUeId;
use crate::error::FsmError;

// ============================================================================
// States and signals
// ============================================================================

/// EMM state on the network side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmState {
    /// EMM-DEREGISTERED (initial)
    Deregistered,
    /// EMM-REGISTERED
    Registered,
    /// EMM-COMMON-PROCEDURE-INITIATED
    CommonProcedureInitiated,
    /// EMM-DEREGISTERED-INITIATED
    DeregisteredInitiated,
}

impl fmt::Display for EmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmState::Deregistered => write!(f, "DEREGISTERED"),
            EmmState::Registered => write!(f, "REGISTERED"),
            EmmState::CommonProcedureInitiated => write!(f, "COMMON_PROCEDURE_INITIATED"),
            EmmState::DeregisteredInitiated => write!(f, "DEREGISTERED_INITIATED"),
        }
    }
}

/// Signals raised by procedures and the lower layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmSignal {
    /// Identification, authentication or security mode control started
    CommonProcRequested,
    /// Common procedure completed
    CommonProcConfirmed,
    /// Common procedure failed or was rejected
    CommonProcRejected,
    /// Attach completed
    AttachConfirmed,
    /// Tracking area update completed
    TauConfirmed,
    /// Attach or TAU rejected
    RegistrationRejected,
    /// Detach started (UE or network)
    DetachInitiated,
    /// Detach finished, explicitly or implicitly
    DetachConfirmed,
    /// Lower layer delivered a message
    LowerLayerSuccess,
    /// Lower layer failed to deliver a message
    LowerLayerFailure,
    /// Message not delivered (e.g. handover)
    LowerLayerNonDelivery,
    /// Signalling connection released
    LowerLayerRelease,
}

// ============================================================================
// State Machine Trait
// ============================================================================

/// State machine trait
pub trait Fsm {
    /// Signal type
    type Signal;
    /// State type
    type State;

    /// Initialize the state machine
    fn init(&mut self);

    /// Finalize the state machine
    fn fini(&mut self);

    /// Dispatch a signal, returning the resulting state
    fn dispatch(&mut self, signal: Self::Signal) -> Result<Self::State, FsmError>;

    /// Check if in a specific state
    fn check_state(&self, state_name: &str) -> bool;
}

// ============================================================================
// EMM State Machine
// ============================================================================

/// EMM State Machine
#[derive(Debug, Clone)]
pub struct EmmFsm {
    /// Current state
    state: EmmState,
    /// State to return to when the common procedure ends
    previous: EmmState,
    /// MME UE ID
    ue_id: MmeUeId,
}

impl EmmFsm {
    /// Create a new EMM FSM in DEREGISTERED
    pub fn new(ue_id: MmeUeId) -> Self {
        Self {
            state: EmmState::Deregistered,
            previous: EmmState::Deregistered,
            ue_id,
        }
    }

    /// Get current state
    pub fn state(&self) -> EmmState {
        self.state
    }

    /// Update the handle used in transition logs
    pub fn rebind(&mut self, ue_id: MmeUeId) {
        self.ue_id = ue_id;
    }

    /// Transition to a new state
    fn transition(&mut self, new_state: EmmState) {
        if new_state != self.state {
            log::debug!("EMM FSM [{}]: {} -> {}", self.ue_id, self.state, new_state);
        }
        self.state = new_state;
    }

    fn invalid(&self, signal: EmmSignal) -> FsmError {
        FsmError::InvalidTransition { state: self.state, signal }
    }

    fn next_state(&self, signal: EmmSignal) -> Result<EmmState, FsmError> {
        use EmmSignal::*;
        use EmmState::*;

        match (self.state, signal) {
            // Lower layer indications never move the coarse state by
            // themselves, except that a release ends any common procedure
            (CommonProcedureInitiated, LowerLayerRelease) => Ok(self.previous),
            (state, LowerLayerSuccess | LowerLayerFailure | LowerLayerNonDelivery | LowerLayerRelease) => {
                Ok(state)
            }

            (DeregisteredInitiated, DetachInitiated) => Err(FsmError::DetachAlreadyInitiated),
            (_, DetachInitiated) => Ok(DeregisteredInitiated),
            (_, DetachConfirmed) => Ok(Deregistered),

            (DeregisteredInitiated, _) => Err(self.invalid(signal)),

            (Deregistered | Registered | CommonProcedureInitiated, CommonProcRequested) => {
                Ok(CommonProcedureInitiated)
            }
            (CommonProcedureInitiated, CommonProcConfirmed) => Ok(self.previous),
            (CommonProcedureInitiated, CommonProcRejected) => Ok(Deregistered),
            (Deregistered | Registered, CommonProcConfirmed | CommonProcRejected) => Ok(self.state),

            (_, AttachConfirmed | TauConfirmed) => Ok(Registered),
            (_, RegistrationRejected) => Ok(Deregistered),
        }
    }
}

impl Fsm for EmmFsm {
    type Signal = EmmSignal;
    type State = EmmState;

    fn init(&mut self) {
        self.previous = EmmState::Deregistered;
        self.transition(EmmState::Deregistered);
    }

    fn fini(&mut self) {
        self.previous = EmmState::Deregistered;
        self.transition(EmmState::Deregistered);
    }

    fn dispatch(&mut self, signal: EmmSignal) -> Result<EmmState, FsmError> {
        let next = self.next_state(signal)?;
        if next == EmmState::CommonProcedureInitiated && self.state != EmmState::CommonProcedureInitiated {
            self.previous = self.state;
        }
        self.transition(next);
        Ok(next)
    }

    fn check_state(&self, state_name: &str) -> bool {
        self.state.to_string() == state_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = EmmFsm::new(1);
        assert_eq!(fsm.state(), EmmState::Deregistered);
        assert!(fsm.check_state("DEREGISTERED"));
    }

    #[test]
    fn test_common_procedure_returns_to_previous() {
        let mut fsm = EmmFsm::new(1);
        fsm.dispatch(EmmSignal::AttachConfirmed).unwrap();
        fsm.dispatch(EmmSignal::CommonProcRequested).unwrap();
        assert_eq!(fsm.state(), EmmState::CommonProcedureInitiated);
        // Nested common procedure keeps the saved state
        fsm.dispatch(EmmSignal::CommonProcRequested).unwrap();
        assert_eq!(fsm.dispatch(EmmSignal::CommonProcConfirmed), Ok(EmmState::Registered));
    }

    #[test]
    fn test_common_procedure_rejected() {
        let mut fsm = EmmFsm::new(1);
        fsm.dispatch(EmmSignal::CommonProcRequested).unwrap();
        assert_eq!(fsm.dispatch(EmmSignal::CommonProcRejected), Ok(EmmState::Deregistered));
    }

    #[test]
    fn test_detach_only_once() {
        let mut fsm = EmmFsm::new(7);
        fsm.dispatch(EmmSignal::AttachConfirmed).unwrap();
        assert_eq!(fsm.dispatch(EmmSignal::DetachInitiated), Ok(EmmState::DeregisteredInitiated));
        assert_eq!(fsm.dispatch(EmmSignal::DetachInitiated), Err(FsmError::DetachAlreadyInitiated));
        assert_eq!(fsm.dispatch(EmmSignal::DetachConfirmed), Ok(EmmState::Deregistered));
    }

    #[test]
    fn test_no_registration_during_detach() {
        let mut fsm = EmmFsm::new(7);
        fsm.dispatch(EmmSignal::DetachInitiated).unwrap();
        assert_eq!(
            fsm.dispatch(EmmSignal::CommonProcRequested),
            Err(FsmError::InvalidTransition {
                state: EmmState::DeregisteredInitiated,
                signal: EmmSignal::CommonProcRequested,
            })
        );
        assert_eq!(fsm.dispatch(EmmSignal::LowerLayerFailure), Ok(EmmState::DeregisteredInitiated));
    }

    #[test]
    fn test_release_ends_common_procedure() {
        let mut fsm = EmmFsm::new(3);
        fsm.dispatch(EmmSignal::CommonProcRequested).unwrap();
        assert_eq!(fsm.dispatch(EmmSignal::LowerLayerRelease), Ok(EmmState::Deregistered));
    }
}
