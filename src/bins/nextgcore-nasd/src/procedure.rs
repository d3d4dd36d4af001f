//! EMM Procedure Manager
//!
//! Arena of the procedures running for one subscriber. Procedures refer to
//! each other by [`ProcId`]; a specific procedure owns at most one child
//! (common or CN-facing), and a child is always torn down with its parent.
//!
//! The set only does bookkeeping. Sending messages and arming timers on the
//! task's wheel is done by the NAS task, which feeds the results back here.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use bytes::Bytes;

use crate::config::TimerValue;
use crate::context::{AuthVector, EpsGuti};
use crate::error::{EmmCause, NasError, NasResult, ProcedureError};
use crate::esm_context::PdnType;
use crate::event::NasPrimitive;
use crate::timer::{NasTimer, TimerId};

/// Number of sent-message digests remembered per subscriber
pub const DIGEST_RING_SIZE: usize = 8;

// ============================================================================
// Identifiers and kinds
// ============================================================================

/// Procedure handle, unique within a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcId(u64);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

/// Specific EMM procedures; at most one active per subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecificKind {
    Attach,
    Detach,
    Tau,
}

/// Common EMM procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonKind {
    Identification,
    Authentication,
    SecurityModeControl,
}

/// Procedures towards the core network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnKind {
    /// S6a authentication information request
    AuthInfo,
    /// S10 context request to the old MME
    ContextRequest,
}

/// Procedure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Specific(SpecificKind),
    Common(CommonKind),
    Cn(CnKind),
}

impl ProcedureKind {
    /// Name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ProcedureKind::Specific(SpecificKind::Attach) => "ATTACH",
            ProcedureKind::Specific(SpecificKind::Detach) => "DETACH",
            ProcedureKind::Specific(SpecificKind::Tau) => "TAU",
            ProcedureKind::Common(CommonKind::Identification) => "IDENTIFICATION",
            ProcedureKind::Common(CommonKind::Authentication) => "AUTHENTICATION",
            ProcedureKind::Common(CommonKind::SecurityModeControl) => "SECURITY_MODE_CONTROL",
            ProcedureKind::Cn(CnKind::AuthInfo) => "CN_AUTH_INFO",
            ProcedureKind::Cn(CnKind::ContextRequest) => "CN_CONTEXT_REQUEST",
        }
    }

    /// Guard timer of the procedure
    pub fn timer(&self) -> NasTimer {
        match self {
            ProcedureKind::Specific(SpecificKind::Attach | SpecificKind::Tau) => NasTimer::T3450,
            ProcedureKind::Specific(SpecificKind::Detach) => NasTimer::T3422,
            ProcedureKind::Common(CommonKind::Identification) => NasTimer::T3470,
            ProcedureKind::Common(CommonKind::Authentication | CommonKind::SecurityModeControl) => {
                NasTimer::T3460
            }
            ProcedureKind::Cn(CnKind::AuthInfo) => NasTimer::S6a,
            ProcedureKind::Cn(CnKind::ContextRequest) => NasTimer::S10,
        }
    }

    /// Outcome reported to the failure continuation on retry exhaustion
    ///
    /// An unresponsive UE gets no reject; a silent core network peer fails
    /// the parent with network failure.
    pub fn timeout_outcome(&self) -> Outcome {
        match self {
            ProcedureKind::Cn(_) => Outcome::Rejected(EmmCause::NetworkFailure),
            _ => Outcome::Failed,
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Continuations
// ============================================================================

/// Where a procedure resumes once it is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Nothing to do
    Noop,
    /// Attach: permanent identity known, authenticate
    AttachIdentified,
    /// Attach: context transfer failed, fall back to identification
    AttachContextFailed,
    /// Attach: authenticated, run security mode control
    AttachAuthenticated,
    /// Attach: secured, establish the default PDN connection
    AttachSecured,
    /// Attach: fail the attach
    AttachFailed,
    /// TAU: context imported from the old MME
    TauContextImported,
    /// TAU: context transfer failed
    TauContextFailed,
    /// TAU: authenticated, run security mode control
    TauAuthenticated,
    /// TAU: secured, accept
    TauSecured,
    /// TAU: fail the update
    TauFailed,
    /// Authentication: vectors arrived, send the challenge
    AuthVectorsReady,
    /// Fail the parent procedure with the same outcome
    FailParent,
    /// Detach the subscriber without signalling
    ImplicitDetach,
    /// Network detach finished (accepted or timed out)
    DetachCompleted,
}

/// Result a procedure is resolved with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed
    Success,
    /// Failed; the UE is told with this cause
    Rejected(EmmCause),
    /// Failed; the UE is not (or can no longer be) told
    Failed,
}

impl Outcome {
    /// Check for success
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

// ============================================================================
// Procedure data
// ============================================================================

/// Message a procedure (re)transmits while its timer runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMessage {
    /// Plain NAS message, protected on every transmission
    Nas {
        plain: Bytes,
        /// Protect with the non-current context (security mode command)
        new_context: bool,
    },
    /// Primitive towards the core network
    Cn(NasPrimitive),
}

/// Attach progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPhase {
    /// Identity, authentication and security
    Securing,
    /// Waiting for session subscription data
    SessionConfig,
    /// Waiting for the default PDN connection
    Connectivity,
    /// ATTACH ACCEPT sent, waiting for ATTACH COMPLETE
    AwaitComplete,
}

/// Attach state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachData {
    /// EPS attach type
    pub attach_type: u8,
    /// Progress
    pub phase: AttachPhase,
    /// PTI of the embedded PDN connectivity request
    pub pti: u8,
    /// APN of the default PDN connection
    pub apn: String,
    /// Requested PDN type
    pub pdn_type: PdnType,
    /// ESM container carried in ATTACH REJECT
    pub esm_reject: Option<Bytes>,
}

/// TAU state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TauData {
    /// EPS update type
    pub update_type: u8,
    /// GUTI the UE identified itself with
    pub old_guti: EpsGuti,
    /// Received PDU, re-verified after a context transfer
    pub pdu: Bytes,
}

/// Authentication round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    /// eKSI assigned to this round
    pub eksi: u8,
    /// Vector used for the challenge in flight
    pub vector: Option<AuthVector>,
}

/// Per-kind procedure state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureData {
    None,
    Attach(AttachData),
    Tau(TauData),
    Detach { detach_type: u8 },
    Authentication(AuthData),
}

// ============================================================================
// Procedure
// ============================================================================

/// Parameters of a new procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSpec {
    /// Continuation on success
    pub on_success: Continuation,
    /// Continuation on failure
    pub on_failure: Continuation,
    /// Timer duration and retransmission bound
    pub timer: TimerValue,
    /// Per-kind state
    pub data: ProcedureData,
}

impl ProcedureSpec {
    /// Spec with no continuations and no data
    pub fn new(timer: TimerValue) -> Self {
        Self {
            on_success: Continuation::Noop,
            on_failure: Continuation::Noop,
            timer,
            data: ProcedureData::None,
        }
    }

    /// Set the success continuation
    pub fn on_success(mut self, continuation: Continuation) -> Self {
        self.on_success = continuation;
        self
    }

    /// Set the failure continuation
    pub fn on_failure(mut self, continuation: Continuation) -> Self {
        self.on_failure = continuation;
        self
    }

    /// Set the per-kind state
    pub fn data(mut self, data: ProcedureData) -> Self {
        self.data = data;
        self
    }
}

/// One running procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    /// Handle
    pub id: ProcId,
    /// Kind
    pub kind: ProcedureKind,
    /// Owning procedure
    pub parent: Option<ProcId>,
    /// Owned child procedure
    pub child: Option<ProcId>,
    /// Continuation on success
    pub on_success: Continuation,
    /// Continuation on failure
    pub on_failure: Continuation,
    /// Armed guard timer
    pub timer: Option<TimerId>,
    /// Guard timer duration
    pub duration: Duration,
    /// Retransmissions done
    pub retries: u32,
    /// Retransmission bound
    pub max_retries: u32,
    /// Message resent on expiry
    pub pending: Option<PendingMessage>,
    /// Per-kind state
    pub data: ProcedureData,
}

impl Procedure {
    fn new(id: ProcId, kind: ProcedureKind, parent: Option<ProcId>, spec: ProcedureSpec) -> Self {
        Self {
            id,
            kind,
            parent,
            child: None,
            on_success: spec.on_success,
            on_failure: spec.on_failure,
            timer: None,
            duration: spec.timer.duration(),
            retries: 0,
            max_retries: spec.timer.max_retries,
            pending: None,
            data: spec.data,
        }
    }

    /// Continuation for `outcome`
    pub fn continuation(&self, outcome: Outcome) -> Continuation {
        if outcome.is_success() {
            self.on_success
        } else {
            self.on_failure
        }
    }
}

/// Result of a guard timer expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Procedure gone or timer already replaced; nothing to do
    Stale,
    /// Retransmit the pending message and re-arm; `attempt` is 1-based
    Retransmit { attempt: u32 },
    /// Retries used up; resolve with the failure continuation
    Exhausted,
}

/// Procedure removed by [`ProcedureSet::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// The resolved procedure
    pub procedure: Procedure,
    /// Descendants torn down with it
    pub torn_down: Vec<Procedure>,
}

impl Resolved {
    /// Every timer that was armed on the removed procedures
    pub fn timers(&self) -> Vec<TimerId> {
        std::iter::once(&self.procedure)
            .chain(self.torn_down.iter())
            .filter_map(|p| p.timer)
            .collect()
    }
}

// ============================================================================
// Procedure Set
// ============================================================================

/// Procedures of one subscriber
#[derive(Debug, Clone, Default)]
pub struct ProcedureSet {
    next_id: u64,
    procedures: BTreeMap<ProcId, Procedure>,
    specific: Option<ProcId>,
    digests: VecDeque<(u64, ProcId)>,
}

impl ProcedureSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> ProcId {
        self.next_id += 1;
        ProcId(self.next_id)
    }

    /// Start a specific procedure
    ///
    /// Fails with a conflict if one is already active; the active procedure
    /// is left untouched.
    pub fn create_specific(&mut self, kind: SpecificKind, spec: ProcedureSpec) -> NasResult<ProcId> {
        if let Some(active) = self.specific_kind() {
            return Err(NasError::Conflict { active, requested: kind });
        }
        let id = self.allocate_id();
        self.procedures
            .insert(id, Procedure::new(id, ProcedureKind::Specific(kind), None, spec));
        self.specific = Some(id);
        Ok(id)
    }

    /// Start a common or CN procedure, optionally owned by `parent`
    pub fn create_child(
        &mut self,
        parent: Option<ProcId>,
        kind: ProcedureKind,
        spec: ProcedureSpec,
    ) -> Result<ProcId, ProcedureError> {
        if let Some(parent_id) = parent {
            let owner = self.procedures.get(&parent_id).ok_or(ProcedureError::NotFound(parent_id))?;
            if let Some(child) = owner.child {
                return Err(ProcedureError::ChildActive { parent: parent_id, child });
            }
        }
        let id = self.allocate_id();
        self.procedures.insert(id, Procedure::new(id, kind, parent, spec));
        if let Some(parent_id) = parent {
            if let Some(owner) = self.procedures.get_mut(&parent_id) {
                owner.child = Some(id);
            }
        }
        Ok(id)
    }

    /// Procedure by handle
    pub fn get(&self, id: ProcId) -> Option<&Procedure> {
        self.procedures.get(&id)
    }

    /// Mutable procedure by handle
    pub fn get_mut(&mut self, id: ProcId) -> Option<&mut Procedure> {
        self.procedures.get_mut(&id)
    }

    /// Active specific procedure
    pub fn specific(&self) -> Option<&Procedure> {
        self.specific.and_then(|id| self.procedures.get(&id))
    }

    /// Mutable active specific procedure
    pub fn specific_mut(&mut self) -> Option<&mut Procedure> {
        let id = self.specific?;
        self.procedures.get_mut(&id)
    }

    /// Kind of the active specific procedure
    pub fn specific_kind(&self) -> Option<SpecificKind> {
        match self.specific()?.kind {
            ProcedureKind::Specific(kind) => Some(kind),
            _ => None,
        }
    }

    /// Handle of the active specific procedure
    pub fn specific_id(&self) -> Option<ProcId> {
        self.specific
    }

    /// Find a running procedure of `kind`
    pub fn find(&self, kind: ProcedureKind) -> Option<ProcId> {
        self.procedures.values().find(|p| p.kind == kind).map(|p| p.id)
    }

    /// Check if any common procedure is running
    pub fn has_common(&self) -> bool {
        self.procedures.values().any(|p| matches!(p.kind, ProcedureKind::Common(_)))
    }

    /// Set the message to (re)transmit
    pub fn set_pending(&mut self, id: ProcId, message: PendingMessage) -> Result<(), ProcedureError> {
        let procedure = self.procedures.get_mut(&id).ok_or(ProcedureError::NotFound(id))?;
        procedure.pending = Some(message);
        Ok(())
    }

    /// Record the armed timer; returns the timer it replaces
    pub fn arm(&mut self, id: ProcId, timer: TimerId) -> Result<Option<TimerId>, ProcedureError> {
        let procedure = self.procedures.get_mut(&id).ok_or(ProcedureError::NotFound(id))?;
        Ok(procedure.timer.replace(timer))
    }

    /// Forget the armed timer; returns it for cancellation
    pub fn disarm(&mut self, id: ProcId) -> Option<TimerId> {
        self.procedures.get_mut(&id)?.timer.take()
    }

    /// Remember that `pdu` was sent on behalf of `id`
    pub fn record_digest(&mut self, id: ProcId, pdu: &[u8]) {
        if self.digests.len() == DIGEST_RING_SIZE {
            self.digests.pop_front();
        }
        self.digests.push_back((digest(pdu), id));
    }

    /// Procedure that sent `pdu`, if still running
    pub fn find_by_digest(&self, pdu: &[u8]) -> Option<ProcId> {
        let wanted = digest(pdu);
        self.digests
            .iter()
            .rev()
            .find(|(d, id)| *d == wanted && self.procedures.contains_key(id))
            .map(|(_, id)| *id)
    }

    /// Remove a procedure and its descendants
    ///
    /// The caller cancels the returned timers and runs the continuation.
    pub fn resolve(&mut self, id: ProcId) -> Result<Resolved, ProcedureError> {
        let procedure = self.procedures.remove(&id).ok_or(ProcedureError::NotFound(id))?;

        let mut torn_down = Vec::new();
        let mut next = procedure.child;
        while let Some(child_id) = next {
            match self.procedures.remove(&child_id) {
                Some(child) => {
                    next = child.child;
                    torn_down.push(child);
                }
                None => next = None,
            }
        }

        if let Some(parent_id) = procedure.parent {
            if let Some(parent) = self.procedures.get_mut(&parent_id) {
                if parent.child == Some(id) {
                    parent.child = None;
                }
            }
        }
        if self.specific == Some(id) {
            self.specific = None;
        }
        self.digests.retain(|(_, owner)| self.procedures.contains_key(owner));

        Ok(Resolved { procedure, torn_down })
    }

    /// Account for an expiry of `timer` on `id`
    ///
    /// An expiry whose timer no longer matches the armed one is stale: the
    /// procedure was resolved or re-armed after the expiry was queued.
    pub fn on_expiry(&mut self, id: ProcId, timer: TimerId) -> Expiry {
        match self.procedures.get_mut(&id) {
            Some(procedure) if procedure.timer == Some(timer) => {
                procedure.timer = None;
                Self::count_retry(procedure)
            }
            _ => Expiry::Stale,
        }
    }

    /// Account for a retransmission requested by the lower layer
    pub fn retry(&mut self, id: ProcId) -> Result<Expiry, ProcedureError> {
        let procedure = self.procedures.get_mut(&id).ok_or(ProcedureError::NotFound(id))?;
        Ok(Self::count_retry(procedure))
    }

    fn count_retry(procedure: &mut Procedure) -> Expiry {
        if procedure.retries < procedure.max_retries {
            procedure.retries += 1;
            Expiry::Retransmit { attempt: procedure.retries }
        } else {
            Expiry::Exhausted
        }
    }

    /// Remove every procedure without running continuations
    pub fn abort_all(&mut self) -> Vec<Procedure> {
        self.specific = None;
        self.digests.clear();
        std::mem::take(&mut self.procedures).into_values().collect()
    }

    /// Handles of every running procedure
    pub fn ids(&self) -> Vec<ProcId> {
        self.procedures.keys().copied().collect()
    }

    /// Number of running procedures
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    /// Check if no procedure runs
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

fn digest(pdu: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    pdu.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max_retries: u32) -> ProcedureSpec {
        ProcedureSpec::new(TimerValue::new(6, max_retries))
    }

    #[test]
    fn test_second_specific_conflicts() {
        let mut set = ProcedureSet::new();
        let attach = set.create_specific(SpecificKind::Attach, spec(4)).unwrap();
        let err = set.create_specific(SpecificKind::Attach, spec(4)).unwrap_err();
        assert_eq!(
            err,
            NasError::Conflict { active: SpecificKind::Attach, requested: SpecificKind::Attach }
        );
        assert_eq!(set.specific_id(), Some(attach));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_single_child_per_parent() {
        let mut set = ProcedureSet::new();
        let attach = set.create_specific(SpecificKind::Attach, spec(4)).unwrap();
        let auth = set
            .create_child(Some(attach), ProcedureKind::Common(CommonKind::Authentication), spec(4))
            .unwrap();
        assert_eq!(
            set.create_child(Some(attach), ProcedureKind::Common(CommonKind::Identification), spec(4)),
            Err(ProcedureError::ChildActive { parent: attach, child: auth })
        );
    }

    #[test]
    fn test_resolve_tears_down_children() {
        let mut set = ProcedureSet::new();
        let attach = set.create_specific(SpecificKind::Attach, spec(4)).unwrap();
        let auth = set
            .create_child(Some(attach), ProcedureKind::Common(CommonKind::Authentication), spec(4))
            .unwrap();
        let air = set.create_child(Some(auth), ProcedureKind::Cn(CnKind::AuthInfo), spec(2)).unwrap();

        let resolved = set.resolve(attach).unwrap();
        assert_eq!(resolved.torn_down.len(), 2);
        assert!(set.get(auth).is_none());
        assert!(set.get(air).is_none());
        assert!(set.is_empty());
        assert_eq!(set.specific_kind(), None);
    }

    #[test]
    fn test_resolve_child_unlinks_parent() {
        let mut set = ProcedureSet::new();
        let attach = set.create_specific(SpecificKind::Attach, spec(4)).unwrap();
        let ident = set
            .create_child(Some(attach), ProcedureKind::Common(CommonKind::Identification), spec(4))
            .unwrap();
        set.resolve(ident).unwrap();
        assert_eq!(set.get(attach).and_then(|p| p.child), None);
        assert!(set
            .create_child(Some(attach), ProcedureKind::Common(CommonKind::Authentication), spec(4))
            .is_ok());
    }

    #[test]
    fn test_retry_bound() {
        let mut set = ProcedureSet::new();
        let id = set.create_child(None, ProcedureKind::Cn(CnKind::AuthInfo), spec(3)).unwrap();
        let mut wheel = crate::timer::TimerWheel::new();
        let now = std::time::Instant::now();

        let mut retransmissions = 0;
        loop {
            let timer = wheel.start(now, Duration::ZERO, ());
            set.arm(id, timer).unwrap();
            match set.on_expiry(id, timer) {
                Expiry::Retransmit { .. } => retransmissions += 1,
                Expiry::Exhausted => break,
                Expiry::Stale => panic!("unexpected stale expiry"),
            }
        }
        assert_eq!(retransmissions, 3);
    }

    #[test]
    fn test_stale_expiry() {
        let mut set = ProcedureSet::new();
        let mut wheel = crate::timer::TimerWheel::new();
        let now = std::time::Instant::now();
        let id = set.create_specific(SpecificKind::Detach, spec(4)).unwrap();
        let first = wheel.start(now, Duration::ZERO, ());
        let second = wheel.start(now, Duration::ZERO, ());
        set.arm(id, second).unwrap();

        assert_eq!(set.on_expiry(id, first), Expiry::Stale);
        set.resolve(id).unwrap();
        assert_eq!(set.on_expiry(id, second), Expiry::Stale);
    }

    #[test]
    fn test_digest_ring() {
        let mut set = ProcedureSet::new();
        let id = set.create_specific(SpecificKind::Attach, spec(4)).unwrap();
        set.record_digest(id, b"first");
        for n in 0..DIGEST_RING_SIZE {
            set.record_digest(id, format!("msg{n}").as_bytes());
        }
        assert_eq!(set.find_by_digest(b"first"), None);
        assert_eq!(set.find_by_digest(b"msg7"), Some(id));

        set.resolve(id).unwrap();
        assert_eq!(set.find_by_digest(b"msg7"), None);
    }

    #[test]
    fn test_abort_all() {
        let mut set = ProcedureSet::new();
        let attach = set.create_specific(SpecificKind::Attach, spec(4)).unwrap();
        set.create_child(Some(attach), ProcedureKind::Common(CommonKind::Authentication), spec(4))
            .unwrap();
        assert_eq!(set.abort_all().len(), 2);
        assert!(set.is_empty());
        assert!(set.create_specific(SpecificKind::Detach, spec(4)).is_ok());
    }
}
