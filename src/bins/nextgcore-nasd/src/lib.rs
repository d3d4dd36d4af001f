//! NextGCore MME NAS Core
//!
//! EMM and ESM contexts, the EMM procedure manager and the SAP dispatch of
//! the MME NAS layer (TS 24.301). The core is a single-owner task: events
//! from the access stratum, the core network and the session layer are
//! handled in order, and outbound primitives are collected for the host.

pub mod config;
pub mod context;
pub mod error;
pub mod esm_context;
pub mod event;
pub mod nas_codec;
pub mod nas_security;
pub mod nas_task;
pub mod procedure;
pub mod security;
pub mod sm;
pub mod timer;

mod emm_as;
mod emm_attach;
mod emm_cn;
mod emm_common;
mod emm_detach;
mod emm_tau;
mod esm_sap;
mod lower_layer;

#[cfg(test)]
mod property_tests;

pub use config::NasConfig;
pub use context::{EmmContext, EpsGuti, Gummei, MmeUeId, PlmnId};
pub use error::{EmmCause, EsmCause, NasError, NasResult};
pub use event::{EmmCnPrimitive, NasEvent, NasPrimitive, SessionPrimitive};
pub use nas_task::NasCore;
pub use sm::{EmmState, Fsm};
