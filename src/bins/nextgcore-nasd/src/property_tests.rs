//! Property-Based Tests for the NAS Core
//!
//! Context indexes, procedure exclusivity, bearer identities, retransmission
//! bounds, timer and response races, subscriber release and NAS COUNT
//! arithmetic.

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use bytes::Bytes;
    use proptest::prelude::*;

    use crate::config::{NasConfig, TimerValue};
    use crate::context::{ContextStore, EmmContext, EpsGuti, Gummei, PlmnId};
    use crate::esm_context::{Ambr, BearerQos, Fteid, Paa, PdnSetup, UeSessions};
    use crate::event::{EmmCnPrimitive, NasEvent, NasPrimitive, SessionPrimitive};
    use crate::nas_codec::{Direction, EmmMessage, NasMessage, DETACH_TYPE_REATTACH_REQUIRED};
    use crate::nas_security::{protect, unprotect, SecurityHeaderType};
    use crate::nas_task::NasCore;
    use crate::procedure::{ProcedureKind, ProcedureSet, ProcedureSpec, SpecificKind};
    use crate::security::{NasCount, SecurityContext, SecurityContextType};
    use crate::sm::{EmmSignal, Fsm};

    /// Operation on the context store
    #[derive(Debug, Clone, Copy)]
    enum StoreOp {
        Add(u32),
        BindImsi(u32, usize),
        AllocateGuti(u32),
        ClearOldGuti(u32),
        Remove(u32),
    }

    impl StoreOp {
        /// Apply to `store`; operations on unknown handles are no-ops
        fn apply(self, store: &mut ContextStore, allocated: &mut Vec<EpsGuti>) {
            match self {
                StoreOp::Add(ue_id) => {
                    if !store.contains(ue_id) {
                        store.add(EmmContext::new(ue_id));
                    }
                }
                StoreOp::BindImsi(ue_id, imsi) => {
                    let _ = store.upsert_imsi(ue_id, IMSIS[imsi]);
                }
                StoreOp::AllocateGuti(ue_id) => {
                    if let Ok(guti) = store.allocate_guti(ue_id) {
                        allocated.push(guti);
                    }
                }
                StoreOp::ClearOldGuti(ue_id) => {
                    let _ = store.clear_old_guti(ue_id);
                }
                StoreOp::Remove(ue_id) => {
                    store.remove(ue_id);
                }
            }
        }
    }

    // ========================================================================
    // Strategies for generating test data
    // ========================================================================

    /// Strategy for generating context store operations
    fn arb_store_op() -> impl Strategy<Value = StoreOp> {
        prop_oneof![
            (1u32..6).prop_map(StoreOp::Add),
            (1u32..6, 0usize..3).prop_map(|(ue_id, imsi)| StoreOp::BindImsi(ue_id, imsi)),
            (1u32..6).prop_map(StoreOp::AllocateGuti),
            (1u32..6).prop_map(StoreOp::ClearOldGuti),
            (1u32..6).prop_map(StoreOp::Remove),
        ]
    }

    /// Strategy for generating specific procedure kinds
    fn arb_specific_kind() -> impl Strategy<Value = SpecificKind> {
        prop_oneof![
            Just(SpecificKind::Attach),
            Just(SpecificKind::Tau),
            Just(SpecificKind::Detach),
        ]
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    const IMSIS: [&str; 3] = ["001010000000001", "001010000000002", "001010000000003"];

    fn gummei() -> Gummei {
        Gummei { plmn_id: PlmnId::new("001", "01"), mme_gid: 2, mme_code: 1 }
    }

    fn connected_core(config: NasConfig) -> NasCore {
        let mut core = NasCore::new(config).unwrap();
        let mut ctx = EmmContext::new(1);
        ctx.connected = true;
        core.contexts.add(ctx);
        core
    }

    fn detach_indications(out: &[NasPrimitive]) -> usize {
        out.iter()
            .filter(|primitive| matches!(primitive, NasPrimitive::DetachIndication { .. }))
            .count()
    }

    fn keyed_context() -> SecurityContext {
        let mut ctx = SecurityContext::new_partial(2, [0x42; 32]);
        ctx.eia = 2;
        ctx.eea = 0;
        ctx.derive_nas_keys().unwrap();
        ctx.ctx_type = SecurityContextType::FullNative;
        ctx
    }

    // ========================================================================
    // Property: index entries always resolve to a live, matching context
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_context_indexes_stay_consistent(ops in prop::collection::vec(arb_store_op(), 1..40)) {
            let mut store = ContextStore::new(gummei());
            let mut allocated: Vec<EpsGuti> = Vec::new();

            for op in ops {
                op.apply(&mut store, &mut allocated);

                for imsi in IMSIS {
                    if let Some(ue_id) = store.get_by_imsi(imsi) {
                        let ctx = store.get(ue_id).unwrap();
                        prop_assert_eq!(ctx.imsi.get().map(String::as_str), Some(imsi));
                    }
                }
                for guti in &allocated {
                    if let Some(ue_id) = store.get_by_guti(guti) {
                        let ctx = store.get(ue_id).unwrap();
                        prop_assert!(ctx.guti.as_ref() == Some(guti) || ctx.old_guti.as_ref() == Some(guti));
                    }
                }
                prop_assert!(store.imsi_index_len() <= store.len());
            }
        }
    }

    // ========================================================================
    // Property: at most one specific procedure per subscriber
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_single_specific_procedure(
            steps in prop::collection::vec((arb_specific_kind(), any::<bool>()), 1..30)
        ) {
            let timer = NasConfig::default().timers.t3450;
            let mut procedures = ProcedureSet::new();

            for (kind, resolve_first) in steps {
                if resolve_first {
                    if let Some(id) = procedures.specific_id() {
                        procedures.resolve(id).unwrap();
                    }
                }
                let running = procedures.specific_kind();
                let created = procedures.create_specific(kind, ProcedureSpec::new(timer));
                prop_assert_eq!(created.is_ok(), running.is_none());

                let specifics = procedures
                    .ids()
                    .into_iter()
                    .filter_map(|id| procedures.get(id))
                    .filter(|p| matches!(p.kind, ProcedureKind::Specific(_)))
                    .count();
                prop_assert!(specifics <= 1);
            }
        }
    }

    // ========================================================================
    // Property: bearer identities are unique across PDN connections
    // ========================================================================

    /// Operation on one subscriber's sessions
    #[derive(Debug, Clone, Copy)]
    enum SessionOp {
        CreatePdn(usize),
        AddBearer(u8),
        RemoveBearer(u8),
    }

    fn arb_session_op() -> impl Strategy<Value = SessionOp> {
        prop_oneof![
            (0usize..4).prop_map(SessionOp::CreatePdn),
            (5u8..16).prop_map(SessionOp::AddBearer),
            (5u8..16).prop_map(SessionOp::RemoveBearer),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_bearer_identities_unique(ops in prop::collection::vec(arb_session_op(), 1..60)) {
            const APNS: [&str; 4] = ["internet", "ims", "mms", "sos"];
            let mut sessions = UeSessions::default();

            for op in ops {
                match op {
                    SessionOp::CreatePdn(apn) => {
                        let _ = sessions.create_pdn(PdnSetup {
                            apn: APNS[apn].into(),
                            paa: Paa::Ipv4(Ipv4Addr::new(10, 45, 0, 2)),
                            ambr: Ambr::default(),
                            qos: BearerQos::default(),
                            sgw_fteid: None,
                            pgw_fteid: None,
                        });
                    }
                    SessionOp::AddBearer(linked) => {
                        let _ = sessions.add_bearer(linked, BearerQos::default(), Bytes::new());
                    }
                    SessionOp::RemoveBearer(ebi) => {
                        sessions.remove_bearer(ebi);
                    }
                }

                let mut seen: Vec<u8> = sessions.pdns().flat_map(|pdn| pdn.bearers.keys().copied()).collect();
                let total = seen.len();
                seen.sort_unstable();
                seen.dedup();
                prop_assert_eq!(seen.len(), total);
                prop_assert!(seen.iter().all(|ebi| (5..=15).contains(ebi)));
                prop_assert_eq!(seen, sessions.ebis());
            }
        }
    }

    // ========================================================================
    // Property: retransmissions never exceed the configured bound
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_retransmissions_bounded(max_retries in 0u32..5, expiries in 0usize..10) {
            let mut config = NasConfig::default();
            config.timers.t3422 = TimerValue::new(1, max_retries);
            let mut core = connected_core(config);

            core.network_detach(1, DETACH_TYPE_REATTACH_REQUIRED, None).unwrap();
            let mut out = core.take_outbound();
            for _ in 0..expiries {
                core.advance(Duration::from_millis(1001));
                out.extend(core.take_outbound());
            }

            let sent = out.iter().filter(|p| matches!(p, NasPrimitive::DataRequest { .. })).count();
            prop_assert_eq!(sent, 1 + expiries.min(max_retries as usize));
            if expiries > max_retries as usize {
                prop_assert!(!core.contexts().contains(1));
                prop_assert_eq!(detach_indications(&out), 1);
                prop_assert_eq!(core.armed_timers(), 0);
            }
        }
    }

    // ========================================================================
    // Property: a response racing the guard timer resolves the procedure once
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_timer_response_race(expiries_before_accept in 0usize..7) {
            let mut config = NasConfig::default();
            config.timers.t3422 = TimerValue::new(2, 3);
            let mut core = connected_core(config);

            core.network_detach(1, DETACH_TYPE_REATTACH_REQUIRED, None).unwrap();
            let mut out = core.take_outbound();
            for _ in 0..expiries_before_accept {
                core.advance(Duration::from_millis(2001));
                out.extend(core.take_outbound());
            }

            let _ = core.detach_accept(1);
            out.extend(core.take_outbound());
            for _ in 0..5 {
                core.advance(Duration::from_secs(3));
                out.extend(core.take_outbound());
            }

            prop_assert_eq!(detach_indications(&out), 1);
            prop_assert!(!core.contexts().contains(1));
            prop_assert_eq!(core.armed_timers(), 0);
        }
    }

    // ========================================================================
    // Property: releasing a subscriber leaves no state behind
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_release_leaves_nothing(dedicated in 0usize..6, connected in any::<bool>()) {
            let mut core = NasCore::new(NasConfig::default()).unwrap();
            let mut ctx = EmmContext::new(1);
            ctx.connected = connected;
            ctx.fsm.dispatch(EmmSignal::AttachConfirmed).unwrap();
            core.contexts.add(ctx);
            core.contexts.upsert_imsi(1, IMSIS[0]).unwrap();

            let setup = PdnSetup {
                apn: "internet".into(),
                paa: Paa::Ipv4(Ipv4Addr::new(10, 45, 0, 2)),
                ambr: Ambr::default(),
                qos: BearerQos { qci: 9, ..Default::default() },
                sgw_fteid: Some(Fteid { teid: 1, addr: IpAddr::V4(Ipv4Addr::LOCALHOST) }),
                pgw_fteid: None,
            };
            let linked = core.sessions.entry(1).create_pdn(setup).unwrap();
            for _ in 0..dedicated {
                core.handle_event(NasEvent::Session(SessionPrimitive::BearerActivateRequest {
                    ue_id: 1,
                    linked_ebi: linked,
                    qos: BearerQos { qci: 1, ..Default::default() },
                    tft: Bytes::from_static(&[0x21, 0x00]),
                }))
                .unwrap();
            }
            core.take_outbound();

            core.handle_event(NasEvent::Cn(EmmCnPrimitive::ImplicitDetach { ue_id: 1 })).unwrap();
            let out = core.take_outbound();

            prop_assert_eq!(detach_indications(&out), 1);
            prop_assert!(core.contexts().is_empty());
            prop_assert!(core.sessions().is_empty());
            prop_assert_eq!(core.contexts().get_by_imsi(IMSIS[0]), None);
            prop_assert_eq!(core.armed_timers(), 0);
        }
    }

    // ========================================================================
    // Property: NAS COUNT arithmetic
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_nas_count_wraps_at_24_bits(start in 0u32..0x0100_0000, steps in 0u32..600) {
            let mut count = NasCount::from_value(start);
            for _ in 0..steps {
                count.increment();
            }
            prop_assert_eq!(count.value(), (start + steps) & 0x00ff_ffff);
        }

        #[test]
        fn prop_tampered_mac_never_moves_uplink_count(octet in 1usize..5, flip in 1u8..=255) {
            let mut ue = keyed_context();
            let mut mme = keyed_context();
            let plain = NasMessage::from(EmmMessage::TauComplete).encode();
            let mut pdu = protect(&mut ue, SecurityHeaderType::IntegrityProtected, &plain, Direction::Uplink)
                .unwrap()
                .to_vec();
            pdu[octet] ^= flip;

            let before = mme.ul_count;
            prop_assert!(unprotect(&mut mme, None, &pdu, Direction::Uplink).is_err());
            prop_assert_eq!(mme.ul_count, before);
        }
    }
}
