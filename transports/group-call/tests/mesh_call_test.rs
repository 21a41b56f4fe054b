//! Mesh Group Call Integration Tests
//!
//! These tests run several orchestrators against the in-memory hub in
//! `harness` and check the mesh each client ends up with.
//!
//! # Running Tests
//!
//! ```bash
//! # Run all mesh tests
//! cargo test --test mesh_call_test
//!
//! # Run with output
//! RUST_LOG=debug cargo test --test mesh_call_test -- --nocapture
//! ```

mod harness;

use group_call::peer::{LinkEvent, LinkEventKind, SignalingState};
use group_call::signaling::protocol::methods;
use group_call::testing::{FakeServices, HubCall};
use group_call::{CallKind, CallNotice, Lifecycle, LinkState, TrackKind};
use harness::{MeshHarness, GROUP, PLACEHOLDER};
use tokio_test::assert_ok;

/// Initialize test logging (call once per test)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,group_call=debug,harness=debug")
        .with_test_writer()
        .try_init();
}

/// Start a call from `caller` and deliver the ring to everyone else
async fn ring(harness: &mut MeshHarness, caller: &str, kind: CallKind) {
    assert_ok!(
        harness
            .client_mut(caller)
            .orchestrator
            .start_call(GROUP, kind)
            .await
    );
    assert_ok!(harness.settle().await);
}

async fn accept(harness: &mut MeshHarness, identity: &str) {
    assert_ok!(harness.client_mut(identity).orchestrator.accept_ringing().await);
}

// ============================================================================
// Two-Party Calls
// ============================================================================

#[tokio::test]
async fn test_two_party_call_connects() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    ring(&mut harness, "carol", CallKind::Video).await;

    let bob = harness.client("bob");
    let incoming = bob.orchestrator.store_handle().snapshot().incoming.unwrap();
    assert_eq!(incoming.caller_identity, "carol");
    assert_eq!(incoming.call_id, "call-carol");
    assert_eq!(incoming.kind, CallKind::Video);

    accept(&mut harness, "bob").await;
    assert_ok!(harness.settle().await);

    harness.assert_full_mesh(&["bob", "carol"]);
    assert!(harness.client("carol").orchestrator.placeholder_claimed());
    assert_eq!(
        harness.client("carol").orchestrator.lifecycle(),
        Lifecycle::Active
    );
    assert_eq!(harness.client("bob").orchestrator.lifecycle(), Lifecycle::Active);

    // Both sides report the link as connected once negotiation settles
    let carol_view = harness.client("carol").orchestrator.store_handle().snapshot();
    assert_eq!(
        carol_view.participant("bob").unwrap().link_state,
        LinkState::Connected
    );
}

#[tokio::test]
async fn test_ice_fetch_failure_falls_back_to_stun() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    harness.client("carol").fakes.ice_source.set_failing(true);

    ring(&mut harness, "carol", CallKind::Audio).await;
    accept(&mut harness, "bob").await;
    assert_ok!(harness.settle().await);

    harness.assert_full_mesh(&["bob", "carol"]);

    let carol_servers = harness
        .client("carol")
        .fakes
        .connections
        .last_ice_servers()
        .unwrap();
    assert!(carol_servers.is_fallback());
    assert_eq!(
        carol_servers.servers()[0].urls,
        vec![FakeServices::FALLBACK_STUN_URL.to_string()]
    );

    let bob_servers = harness
        .client("bob")
        .fakes
        .connections
        .last_ice_servers()
        .unwrap();
    assert!(!bob_servers.is_fallback());
}

#[tokio::test]
async fn test_early_candidates_are_applied_once() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    ring(&mut harness, "carol", CallKind::Audio).await;

    // The caller's candidate arrived while the call was still ringing
    assert_eq!(
        harness.client("bob").orchestrator.registry().pending_for("carol"),
        1
    );

    accept(&mut harness, "bob").await;
    assert_ok!(harness.settle().await);

    let bob = harness.client("bob");
    assert_eq!(bob.orchestrator.registry().pending_for("carol"), 0);
    assert_eq!(bob.orchestrator.registry().get("carol").unwrap().pending_candidates(), 0);

    let link = bob.fakes.connections.connection("carol").unwrap();
    let applied = link.applied_candidates();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].candidate.starts_with("candidate:offer:"));

    // The callee's candidate reached the renamed placeholder link
    let carol = harness.client("carol");
    let link = carol.fakes.connections.connection(PLACEHOLDER).unwrap();
    assert_eq!(link.applied_candidates().len(), 1);
}

#[tokio::test]
async fn test_late_answer_after_stable_has_no_effect() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    ring(&mut harness, "carol", CallKind::Audio).await;
    accept(&mut harness, "bob").await;
    assert_ok!(harness.settle().await);

    let answer = harness
        .routed()
        .iter()
        .find(|routed| {
            routed.sender == "bob" && matches!(routed.call, HubCall::AnswerGroupCall { .. })
        })
        .map(|routed| routed.call.clone())
        .unwrap();

    let carol = harness.client_mut("carol");
    carol
        .orchestrator
        .handle_hub_event(answer.into_event("bob", "call-carol"))
        .await;

    let link = carol.fakes.connections.connection(PLACEHOLDER).unwrap();
    assert_eq!(link.remote_descriptions().len(), 1);
    assert_eq!(carol.link_state("bob"), Some(SignalingState::Stable));
    assert_eq!(carol.roster(), vec!["bob".to_string()]);
    assert!(carol.fakes.signaling.calls().is_empty());
}

// ============================================================================
// Fan-Out and Tie-Break
// ============================================================================

#[tokio::test]
async fn test_second_answerer_gets_fresh_offer_from_caller() {
    init_logging();

    let mut harness = MeshHarness::new(&["carol", "xavier", "yvonne"]).unwrap();
    ring(&mut harness, "carol", CallKind::Video).await;

    accept(&mut harness, "xavier").await;
    assert_ok!(harness.settle().await);
    accept(&mut harness, "yvonne").await;
    assert_ok!(harness.settle().await);

    harness.assert_full_mesh(&["carol", "xavier", "yvonne"]);

    // The placeholder link went to the first answerer only
    let carol = harness.client("carol");
    let placeholder_link = carol.fakes.connections.connection(PLACEHOLDER).unwrap();
    assert_eq!(
        carol.orchestrator.registry().get("xavier").unwrap().link_id(),
        placeholder_link.link_id()
    );

    assert_eq!(harness.targeted_offers("carol", "xavier"), 0);
    assert_eq!(harness.targeted_offers("carol", "yvonne"), 1);

    // Between the callees the smaller identity offers
    assert_eq!(harness.targeted_offers("xavier", "yvonne"), 1);
    assert_eq!(harness.targeted_offers("yvonne", "xavier"), 0);
}

#[tokio::test]
async fn test_tie_break_holds_in_both_delivery_orders() {
    init_logging();

    for order in [["alice", "bob", "carol"], ["bob", "alice", "carol"]] {
        let mut harness = MeshHarness::new(&["alice", "bob", "carol"]).unwrap();
        ring(&mut harness, "carol", CallKind::Audio).await;

        // Both accept before either answer has been delivered
        accept(&mut harness, "alice").await;
        accept(&mut harness, "bob").await;
        assert_ok!(harness.settle_in_order(&order).await);

        harness.assert_full_mesh(&["alice", "bob", "carol"]);
        assert_eq!(harness.targeted_offers("alice", "bob"), 1, "order {:?}", order);
        assert_eq!(harness.targeted_offers("bob", "alice"), 0, "order {:?}", order);
    }
}

#[tokio::test]
async fn test_late_joiner_sorting_first_offers_to_earlier_joiner() {
    init_logging();

    let mut harness = MeshHarness::new(&["alice", "carol", "yvonne"]).unwrap();
    ring(&mut harness, "carol", CallKind::Video).await;

    accept(&mut harness, "yvonne").await;
    assert_ok!(harness.settle().await);

    // Alice is still ringing and only remembers that yvonne joined
    assert!(!harness.client("alice").orchestrator.registry().contains("yvonne"));

    accept(&mut harness, "alice").await;
    assert_ok!(harness.settle().await);

    harness.assert_full_mesh(&["alice", "carol", "yvonne"]);
    assert_eq!(harness.targeted_offers("alice", "yvonne"), 1);
    assert_eq!(harness.targeted_offers("yvonne", "alice"), 0);
    assert_eq!(harness.targeted_offers("carol", "alice"), 1);
}

#[tokio::test]
async fn test_four_way_concurrent_join() {
    init_logging();

    let members = ["alice", "bob", "carol", "dave"];
    let mut harness = MeshHarness::new(&members).unwrap();
    ring(&mut harness, "dave", CallKind::Video).await;

    for callee in ["carol", "alice", "bob"] {
        accept(&mut harness, callee).await;
    }
    assert_ok!(harness.settle_in_order(&["carol", "dave", "bob", "alice"]).await);

    harness.assert_full_mesh(&members);

    for (a, b) in [("alice", "bob"), ("alice", "carol"), ("bob", "carol")] {
        assert_eq!(harness.targeted_offers(a, b), 1, "{} -> {}", a, b);
        assert_eq!(harness.targeted_offers(b, a), 0, "{} -> {}", b, a);
    }

    // Exactly one link per remote member
    for member in members {
        let registry = harness.client(member).orchestrator.registry();
        assert_eq!(registry.len(), members.len() - 1, "{}", member);
    }
}

#[tokio::test]
async fn test_events_from_replaced_link_are_ignored() {
    init_logging();

    let mut harness = MeshHarness::new(&["carol", "xavier", "yvonne"]).unwrap();
    ring(&mut harness, "carol", CallKind::Audio).await;
    accept(&mut harness, "xavier").await;
    assert_ok!(harness.settle().await);
    accept(&mut harness, "yvonne").await;
    assert_ok!(harness.settle().await);

    // Yvonne's accept-time link to the caller was replaced by the fresh offer
    let yvonne = harness.client_mut("yvonne");
    let links = yvonne.fakes.connections.connections_for("carol");
    assert_eq!(links.len(), 2);
    assert!(links[0].is_closed());
    assert!(!links[1].is_closed());

    yvonne
        .orchestrator
        .handle_link_event(LinkEvent {
            link_id: links[0].link_id().to_string(),
            identity: "carol".to_string(),
            kind: LinkEventKind::StateChanged(LinkState::Failed),
        })
        .await;

    assert_eq!(yvonne.link_state("carol"), Some(SignalingState::Stable));
    assert!(yvonne.roster().contains(&"carol".to_string()));
    assert!(yvonne.fakes.signaling.calls().is_empty());
}

// ============================================================================
// Leaving and Cancelling
// ============================================================================

#[tokio::test]
async fn test_callee_leaving_empties_roster_once() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    ring(&mut harness, "carol", CallKind::Audio).await;
    accept(&mut harness, "bob").await;
    assert_ok!(harness.settle().await);

    let mut notices = harness.client("carol").orchestrator.store_handle().notices();

    assert_ok!(harness.client_mut("bob").orchestrator.leave_call().await);
    assert_ok!(harness.settle().await);

    let bob = harness.client("bob");
    assert_eq!(bob.orchestrator.lifecycle(), Lifecycle::Idle);
    assert!(bob.orchestrator.registry().is_empty());
    assert!(!bob.orchestrator.media().is_acquired());

    let carol = harness.client("carol");
    assert!(carol.roster().is_empty());
    assert!(carol.orchestrator.registry().is_empty());
    assert_eq!(carol.orchestrator.lifecycle(), Lifecycle::Active);

    let mut emptied = 0;
    while let Ok(notice) = notices.try_recv() {
        if notice == CallNotice::RosterEmptied {
            emptied += 1;
        }
    }
    assert_eq!(emptied, 1);
}

#[tokio::test]
async fn test_caller_cancelling_stops_ringing() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    ring(&mut harness, "carol", CallKind::Video).await;

    let mut notices = harness.client("bob").orchestrator.store_handle().notices();
    assert_eq!(
        harness.client("bob").orchestrator.registry().pending_for("carol"),
        1
    );

    assert_ok!(harness.client_mut("carol").orchestrator.leave_call().await);
    assert_ok!(harness.settle().await);

    let bob = harness.client("bob");
    assert!(bob.orchestrator.store_handle().snapshot().incoming.is_none());
    assert_eq!(bob.orchestrator.registry().pending_for("carol"), 0);
    assert_eq!(
        notices.try_recv().unwrap(),
        CallNotice::IncomingCallCancelled {
            call_id: "call-carol".to_string()
        }
    );

    // Nothing left to accept
    assert!(harness
        .client_mut("bob")
        .orchestrator
        .accept_ringing()
        .await
        .is_err());
}

// ============================================================================
// Start Failures
// ============================================================================

#[tokio::test]
async fn test_media_refusal_rolls_back_start() {
    init_logging();

    let mut harness = MeshHarness::new(&["bob", "carol"]).unwrap();
    let carol = harness.client_mut("carol");
    carol.fakes.devices.refuse(TrackKind::Audio);

    let mut notices = carol.orchestrator.store_handle().notices();
    let result = carol.orchestrator.start_call(GROUP, CallKind::Video).await;
    assert!(result.is_err());

    assert_eq!(carol.orchestrator.lifecycle(), Lifecycle::Idle);
    assert!(carol.orchestrator.registry().is_empty());
    assert!(!carol.orchestrator.media().is_acquired());
    assert_eq!(carol.fakes.connections.created_count(), 0);
    assert!(matches!(notices.try_recv().unwrap(), CallNotice::StartFailed(_)));
    assert!(carol
        .orchestrator
        .store_handle()
        .snapshot()
        .last_error
        .is_some());

    assert_ok!(harness.settle().await);
    assert!(harness.routed().is_empty());
    assert!(harness.client("bob").orchestrator.store_handle().snapshot().incoming.is_none());

    // A later attempt works once the device is available again
    let carol = harness.client_mut("carol");
    carol.fakes.devices.refuse(TrackKind::Video);
    assert!(carol.orchestrator.start_call(GROUP, CallKind::Audio).await.is_ok());
}

#[tokio::test]
async fn test_call_group_failure_rolls_back_start() {
    init_logging();

    let mut harness = MeshHarness::new(&["carol"]).unwrap();
    let carol = harness.client_mut("carol");
    carol.fakes.signaling.fail_method(methods::CALL_GROUP);

    let result = carol.orchestrator.start_call(GROUP, CallKind::Audio).await;
    assert!(result.is_err());

    assert_eq!(carol.orchestrator.lifecycle(), Lifecycle::Idle);
    assert!(carol.orchestrator.registry().is_empty());
    assert!(!carol.orchestrator.media().is_acquired());

    let placeholder = carol.fakes.connections.connection(PLACEHOLDER).unwrap();
    assert!(placeholder.is_closed());

    // No call id came back, so there is nothing to end on the hub
    let calls = carol.fakes.signaling.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(calls[0], HubCall::CallGroup { .. }));
}
