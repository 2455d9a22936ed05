// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Reconnect Integration Tests
//!
//! Session loss detection, backoff and replay of subscriptions onto the new
//! session.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sentra_opcua::client::Variant;
use sentra_opcua::{
    ConnectivityState, ItemKey, MonitoredItemModel, OperationContext, Session, SubscriptionHandle,
    SubscriptionState,
};
use sentra_tests::prelude::*;

fn ctx() -> OperationContext {
    OperationContext::new("integration-test")
}

async fn active_subscription(
    harness: &EngineHarness,
    id: &str,
    items: Vec<MonitoredItemModel>,
) -> (Arc<SubscriptionHandle>, Session) {
    let sub = harness.subscription(id).unwrap();
    let session = harness.connected_session().await;
    sub.apply(items, ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();
    sub.enable(&session).await.unwrap();
    sub.activate(&session).await.unwrap();
    (sub, session)
}

fn server_keys(session: &MockSession) -> BTreeSet<ItemKey> {
    session
        .subscriptions()
        .iter()
        .flat_map(|sub| sub.items.iter().map(|item| item.model.key()))
        .collect()
}

// =============================================================================
// Keep-alive loss
// =============================================================================

#[tokio::test]
async fn test_keep_alive_loss_replays_subscription_without_deletes() {
    let harness = EngineHarness::new();
    let items = vec![ItemFixtures::item_a(), ItemFixtures::item_b()];
    let (sub, first) = active_subscription(&harness, "line-1", items.clone()).await;
    let old_mock = harness.mock_session();
    let handle = harness.handle();

    let second = harness.force_reconnect().await;

    assert!(second.generation() > first.generation());
    assert!(old_mock.is_closed());
    assert_eq!(handle.stats().reconnects(), 1);
    assert!(handle.stats().keep_alive_failures() >= 3);

    assert_eventually_sync("subscription active again", || sub.active()).await;
    let new_mock = harness.mock_session();
    assert_ne!(new_mock.id(), old_mock.id());

    let server = new_mock.subscriptions();
    assert_eq!(server.len(), 1);
    assert!(server[0].publishing);
    assert_eq!(
        server_keys(&new_mock),
        items.iter().map(|i| i.key()).collect::<BTreeSet<_>>()
    );

    // Objects of the dead session are forgotten, never deleted.
    assert_eq!(harness.stack.calls().deletes(), 0);
    assert_eq!(harness.stack.calls().create_subscriptions(), 2);
    assert!(sub.stats().replays() >= 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_transport_loss_reconnects_immediately() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    let handle = harness.handle();

    harness.mock_session().drop_connection();

    assert_eventually_sync("replacement session", || handle.stats().reconnects() == 1).await;
    assert_eventually_sync("subscription active again", || sub.active()).await;
    assert_eq!(handle.stats().keep_alive_failures(), 0);
    assert_eq!(harness.stack.sessions().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_connectivity_listener_sees_loss_and_recovery() {
    let harness = EngineHarness::new();
    let listener = RecordingListener::new();
    harness.pool.add_listener(listener.clone());
    let _sub = harness.subscription("line-1").unwrap();
    harness.connected_session().await;

    harness.force_reconnect().await;

    let transitions = listener.transitions();
    assert!(transitions.contains(&(ConnectivityState::Connected, ConnectivityState::Disconnected)));
    assert_eq!(
        transitions
            .iter()
            .filter(|(_, current)| *current == ConnectivityState::Connected)
            .count(),
        2
    );

    harness.shutdown().await;
}

// =============================================================================
// Active tracks connectivity
// =============================================================================

#[tokio::test]
async fn test_active_is_false_while_disconnected() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    let handle = harness.handle();
    assert!(sub.active());

    harness.stack.set_fail_open(true);
    harness.mock_session().set_keep_alive_failing(true);
    assert_eventually_sync("session released", || {
        handle.current().is_none() && !handle.state().is_connected()
    })
    .await;

    assert!(!sub.active());
    assert_eq!(sub.state(), SubscriptionState::Enabled);
    assert!(sub.enabled());

    // Desired changes made during the outage wait for the replay.
    let calls = harness.stack.calls().subscription_calls();
    let during_outage = vec![
        ItemFixtures::item_a(),
        ItemFixtures::item_b(),
        ItemFixtures::item_c(),
    ];
    let enabled = sub
        .apply(during_outage.clone(), ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();
    assert!(enabled);
    assert_eq!(harness.stack.calls().subscription_calls(), calls);

    harness.stack.set_fail_open(false);
    assert_eventually_sync("subscription active again", || sub.active()).await;
    assert_eventually_sync("outage changes applied", || {
        server_keys(&harness.mock_session()).len() == 3
    })
    .await;
    assert_eq!(
        server_keys(&harness.mock_session()),
        during_outage.iter().map(|i| i.key()).collect::<BTreeSet<_>>()
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_deactivated_subscription_stays_deactivated_after_reconnect() {
    let harness = EngineHarness::new();
    let (sub, session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    sub.deactivate(&session).await.unwrap();

    harness.force_reconnect().await;

    assert_eventually_sync("subscription recreated", || {
        harness.mock_session().subscriptions().len() == 1
    })
    .await;
    assert_eventually_sync("items recreated", || harness.mock_session().item_count() == 1).await;
    assert_eq!(sub.state(), SubscriptionState::Deactivated);
    assert!(!harness.mock_session().subscriptions()[0].publishing);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_created_subscription_is_not_replayed() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();
    harness.connected_session().await;
    sub.apply(
        vec![ItemFixtures::item_a()],
        ConfigFixtures::default_subscription(),
        &ctx(),
    )
    .await
    .unwrap();

    harness.force_reconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sub.state(), SubscriptionState::Created);
    assert_eq!(harness.stack.calls().create_subscriptions(), 0);
    harness.shutdown().await;
}

// =============================================================================
// Failed replays
// =============================================================================

#[tokio::test]
async fn test_failed_replay_recovers_on_next_apply() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;

    harness.stack.set_fail_create_subscription(true);
    harness.force_reconnect().await;
    assert_eventually_sync("replay attempted", || {
        harness.stack.calls().create_subscriptions() >= 2
    })
    .await;
    assert!(harness.mock_session().subscriptions().is_empty());
    assert_eq!(sub.state(), SubscriptionState::Enabled);
    assert!(!sub.active());

    harness.stack.set_fail_create_subscription(false);
    let items = vec![ItemFixtures::item_a(), ItemFixtures::item_b()];
    let enabled = sub
        .apply(items.clone(), ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();
    assert!(enabled);

    assert_eventually_sync("subscription active again", || sub.active()).await;
    let mock = harness.mock_session();
    assert_eq!(mock.subscriptions().len(), 1);
    assert_eq!(
        server_keys(&mock),
        items.iter().map(|i| i.key()).collect::<BTreeSet<_>>()
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_replay_is_retried_with_backoff() {
    let harness = EngineHarness::new();
    let items = vec![ItemFixtures::item_a(), ItemFixtures::item_b()];
    let expected: BTreeSet<ItemKey> = items.iter().map(|i| i.key()).collect();
    let (sub, _session) = active_subscription(&harness, "line-1", items).await;

    harness.stack.set_fail_create_subscription(true);
    harness.force_reconnect().await;
    assert_eventually_sync("replay retried", || {
        harness.stack.calls().create_subscriptions() >= 4
    })
    .await;
    assert_eq!(harness.handle().stats().reconnects(), 1);
    assert!(!sub.active());

    harness.stack.set_fail_create_subscription(false);
    assert_eventually_sync("subscription active again", || sub.active()).await;
    assert_eventually_sync("items recreated", || {
        server_keys(&harness.mock_session()) == expected
    })
    .await;
    assert_eq!(harness.mock_session().subscriptions().len(), 1);

    harness.shutdown().await;
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn test_desired_state_survives_repeated_reconnects() {
    let harness = EngineHarness::new();
    let items = ItemFixtures::batch(20);
    let (sub, _session) = active_subscription(&harness, "line-1", items.clone()).await;
    let expected: BTreeSet<ItemKey> = items.iter().map(|i| i.key()).collect();

    for round in 1..=3u64 {
        harness.force_reconnect().await;
        assert_eventually_sync("subscription active again", || sub.active()).await;
        assert_eventually_sync("all items recreated", || {
            server_keys(&harness.mock_session()) == expected
        })
        .await;
        assert_eq!(harness.handle().stats().reconnects(), round);
    }

    assert_eq!(sub.desired_items().len(), 20);
    assert_eq!(sub.applied_items().await.len(), 20);
    assert_eq!(harness.stack.calls().deletes(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_notifications_resume_after_reconnect() {
    let harness = EngineHarness::new();
    let a = ItemFixtures::item_a();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![a.clone()]).await;
    let mut receiver = sub.notifications();

    harness.force_reconnect().await;
    assert_eventually_sync("subscription active again", || sub.active()).await;

    assert_eq!(harness.stack.emit(&a.node_id, Variant::UInt32(42)), 1);
    let notification = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.key, a.key());
    assert_eq!(notification.value, Variant::UInt32(42));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_backoff_retries_until_server_returns() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    let handle = harness.handle();

    harness.stack.fail_next_opens(4);
    harness.mock_session().drop_connection();

    assert_eventually_sync("subscription active again", || sub.active()).await;
    assert_eq!(handle.stats().connect_failures(), 4);
    assert_eq!(handle.stats().reconnects(), 1);
    assert_eq!(harness.stack.calls().opens(), 6);

    harness.shutdown().await;
}
