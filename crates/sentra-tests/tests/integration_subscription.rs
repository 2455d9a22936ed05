// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Subscription Integration Tests
//!
//! - `test_apply_*`: desired-state recording and reconciliation
//! - `test_state_*`: lifecycle transitions
//! - `test_close_*`: teardown
//! - `test_notifications_*`: data-change routing

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use sentra_opcua::client::{ChannelCallback, Variant};
use sentra_opcua::{
    ConfigurationError, ConnectivityState, ItemKey, MonitoredItemModel, NodeId, OpcUaError, OperationContext,
    Session, StatusCode, SubscriptionConfiguration, SubscriptionError, SubscriptionHandle,
    SubscriptionState,
};
use sentra_tests::assert_completes_within;
use sentra_tests::prelude::*;

fn ctx() -> OperationContext {
    OperationContext::new("integration-test")
}

async fn enabled_subscription(
    harness: &EngineHarness,
    id: &str,
    items: Vec<MonitoredItemModel>,
) -> (Arc<SubscriptionHandle>, Session) {
    let sub = harness.subscription(id).unwrap();
    let session = harness.connected_session().await;
    let enabled = sub
        .apply(items, ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();
    assert!(!enabled);
    sub.enable(&session).await.unwrap();
    (sub, session)
}

async fn active_subscription(
    harness: &EngineHarness,
    id: &str,
    items: Vec<MonitoredItemModel>,
) -> (Arc<SubscriptionHandle>, Session) {
    let (sub, session) = enabled_subscription(harness, id, items).await;
    sub.activate(&session).await.unwrap();
    (sub, session)
}

fn keys(items: &[MonitoredItemModel]) -> BTreeSet<ItemKey> {
    items.iter().map(|item| item.key()).collect()
}

// =============================================================================
// Apply
// =============================================================================

#[tokio::test]
async fn test_apply_before_enable_only_records() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();
    let session = harness.connected_session().await;

    let enabled = sub
        .apply(
            vec![ItemFixtures::item_a(), ItemFixtures::item_b()],
            ConfigFixtures::default_subscription(),
            &ctx(),
        )
        .await
        .unwrap();

    assert!(!enabled);
    assert_eq!(sub.state(), SubscriptionState::Created);
    assert_eq!(sub.desired_items().len(), 2);
    assert_eq!(harness.stack.calls().subscription_calls(), 0);

    sub.enable(&session).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Enabled);
    assert!(!sub.active());

    let server = harness.mock_session().subscriptions();
    assert_eq!(server.len(), 1);
    assert_eq!(server[0].items.len(), 2);
    assert!(!server[0].publishing);
    assert_eq!(sub.applied_items().await.len(), 2);
    assert_eq!(
        sub.revised_parameters().await.unwrap().revised_publishing_interval,
        Duration::from_secs(1)
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_reconciles_remove_modify_add_in_order() {
    let harness = EngineHarness::new();
    let b = ItemFixtures::item_b();
    let c = ItemFixtures::item_c();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![b.clone(), c.clone()]).await;
    harness.stack.clear_service_log();

    let a = ItemFixtures::item_a();
    let b_faster = b.clone().with_sampling_interval(250.0);
    let enabled = sub
        .apply(
            vec![a.clone(), b_faster.clone()],
            ConfigFixtures::default_subscription(),
            &ctx(),
        )
        .await
        .unwrap();
    assert!(enabled);

    assert_eq!(
        harness.stack.service_log(),
        vec![
            "delete_monitored_items",
            "modify_monitored_items",
            "create_monitored_items"
        ]
    );

    let report = sub.last_apply_report().unwrap();
    assert_eq!((report.added, report.modified, report.removed), (1, 1, 1));
    assert!(report.is_complete());

    let server = &harness.mock_session().subscriptions()[0];
    assert_eq!(server.items.len(), 2);
    assert!(server.item(&c.node_id).is_none());
    assert_eq!(server.item(&a.node_id).unwrap().model.sampling_interval, 100.0);
    assert_eq!(server.item(&b.node_id).unwrap().model.sampling_interval, 250.0);

    let applied = sub.applied_items().await;
    assert_eq!(applied.keys().cloned().collect::<BTreeSet<_>>(), keys(&[a, b_faster]));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let harness = EngineHarness::new();
    let items = ItemSetBuilder::new()
        .string("A", 100.0)
        .string("B", 500.0)
        .deadband(0.5)
        .build();
    let (sub, _session) = active_subscription(&harness, "line-1", items.clone()).await;
    let calls = harness.stack.calls().subscription_calls();

    for _ in 0..3 {
        sub.apply(items.clone(), ConfigFixtures::default_subscription(), &ctx())
            .await
            .unwrap();
    }

    assert_eq!(harness.stack.calls().subscription_calls(), calls);
    assert_eq!(sub.last_apply_report().unwrap().attempted(), 0);
    assert_eq!(sub.stats().applies(), 4);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_fastest_sampling_is_always_modified() {
    let harness = EngineHarness::new();
    let fastest = ItemFixtures::named("Fast", 0.0);
    let (sub, _session) = active_subscription(&harness, "line-1", vec![fastest.clone()]).await;
    assert_eq!(harness.stack.calls().modify_items(), 0);

    sub.apply(vec![fastest.clone()], ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();
    sub.apply(vec![fastest], ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();

    assert_eq!(harness.stack.calls().modify_items(), 2);
    assert_eq!(harness.stack.calls().create_items(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_changes_subscription_parameters() {
    let harness = EngineHarness::new();
    let items = vec![ItemFixtures::item_a()];
    let (sub, _session) = active_subscription(&harness, "line-1", items.clone()).await;

    let config = SubscriptionConfiguration::with_interval(Duration::from_millis(250));
    sub.apply(items, config.clone(), &ctx()).await.unwrap();

    assert_eq!(harness.stack.calls().modify_subscriptions(), 1);
    assert_eq!(harness.stack.calls().items_created(), 1);
    assert!(sub.last_apply_report().unwrap().subscription_modified);
    assert_eq!(sub.desired_configuration(), config);
    assert_eq!(
        sub.revised_parameters().await.unwrap().revised_publishing_interval,
        Duration::from_millis(250)
    );
    assert_eq!(
        harness.mock_session().subscriptions()[0].config.publishing_interval,
        Duration::from_millis(250)
    );

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_apply_concurrent_callers_converge_to_last_desired_state() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", Vec::new()).await;

    let applies = (0..100u32).map(|i| {
        let sub = sub.clone();
        tokio::spawn(async move {
            let items = ItemSetBuilder::new().numeric_range(i, 1 + i % 7).build();
            sub.apply(items, ConfigFixtures::default_subscription(), &ctx())
                .await
        })
    });
    for result in join_all(applies).await {
        assert!(result.unwrap().unwrap());
    }

    let desired = keys(&sub.desired_items());
    let applied: BTreeSet<ItemKey> = sub.applied_items().await.keys().cloned().collect();
    assert_eq!(applied, desired);

    let server: BTreeSet<ItemKey> = harness.mock_session().subscriptions()[0]
        .items
        .iter()
        .map(|item| item.model.key())
        .collect();
    assert_eq!(server, desired);
    assert_eq!(harness.stack.calls().create_subscriptions(), 1);
    assert_eq!(sub.stats().applies(), 101);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_partial_failure_is_reported_and_retried() {
    let harness = EngineHarness::new();
    let a = ItemFixtures::item_a();
    let c = ItemFixtures::item_c();
    harness.stack.reject_node(c.node_id.clone());

    let (sub, _session) = active_subscription(&harness, "line-1", vec![a.clone(), c.clone()]).await;

    let report = sub.last_apply_report().unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, c.key());
    assert_eq!(report.failures[0].status, StatusCode::BAD_NODE_ID_UNKNOWN);
    assert!(matches!(
        report.check(sub.id()),
        Err(OpcUaError::Subscription(SubscriptionError::PartialApply { failed: 1, total: 2, .. }))
    ));
    assert_eq!(sub.stats().item_failures(), 1);
    assert_eq!(sub.applied_items().await.len(), 1);
    assert_eq!(sub.state(), SubscriptionState::Active);

    harness.stack.accept_node(&c.node_id);
    sub.apply(vec![a, c.clone()], ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();

    let report = sub.last_apply_report().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.added, 1);
    assert!(harness.mock_session().subscriptions()[0].item(&c.node_id).is_some());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_rejects_duplicate_and_invalid_items() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();

    let duplicate = sub
        .apply(
            vec![ItemFixtures::item_a(), ItemFixtures::item_a()],
            ConfigFixtures::default_subscription(),
            &ctx(),
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(OpcUaError::Subscription(SubscriptionError::DuplicateItem { .. }))
    ));

    let null_node = sub
        .apply(
            vec![MonitoredItemModel::new(NodeId::numeric(0, 0))],
            ConfigFixtures::default_subscription(),
            &ctx(),
        )
        .await;
    assert!(matches!(
        null_node,
        Err(OpcUaError::Configuration(ConfigurationError::InvalidNodeId { .. }))
    ));

    let mut bad_config = SubscriptionConfiguration::default();
    bad_config.lifetime_count = 1;
    assert!(sub.apply(Vec::new(), bad_config, &ctx()).await.is_err());

    // Rejected calls leave the desired state untouched.
    assert!(sub.desired_items().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_canceled_caller_still_records_desired_state() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", Vec::new()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = sub
        .apply_with_cancel(
            vec![ItemFixtures::item_a()],
            ConfigFixtures::default_subscription(),
            &ctx(),
            Some(&cancel),
        )
        .await;

    result.assert_canceled();
    assert_eq!(sub.desired_items(), vec![ItemFixtures::item_a()]);

    // The next pass picks the recorded state up.
    sub.apply(
        vec![ItemFixtures::item_a()],
        ConfigFixtures::default_subscription(),
        &ctx(),
    )
    .await
    .unwrap();
    assert_eq!(sub.applied_items().await.len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_cancel_interrupts_hung_server_call() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    harness.stack.set_hang_item_creation(true);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let items = vec![ItemFixtures::item_a(), ItemFixtures::item_b()];
    let result = assert_completes_within!(
        Duration::from_secs(2),
        sub.apply_with_cancel(
            items.clone(),
            ConfigFixtures::default_subscription(),
            &ctx(),
            Some(&cancel),
        )
    );
    result.assert_canceled();
    assert_eq!(keys(&sub.desired_items()), keys(&items));

    // The apply lock is free again.
    let applied = assert_completes_within!(Duration::from_secs(1), sub.applied_items());
    assert_eq!(applied.len(), 1);
    assert_eq!(sub.state(), SubscriptionState::Active);

    harness.stack.set_hang_item_creation(false);
    sub.apply(items.clone(), ConfigFixtures::default_subscription(), &ctx())
        .await
        .unwrap();
    let applied: BTreeSet<ItemKey> = sub.applied_items().await.into_keys().collect();
    assert_eq!(applied, keys(&items));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_apply_failed_parameter_change_is_retried_on_replay() {
    let harness = EngineHarness::new();
    let items = vec![ItemFixtures::item_a()];
    let (sub, _session) = active_subscription(&harness, "line-1", items.clone()).await;
    harness.stack.set_fail_modify_subscription(true);

    let config = SubscriptionConfiguration::with_interval(Duration::from_millis(250));
    assert!(sub.apply(items, config, &ctx()).await.unwrap());

    let report = sub.last_apply_report().unwrap();
    assert!(!report.subscription_modified);
    assert_eq!(report.subscription_failure, Some(StatusCode::BAD_TIMEOUT));
    assert!(matches!(
        report.check(sub.id()),
        Err(OpcUaError::Subscription(SubscriptionError::PartialApply { failed: 1, .. }))
    ));

    harness.stack.set_fail_modify_subscription(false);
    sub.update_connectivity_state(ConnectivityState::Disconnected, ConnectivityState::Connected);

    let handle = &sub;
    assert_eventually("parameters applied by replay", || async move {
        handle
            .revised_parameters()
            .await
            .map(|revised| revised.revised_publishing_interval)
            == Some(Duration::from_millis(250))
    })
    .await;
    assert_eq!(harness.stack.calls().modify_subscriptions(), 2);
    assert!(sub.last_apply_report().unwrap().is_complete());

    harness.shutdown().await;
}

// =============================================================================
// State
// =============================================================================

#[tokio::test]
async fn test_state_invalid_transitions_from_created() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();
    let session = harness.connected_session().await;

    sub.activate(&session).await.assert_invalid_transition();
    sub.deactivate(&session).await.assert_invalid_transition();
    assert_eq!(sub.state(), SubscriptionState::Created);
    assert_eq!(harness.stack.calls().subscription_calls(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_state_deactivate_and_reactivate() {
    let harness = EngineHarness::new();
    let (sub, session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    assert!(sub.active());
    assert!(harness.mock_session().subscriptions()[0].publishing);

    sub.deactivate(&session).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Deactivated);
    assert!(!sub.active());
    assert!(sub.enabled());
    assert!(!harness.mock_session().subscriptions()[0].publishing);

    // Deactivating twice is a no-op.
    let publishing_calls = harness.stack.calls().set_publishing();
    sub.deactivate(&session).await.unwrap();
    assert_eq!(harness.stack.calls().set_publishing(), publishing_calls);

    sub.activate(&session).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Active);
    assert!(harness.mock_session().subscriptions()[0].publishing);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_state_deactivate_from_enabled_makes_no_server_call() {
    let harness = EngineHarness::new();
    let (sub, session) = enabled_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    let calls = harness.stack.calls().subscription_calls();

    sub.deactivate(&session).await.unwrap();

    assert_eq!(sub.state(), SubscriptionState::Deactivated);
    assert_eq!(harness.stack.calls().subscription_calls(), calls);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_state_enable_failure_keeps_created() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();
    let session = harness.connected_session().await;
    harness.stack.set_fail_create_subscription(true);

    let result = sub.enable(&session).await;
    assert!(matches!(
        result,
        Err(OpcUaError::Subscription(SubscriptionError::CreationFailed { .. }))
    ));
    assert_eq!(sub.state(), SubscriptionState::Created);

    harness.stack.set_fail_create_subscription(false);
    sub.enable(&session).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Enabled);

    harness.shutdown().await;
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_is_idempotent() {
    let harness = EngineHarness::new();
    let (sub, session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;

    sub.close(&ctx()).await.unwrap();
    sub.close(&ctx()).await.unwrap();

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert!(!sub.active());
    assert_eq!(harness.stack.calls().delete_subscriptions(), 1);
    assert!(harness.mock_session().subscriptions().is_empty());
    assert_eq!(harness.pool.subscription_count(&harness.identity), 0);

    sub.apply(Vec::new(), ConfigFixtures::default_subscription(), &ctx())
        .await
        .assert_invalid_transition();
    sub.enable(&session).await.assert_invalid_transition();
    sub.activate(&session).await.assert_invalid_transition();

    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_without_session_succeeds() {
    let harness = EngineHarness::new();
    harness.stack.set_fail_open(true);
    let sub = harness.subscription("line-1").unwrap();

    sub.close(&ctx()).await.unwrap();

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(harness.stack.calls().delete_subscriptions(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_rejoins_pool_under_same_id() {
    let harness = EngineHarness::new();
    let first = harness.subscription("line-1").unwrap();
    first.close(&ctx()).await.unwrap();

    let second = harness.subscription("line-1").unwrap();
    assert_eq!(second.state(), SubscriptionState::Created);
    assert_eq!(harness.pool.subscription_count(&harness.identity), 1);
    assert_eq!(harness.pool.stats().registrations(), 2);
    assert_eq!(harness.pool.stats().unregistrations(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_interrupts_hung_server_call() {
    let harness = EngineHarness::new();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![ItemFixtures::item_a()]).await;
    harness.stack.set_hang_item_creation(true);

    let in_flight = {
        let sub = sub.clone();
        tokio::spawn(async move {
            sub.apply(
                vec![ItemFixtures::item_a(), ItemFixtures::item_b()],
                ConfigFixtures::default_subscription(),
                &ctx(),
            )
            .await
        })
    };
    assert_eventually_sync("item creation in flight", || {
        harness.stack.calls().create_items() == 2
    })
    .await;

    assert_completes_within!(Duration::from_secs(2), sub.close(&ctx())).unwrap();
    assert_completes_within!(Duration::from_secs(2), in_flight)
        .unwrap()
        .assert_canceled();
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(harness.stack.calls().delete_subscriptions(), 1);

    harness.shutdown().await;
}

// =============================================================================
// Notifications
// =============================================================================

#[tokio::test]
async fn test_notifications_reach_receivers_and_callbacks() {
    let harness = EngineHarness::new();
    let a = ItemFixtures::item_a();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![a.clone()]).await;

    let mut receiver = sub.notifications();
    let (callback, mut channel) = ChannelCallback::with_channel(8);
    sub.add_callback(Arc::new(callback));

    assert_eq!(harness.stack.emit(&a.node_id, Variant::Double(21.5)), 1);

    let broadcast = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broadcast.subscription_id.as_str(), "line-1");
    assert_eq!(broadcast.key, a.key());
    assert_eq!(broadcast.value, Variant::Double(21.5));
    assert!(broadcast.status.is_good());

    let callback_copy = tokio::time::timeout(Duration::from_secs(1), channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(callback_copy.key, a.key());
    assert_eq!(sub.notifications_delivered(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_notifications_not_published_while_deactivated() {
    let harness = EngineHarness::new();
    let a = ItemFixtures::item_a();
    let (sub, session) = active_subscription(&harness, "line-1", vec![a.clone()]).await;

    sub.deactivate(&session).await.unwrap();
    assert_eq!(harness.stack.emit(&a.node_id, Variant::Int32(7)), 0);
    assert_eq!(sub.notifications_delivered(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_notifications_stop_after_pool_stop() {
    let harness = EngineHarness::new();
    let a = ItemFixtures::item_a();
    let (sub, _session) = active_subscription(&harness, "line-1", vec![a.clone()]).await;
    let mock = harness.mock_session();
    let mut receiver = sub.notifications();

    harness.shutdown().await;

    // The mock still holds the sink; the engine must drop late publishes.
    assert_eq!(mock.emit(&a.node_id, Variant::Boolean(true)), 1);
    assert_eq!(sub.notifications_delivered(), 0);
    assert!(receiver.try_recv().is_err());
    assert_eq!(sub.state(), SubscriptionState::Closed);
}
