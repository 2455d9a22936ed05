// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Session Pool Integration Tests
//!
//! - `test_pool_*`: session sharing, lookup and removal
//! - `test_acquire_*`: waiting for a connected session
//! - `test_stop_*`: pool shutdown
//! - `test_credentials_*`: identity resolution

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use sentra_opcua::client::{IdentityToken, StaticCredentials};
use sentra_opcua::{
    ConnectionError, ConnectivityState, CredentialKind, OpcUaError, OperationContext,
    SubscriptionState,
};
use sentra_tests::assert_completes_within;
use sentra_tests::prelude::*;

fn ctx() -> OperationContext {
    OperationContext::new("integration-test")
}

// =============================================================================
// Session sharing
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_single_session_under_concurrent_callers() {
    let harness = EngineHarness::new();
    harness.stack.set_open_delay(Duration::from_millis(50));

    let calls = (0..32).map(|_| {
        let pool = harness.pool.clone();
        let identity = harness.identity.clone();
        tokio::spawn(async move { pool.get_or_create_session(&identity, true).await })
    });
    let sessions: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().expect("session must be created"))
        .collect();

    assert_eq!(harness.stack.calls().opens(), 1);
    assert_eq!(harness.pool.session_count(), 1);
    assert_eq!(harness.pool.stats().sessions_created(), 1);
    assert!(sessions.iter().all(|s| s.same_session(&sessions[0])));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pool_distinct_identities_get_distinct_sessions() {
    let harness = EngineHarness::new();
    let servers = IdentityFixtures::server_batch(3);

    for identity in &servers {
        harness
            .pool
            .get_or_create_session(identity, true)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(harness.pool.session_count(), 3);
    assert_eq!(harness.stack.calls().opens(), 3);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_pool_lookup_without_create() {
    let harness = EngineHarness::new();

    let none = harness
        .pool
        .get_or_create_session(&harness.identity, false)
        .await
        .unwrap();
    assert!(none.is_none());
    assert_eq!(harness.pool.session_count(), 0);
    assert!(harness.pool.find_session_handle(&harness.identity).is_none());

    // An existing but disconnected handle is reported without waiting.
    harness.stack.set_fail_open(true);
    let handle = harness.handle();
    let current = assert_completes_within!(
        Duration::from_millis(500),
        harness.pool.get_or_create_session(&harness.identity, false)
    )
    .unwrap();
    assert!(current.is_none());
    assert!(Arc::ptr_eq(
        &handle,
        &harness.pool.find_session_handle(&harness.identity).unwrap()
    ));

    harness.stack.set_fail_open(false);
    wait_for_connectivity(&handle, ConnectivityState::Connected).await;
    let current = harness
        .pool
        .get_or_create_session(&harness.identity, false)
        .await
        .unwrap();
    assert!(current.is_some());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pool_normalizes_identity() {
    let harness = EngineHarness::new();
    let a = harness
        .pool
        .session_handle(&sentra_opcua::ConnectionIdentity::new("opc.tcp://Plant-Server:4840/"))
        .unwrap();
    let b = harness
        .pool
        .session_handle(&IdentityFixtures::plant_server())
        .unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(harness.pool.session_count(), 1);
    harness.shutdown().await;
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn test_pool_remove_only_if_empty_keeps_referenced_session() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();
    harness.connected_session().await;
    assert_eq!(harness.pool.subscription_count(&harness.identity), 1);

    let removed = harness
        .pool
        .remove_session(&harness.identity, true, &ctx())
        .await
        .unwrap();
    assert!(!removed);
    assert_eq!(harness.pool.session_count(), 1);

    sub.close(&ctx()).await.unwrap();
    assert_eq!(harness.pool.subscription_count(&harness.identity), 0);

    let removed = harness
        .pool
        .remove_session(&harness.identity, true, &ctx())
        .await
        .unwrap();
    assert!(removed);
    assert_eq!(harness.pool.session_count(), 0);
    assert_eq!(harness.pool.stats().sessions_removed(), 1);
    assert_eventually_sync("session closed on the stack", || {
        harness.stack.open_sessions() == 0
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pool_forced_remove_fails_waiters_with_session_closed() {
    let harness = EngineHarness::new();
    harness.stack.set_fail_open(true);
    let sub = harness.subscription("line-1").unwrap();
    let handle = harness.handle();

    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.acquire_session(None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let removed = harness
        .pool
        .remove_session(&harness.identity, false, &ctx())
        .await
        .unwrap();
    assert!(removed);

    waiter.await.unwrap().assert_session_closed();
    handle.acquire_session(None).await.assert_session_closed();
    assert!(handle.is_closed());
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(harness.pool.session_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pool_remove_unknown_identity_is_noop() {
    let harness = EngineHarness::new();
    let removed = harness
        .pool
        .remove_session(&IdentityFixtures::line_server(), false, &ctx())
        .await
        .unwrap();
    assert!(!removed);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_pool_dropped_subscription_does_not_pin_session() {
    let harness = EngineHarness::new();
    let sub = harness.subscription("line-1").unwrap();
    drop(sub);

    // A replay task may still hold the handle for a moment.
    assert_eventually_sync("dropped subscription pruned", || {
        harness.pool.subscription_count(&harness.identity) == 0
    })
    .await;
    let removed = harness
        .pool
        .remove_session(&harness.identity, true, &ctx())
        .await
        .unwrap();
    assert!(removed);
    harness.shutdown().await;
}

// =============================================================================
// Acquire
// =============================================================================

#[tokio::test]
async fn test_acquire_waits_for_connection() {
    let harness = EngineHarness::new();
    harness.stack.fail_next_opens(3);

    let session = harness.connected_session().await;
    let handle = harness.handle();

    assert_eq!(session.generation(), 1);
    assert_eq!(harness.stack.calls().opens(), 4);
    assert_eq!(handle.stats().connect_failures(), 3);
    assert_eq!(handle.stats().connects(), 1);
    assert_eq!(handle.state(), ConnectivityState::Connected);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_acquire_caller_cancellation() {
    let harness = EngineHarness::new();
    harness.stack.set_fail_open(true);
    let handle = harness.handle();
    let cancel = CancellationToken::new();

    let waiter = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { handle.acquire_session(Some(&cancel)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    waiter.await.unwrap().assert_canceled();
    // Only the caller gave up; the handle keeps trying.
    assert!(!handle.is_closed());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_acquire_max_wait_exceeded() {
    let config = ConfigFixtures::fast_builder()
        .acquire_max_wait(Duration::from_millis(100))
        .build()
        .unwrap();
    let harness = EngineHarness::with_config(config);
    harness.stack.set_fail_open(true);

    let result = harness.handle().acquire_session(None).await;
    assert!(matches!(
        result,
        Err(OpcUaError::Connection(ConnectionError::WaitExceeded { .. }))
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_acquire_fails_after_reconnect_attempts_exhausted() {
    let config = ConfigFixtures::fast_builder()
        .max_reconnect_attempts(2)
        .build()
        .unwrap();
    let harness = EngineHarness::with_config(config);
    harness.stack.set_fail_open(true);
    let handle = harness.handle();

    let result = handle.acquire_session(None).await;
    assert!(matches!(
        result,
        Err(OpcUaError::Connection(ConnectionError::Failed { attempts: 2, .. }))
    ));
    assert!(handle.is_failed());
    assert_eq!(harness.stack.calls().opens(), 2);
    assert_eq!(handle.state(), ConnectivityState::Error);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_acquire_after_dispose() {
    let harness = EngineHarness::new();
    let handle = harness.handle();
    harness.connected_session().await;

    handle.dispose().await;

    handle.acquire_session(None).await.assert_canceled();
    assert!(handle.is_closed());
    assert!(handle.current().is_none());
    assert_eq!(handle.state(), ConnectivityState::Disconnected);
    assert_eq!(harness.stack.open_sessions(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_acquire_unauthorized_state() {
    let harness = EngineHarness::new();
    harness.stack.set_deny_access(true);
    let handle = harness.handle();

    wait_for_connectivity(&handle, ConnectivityState::Unauthorized).await;

    harness.stack.set_deny_access(false);
    wait_for_connectivity(&handle, ConnectivityState::Connected).await;
    harness.shutdown().await;
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn test_stop_cancels_waiters_and_rejects_new_work() {
    let harness = EngineHarness::new();
    harness.stack.set_fail_open(true);
    let handle = harness.handle();

    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.acquire_session(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    harness.shutdown().await;

    let result = waiter.await.unwrap();
    assert!(matches!(&result, Err(e) if e.is_canceled()));
    assert!(harness.pool.is_stopped());
    assert_eq!(harness.pool.session_count(), 0);
    assert!(harness
        .pool
        .get_or_create_session(&harness.identity, true)
        .await
        .is_err());
    assert!(harness.subscription("late").is_err());

    // Idempotent.
    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_silences_listeners() {
    let harness = EngineHarness::new();
    let listener = RecordingListener::new();
    harness.pool.add_listener(listener.clone());
    let sub = harness.subscription("line-1").unwrap();

    harness.connected_session().await;
    assert!(listener
        .transitions()
        .contains(&(ConnectivityState::Connecting, ConnectivityState::Connected)));

    harness.shutdown().await;
    assert_eq!(listener.shutdowns(), 1);
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(harness.stack.open_sessions(), 0);

    let seen = listener.transitions().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.transitions().len(), seen);

    harness.shutdown().await;
    assert_eq!(listener.shutdowns(), 1);
}

// =============================================================================
// Credentials
// =============================================================================

#[tokio::test]
async fn test_credentials_resolved_per_identity() {
    let credentials = StaticCredentials::new()
        .with("operator", IdentityToken::user_name("operator", "s3cret"));
    let harness = EngineHarness::with_credentials(ConfigFixtures::fast_engine(), Arc::new(credentials))
        .identity(IdentityFixtures::secured_plant_server("operator"));

    harness.connected_session().await;

    let tokens = harness.stack.presented_tokens();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind(), CredentialKind::UserName);
    assert!(!tokens[0].to_string().contains("s3cret"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_credentials_unknown_reference_is_unauthorized() {
    let harness = EngineHarness::with_credentials(
        ConfigFixtures::fast_engine(),
        Arc::new(StaticCredentials::new()),
    )
    .identity(IdentityFixtures::secured_plant_server("nobody"));

    let handle = harness.handle();
    wait_for_connectivity(&handle, ConnectivityState::Unauthorized).await;
    assert_eq!(harness.stack.calls().opens(), 0);

    harness.shutdown().await;
}
