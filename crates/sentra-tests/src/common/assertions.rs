// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Custom Test Assertions
//!
//! Polling helpers and engine-specific assertions with readable failures.

use std::future::Future;
use std::time::Duration;

use sentra_opcua::{
    ConnectivityState, OpcUaError, OpcUaResult, SessionError, SessionHandle, SubscriptionError,
    SubscriptionHandle, SubscriptionState,
};

/// Default upper bound for eventual assertions.
pub const EVENTUALLY: Duration = Duration::from_secs(5);

const POLL: Duration = Duration::from_millis(5);

// =============================================================================
// Async Assertion Helpers
// =============================================================================

/// Wait for a condition to become true within a timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for a condition, panicking with `message` if it never holds.
pub async fn assert_eventually<F, Fut>(message: &str, condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if !wait_for(EVENTUALLY, POLL, condition).await {
        panic!("Condition not met within {:?}: {}", EVENTUALLY, message);
    }
}

/// Synchronous variant of [`assert_eventually`].
pub async fn assert_eventually_sync<F>(message: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    assert_eventually(message, || std::future::ready(condition())).await;
}

/// Wait until the handle reports `expected`.
pub async fn wait_for_connectivity(handle: &SessionHandle, expected: ConnectivityState) {
    let mut rx = handle.watch_state();
    let reached = tokio::time::timeout(EVENTUALLY, async {
        loop {
            if *rx.borrow_and_update() == expected {
                return true;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow() == expected;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(
        reached,
        "Session for {} never reached {:?}, last state {:?}",
        handle.identity().endpoint_url(),
        expected,
        handle.state()
    );
}

/// Wait until the subscription reports `expected`.
pub async fn wait_for_subscription_state(
    subscription: &SubscriptionHandle,
    expected: SubscriptionState,
) {
    let reached = wait_for(EVENTUALLY, POLL, || {
        std::future::ready(subscription.state() == expected)
    })
    .await;
    assert!(
        reached,
        "Subscription '{}' never reached {:?}, last state {:?}",
        subscription.id(),
        expected,
        subscription.state()
    );
}

// =============================================================================
// Error Assertions
// =============================================================================

/// Assertion extensions for engine results.
pub trait ResultAssertions<T> {
    /// Assert a cancellation error.
    fn assert_canceled(self);

    /// Assert `SessionClosed`.
    fn assert_session_closed(self);

    /// Assert an invalid state transition.
    fn assert_invalid_transition(self);
}

impl<T: std::fmt::Debug> ResultAssertions<T> for OpcUaResult<T> {
    fn assert_canceled(self) {
        match self {
            Err(OpcUaError::Session(SessionError::Canceled { .. })) => {}
            other => panic!("Expected a cancellation error, got {:?}", other),
        }
    }

    fn assert_session_closed(self) {
        match self {
            Err(OpcUaError::Session(SessionError::Closed { .. })) => {}
            other => panic!("Expected SessionClosed, got {:?}", other),
        }
    }

    fn assert_invalid_transition(self) {
        match self {
            Err(OpcUaError::Subscription(SubscriptionError::InvalidStateTransition { .. })) => {}
            other => panic!("Expected an invalid state transition, got {:?}", other),
        }
    }
}

/// Assert that an async operation completes within a timeout.
#[macro_export]
macro_rules! assert_completes_within {
    ($timeout:expr, $future:expr) => {{
        match tokio::time::timeout($timeout, $future).await {
            Ok(result) => result,
            Err(_) => panic!("Operation did not complete within {:?}", $timeout),
        }
    }};
}
