// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Harness
//!
//! A [`SessionPool`] wired to a [`MockProtocolStack`] with fast timings.

use std::sync::Arc;
use std::time::Duration;

use sentra_opcua::client::CredentialProvider;
use sentra_opcua::{
    ConnectionIdentity, EngineConfig, OpcUaResult, Session, SessionHandle, SessionPool,
    SubscriptionHandle,
};

use super::assertions::assert_eventually;
use super::fixtures::{ConfigFixtures, IdentityFixtures};
use super::init_test_logging;
use super::mocks::{MockProtocolStack, MockSession};

// =============================================================================
// EngineHarness
// =============================================================================

/// Pool, mock stack and a default identity.
pub struct EngineHarness {
    /// The mock stack behind the pool.
    pub stack: MockProtocolStack,
    /// The pool under test.
    pub pool: SessionPool,
    /// Identity used by the convenience helpers.
    pub identity: ConnectionIdentity,
}

impl EngineHarness {
    /// Harness with [`ConfigFixtures::fast_engine`].
    pub fn new() -> Self {
        Self::with_config(ConfigFixtures::fast_engine())
    }

    /// Harness with a custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        init_test_logging();
        let stack = MockProtocolStack::new();
        let pool = SessionPool::builder(Arc::new(stack.clone()))
            .config(config)
            .build()
            .expect("harness config must be valid");
        Self {
            stack,
            pool,
            identity: IdentityFixtures::plant_server(),
        }
    }

    /// Harness with a custom credential provider.
    pub fn with_credentials(config: EngineConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        init_test_logging();
        let stack = MockProtocolStack::new();
        let pool = SessionPool::builder(Arc::new(stack.clone()))
            .config(config)
            .credentials(credentials)
            .build()
            .expect("harness config must be valid");
        Self {
            stack,
            pool,
            identity: IdentityFixtures::plant_server(),
        }
    }

    /// Use `identity` for the convenience helpers.
    pub fn identity(mut self, identity: ConnectionIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// The session handle for the default identity.
    pub fn handle(&self) -> Arc<SessionHandle> {
        self.pool
            .session_handle(&self.identity)
            .expect("pool must be running")
    }

    /// Waits for the default identity to connect.
    pub async fn connected_session(&self) -> Session {
        let handle = self.handle();
        tokio::time::timeout(Duration::from_secs(5), handle.acquire_session(None))
            .await
            .expect("session did not connect in time")
            .expect("session acquisition failed")
    }

    /// Creates and registers a subscription on the default identity.
    pub fn subscription(&self, id: &str) -> OpcUaResult<Arc<SubscriptionHandle>> {
        self.pool.create_subscription(id, &self.identity)
    }

    /// The mock session behind the current connection.
    pub fn mock_session(&self) -> Arc<MockSession> {
        self.stack
            .latest_session()
            .expect("no session has been opened")
    }

    /// Breaks the current session by failing its keep-alives, then waits for
    /// the replacement session.
    pub async fn force_reconnect(&self) -> Session {
        let handle = self.handle();
        let previous = self.connected_session().await.generation();
        tracing::info!(generation = previous, "Forcing reconnect");
        self.mock_session().set_keep_alive_failing(true);
        assert_eventually("session replaced after keep-alive loss", || {
            let replaced = handle
                .current()
                .map(|session| session.generation() > previous)
                .unwrap_or(false);
            std::future::ready(replaced && handle.state().is_connected())
        })
        .await;
        self.connected_session().await
    }

    /// Stops the pool.
    pub async fn shutdown(&self) {
        tracing::info!(sessions = self.pool.session_count(), "Stopping harness pool");
        tokio::time::timeout(Duration::from_secs(5), self.pool.stop())
            .await
            .expect("pool did not stop in time");
    }
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}
