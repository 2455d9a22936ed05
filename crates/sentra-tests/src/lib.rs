// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Sentra Integration Tests
//!
//! Shared test utilities and integration suites for the sentra session and
//! subscription engine. Everything runs against an in-process mock protocol
//! stack; no OPC UA server is required.
//!
//! ## Module Structure
//!
//! - [`common`]: Shared test utilities
//!   - `fixtures`: Identities, items and configurations used across suites
//!   - `builders`: Builders for monitored item sets
//!   - `assertions`: Polling and state assertions
//!   - `mocks`: Scriptable [`ProtocolStack`](sentra_opcua::ProtocolStack)
//!   - `harness`: Pool + mock wiring with fast timings
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p sentra-tests
//! cargo test -p sentra-tests --test integration_pool
//! cargo test -p sentra-tests --test integration_subscription
//! cargo test -p sentra-tests --test integration_reconnect
//! cargo test -p sentra-tests --test integration_config
//! ```
//!
//! ## Test Categories
//!
//! ### Pool Tests (`integration_pool.rs`)
//! - One session per identity under concurrent callers
//! - Removal with and without registered subscriptions
//! - Stop semantics and listener fan-out
//!
//! ### Subscription Tests (`integration_subscription.rs`)
//! - Diff reconciliation and idempotence
//! - Concurrent applies converging to the last desired state
//! - Partial failures, state transitions, notifications
//!
//! ### Reconnect Tests (`integration_reconnect.rs`)
//! - Keep-alive loss, backoff and replay onto the new session
//! - Active flag tracking connectivity
//!
//! ### Config Tests (`integration_config.rs`)
//! - YAML, TOML and JSON loading and validation
//!
//! ## Writing New Tests
//!
//! ```rust,ignore
//! use sentra_tests::prelude::*;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = EngineHarness::new();
//!     let sub = harness.subscription("line-1").unwrap();
//!     let session = harness.connected_session().await;
//!     sub.enable(&session).await.unwrap();
//!     harness.shutdown().await;
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod common;

/// Re-export commonly used items for convenience.
pub mod prelude {
    pub use crate::common::assertions::*;
    pub use crate::common::builders::*;
    pub use crate::common::fixtures::*;
    pub use crate::common::harness::*;
    pub use crate::common::mocks::*;
    pub use crate::common::{init_test_logging, unique_test_id};
}
