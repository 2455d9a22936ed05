// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA session and subscription management engine.
//!
//! Keeps pooled client sessions to remote OPC UA endpoints alive, reconciles
//! subscriptions against a continuously changing desired configuration and
//! recovers from network and server faults on its own. Wire encoding is left
//! to a [`ProtocolStack`](client::ProtocolStack) implementation.
//!
//! # Features
//!
//! - At most one session per connection identity, shared by all subscribers
//! - Keep-alive probing and reconnect with capped, jittered backoff
//! - Incremental monitored-item reconciliation (remove, modify, add)
//! - Desired state that survives disconnects and is replayed on reconnect
//! - Data-change delivery via broadcast stream or callbacks
//!
//! # Error Handling
//!
//! ```text
//! OpcUaError
//! ├── Connection    - connect failures, wait exceeded, lost channels
//! ├── Session       - SessionClosed, Canceled
//! ├── Subscription  - PartialApply, InvalidStateTransition
//! ├── Service       - status codes returned by the stack
//! └── Configuration - invalid settings
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sentra_opcua::client::SessionPool;
//! use sentra_opcua::types::{ConnectionIdentity, MonitoredItemModel, NodeId, OperationContext};
//!
//! let pool = SessionPool::builder(stack).build()?;
//! let identity = ConnectionIdentity::new("opc.tcp://plc-01:4840");
//!
//! let subscription = pool.create_subscription("twin-1", &identity)?;
//! let session = subscription.session_handle().acquire_session(None).await?;
//! subscription.enable(&session).await?;
//! subscription.activate(&session).await?;
//!
//! let items = vec![MonitoredItemModel::new(NodeId::string(2, "Line1.Speed"))];
//! subscription
//!     .apply(items, Default::default(), &OperationContext::new("twin-service"))
//!     .await?;
//!
//! let mut notifications = subscription.notifications();
//! while let Ok(change) = notifications.recv().await {
//!     println!("{} = {}", change.key, change.value);
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use client::{
    ConnectivityListener, DataChangeNotification, ProtocolStack, Session, SessionHandle,
    SessionPool, StackSession, SubscriptionHandle, SubscriptionId, SubscriptionState,
};
pub use config::EngineConfig;
pub use error::{
    ConfigurationError, ConnectionError, ErrorCode, ErrorSeverity, OpcUaError, OpcUaResult,
    ServiceError, SessionError, SubscriptionError,
};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use types::{
    AttributeId, ConnectionIdentity, ConnectivityState, CredentialKind, CredentialRef, Deadband,
    ItemFilter, ItemKey, MonitoredItemModel, NodeId, NodeIdentifier, OperationContext,
    SecurityMode, SecurityPolicy, StatusCode, SubscriptionConfiguration,
};
