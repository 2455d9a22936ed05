// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session pool, session handles and subscription handles.
//!
//! - **Session Pool**: one session handle per connection identity, reverse
//!   index of bound subscriptions, connectivity fan-out
//! - **Session Handle**: acquire-with-wait, keep-alive and reconnect supervisor
//! - **Subscription Handle**: desired-vs-applied reconciliation and the
//!   enable/activate/deactivate/close state machine
//! - **Protocol Stack**: the outbound traits the engine drives
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 desired-state source (owner)                    │
//! │           apply / enable / activate / deactivate / close        │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     SubscriptionHandle                          │
//! │        (diff, FIFO apply lock, replay on reconnect)             │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │              ▲ ConnectivityListener
//!                              ▼              │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 SessionPool  ──►  SessionHandle                 │
//! │     (identity map, ref-count)     (keep-alive, backoff)         │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              ProtocolStack / StackSession (external)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod backoff;
mod diff;
mod notification;
mod pool;
mod session;
mod stack;
mod subscription;

pub use backoff::{BackoffSequence, ExponentialBackoff};
pub use diff::{diff, AppliedItem, ItemDiff};
pub use notification::{
    ChannelCallback, DataChangeNotification, MonitoredValue, NotificationCallback,
    NotificationSink, Variant,
};
pub use pool::{ConnectivityListener, PoolStats, SessionPool, SessionPoolBuilder};
pub use session::{Session, SessionHandle, SessionStats};
pub use stack::{
    AnonymousCredentials, CreatedSubscription, CredentialProvider, IdentityToken,
    MonitoredItemModify, MonitoredItemRequest, MonitoredItemResult, ProtocolStack, StackSession,
    StaticCredentials,
};
pub use subscription::{
    ApplyReport, ItemFailure, SubscriptionHandle, SubscriptionId, SubscriptionState,
    SubscriptionStats,
};
