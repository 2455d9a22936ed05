// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Data-change delivery from the protocol stack to telemetry consumers.
//!
//! The stack pushes raw [`MonitoredValue`]s into a [`NotificationSink`]
//! keyed by client handle. Each subscription handle owns a router that
//! resolves the handle to an [`ItemKey`] and fans the resulting
//! [`DataChangeNotification`] out to a broadcast stream and to any attached
//! [`NotificationCallback`]s.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use super::subscription::SubscriptionId;
use crate::types::{ItemKey, StatusCode};

// =============================================================================
// Variant
// =============================================================================

/// Value carried by a data-change notification.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    /// Boolean value.
    Boolean(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit double.
    Double(f64),
    /// String value.
    String(String),
    /// Date/time value.
    DateTime(DateTime<Utc>),
    /// Byte string.
    ByteString(Vec<u8>),
    /// No value.
    #[default]
    Null,
}

impl Variant {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Int32(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt32(v) => Some(f64::from(*v)),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns `true` for [`Variant::Null`].
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::UInt64(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::ByteString(v) => write!(f, "<{} bytes>", v.len()),
            Self::Null => write!(f, "null"),
        }
    }
}

// =============================================================================
// Stack-facing types
// =============================================================================

/// A value reported by the stack for one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredValue {
    /// Client handle assigned when the item was created.
    pub client_handle: u32,
    /// Reported value.
    pub value: Variant,
    /// Value status.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl MonitoredValue {
    /// A good value with a server timestamp of now.
    pub fn good(client_handle: u32, value: Variant) -> Self {
        Self {
            client_handle,
            value,
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }
}

/// Receiver of publish results, handed to the stack on subscription creation.
///
/// Implementations must not block; the stack calls them from its publish loop.
pub trait NotificationSink: Send + Sync {
    /// Data changes for items of the subscription.
    fn on_data_change(&self, values: Vec<MonitoredValue>);

    /// Subscription status change reported by the server.
    fn on_status_change(&self, _status: StatusCode) {}
}

// =============================================================================
// Consumer-facing types
// =============================================================================

/// A data change resolved to its item key.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeNotification {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// Item that changed.
    pub key: ItemKey,
    /// New value.
    pub value: Variant,
    /// Value status.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// When the engine received it.
    pub received_at: DateTime<Utc>,
}

/// Synchronous consumer of notifications.
///
/// Called on the stack's delivery path; implementations hand work off
/// rather than block.
pub trait NotificationCallback: Send + Sync {
    /// Called for every routed data change.
    fn on_data_change(&self, notification: &DataChangeNotification);

    /// Called when the server reports a subscription status change.
    fn on_status_change(&self, _subscription_id: &SubscriptionId, _status: StatusCode) {}
}

/// Callback forwarding into a bounded mpsc channel. Full channels drop.
pub struct ChannelCallback {
    sender: mpsc::Sender<DataChangeNotification>,
    dropped: AtomicU64,
}

impl ChannelCallback {
    /// Wraps an existing sender.
    pub fn new(sender: mpsc::Sender<DataChangeNotification>) -> Self {
        Self {
            sender,
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates the callback together with its receiver.
    pub fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<DataChangeNotification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Notifications dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl NotificationCallback for ChannelCallback {
    fn on_data_change(&self, notification: &DataChangeNotification) {
        if self.sender.try_send(notification.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// NotificationRouter
// =============================================================================

/// Per-subscription router between the stack and consumers.
///
/// Once sealed, no callback runs and no notification is published; sealing
/// waits for in-flight deliveries to finish.
pub(crate) struct NotificationRouter {
    subscription_id: SubscriptionId,
    handles: DashMap<u32, ItemKey>,
    sender: broadcast::Sender<DataChangeNotification>,
    callbacks: RwLock<Vec<Arc<dyn NotificationCallback>>>,
    open: RwLock<bool>,
    delivered: AtomicU64,
    unroutable: AtomicU64,
}

impl NotificationRouter {
    pub(crate) fn new(subscription_id: SubscriptionId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscription_id,
            handles: DashMap::new(),
            sender,
            callbacks: RwLock::new(Vec::new()),
            open: RwLock::new(true),
            delivered: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DataChangeNotification> {
        self.sender.subscribe()
    }

    pub(crate) fn add_callback(&self, callback: Arc<dyn NotificationCallback>) {
        self.callbacks.write().push(callback);
    }

    pub(crate) fn bind(&self, client_handle: u32, key: ItemKey) {
        self.handles.insert(client_handle, key);
    }

    pub(crate) fn unbind(&self, client_handle: u32) {
        self.handles.remove(&client_handle);
    }

    pub(crate) fn clear(&self) {
        self.handles.clear();
    }

    /// Stops all further delivery.
    pub(crate) fn seal(&self) {
        *self.open.write() = false;
        self.handles.clear();
        self.callbacks.write().clear();
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }
}

impl NotificationSink for NotificationRouter {
    fn on_data_change(&self, values: Vec<MonitoredValue>) {
        let open = self.open.read();
        if !*open {
            return;
        }

        let callbacks = self.callbacks.read().clone();
        let received_at = Utc::now();
        for value in values {
            let Some(key) = self.handles.get(&value.client_handle).map(|k| k.clone()) else {
                self.unroutable.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    subscription_id = %self.subscription_id,
                    client_handle = value.client_handle,
                    "Dropping notification for unknown client handle"
                );
                continue;
            };

            let notification = DataChangeNotification {
                subscription_id: self.subscription_id.clone(),
                key,
                value: value.value,
                status: value.status,
                source_timestamp: value.source_timestamp,
                server_timestamp: value.server_timestamp,
                received_at,
            };
            for callback in &callbacks {
                callback.on_data_change(&notification);
            }
            // No receivers is fine.
            let _ = self.sender.send(notification);
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_status_change(&self, status: StatusCode) {
        let open = self.open.read();
        if !*open {
            return;
        }
        tracing::debug!(
            subscription_id = %self.subscription_id,
            status = %status,
            "Subscription status changed"
        );
        for callback in self.callbacks.read().iter() {
            callback.on_status_change(&self.subscription_id, status);
        }
    }
}
