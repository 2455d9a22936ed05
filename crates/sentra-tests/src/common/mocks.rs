// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Mock Implementations
//!
//! A scriptable in-memory protocol stack for exercising the engine without a
//! server.
//!
//! - Server-side subscriptions and items are kept per session, so a
//!   reconnect really starts from an empty server
//! - Every service call is counted for verification
//! - Faults are injected through atomic switches: failing opens, refused
//!   identities, failing keep-alives, rejected nodes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sentra_opcua::client::{
    CreatedSubscription, IdentityToken, MonitoredItemModify, MonitoredItemRequest,
    MonitoredItemResult, MonitoredValue, NotificationSink, ProtocolStack, StackSession, Variant,
};
use sentra_opcua::{
    ConnectionIdentity, ConnectivityListener, ConnectivityState, MonitoredItemModel, NodeId,
    OpcUaError, OpcUaResult, SessionError, StatusCode, SubscriptionConfiguration,
};

// =============================================================================
// Call Counters
// =============================================================================

/// Service call counters shared by all sessions of one mock stack.
#[derive(Debug, Default)]
pub struct CallCounters {
    opens: AtomicU64,
    closes: AtomicU64,
    keep_alives: AtomicU64,
    create_subscriptions: AtomicU64,
    modify_subscriptions: AtomicU64,
    delete_subscriptions: AtomicU64,
    set_publishing: AtomicU64,
    create_items: AtomicU64,
    modify_items: AtomicU64,
    delete_items: AtomicU64,
    items_created: AtomicU64,
    items_modified: AtomicU64,
    items_deleted: AtomicU64,
}

impl CallCounters {
    /// Session open attempts.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Session closes.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Keep-alive probes.
    pub fn keep_alives(&self) -> u64 {
        self.keep_alives.load(Ordering::SeqCst)
    }

    /// CreateSubscription calls.
    pub fn create_subscriptions(&self) -> u64 {
        self.create_subscriptions.load(Ordering::SeqCst)
    }

    /// ModifySubscription calls.
    pub fn modify_subscriptions(&self) -> u64 {
        self.modify_subscriptions.load(Ordering::SeqCst)
    }

    /// DeleteSubscriptions calls.
    pub fn delete_subscriptions(&self) -> u64 {
        self.delete_subscriptions.load(Ordering::SeqCst)
    }

    /// SetPublishingMode calls.
    pub fn set_publishing(&self) -> u64 {
        self.set_publishing.load(Ordering::SeqCst)
    }

    /// CreateMonitoredItems calls.
    pub fn create_items(&self) -> u64 {
        self.create_items.load(Ordering::SeqCst)
    }

    /// ModifyMonitoredItems calls.
    pub fn modify_items(&self) -> u64 {
        self.modify_items.load(Ordering::SeqCst)
    }

    /// DeleteMonitoredItems calls.
    pub fn delete_items(&self) -> u64 {
        self.delete_items.load(Ordering::SeqCst)
    }

    /// Items successfully created.
    pub fn items_created(&self) -> u64 {
        self.items_created.load(Ordering::SeqCst)
    }

    /// Items successfully modified.
    pub fn items_modified(&self) -> u64 {
        self.items_modified.load(Ordering::SeqCst)
    }

    /// Items successfully deleted.
    pub fn items_deleted(&self) -> u64 {
        self.items_deleted.load(Ordering::SeqCst)
    }

    /// All subscription and item service calls.
    pub fn subscription_calls(&self) -> u64 {
        self.create_subscriptions()
            + self.modify_subscriptions()
            + self.delete_subscriptions()
            + self.set_publishing()
            + self.create_items()
            + self.modify_items()
            + self.delete_items()
    }

    /// Any call that removes server-side state.
    pub fn deletes(&self) -> u64 {
        self.delete_subscriptions() + self.delete_items()
    }
}

// =============================================================================
// Server-side view
// =============================================================================

/// A monitored item as the mock server holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerItem {
    /// Server handle.
    pub server_handle: u32,
    /// Client handle supplied at creation.
    pub client_handle: u32,
    /// Current settings.
    pub model: MonitoredItemModel,
}

/// Snapshot of one mock server subscription.
#[derive(Debug, Clone)]
pub struct ServerSubscriptionView {
    /// Server-assigned id.
    pub id: u32,
    /// Current parameters.
    pub config: SubscriptionConfiguration,
    /// Publishing mode.
    pub publishing: bool,
    /// Items, ordered by server handle.
    pub items: Vec<ServerItem>,
}

impl ServerSubscriptionView {
    /// Finds the item monitoring `node_id`.
    pub fn item(&self, node_id: &NodeId) -> Option<&ServerItem> {
        self.items.iter().find(|item| &item.model.node_id == node_id)
    }
}

struct ServerSubscription {
    config: SubscriptionConfiguration,
    publishing: bool,
    sink: Arc<dyn NotificationSink>,
    items: BTreeMap<u32, ServerItem>,
}

// =============================================================================
// Mock Protocol Stack
// =============================================================================

struct MockShared {
    counters: CallCounters,
    log: Mutex<Vec<&'static str>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    tokens: Mutex<Vec<IdentityToken>>,
    next_session: AtomicU32,
    fail_open: AtomicBool,
    fail_next_opens: AtomicU32,
    deny_access: AtomicBool,
    fail_create_subscription: AtomicBool,
    fail_modify_subscription: AtomicBool,
    hang_item_creation: AtomicBool,
    open_delay: Mutex<Duration>,
    rejected_nodes: Mutex<Vec<NodeId>>,
    max_items: AtomicU32,
}

/// In-memory [`ProtocolStack`] with fault injection.
#[derive(Clone)]
pub struct MockProtocolStack {
    shared: Arc<MockShared>,
}

impl MockProtocolStack {
    /// Create a stack where everything succeeds.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared {
                counters: CallCounters::default(),
                log: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                tokens: Mutex::new(Vec::new()),
                next_session: AtomicU32::new(1),
                fail_open: AtomicBool::new(false),
                fail_next_opens: AtomicU32::new(0),
                deny_access: AtomicBool::new(false),
                fail_create_subscription: AtomicBool::new(false),
                fail_modify_subscription: AtomicBool::new(false),
                hang_item_creation: AtomicBool::new(false),
                open_delay: Mutex::new(Duration::ZERO),
                rejected_nodes: Mutex::new(Vec::new()),
                max_items: AtomicU32::new(u32::MAX),
            }),
        }
    }

    /// Service call counters.
    pub fn calls(&self) -> &CallCounters {
        &self.shared.counters
    }

    /// Subscription and item services in call order.
    pub fn service_log(&self) -> Vec<&'static str> {
        self.shared.log.lock().clone()
    }

    /// Forget the service log.
    pub fn clear_service_log(&self) {
        self.shared.log.lock().clear();
    }

    /// Make every open fail until switched back.
    pub fn set_fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.shared.fail_next_opens.store(count, Ordering::SeqCst);
    }

    /// Refuse every identity with `BadUserAccessDenied`.
    pub fn set_deny_access(&self, deny: bool) {
        self.shared.deny_access.store(deny, Ordering::SeqCst);
    }

    /// Fail CreateSubscription with a bad status.
    pub fn set_fail_create_subscription(&self, fail: bool) {
        self.shared.fail_create_subscription.store(fail, Ordering::SeqCst);
    }

    /// Fail `modify_subscription` with `BadTimeout`.
    pub fn set_fail_modify_subscription(&self, fail: bool) {
        self.shared.fail_modify_subscription.store(fail, Ordering::SeqCst);
    }

    /// Make `create_monitored_items` never answer.
    pub fn set_hang_item_creation(&self, hang: bool) {
        self.shared.hang_item_creation.store(hang, Ordering::SeqCst);
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.shared.open_delay.lock() = delay;
    }

    /// Reject items for `node_id` with `BadNodeIdUnknown`.
    pub fn reject_node(&self, node_id: NodeId) {
        self.shared.rejected_nodes.lock().push(node_id);
    }

    /// Accept items for `node_id` again.
    pub fn accept_node(&self, node_id: &NodeId) {
        self.shared.rejected_nodes.lock().retain(|n| n != node_id);
    }

    /// Limit the items one subscription may hold.
    pub fn set_max_items(&self, max: u32) {
        self.shared.max_items.store(max, Ordering::SeqCst);
    }

    /// Every session opened so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.shared.sessions.lock().clone()
    }

    /// The most recently opened session.
    pub fn latest_session(&self) -> Option<Arc<MockSession>> {
        self.shared.sessions.lock().last().cloned()
    }

    /// Number of sessions not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Identity tokens presented so far.
    pub fn presented_tokens(&self) -> Vec<IdentityToken> {
        self.shared.tokens.lock().clone()
    }

    /// Publish `value` for `node_id` on the latest session.
    ///
    /// Returns the number of items the value was delivered to.
    pub fn emit(&self, node_id: &NodeId, value: Variant) -> usize {
        self.latest_session()
            .map(|session| session.emit(node_id, value))
            .unwrap_or(0)
    }
}

impl Default for MockProtocolStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockProtocolStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProtocolStack")
            .field("opens", &self.calls().opens())
            .field("sessions", &self.shared.sessions.lock().len())
            .finish()
    }
}

#[async_trait]
impl ProtocolStack for MockProtocolStack {
    async fn open_session(
        &self,
        identity: &ConnectionIdentity,
        token: IdentityToken,
    ) -> OpcUaResult<Arc<dyn StackSession>> {
        self.shared.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.shared.tokens.lock().push(token);

        let delay = *self.shared.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.shared.deny_access.load(Ordering::SeqCst) {
            return Err(SessionError::unauthorized(identity.endpoint_url(), "access denied").into());
        }
        let scheduled_failure = self
            .shared
            .fail_next_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(OpcUaError::bad_status(
                "open_session",
                StatusCode::BAD_COMMUNICATION_ERROR,
            ));
        }

        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession::new(id, self.shared.clone()));
        self.shared.sessions.lock().push(session.clone());
        Ok(session)
    }
}

// =============================================================================
// Mock Session
// =============================================================================

/// One session of the [`MockProtocolStack`].
pub struct MockSession {
    id: u32,
    shared: Arc<MockShared>,
    closed: AtomicBool,
    keep_alive_failing: AtomicBool,
    subscriptions: Mutex<BTreeMap<u32, ServerSubscription>>,
    next_subscription: AtomicU32,
    next_item: AtomicU32,
}

impl MockSession {
    fn new(id: u32, shared: Arc<MockShared>) -> Self {
        Self {
            id,
            shared,
            closed: AtomicBool::new(false),
            keep_alive_failing: AtomicBool::new(false),
            subscriptions: Mutex::new(BTreeMap::new()),
            next_subscription: AtomicU32::new(1),
            next_item: AtomicU32::new(1000),
        }
    }

    /// Numeric session id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns `true` once the engine closed the session.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make keep-alive probes fail with `BadTimeout`.
    pub fn set_keep_alive_failing(&self, failing: bool) {
        self.keep_alive_failing.store(failing, Ordering::SeqCst);
    }

    /// Simulate a dropped channel: every later call fails with
    /// `BadConnectionClosed`.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Snapshot of all server subscriptions.
    pub fn subscriptions(&self) -> Vec<ServerSubscriptionView> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(id, sub)| ServerSubscriptionView {
                id: *id,
                config: sub.config.clone(),
                publishing: sub.publishing,
                items: sub.items.values().cloned().collect(),
            })
            .collect()
    }

    /// Total items across all subscriptions.
    pub fn item_count(&self) -> usize {
        self.subscriptions.lock().values().map(|s| s.items.len()).sum()
    }

    /// Publish `value` to every publishing item on `node_id`.
    pub fn emit(&self, node_id: &NodeId, value: Variant) -> usize {
        let targets: Vec<(Arc<dyn NotificationSink>, u32)> = self
            .subscriptions
            .lock()
            .values()
            .filter(|sub| sub.publishing)
            .flat_map(|sub| {
                sub.items
                    .values()
                    .filter(|item| &item.model.node_id == node_id)
                    .map(|item| (sub.sink.clone(), item.client_handle))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (sink, client_handle) in &targets {
            sink.on_data_change(vec![MonitoredValue::good(*client_handle, value.clone())]);
        }
        targets.len()
    }

    /// Report a subscription status change, e.g. a server-side timeout.
    pub fn emit_status(&self, subscription_id: u32, status: StatusCode) -> bool {
        let sink = self
            .subscriptions
            .lock()
            .get(&subscription_id)
            .map(|sub| sub.sink.clone());
        match sink {
            Some(sink) => {
                sink.on_status_change(status);
                true
            }
            None => false,
        }
    }

    fn record(&self, counter: &AtomicU64, service: &'static str) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.shared.log.lock().push(service);
    }

    fn ensure_open(&self, service: &'static str) -> OpcUaResult<()> {
        if self.is_closed() {
            return Err(OpcUaError::bad_status(service, StatusCode::BAD_SESSION_CLOSED));
        }
        Ok(())
    }

    fn is_rejected(&self, node_id: &NodeId) -> bool {
        self.shared.rejected_nodes.lock().contains(node_id)
    }
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl StackSession for MockSession {
    fn session_id(&self) -> String {
        format!("ns=1;i={}", self.id)
    }

    async fn close(&self) -> OpcUaResult<()> {
        self.shared.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn keep_alive(&self) -> OpcUaResult<()> {
        self.shared.counters.keep_alives.fetch_add(1, Ordering::SeqCst);
        self.ensure_open("read")?;
        if self.keep_alive_failing.load(Ordering::SeqCst) {
            return Err(OpcUaError::bad_status("read", StatusCode::BAD_TIMEOUT));
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        config: &SubscriptionConfiguration,
        publishing_enabled: bool,
        sink: Arc<dyn NotificationSink>,
    ) -> OpcUaResult<CreatedSubscription> {
        self.record(&self.shared.counters.create_subscriptions, "create_subscription");
        self.ensure_open("create_subscription")?;
        if self.shared.fail_create_subscription.load(Ordering::SeqCst) {
            return Err(OpcUaError::bad_status(
                "create_subscription",
                StatusCode::BAD_TOO_MANY_MONITORED_ITEMS,
            ));
        }

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().insert(
            id,
            ServerSubscription {
                config: config.clone(),
                publishing: publishing_enabled,
                sink,
                items: BTreeMap::new(),
            },
        );
        Ok(CreatedSubscription::granted(id, config))
    }

    async fn modify_subscription(
        &self,
        subscription_id: u32,
        config: &SubscriptionConfiguration,
    ) -> OpcUaResult<CreatedSubscription> {
        self.record(&self.shared.counters.modify_subscriptions, "modify_subscription");
        self.ensure_open("modify_subscription")?;
        if self.shared.fail_modify_subscription.load(Ordering::SeqCst) {
            return Err(OpcUaError::bad_status(
                "modify_subscription",
                StatusCode::BAD_TIMEOUT,
            ));
        }
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            OpcUaError::bad_status("modify_subscription", StatusCode::BAD_SUBSCRIPTION_ID_INVALID)
        })?;
        sub.config = config.clone();
        Ok(CreatedSubscription::granted(subscription_id, config))
    }

    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()> {
        self.record(&self.shared.counters.delete_subscriptions, "delete_subscription");
        self.ensure_open("delete_subscription")?;
        match self.subscriptions.lock().remove(&subscription_id) {
            Some(_) => Ok(()),
            None => Err(OpcUaError::bad_status(
                "delete_subscription",
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            )),
        }
    }

    async fn set_publishing_mode(&self, subscription_id: u32, enabled: bool) -> OpcUaResult<()> {
        self.record(&self.shared.counters.set_publishing, "set_publishing_mode");
        self.ensure_open("set_publishing_mode")?;
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            OpcUaError::bad_status("set_publishing_mode", StatusCode::BAD_SUBSCRIPTION_ID_INVALID)
        })?;
        sub.publishing = enabled;
        Ok(())
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> OpcUaResult<Vec<MonitoredItemResult>> {
        self.record(&self.shared.counters.create_items, "create_monitored_items");
        self.ensure_open("create_monitored_items")?;
        if self.shared.hang_item_creation.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let max_items = self.shared.max_items.load(Ordering::SeqCst) as usize;

        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            OpcUaError::bad_status(
                "create_monitored_items",
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            )
        })?;

        let results = items
            .iter()
            .map(|request| {
                if self.is_rejected(&request.model.node_id) {
                    return MonitoredItemResult::bad(StatusCode::BAD_NODE_ID_UNKNOWN);
                }
                if sub.items.len() >= max_items {
                    return MonitoredItemResult::bad(StatusCode::BAD_TOO_MANY_MONITORED_ITEMS);
                }
                let server_handle = self.next_item.fetch_add(1, Ordering::SeqCst);
                sub.items.insert(
                    server_handle,
                    ServerItem {
                        server_handle,
                        client_handle: request.client_handle,
                        model: request.model.clone(),
                    },
                );
                self.shared.counters.items_created.fetch_add(1, Ordering::SeqCst);
                MonitoredItemResult::good(server_handle, &request.model)
            })
            .collect();
        Ok(results)
    }

    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemModify],
    ) -> OpcUaResult<Vec<MonitoredItemResult>> {
        self.record(&self.shared.counters.modify_items, "modify_monitored_items");
        self.ensure_open("modify_monitored_items")?;
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            OpcUaError::bad_status(
                "modify_monitored_items",
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            )
        })?;

        let results = items
            .iter()
            .map(|request| match sub.items.get_mut(&request.server_handle) {
                Some(item) => {
                    item.model = request.model.clone();
                    self.shared.counters.items_modified.fetch_add(1, Ordering::SeqCst);
                    MonitoredItemResult::good(request.server_handle, &request.model)
                }
                None => MonitoredItemResult::bad(StatusCode::BAD_MONITORED_ITEM_ID_INVALID),
            })
            .collect();
        Ok(results)
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        server_handles: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>> {
        self.record(&self.shared.counters.delete_items, "delete_monitored_items");
        self.ensure_open("delete_monitored_items")?;
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            OpcUaError::bad_status(
                "delete_monitored_items",
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            )
        })?;

        let results = server_handles
            .iter()
            .map(|handle| match sub.items.remove(handle) {
                Some(_) => {
                    self.shared.counters.items_deleted.fetch_add(1, Ordering::SeqCst);
                    StatusCode::GOOD
                }
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect();
        Ok(results)
    }
}

// =============================================================================
// Recording Listener
// =============================================================================

/// A [`ConnectivityListener`] that records every transition.
#[derive(Debug, Default)]
pub struct RecordingListener {
    transitions: Mutex<Vec<(ConnectivityState, ConnectivityState)>>,
    shutdowns: AtomicU64,
}

impl RecordingListener {
    /// Create an empty listener.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded `(previous, current)` pairs.
    pub fn transitions(&self) -> Vec<(ConnectivityState, ConnectivityState)> {
        self.transitions.lock().clone()
    }

    /// Number of `on_shutdown` calls.
    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl ConnectivityListener for RecordingListener {
    fn on_connectivity_changed(
        &self,
        _identity: &ConnectionIdentity,
        previous: ConnectivityState,
        current: ConnectivityState,
    ) {
        self.transitions.lock().push((previous, current));
    }

    fn on_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
