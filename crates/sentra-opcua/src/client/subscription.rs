// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription handles.
//!
//! A [`SubscriptionHandle`] keeps the desired monitored items of one logical
//! subscriber and reconciles them against what exists on the server.
//!
//! # State machine
//!
//! ```text
//!  Created --enable--> Enabled --activate--> Active <--> Deactivated
//!                         ^                    |            |
//!                         +--- connection lost-+            |
//!  any --------------------------- close ------------------+--> Closed
//! ```
//!
//! Desired state is recorded before any I/O and survives disconnects. All
//! effects (apply, enable, activate, deactivate, replay, close) run under one
//! FIFO lock per handle; replays always use the latest desired state.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::diff::{diff, AppliedItem};
use super::notification::{DataChangeNotification, NotificationCallback, NotificationRouter};
use super::pool::{ConnectivityListener, PoolShared};
use super::session::{Session, SessionHandle};
use super::stack::{CreatedSubscription, MonitoredItemModify, MonitoredItemRequest, MonitoredItemResult};
use crate::config::EngineConfig;
use crate::error::{OpcUaError, OpcUaResult, SubscriptionError};
use crate::types::{
    ConnectionIdentity, ConnectivityState, ItemKey, MonitoredItemModel, OperationContext,
    StatusCode, SubscriptionConfiguration,
};

// =============================================================================
// SubscriptionId
// =============================================================================

/// Owner-assigned, stable subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Creates an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriptionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// SubscriptionState
// =============================================================================

/// Lifecycle state of a subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Desired state recorded, nothing created on the server.
    #[default]
    Created,
    /// The server-side subscription exists (or is being restored).
    Enabled,
    /// Publishing is on.
    Active,
    /// Publishing is off, items are kept.
    Deactivated,
    /// Terminal.
    Closed,
}

impl SubscriptionState {
    /// Returns `true` for Enabled, Active and Deactivated.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled | Self::Active | Self::Deactivated)
    }

    /// Returns `true` for Closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns the state name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Enabled => "enabled",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ApplyReport
// =============================================================================

/// An item operation the server rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Failed item.
    pub key: ItemKey,
    /// Operation that failed.
    pub operation: &'static str,
    /// Status returned for the item.
    pub status: StatusCode,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Items created.
    pub added: usize,
    /// Items modified.
    pub modified: usize,
    /// Items deleted.
    pub removed: usize,
    /// `true` if the subscription parameters were modified.
    pub subscription_modified: bool,
    /// Status of a rejected parameter modification, retried on the next pass.
    pub subscription_failure: Option<StatusCode>,
    /// Rejected item operations. They are retried on the next pass.
    pub failures: Vec<ItemFailure>,
}

impl ApplyReport {
    /// Item operations attempted.
    pub fn attempted(&self) -> usize {
        self.added + self.modified + self.removed + self.failures.len()
    }

    /// Returns `true` if nothing was rejected.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.subscription_failure.is_none()
    }

    /// Rejected operations, the parameter modification included.
    pub fn failed(&self) -> usize {
        self.failures.len() + usize::from(self.subscription_failure.is_some())
    }

    /// `PartialApply` error describing the rejected operations, if any.
    pub fn check(&self, subscription_id: &SubscriptionId) -> OpcUaResult<()> {
        if self.is_complete() {
            return Ok(());
        }
        Err(SubscriptionError::partial_apply(
            subscription_id.as_str(),
            self.failed(),
            self.attempted() + usize::from(self.subscription_failure.is_some()),
        )
        .into())
    }

    fn fail(&mut self, key: ItemKey, operation: &'static str, status: StatusCode) {
        self.failures.push(ItemFailure {
            key,
            operation,
            status,
        });
    }
}

// =============================================================================
// Internal state
// =============================================================================

struct DesiredState {
    items: BTreeMap<ItemKey, MonitoredItemModel>,
    config: SubscriptionConfiguration,
    version: u64,
}

/// What exists on the server. Guarded by the handle's apply lock.
#[derive(Default)]
struct AppliedState {
    generation: u64,
    server_id: Option<u32>,
    config: Option<SubscriptionConfiguration>,
    revised: Option<CreatedSubscription>,
    items: BTreeMap<ItemKey, AppliedItem>,
    publishing: bool,
    version: u64,
}

impl AppliedState {
    fn is_live_on(&self, session: &Session) -> bool {
        self.server_id.is_some() && self.generation == session.generation()
    }
}

// =============================================================================
// SubscriptionHandle
// =============================================================================

/// Desired-vs-applied reconciliation and lifecycle of one subscription.
///
/// Created through [`SessionPool::create_subscription`](super::SessionPool::create_subscription).
pub struct SubscriptionHandle {
    id: SubscriptionId,
    identity: ConnectionIdentity,
    session: Arc<SessionHandle>,
    desired: RwLock<DesiredState>,
    applied: Mutex<AppliedState>,
    state: RwLock<SubscriptionState>,
    desired_active: AtomicBool,
    router: Arc<NotificationRouter>,
    next_client_handle: AtomicU32,
    last_report: RwLock<Option<ApplyReport>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pool: Weak<PoolShared>,
    weak_self: Weak<SubscriptionHandle>,
    stats: SubscriptionStats,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriptionId,
        session: Arc<SessionHandle>,
        config: &EngineConfig,
        tracker: &TaskTracker,
        pool: Weak<PoolShared>,
    ) -> Arc<Self> {
        let router = Arc::new(NotificationRouter::new(
            id.clone(),
            config.subscription.notification_capacity,
        ));
        Arc::new_cyclic(|weak_self| Self {
            identity: session.identity().clone(),
            cancel: session.child_token(),
            id,
            session,
            desired: RwLock::new(DesiredState {
                items: BTreeMap::new(),
                config: config.subscription.defaults.clone(),
                version: 0,
            }),
            applied: Mutex::new(AppliedState::default()),
            state: RwLock::new(SubscriptionState::Created),
            desired_active: AtomicBool::new(true),
            router,
            next_client_handle: AtomicU32::new(1),
            last_report: RwLock::new(None),
            tracker: tracker.clone(),
            pool,
            weak_self: weak_self.clone(),
            stats: SubscriptionStats::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Owner-assigned id.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Identity of the session this handle is bound to.
    pub fn connection_identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// The session handle this subscription is bound to.
    pub fn session_handle(&self) -> &Arc<SessionHandle> {
        &self.session
    }

    /// Lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.read()
    }

    /// Returns `true` while the subscription is enabled.
    pub fn enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Returns `true` while publishing is on. Never `true` unless the session
    /// is connected.
    pub fn active(&self) -> bool {
        self.state() == SubscriptionState::Active && self.session.state().is_connected()
    }

    /// Latest desired items, sorted by key.
    pub fn desired_items(&self) -> Vec<MonitoredItemModel> {
        self.desired.read().items.values().cloned().collect()
    }

    /// Latest desired subscription parameters.
    pub fn desired_configuration(&self) -> SubscriptionConfiguration {
        self.desired.read().config.clone()
    }

    /// Items that exist on the server. Waits for in-flight work.
    pub async fn applied_items(&self) -> BTreeMap<ItemKey, AppliedItem> {
        self.applied.lock().await.items.clone()
    }

    /// Parameters granted by the server for the current subscription.
    pub async fn revised_parameters(&self) -> Option<CreatedSubscription> {
        self.applied.lock().await.revised.clone()
    }

    /// Report of the most recent reconciliation pass.
    pub fn last_apply_report(&self) -> Option<ApplyReport> {
        self.last_report.read().clone()
    }

    /// Statistics.
    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    /// Notifications delivered so far.
    pub fn notifications_delivered(&self) -> u64 {
        self.router.delivered()
    }

    /// Stream of data changes for this subscription.
    pub fn notifications(&self) -> broadcast::Receiver<DataChangeNotification> {
        self.router.subscribe()
    }

    /// Attaches a synchronous notification callback.
    pub fn add_callback(&self, callback: Arc<dyn NotificationCallback>) {
        self.router.add_callback(callback);
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Records the desired items and parameters, then reconciles the server
    /// if the subscription is enabled and its session is connected.
    ///
    /// Returns whether the subscription is enabled. Rejected item operations
    /// are logged, reported by [`last_apply_report`](Self::last_apply_report)
    /// and retried on the next pass.
    pub async fn apply(
        &self,
        items: Vec<MonitoredItemModel>,
        config: SubscriptionConfiguration,
        ctx: &OperationContext,
    ) -> OpcUaResult<bool> {
        self.apply_with_cancel(items, config, ctx, None).await
    }

    /// [`apply`](Self::apply) that gives up when `cancel` fires.
    ///
    /// The desired state is recorded even when the call is canceled.
    pub async fn apply_with_cancel(
        &self,
        items: Vec<MonitoredItemModel>,
        config: SubscriptionConfiguration,
        ctx: &OperationContext,
        cancel: Option<&CancellationToken>,
    ) -> OpcUaResult<bool> {
        self.ensure_open("apply")?;
        config.validate()?;

        let mut desired = BTreeMap::new();
        for item in items {
            item.validate()?;
            let key = item.key();
            if desired.contains_key(&key) {
                return Err(SubscriptionError::duplicate_item(self.id.as_str(), key).into());
            }
            desired.insert(key, item);
        }

        let (version, count) = {
            let mut state = self.desired.write();
            state.version += 1;
            state.items = desired;
            state.config = config;
            (state.version, state.items.len())
        };
        self.stats.applies.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            subscription_id = %self.id,
            version,
            items = count,
            author = ctx.author_or_system(),
            correlation_id = %ctx.correlation_id,
            "Desired state recorded"
        );

        let mut applied = self.lock_applied(cancel).await?;
        self.ensure_open("apply")?;
        if !self.enabled() {
            return Ok(false);
        }
        if applied.version >= version {
            // A later apply already reconciled this or a newer version.
            return Ok(true);
        }
        let Some(session) = self.session.current() else {
            tracing::debug!(
                subscription_id = %self.id,
                "Session not connected, desired state will be replayed"
            );
            return Ok(true);
        };

        if !applied.is_live_on(&session) {
            // Connected, but nothing of this subscription exists on the
            // session, e.g. after a failed replay.
            tracing::debug!(
                subscription_id = %self.id,
                generation = session.generation(),
                "Restoring subscription on current session"
            );
            self.enable_locked(&mut applied, &session, cancel).await?;
            if self.desired_active.load(Ordering::SeqCst) {
                self.activate_locked(&mut applied, &session, cancel).await?;
            }
            return Ok(self.enabled());
        }

        self.reconcile_locked(&mut applied, &session, cancel).await?;
        Ok(self.enabled())
    }

    /// Creates the server-side subscription and all desired items.
    ///
    /// Items the server rejects are retried on the next apply or reconnect.
    pub async fn enable(&self, session: &Session) -> OpcUaResult<()> {
        self.ensure_open("enable")?;
        let mut applied = self.lock_applied(None).await?;
        self.enable_locked(&mut applied, session, None).await
    }

    /// Turns publishing on. Valid once enabled.
    pub async fn activate(&self, session: &Session) -> OpcUaResult<()> {
        self.ensure_open("activate")?;
        let mut applied = self.lock_applied(None).await?;
        self.activate_locked(&mut applied, session, None).await
    }

    /// Turns publishing off, keeping the subscription and its items.
    pub async fn deactivate(&self, session: &Session) -> OpcUaResult<()> {
        self.ensure_open("deactivate")?;
        let mut applied = self.lock_applied(None).await?;
        let state = self.state();
        match state {
            SubscriptionState::Deactivated => return Ok(()),
            SubscriptionState::Enabled => {
                // Publishing is already off on the server.
                self.desired_active.store(false, Ordering::SeqCst);
                *self.state.write() = SubscriptionState::Deactivated;
                return Ok(());
            }
            SubscriptionState::Active => {}
            SubscriptionState::Created | SubscriptionState::Closed => {
                return Err(SubscriptionError::invalid_transition(
                    self.id.as_str(),
                    state,
                    "deactivate",
                )
                .into());
            }
        }

        self.desired_active.store(false, Ordering::SeqCst);
        if let Some(server_id) = applied.server_id.filter(|_| applied.is_live_on(session)) {
            self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
            self.guarded("deactivate", None, session.set_publishing_mode(server_id, false))
                .await??;
            applied.publishing = false;
        }
        *self.state.write() = SubscriptionState::Deactivated;
        tracing::info!(subscription_id = %self.id, "Subscription deactivated");
        Ok(())
    }

    /// Reacts to a connectivity transition of the owning session.
    ///
    /// Leaving Connected clears Active without any server call. Entering
    /// Connected schedules a replay of the latest desired state.
    pub fn update_connectivity_state(&self, previous: ConnectivityState, current: ConnectivityState) {
        if self.state().is_closed() {
            return;
        }
        if previous.is_connected() && !current.is_connected() {
            let mut state = self.state.write();
            if *state == SubscriptionState::Active {
                *state = SubscriptionState::Enabled;
            }
            tracing::debug!(
                subscription_id = %self.id,
                connectivity = %current,
                "Session left Connected, subscription inactive"
            );
        } else if current.is_connected() && !previous.is_connected() {
            self.schedule_replay();
        }
    }

    /// Deletes the server-side subscription (best-effort), unregisters from
    /// the pool and moves to Closed. Idempotent.
    pub async fn close(&self, ctx: &OperationContext) -> OpcUaResult<()> {
        if self.state().is_closed() {
            return Ok(());
        }
        // Aborts queued work and a running replay.
        self.cancel.cancel();
        let mut applied = self.applied.lock().await;
        if self.state().is_closed() {
            return Ok(());
        }

        if let (Some(server_id), Some(session)) = (applied.server_id, self.session.current()) {
            if applied.is_live_on(&session) {
                self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
                let timeout = self.session.config().keep_alive.timeout;
                match tokio::time::timeout(timeout, session.delete_subscription(server_id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(
                        subscription_id = %self.id,
                        error = %e,
                        "Ignoring error while deleting subscription"
                    ),
                    Err(_) => tracing::debug!(
                        subscription_id = %self.id,
                        "Timed out deleting subscription"
                    ),
                }
            }
        }
        *applied = AppliedState::default();
        self.finish_close();
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister(self);
        }
        tracing::info!(
            subscription_id = %self.id,
            author = ctx.author_or_system(),
            correlation_id = %ctx.correlation_id,
            "Subscription closed"
        );
        Ok(())
    }

    // =========================================================================
    // Locked operations
    // =========================================================================

    async fn lock_applied(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> OpcUaResult<MutexGuard<'_, AppliedState>> {
        tokio::select! {
            biased;
            _ = caller_canceled(cancel) => Err(OpcUaError::canceled("apply")),
            _ = self.cancel.cancelled() => Err(OpcUaError::canceled("apply")),
            guard = self.applied.lock() => Ok(guard),
        }
    }

    /// Runs one stack call. The outer error is a cancellation by the caller
    /// or by the handle; the inner result is the stack's.
    async fn guarded<T>(
        &self,
        operation: &'static str,
        cancel: Option<&CancellationToken>,
        call: impl Future<Output = OpcUaResult<T>>,
    ) -> OpcUaResult<OpcUaResult<T>> {
        tokio::select! {
            biased;
            _ = caller_canceled(cancel) => Err(OpcUaError::canceled(operation)),
            _ = self.cancel.cancelled() => Err(OpcUaError::canceled(operation)),
            result = call => Ok(result),
        }
    }

    async fn enable_locked(
        &self,
        applied: &mut AppliedState,
        session: &Session,
        cancel: Option<&CancellationToken>,
    ) -> OpcUaResult<()> {
        self.ensure_open("enable")?;

        if applied.server_id.is_some() && !applied.is_live_on(session) {
            self.reset_applied(applied);
        }

        if applied.server_id.is_none() {
            let config = self.desired.read().config.clone();
            self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
            let created = self
                .guarded(
                    "enable",
                    cancel,
                    session.create_subscription(&config, false, self.router.clone()),
                )
                .await?
                .map_err(|e| {
                    if e.is_transport_loss() {
                        e
                    } else {
                        SubscriptionError::creation_failed(self.id.as_str(), e.to_string()).into()
                    }
                })?;

            tracing::info!(
                subscription_id = %self.id,
                server_id = created.subscription_id,
                generation = session.generation(),
                revised_publishing_ms = created.revised_publishing_interval.as_millis() as u64,
                "Subscription created on server"
            );
            applied.server_id = Some(created.subscription_id);
            applied.generation = session.generation();
            applied.config = Some(config);
            applied.revised = Some(created);
            applied.publishing = false;
        }

        {
            let mut state = self.state.write();
            if *state == SubscriptionState::Created {
                *state = SubscriptionState::Enabled;
            }
        }
        self.reconcile_locked(applied, session, cancel).await?;
        Ok(())
    }

    async fn activate_locked(
        &self,
        applied: &mut AppliedState,
        session: &Session,
        cancel: Option<&CancellationToken>,
    ) -> OpcUaResult<()> {
        let state = self.state();
        match state {
            SubscriptionState::Active if applied.publishing && applied.is_live_on(session) => {
                return Ok(())
            }
            SubscriptionState::Enabled | SubscriptionState::Deactivated | SubscriptionState::Active => {}
            SubscriptionState::Created | SubscriptionState::Closed => {
                return Err(SubscriptionError::invalid_transition(
                    self.id.as_str(),
                    state,
                    "activate",
                )
                .into());
            }
        }

        self.desired_active.store(true, Ordering::SeqCst);
        if !applied.is_live_on(session) {
            self.enable_locked(applied, session, cancel).await?;
        }
        let Some(server_id) = applied.server_id else {
            return Ok(());
        };

        self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
        self.guarded("activate", cancel, session.set_publishing_mode(server_id, true))
            .await??;
        applied.publishing = true;

        let mut state = self.state.write();
        let still_current = self
            .session
            .current()
            .map(|current| current.generation() == session.generation())
            .unwrap_or(false);
        if state.is_enabled() && still_current && self.session.state().is_connected() {
            *state = SubscriptionState::Active;
            tracing::info!(subscription_id = %self.id, "Subscription activated");
        }
        Ok(())
    }

    /// Pushes the latest desired state to the server: parameters, then
    /// removals, modifications and additions.
    async fn reconcile_locked(
        &self,
        applied: &mut AppliedState,
        session: &Session,
        cancel: Option<&CancellationToken>,
    ) -> OpcUaResult<()> {
        let Some(server_id) = applied.server_id else {
            return Ok(());
        };
        let (items, config, version) = {
            let desired = self.desired.read();
            (desired.items.clone(), desired.config.clone(), desired.version)
        };
        self.stats.reconciles.fetch_add(1, Ordering::Relaxed);
        let mut report = ApplyReport::default();
        let mut lost = false;

        if applied.config.as_ref() != Some(&config) {
            self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
            match self
                .guarded("apply", cancel, session.modify_subscription(server_id, &config))
                .await?
            {
                Ok(revised) => {
                    applied.config = Some(config);
                    applied.revised = Some(revised);
                    report.subscription_modified = true;
                }
                Err(e) => {
                    lost = e.is_transport_loss();
                    e.log("modify subscription");
                    report.subscription_failure = Some(service_status(&e));
                }
            }
        }

        let plan = diff(&items, &applied.items);
        if !plan.is_empty() {
            tracing::debug!(
                subscription_id = %self.id,
                add = plan.to_add.len(),
                modify = plan.to_modify.len(),
                remove = plan.to_remove.len(),
                "Reconciling monitored items"
            );
        }

        if !plan.to_remove.is_empty() && !lost {
            let targets: Vec<(ItemKey, AppliedItem)> = plan
                .to_remove
                .iter()
                .filter_map(|key| applied.items.get(key).map(|item| (key.clone(), item.clone())))
                .collect();
            let handles: Vec<u32> = targets.iter().map(|(_, item)| item.server_handle).collect();
            self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
            match self
                .guarded("apply", cancel, session.delete_monitored_items(server_id, &handles))
                .await?
            {
                Ok(statuses) => {
                    for (index, (key, item)) in targets.into_iter().enumerate() {
                        let status = statuses
                            .get(index)
                            .copied()
                            .unwrap_or(StatusCode::BAD_COMMUNICATION_ERROR);
                        // An item the server no longer knows is as good as deleted.
                        if status.is_good() || status == StatusCode::BAD_MONITORED_ITEM_ID_INVALID {
                            applied.items.remove(&key);
                            self.router.unbind(item.client_handle);
                            report.removed += 1;
                        } else {
                            report.fail(key, "delete", status);
                        }
                    }
                }
                Err(e) => {
                    lost = e.is_transport_loss();
                    e.log("delete monitored items");
                    for (key, _) in targets {
                        report.fail(key, "delete", service_status(&e));
                    }
                }
            }
        }

        if !plan.to_modify.is_empty() && !lost {
            let requests: Vec<(ItemKey, MonitoredItemModify)> = plan
                .to_modify
                .iter()
                .filter_map(|key| {
                    let current = applied.items.get(key)?;
                    let model = items.get(key)?;
                    Some((
                        key.clone(),
                        MonitoredItemModify {
                            server_handle: current.server_handle,
                            client_handle: current.client_handle,
                            model: model.clone(),
                        },
                    ))
                })
                .collect();
            let batch: Vec<MonitoredItemModify> = requests.iter().map(|(_, r)| r.clone()).collect();
            self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
            match self
                .guarded("apply", cancel, session.modify_monitored_items(server_id, &batch))
                .await?
            {
                Ok(results) => {
                    for (index, (key, request)) in requests.into_iter().enumerate() {
                        let result = result_at(&results, index);
                        match applied.items.get_mut(&key) {
                            Some(item) if result.status.is_good() => {
                                item.model = request.model;
                                item.revised_sampling_interval = result.revised_sampling_interval;
                                report.modified += 1;
                            }
                            _ => report.fail(key, "modify", result.status),
                        }
                    }
                }
                Err(e) => {
                    lost = e.is_transport_loss();
                    e.log("modify monitored items");
                    for (key, _) in requests {
                        report.fail(key, "modify", service_status(&e));
                    }
                }
            }
        }

        if !plan.to_add.is_empty() && !lost {
            let requests: Vec<(ItemKey, MonitoredItemRequest)> = plan
                .to_add
                .iter()
                .filter_map(|key| {
                    let model = items.get(key)?;
                    let client_handle = self.next_client_handle.fetch_add(1, Ordering::Relaxed);
                    self.router.bind(client_handle, key.clone());
                    Some((
                        key.clone(),
                        MonitoredItemRequest {
                            client_handle,
                            model: model.clone(),
                        },
                    ))
                })
                .collect();
            let batch: Vec<MonitoredItemRequest> = requests.iter().map(|(_, r)| r.clone()).collect();
            self.stats.server_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = match self
                .guarded("apply", cancel, session.create_monitored_items(server_id, &batch))
                .await
            {
                Ok(outcome) => outcome,
                Err(canceled) => {
                    for (_, request) in &requests {
                        self.router.unbind(request.client_handle);
                    }
                    return Err(canceled);
                }
            };
            match outcome {
                Ok(results) => {
                    for (index, (key, request)) in requests.into_iter().enumerate() {
                        let result = result_at(&results, index);
                        if result.status.is_good() {
                            applied.items.insert(
                                key,
                                AppliedItem {
                                    model: request.model,
                                    server_handle: result.server_handle,
                                    client_handle: request.client_handle,
                                    revised_sampling_interval: result.revised_sampling_interval,
                                },
                            );
                            report.added += 1;
                        } else {
                            self.router.unbind(request.client_handle);
                            report.fail(key, "create", result.status);
                        }
                    }
                }
                Err(e) => {
                    e.log("create monitored items");
                    for (key, request) in requests {
                        self.router.unbind(request.client_handle);
                        report.fail(key, "create", service_status(&e));
                    }
                }
            }
        }

        if report.is_complete() {
            applied.version = version;
        } else {
            self.stats
                .item_failures
                .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
            if let Err(e) = report.check(&self.id) {
                e.log("apply");
            }
        }
        if report.attempted() > 0 || report.subscription_modified {
            tracing::debug!(
                subscription_id = %self.id,
                added = report.added,
                modified = report.modified,
                removed = report.removed,
                failed = report.failed(),
                "Reconciliation finished"
            );
        }
        *self.last_report.write() = Some(report);
        Ok(())
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Replays on a task; failed replays are retried with the reconnect
    /// backoff until they succeed, the session changes or the handle closes.
    fn schedule_replay(&self) {
        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        let mut delays = self.session.config().reconnect.backoff().sequence();
        self.tracker.spawn(async move {
            loop {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let retry = tokio::select! {
                    _ = cancel.cancelled() => return,
                    retry = this.replay() => retry,
                };
                if !retry {
                    return;
                }
                let delay = delays.next_delay();
                tracing::debug!(
                    subscription_id = %this.id,
                    attempt = delays.attempts(),
                    delay = %humantime::format_duration(delay),
                    "Retrying subscription replay"
                );
                drop(this);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
    }

    /// Returns `true` if the replay failed on a session that is still
    /// current, so retrying may help.
    async fn replay(&self) -> bool {
        let mut applied = self.applied.lock().await;
        if !self.enabled() {
            return false;
        }
        let Some(session) = self.session.current() else {
            return false;
        };
        self.stats.replays.fetch_add(1, Ordering::Relaxed);
        if applied.server_id.is_some() && !applied.is_live_on(&session) {
            tracing::info!(
                subscription_id = %self.id,
                generation = session.generation(),
                "Recreating subscription on new session"
            );
            self.reset_applied(&mut applied);
        }

        let up_to_date =
            applied.is_live_on(&session) && applied.version >= self.desired.read().version;
        let mut result = Ok(());
        if !up_to_date {
            result = self.enable_locked(&mut applied, &session, None).await;
        }
        if result.is_ok() && self.desired_active.load(Ordering::SeqCst) {
            result = self.activate_locked(&mut applied, &session, None).await;
        }
        match result {
            Ok(()) => false,
            Err(e) => {
                e.log("subscription replay");
                !e.is_canceled() && !e.is_transport_loss()
            }
        }
    }

    /// Forgets server-side state that belonged to a previous session. No
    /// server calls: the objects died with that session.
    fn reset_applied(&self, applied: &mut AppliedState) {
        *applied = AppliedState::default();
        self.router.clear();
    }

    fn finish_close(&self) {
        self.cancel.cancel();
        self.router.seal();
        *self.state.write() = SubscriptionState::Closed;
    }

    fn ensure_open(&self, operation: &'static str) -> OpcUaResult<()> {
        let state = self.state();
        if state.is_closed() {
            return Err(
                SubscriptionError::invalid_transition(self.id.as_str(), state, operation).into(),
            );
        }
        Ok(())
    }
}

impl ConnectivityListener for SubscriptionHandle {
    fn on_connectivity_changed(
        &self,
        _identity: &ConnectionIdentity,
        previous: ConnectivityState,
        current: ConnectivityState,
    ) {
        self.update_connectivity_state(previous, current);
    }

    fn on_shutdown(&self) {
        if !self.state().is_closed() {
            self.finish_close();
            tracing::debug!(subscription_id = %self.id, "Subscription closed by pool");
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.identity.endpoint_url())
            .field("state", &self.state())
            .finish()
    }
}

async fn caller_canceled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn result_at(results: &[MonitoredItemResult], index: usize) -> MonitoredItemResult {
    results
        .get(index)
        .copied()
        .unwrap_or_else(|| MonitoredItemResult::bad(StatusCode::BAD_COMMUNICATION_ERROR))
}

fn service_status(error: &OpcUaError) -> StatusCode {
    match error {
        OpcUaError::Service(e) => e.status(),
        _ => StatusCode::BAD_COMMUNICATION_ERROR,
    }
}

// =============================================================================
// SubscriptionStats
// =============================================================================

/// Counters of one subscription handle.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    applies: AtomicU64,
    reconciles: AtomicU64,
    server_calls: AtomicU64,
    item_failures: AtomicU64,
    replays: AtomicU64,
}

impl SubscriptionStats {
    /// Calls to `apply`.
    pub fn applies(&self) -> u64 {
        self.applies.load(Ordering::Relaxed)
    }

    /// Reconciliation passes that reached the server.
    pub fn reconciles(&self) -> u64 {
        self.reconciles.load(Ordering::Relaxed)
    }

    /// Service calls issued to the stack.
    pub fn server_calls(&self) -> u64 {
        self.server_calls.load(Ordering::Relaxed)
    }

    /// Item operations rejected by the server.
    pub fn item_failures(&self) -> u64 {
        self.item_failures.load(Ordering::Relaxed)
    }

    /// Replays after a reconnect.
    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }
}
