// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The session pool.
//!
//! At most one [`SessionHandle`] exists per [`ConnectionIdentity`]. Each
//! entry carries the reverse index of subscription handles bound to it; the
//! index drives connectivity fan-out and reference-counted eviction.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use sentra_opcua::client::{ProtocolStack, SessionPool};
//! use sentra_opcua::config::EngineConfig;
//! use sentra_opcua::types::{ConnectionIdentity, OperationContext};
//!
//! # async fn example(stack: Arc<dyn ProtocolStack>) -> sentra_opcua::error::OpcUaResult<()> {
//! let pool = SessionPool::builder(stack).config(EngineConfig::default()).build()?;
//! let identity = ConnectionIdentity::new("opc.tcp://plc-01:4840");
//!
//! let session = pool.get_or_create_session(&identity, true).await?;
//! assert!(session.is_some());
//!
//! pool.remove_session(&identity, true, &OperationContext::system()).await?;
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::session::{CloseReason, Session, SessionHandle};
use super::stack::{AnonymousCredentials, CredentialProvider, ProtocolStack};
use super::subscription::{SubscriptionHandle, SubscriptionId};
use crate::config::EngineConfig;
use crate::error::{OpcUaError, OpcUaResult};
use crate::types::{ConnectionIdentity, ConnectivityState, OperationContext};

// =============================================================================
// ConnectivityListener
// =============================================================================

/// Receiver of connectivity transitions.
///
/// Called synchronously from the session supervisor; implementations must
/// return quickly and hand long work to a task. A panicking listener is
/// logged and skipped.
pub trait ConnectivityListener: Send + Sync {
    /// The session for `identity` moved from `previous` to `current`.
    fn on_connectivity_changed(
        &self,
        identity: &ConnectionIdentity,
        previous: ConnectivityState,
        current: ConnectivityState,
    );

    /// The pool is stopping. No further calls follow.
    fn on_shutdown(&self) {}
}

type GlobalListeners = Arc<RwLock<Vec<Arc<dyn ConnectivityListener>>>>;

// =============================================================================
// SubscriberSet
// =============================================================================

/// Subscription handles bound to one session, plus the pool-wide listeners.
struct SubscriberSet {
    subscribers: DashMap<SubscriptionId, Weak<dyn ConnectivityListener>>,
    global: GlobalListeners,
    closed: AtomicBool,
}

impl SubscriberSet {
    fn new(global: GlobalListeners) -> Self {
        Self {
            subscribers: DashMap::new(),
            global,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live subscribers. Dropped handles are pruned.
    fn live_count(&self) -> usize {
        self.subscribers.retain(|_, weak| weak.strong_count() > 0);
        self.subscribers.len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectivityListener>> {
        let mut listeners: Vec<Arc<dyn ConnectivityListener>> = self
            .subscribers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        listeners.extend(self.global.read().iter().cloned());
        listeners
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers: Vec<_> = self
            .subscribers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.subscribers.clear();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber.on_shutdown())).is_err() {
                tracing::error!("Subscriber panicked during shutdown");
            }
        }
    }
}

impl ConnectivityListener for SubscriberSet {
    fn on_connectivity_changed(
        &self,
        identity: &ConnectionIdentity,
        previous: ConnectivityState,
        current: ConnectivityState,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Locks are released before any listener runs.
        for listener in self.snapshot() {
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                listener.on_connectivity_changed(identity, previous, current)
            }));
            if delivered.is_err() {
                tracing::error!(
                    endpoint = %identity.endpoint_url(),
                    state = %current,
                    "Connectivity listener panicked"
                );
            }
        }
    }
}

// =============================================================================
// SessionPool
// =============================================================================

#[derive(Clone)]
struct PoolEntry {
    handle: Arc<SessionHandle>,
    subscribers: Arc<SubscriberSet>,
}

pub(crate) struct PoolShared {
    config: Arc<EngineConfig>,
    stack: Arc<dyn ProtocolStack>,
    credentials: Arc<dyn CredentialProvider>,
    sessions: DashMap<ConnectionIdentity, PoolEntry>,
    listeners: GlobalListeners,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
    stats: PoolStats,
}

/// Pool of session handles keyed by connection identity.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    /// Starts building a pool on top of `stack`.
    pub fn builder(stack: Arc<dyn ProtocolStack>) -> SessionPoolBuilder {
        SessionPoolBuilder {
            stack,
            config: EngineConfig::default(),
            credentials: Arc::new(AnonymousCredentials),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Pool statistics.
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Number of live session handles.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Registers a listener for transitions of every session in the pool.
    pub fn add_listener(&self, listener: Arc<dyn ConnectivityListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Returns the session for `identity`.
    ///
    /// With an existing handle and `create == false`, returns the current
    /// session without waiting (`None` while disconnected). Without a handle
    /// and `create == false`, returns `None`. Otherwise creates the handle if
    /// needed and waits for it to connect, as
    /// [`SessionHandle::acquire_session`] does.
    pub async fn get_or_create_session(
        &self,
        identity: &ConnectionIdentity,
        create: bool,
    ) -> OpcUaResult<Option<Session>> {
        self.shared.ensure_running()?;
        let existing = self.shared.sessions.get(identity).map(|e| e.value().clone());
        let entry = match existing {
            Some(entry) if !create => return Ok(entry.handle.current()),
            Some(entry) => entry,
            None if !create => return Ok(None),
            None => self.shared.entry(identity)?,
        };
        entry.handle.acquire_session(None).await.map(Some)
    }

    /// Returns the handle for `identity`, creating it without waiting.
    pub fn session_handle(&self, identity: &ConnectionIdentity) -> OpcUaResult<Arc<SessionHandle>> {
        self.shared.entry(identity).map(|entry| entry.handle)
    }

    /// Looks up an existing handle.
    pub fn find_session_handle(&self, identity: &ConnectionIdentity) -> Option<Arc<SessionHandle>> {
        self.shared
            .sessions
            .get(identity)
            .map(|entry| entry.handle.clone())
    }

    /// Removes the handle for `identity`.
    ///
    /// With `only_if_empty`, the handle is kept while subscriptions are
    /// registered against it. A forced removal fails pending acquires with
    /// `SessionClosed`. Returns `true` if a handle was removed.
    pub async fn remove_session(
        &self,
        identity: &ConnectionIdentity,
        only_if_empty: bool,
        ctx: &OperationContext,
    ) -> OpcUaResult<bool> {
        let removed = self.shared.sessions.remove_if(identity, |_, entry| {
            !only_if_empty || entry.subscribers.live_count() == 0
        });

        let Some((_, entry)) = removed else {
            if self.shared.sessions.contains_key(identity) {
                tracing::debug!(
                    endpoint = %identity.endpoint_url(),
                    author = ctx.author_or_system(),
                    correlation_id = %ctx.correlation_id,
                    "Session still referenced, not removed"
                );
            }
            return Ok(false);
        };

        entry.handle.shutdown(CloseReason::Removed).await;
        entry.subscribers.shutdown();
        self.shared.stats.sessions_removed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            endpoint = %identity.endpoint_url(),
            forced = !only_if_empty,
            author = ctx.author_or_system(),
            correlation_id = %ctx.correlation_id,
            "Session removed"
        );
        Ok(true)
    }

    /// Creates a subscription handle bound to the session for `identity` and
    /// registers it. The session handle is created if needed.
    pub fn create_subscription(
        &self,
        id: impl Into<SubscriptionId>,
        identity: &ConnectionIdentity,
    ) -> OpcUaResult<Arc<SubscriptionHandle>> {
        let entry = self.shared.entry(identity)?;
        let subscription = SubscriptionHandle::new(
            id.into(),
            entry.handle.clone(),
            &self.shared.config,
            &self.shared.tracker,
            Arc::downgrade(&self.shared),
        );
        self.register_subscription(&subscription)?;
        Ok(subscription)
    }

    /// Adds a subscription handle to the reverse index of its session.
    pub fn register_subscription(&self, subscription: &Arc<SubscriptionHandle>) -> OpcUaResult<()> {
        self.shared.register(subscription)
    }

    /// Removes a subscription handle from the reverse index of its session.
    pub fn unregister_subscription(&self, subscription: &SubscriptionHandle) -> bool {
        self.shared.unregister(subscription)
    }

    /// Number of subscriptions registered against `identity`.
    pub fn subscription_count(&self, identity: &ConnectionIdentity) -> usize {
        self.shared
            .sessions
            .get(identity)
            .map(|entry| entry.subscribers.live_count())
            .unwrap_or(0)
    }

    /// Stops the pool.
    ///
    /// Fails all waiters, tears every session down and joins all background
    /// tasks. No listener or notification callback runs after this returns.
    pub async fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!(sessions = self.session_count(), "Stopping session pool");
            self.shared.cancel.cancel();

            let entries: Vec<PoolEntry> = self
                .shared
                .sessions
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            self.shared.sessions.clear();

            join_all(
                entries
                    .iter()
                    .map(|entry| entry.handle.shutdown(CloseReason::Stopped)),
            )
            .await;
            for entry in &entries {
                entry.subscribers.shutdown();
            }

            let listeners: Vec<_> = self.shared.listeners.write().drain(..).collect();
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener.on_shutdown())).is_err() {
                    tracing::error!("Pool listener panicked during shutdown");
                }
            }
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        tracing::info!("Session pool stopped");
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.session_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PoolShared {
    fn ensure_running(&self) -> OpcUaResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(OpcUaError::canceled("session pool stopped"));
        }
        Ok(())
    }

    fn entry(&self, identity: &ConnectionIdentity) -> OpcUaResult<PoolEntry> {
        self.ensure_running()?;
        identity.validate()?;

        let mut created = false;
        let entry = self
            .sessions
            .entry(identity.clone())
            .or_insert_with(|| {
                created = true;
                let subscribers = Arc::new(SubscriberSet::new(self.listeners.clone()));
                let handle = SessionHandle::spawn(
                    identity.clone(),
                    self.config.clone(),
                    self.stack.clone(),
                    self.credentials.clone(),
                    subscribers.clone(),
                    &self.cancel,
                    &self.tracker,
                );
                PoolEntry {
                    handle,
                    subscribers,
                }
            })
            .clone();

        if created {
            // Raced with stop(): the handle was born canceled.
            if self.stopped.load(Ordering::SeqCst) {
                self.sessions.remove(identity);
                return Err(OpcUaError::canceled("session pool stopped"));
            }
            self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                endpoint = %identity.endpoint_url(),
                security_mode = %identity.security_mode(),
                security_policy = %identity.security_policy(),
                "Session handle created"
            );
        }
        Ok(entry)
    }

    pub(crate) fn register(&self, subscription: &Arc<SubscriptionHandle>) -> OpcUaResult<()> {
        self.ensure_running()?;
        let identity = subscription.connection_identity();
        let Some(entry) = self.sessions.get(identity).map(|e| e.value().clone()) else {
            return Err(OpcUaError::session_closed(identity.endpoint_url()));
        };
        if !Arc::ptr_eq(&entry.handle, subscription.session_handle()) {
            return Err(OpcUaError::session_closed(identity.endpoint_url()));
        }

        let listener: Arc<dyn ConnectivityListener> = subscription.clone();
        entry
            .subscribers
            .subscribers
            .insert(subscription.id().clone(), Arc::downgrade(&listener));
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            endpoint = %identity.endpoint_url(),
            subscription_id = %subscription.id(),
            "Subscription registered"
        );
        Ok(())
    }

    pub(crate) fn unregister(&self, subscription: &SubscriptionHandle) -> bool {
        let identity = subscription.connection_identity();
        let Some(entry) = self.sessions.get(identity).map(|e| e.value().clone()) else {
            return false;
        };
        // Only the handle that registered under this id may remove it.
        let this = subscription as *const SubscriptionHandle as *const ();
        let removed = entry
            .subscribers
            .subscribers
            .remove_if(subscription.id(), |_, weak| {
                weak.upgrade()
                    .map_or(true, |listener| Arc::as_ptr(&listener) as *const () == this)
            })
            .is_some();
        if removed {
            self.stats.unregistrations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                endpoint = %identity.endpoint_url(),
                subscription_id = %subscription.id(),
                "Subscription unregistered"
            );
        }
        removed
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// SessionPoolBuilder
// =============================================================================

/// Builder for [`SessionPool`].
pub struct SessionPoolBuilder {
    stack: Arc<dyn ProtocolStack>,
    config: EngineConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl SessionPoolBuilder {
    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the credential provider. Defaults to [`AnonymousCredentials`].
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Validates the configuration and builds the pool.
    pub fn build(self) -> OpcUaResult<SessionPool> {
        self.config.validate()?;
        Ok(SessionPool {
            shared: Arc::new(PoolShared {
                config: Arc::new(self.config),
                stack: self.stack,
                credentials: self.credentials,
                sessions: DashMap::new(),
                listeners: Arc::new(RwLock::new(Vec::new())),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                stopped: AtomicBool::new(false),
                stats: PoolStats::default(),
            }),
        })
    }
}

// =============================================================================
// PoolStats
// =============================================================================

/// Counters of the pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    sessions_created: AtomicU64,
    sessions_removed: AtomicU64,
    registrations: AtomicU64,
    unregistrations: AtomicU64,
}

impl PoolStats {
    /// Session handles created.
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Session handles removed through `remove_session`.
    pub fn sessions_removed(&self) -> u64 {
        self.sessions_removed.load(Ordering::Relaxed)
    }

    /// Subscription registrations.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Subscription unregistrations.
    pub fn unregistrations(&self) -> u64 {
        self.unregistrations.load(Ordering::Relaxed)
    }
}
