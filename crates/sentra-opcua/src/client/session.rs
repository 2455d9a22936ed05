// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session handles and their connectivity supervisor.
//!
//! A [`SessionHandle`] exclusively owns the stack session of one
//! [`ConnectionIdentity`]. A background supervisor task connects, probes the
//! session with keep-alives and reconnects with exponential backoff when it
//! is lost. Every connectivity transition is published on a `watch` channel
//! and reported synchronously to the handle's [`ConnectivityListener`].
//!
//! ```text
//!            +-----------+  open ok   +-----------+
//!  spawn --> | Connecting| ---------> | Connected |
//!            +-----------+            +-----------+
//!              ^      | open failed         | 3 failed probes / transport loss
//!              |      v                     v
//!              |  Error / Unauthorized   Disconnected
//!              +------ backoff ------------+
//! ```

use std::fmt;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::pool::ConnectivityListener;
use super::stack::{CredentialProvider, ProtocolStack, StackSession};
use crate::config::EngineConfig;
use crate::error::{ConnectionError, OpcUaError, OpcUaResult};
use crate::types::{ConnectionIdentity, ConnectivityState};

// =============================================================================
// Session
// =============================================================================

/// A live stack session, tagged with the connect generation it belongs to.
///
/// Cloning is cheap. A reconnect produces a session with a higher
/// generation; server-side objects created on an older generation are gone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<dyn StackSession>,
    generation: u64,
}

impl Session {
    /// Connect generation, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` if both leases refer to the same stack session.
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Deref for Session {
    type Target = dyn StackSession;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.session_id())
            .field("generation", &self.generation)
            .finish()
    }
}

// =============================================================================
// CloseReason
// =============================================================================

/// Why a handle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The handle was disposed directly.
    Disposed,
    /// The pool was stopped.
    Stopped,
    /// The handle was removed from the pool.
    Removed,
}

// =============================================================================
// SessionHandle
// =============================================================================

/// Owner of the session for one connection identity.
///
/// Created by the [`SessionPool`](super::SessionPool); obtain the live session
/// with [`acquire_session`](Self::acquire_session).
pub struct SessionHandle {
    identity: ConnectionIdentity,
    config: Arc<EngineConfig>,
    state: watch::Sender<ConnectivityState>,
    session: RwLock<Option<Session>>,
    generation: AtomicU64,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    failure: Mutex<Option<(u32, String)>>,
    listener: Arc<dyn ConnectivityListener>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stats: SessionStats,
}

impl SessionHandle {
    /// Creates the handle and starts its supervisor on `tracker`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        identity: ConnectionIdentity,
        config: Arc<EngineConfig>,
        stack: Arc<dyn ProtocolStack>,
        credentials: Arc<dyn CredentialProvider>,
        listener: Arc<dyn ConnectivityListener>,
        parent: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectivityState::Connecting);
        let handle = Arc::new(Self {
            identity,
            config,
            state,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            cancel: parent.child_token(),
            close_reason: Mutex::new(None),
            failure: Mutex::new(None),
            listener,
            supervisor: Mutex::new(None),
            stats: SessionStats::new(),
        });

        let task = tracker.spawn(handle.clone().supervise(stack, credentials));
        *handle.supervisor.lock() = Some(task);
        handle
    }

    /// Identity this handle connects to.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Current connectivity state. Never blocks.
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Receiver observing every connectivity transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// The live session, if connected right now.
    pub fn current(&self) -> Option<Session> {
        self.session.read().clone()
    }

    /// Returns `true` once the handle has been disposed, removed or stopped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `true` when the reconnect policy gave up.
    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Session statistics.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Engine configuration shared with the pool.
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token canceled together with this handle.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Waits until the handle is connected and returns the session.
    ///
    /// Fails with a cancellation error when `cancel` fires or the handle is
    /// disposed, with `SessionClosed` when the handle is removed from the
    /// pool, and with a connection error when `acquire.max_wait` elapses or
    /// the reconnect policy gave up.
    pub async fn acquire_session(&self, cancel: Option<&CancellationToken>) -> OpcUaResult<Session> {
        let started = Instant::now();
        let mut rx = self.state.subscribe();

        let wait = async {
            loop {
                if let Some(err) = self.failure_error() {
                    return Err(err);
                }
                if rx.borrow_and_update().is_connected() {
                    if let Some(session) = self.current() {
                        return Ok(session);
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(self.closed_error());
                }
            }
        };
        let caller_canceled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.config.acquire.max_wait {
                Some(max_wait) => tokio::time::sleep(max_wait).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = caller_canceled => Err(OpcUaError::canceled("acquire_session")),
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            result = wait => result,
            _ = deadline => Err(ConnectionError::wait_exceeded(
                self.identity.endpoint_url(),
                started.elapsed(),
            )
            .into()),
        }
    }

    /// Stops the supervisor, closes the session and fails all waiters.
    pub async fn dispose(&self) {
        self.shutdown(CloseReason::Disposed).await;
    }

    pub(crate) async fn shutdown(&self, reason: CloseReason) {
        {
            let mut close_reason = self.close_reason.lock();
            if close_reason.is_none() {
                *close_reason = Some(reason);
            }
        }
        self.cancel.cancel();

        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(
                    endpoint = %self.identity.endpoint_url(),
                    error = %e,
                    "Session supervisor terminated abnormally"
                );
            }
        }
    }

    fn closed_error(&self) -> OpcUaError {
        match *self.close_reason.lock() {
            Some(CloseReason::Removed) => OpcUaError::session_closed(self.identity.endpoint_url()),
            _ => OpcUaError::canceled("acquire_session"),
        }
    }

    fn failure_error(&self) -> Option<OpcUaError> {
        self.failure.lock().as_ref().map(|(attempts, reason)| {
            ConnectionError::failed(self.identity.endpoint_url(), *attempts, reason.clone()).into()
        })
    }

    // =========================================================================
    // Supervisor
    // =========================================================================

    async fn supervise(
        self: Arc<Self>,
        stack: Arc<dyn ProtocolStack>,
        credentials: Arc<dyn CredentialProvider>,
    ) {
        let mut delays = self.config.reconnect.backoff().sequence();
        let mut failed_attempts: u32 = 0;
        let mut reconnecting = false;

        loop {
            self.set_state(ConnectivityState::Connecting);
            self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect(stack.as_ref(), credentials.as_ref()) => result,
            };

            match attempt {
                Ok(inner) => {
                    failed_attempts = 0;
                    delays.reset();
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let session = Session { inner, generation };
                    *self.session.write() = Some(session.clone());

                    self.stats.connects.fetch_add(1, Ordering::Relaxed);
                    if reconnecting {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::info!(
                        endpoint = %self.identity.endpoint_url(),
                        session_id = %session.session_id(),
                        generation,
                        reconnect = reconnecting,
                        "Session connected"
                    );
                    self.set_state(ConnectivityState::Connected);

                    let lost = self.keep_alive(&session).await;
                    if let Some(reason) = &lost {
                        tracing::warn!(
                            endpoint = %self.identity.endpoint_url(),
                            generation,
                            reason = %reason,
                            "Session lost, reconnecting"
                        );
                        self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                        self.set_state(ConnectivityState::Disconnected);
                    }
                    self.release_session().await;
                    if lost.is_none() {
                        break;
                    }
                    reconnecting = true;
                }
                Err(e) => {
                    failed_attempts = failed_attempts.saturating_add(1);
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    e.log("session connect");

                    let state = if e.is_access_denied() {
                        ConnectivityState::Unauthorized
                    } else {
                        ConnectivityState::Error
                    };
                    if let Some(max_attempts) = self.config.reconnect.max_attempts {
                        if failed_attempts >= max_attempts {
                            tracing::error!(
                                endpoint = %self.identity.endpoint_url(),
                                attempts = failed_attempts,
                                "Giving up on session after exhausting reconnect attempts"
                            );
                            *self.failure.lock() = Some((failed_attempts, e.to_string()));
                            self.set_state(state);
                            return;
                        }
                    }
                    self.set_state(state);
                }
            }

            let delay = delays.next_delay();
            tracing::debug!(
                endpoint = %self.identity.endpoint_url(),
                attempt = delays.attempts(),
                delay = %humantime::format_duration(delay),
                "Scheduling reconnect"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.release_session().await;
        self.set_state(ConnectivityState::Disconnected);
        tracing::debug!(endpoint = %self.identity.endpoint_url(), "Session supervisor stopped");
    }

    async fn connect(
        &self,
        stack: &dyn ProtocolStack,
        credentials: &dyn CredentialProvider,
    ) -> OpcUaResult<Arc<dyn StackSession>> {
        let token = credentials.resolve(&self.identity).await?;
        tracing::debug!(
            endpoint = %self.identity.endpoint_url(),
            identity = %token,
            "Opening session"
        );
        stack.open_session(&self.identity, token).await
    }

    /// Probes the session until it is lost (`Some(reason)`) or the handle is
    /// canceled (`None`).
    async fn keep_alive(&self, session: &Session) -> Option<String> {
        let settings = &self.config.keep_alive;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + settings.interval,
            settings.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let probe = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = tokio::time::timeout(settings.timeout, session.keep_alive()) => result,
            };

            match probe {
                Ok(Ok(())) => failures = 0,
                Ok(Err(e)) if e.is_transport_loss() => return Some(e.to_string()),
                Ok(Err(e)) => {
                    failures += 1;
                    self.stats.keep_alive_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        endpoint = %self.identity.endpoint_url(),
                        failures,
                        error = %e,
                        "Keep-alive failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    self.stats.keep_alive_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        endpoint = %self.identity.endpoint_url(),
                        failures,
                        timeout_ms = settings.timeout.as_millis() as u64,
                        "Keep-alive timed out"
                    );
                }
            }

            if failures >= settings.max_failures {
                return Some(format!("{} consecutive keep-alive failures", failures));
            }
        }
    }

    /// Drops the current session and closes it on the stack, best-effort.
    async fn release_session(&self) {
        let Some(session) = self.session.write().take() else {
            return;
        };
        let timeout = self.config.keep_alive.timeout;
        match tokio::time::timeout(timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(
                endpoint = %self.identity.endpoint_url(),
                error = %e,
                "Ignoring error while closing session"
            ),
            Err(_) => tracing::debug!(
                endpoint = %self.identity.endpoint_url(),
                "Timed out closing session"
            ),
        }
    }

    fn set_state(&self, new_state: ConnectivityState) {
        let previous = self.state.send_replace(new_state);
        if previous == new_state {
            return;
        }

        tracing::trace!(
            endpoint = %self.identity.endpoint_url(),
            previous = %previous,
            state = %new_state,
            "Connectivity state changed"
        );
        self.stats.transitions.fetch_add(1, Ordering::Relaxed);

        let notified = catch_unwind(AssertUnwindSafe(|| {
            self.listener
                .on_connectivity_changed(&self.identity, previous, new_state)
        }));
        if notified.is_err() {
            tracing::error!(
                endpoint = %self.identity.endpoint_url(),
                "Connectivity listener panicked"
            );
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("endpoint", &self.identity.endpoint_url())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// SessionStats
// =============================================================================

/// Counters of one session handle.
#[derive(Debug, Default)]
pub struct SessionStats {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    reconnects: AtomicU64,
    disconnects: AtomicU64,
    keep_alive_failures: AtomicU64,
    transitions: AtomicU64,
}

impl SessionStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls to the stack's `open_session`.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Successful connects, including reconnects.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Failed connect attempts.
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    /// Successful connects after a lost session.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Sessions declared lost.
    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Failed or timed-out keep-alive probes.
    pub fn keep_alive_failures(&self) -> u64 {
        self.keep_alive_failures.load(Ordering::Relaxed)
    }

    /// Connectivity state transitions.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}
