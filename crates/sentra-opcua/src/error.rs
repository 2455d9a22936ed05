// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the session and subscription engine.
//!
//! # Error Categories
//!
//! ```text
//! OpcUaError
//! ├── Connection    - establishing or keeping a session (ConnectionFailed)
//! ├── Session       - handle lifecycle (SessionClosed, Canceled)
//! ├── Subscription  - reconciliation and state machine
//! │                   (PartialApplyFailure, InvalidStateTransition)
//! ├── Service       - structured status returned by the protocol stack
//! └── Configuration - invalid settings, fail fast
//! ```
//!
//! Transient faults (connection, service) are retried inside the engine and
//! are only surfaced through observable state. Configuration errors, invalid
//! transitions and cancellation propagate to the caller.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use sentra_opcua::error::{ConnectionError, ErrorSeverity, OpcUaError};
//!
//! let error = OpcUaError::from(ConnectionError::wait_exceeded(
//!     "opc.tcp://localhost:4840",
//!     Duration::from_secs(30),
//! ));
//! assert!(error.is_retryable());
//! assert_eq!(error.severity(), ErrorSeverity::Warning);
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::types::StatusCode;

// =============================================================================
// OpcUaError
// =============================================================================

/// The main error type of the engine.
#[derive(Debug, Error)]
pub enum OpcUaError {
    /// Connection establishment or loss.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Session handle lifecycle.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Subscription reconciliation and state machine.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Status returned by a protocol stack service call.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Invalid configuration.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),
}

impl OpcUaError {
    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// A wait was canceled by the caller, the handle or the pool.
    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Session(SessionError::canceled(operation))
    }

    /// The session handle was removed while the call was pending.
    pub fn session_closed(endpoint: impl Into<String>) -> Self {
        Self::Session(SessionError::closed(endpoint))
    }

    /// A protocol stack service returned a bad status.
    pub fn bad_status(service: &'static str, status: StatusCode) -> Self {
        Self::Service(ServiceError::bad_status(service, status))
    }

    /// The channel to the server is gone.
    pub fn connection_lost(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection(ConnectionError::lost(endpoint, reason))
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns `true` if this error is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Subscription(e) => e.is_retryable(),
            Self::Service(e) => e.is_retryable(),
            Self::Configuration(_) => false,
        }
    }

    /// Returns `true` for cancellation, including handle and pool shutdown.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::Canceled { .. } | SessionError::Closed { .. })
        )
    }

    /// Returns `true` if the error means the transport itself is gone and the
    /// session must be re-created without further probing.
    pub fn is_transport_loss(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::Lost { .. }) => true,
            Self::Service(ServiceError::BadStatus { status, .. }) => status.is_connection_loss(),
            _ => false,
        }
    }

    /// Returns `true` if the server refused the presented identity.
    pub fn is_access_denied(&self) -> bool {
        match self {
            Self::Session(SessionError::Unauthorized { .. }) => true,
            Self::Service(ServiceError::BadStatus { status, .. }) => status.is_access_denied(),
            _ => false,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(e) => e.severity(),
            Self::Session(e) => e.severity(),
            Self::Subscription(e) => e.severity(),
            Self::Service(e) => e.severity(),
            Self::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Session(_) => "session",
            Self::Subscription(_) => "subscription",
            Self::Service(_) => "service",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Returns the structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Service(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
        }
    }

    /// Returns recovery hints for operators.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Connection(e) => e.recovery_hints(),
            Self::Session(e) => e.recovery_hints(),
            Self::Subscription(e) => e.recovery_hints(),
            Self::Service(e) => e.recovery_hints(),
            Self::Configuration(_) => vec!["Fix the configuration and retry"],
        }
    }

    /// Logs this error at the level implied by its severity.
    pub fn log(&self, context: &str) {
        let code = self.error_code();
        match self.severity().to_tracing_level() {
            Level::ERROR => tracing::error!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Failures establishing or keeping a session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Every attempt allowed by the reconnect policy failed.
    #[error("Connection to '{endpoint}' failed after {attempts} attempt(s): {reason}")]
    Failed {
        /// Target endpoint.
        endpoint: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// The caller waited longer than the configured maximum.
    #[error("No connection to '{endpoint}' within {waited:?}")]
    WaitExceeded {
        /// Target endpoint.
        endpoint: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// An established channel was lost.
    #[error("Connection to '{endpoint}' lost: {reason}")]
    Lost {
        /// Target endpoint.
        endpoint: String,
        /// Reason reported by the stack.
        reason: String,
    },

    /// No session is currently available.
    #[error("Not connected")]
    NotConnected,

    /// Transport-level I/O error.
    #[error("I/O error on '{endpoint}': {source}")]
    Io {
        /// Target endpoint.
        endpoint: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    /// Creates a failed-after-retries error.
    pub fn failed(endpoint: impl Into<String>, attempts: u32, reason: impl Into<String>) -> Self {
        Self::Failed {
            endpoint: endpoint.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// Creates a wait-exceeded error.
    pub fn wait_exceeded(endpoint: impl Into<String>, waited: Duration) -> Self {
        Self::WaitExceeded {
            endpoint: endpoint.into(),
            waited,
        }
    }

    /// Creates a connection-lost error.
    pub fn lost(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lost {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an I/O error.
    pub fn io(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        true
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Failed { .. } => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Failed { .. } => ErrorCode::new(1, 1),
            Self::WaitExceeded { .. } => ErrorCode::new(1, 2),
            Self::Lost { .. } => ErrorCode::new(1, 3),
            Self::NotConnected => ErrorCode::new(1, 4),
            Self::Io { .. } => ErrorCode::new(1, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Failed { .. } | Self::Io { .. } => vec![
                "Check that the server is running and reachable",
                "Verify the endpoint URL and security settings",
            ],
            Self::WaitExceeded { .. } => vec![
                "The session keeps reconnecting in the background",
                "Increase acquire.max_wait if the server is slow to start",
            ],
            Self::Lost { .. } | Self::NotConnected => {
                vec!["The engine reconnects automatically"]
            }
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session handle lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The handle was removed from the pool.
    #[error("Session for '{endpoint}' was closed")]
    Closed {
        /// Target endpoint.
        endpoint: String,
    },

    /// The operation was canceled.
    #[error("Operation '{operation}' was canceled")]
    Canceled {
        /// The canceled operation.
        operation: String,
    },

    /// The stack could not open a session.
    #[error("Failed to create session on '{endpoint}': {message}")]
    CreationFailed {
        /// Target endpoint.
        endpoint: String,
        /// Error message.
        message: String,
    },

    /// The server refused the identity.
    #[error("Identity rejected by '{endpoint}': {message}")]
    Unauthorized {
        /// Target endpoint.
        endpoint: String,
        /// Error message.
        message: String,
    },
}

impl SessionError {
    /// Creates a closed error.
    pub fn closed(endpoint: impl Into<String>) -> Self {
        Self::Closed {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a canceled error.
    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Canceled {
            operation: operation.into(),
        }
    }

    /// Creates a creation-failed error.
    pub fn creation_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CreationFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates an unauthorized error.
    pub fn unauthorized(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CreationFailed { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Canceled { .. } | Self::Closed { .. } => ErrorSeverity::Info,
            Self::CreationFailed { .. } => ErrorSeverity::Warning,
            Self::Unauthorized { .. } => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Closed { .. } => ErrorCode::new(2, 1),
            Self::Canceled { .. } => ErrorCode::new(2, 2),
            Self::CreationFailed { .. } => ErrorCode::new(2, 3),
            Self::Unauthorized { .. } => ErrorCode::new(2, 4),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Closed { .. } | Self::Canceled { .. } => {
                vec!["Obtain a new session from the pool"]
            }
            Self::CreationFailed { .. } => vec!["Check server session limits"],
            Self::Unauthorized { .. } => vec![
                "Verify the credential referenced by the connection identity",
                "Check that the server trusts the client certificate",
            ],
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription reconciliation and state machine errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Some monitored items could not be created, modified or deleted.
    #[error("Subscription '{subscription_id}': {failed} of {total} item operation(s) failed")]
    PartialApply {
        /// Subscription id.
        subscription_id: String,
        /// Failed operations.
        failed: usize,
        /// Attempted operations.
        total: usize,
    },

    /// The operation is not allowed in the current state.
    #[error("Subscription '{subscription_id}': cannot {operation} while {from}")]
    InvalidStateTransition {
        /// Subscription id.
        subscription_id: String,
        /// Current state.
        from: String,
        /// Requested operation.
        operation: &'static str,
    },

    /// The desired set contains the same item key twice.
    #[error("Subscription '{subscription_id}': duplicate monitored item '{key}'")]
    DuplicateItem {
        /// Subscription id.
        subscription_id: String,
        /// Duplicated key.
        key: String,
    },

    /// The server-side subscription could not be created.
    #[error("Subscription '{subscription_id}': creation failed: {message}")]
    CreationFailed {
        /// Subscription id.
        subscription_id: String,
        /// Error message.
        message: String,
    },
}

impl SubscriptionError {
    /// Creates a partial-apply error.
    pub fn partial_apply(subscription_id: impl Into<String>, failed: usize, total: usize) -> Self {
        Self::PartialApply {
            subscription_id: subscription_id.into(),
            failed,
            total,
        }
    }

    /// Creates an invalid-transition error.
    pub fn invalid_transition(
        subscription_id: impl Into<String>,
        from: impl fmt::Display,
        operation: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            subscription_id: subscription_id.into(),
            from: from.to_string(),
            operation,
        }
    }

    /// Creates a duplicate-item error.
    pub fn duplicate_item(subscription_id: impl Into<String>, key: impl fmt::Display) -> Self {
        Self::DuplicateItem {
            subscription_id: subscription_id.into(),
            key: key.to_string(),
        }
    }

    /// Creates a creation-failed error.
    pub fn creation_failed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CreationFailed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PartialApply { .. } | Self::CreationFailed { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::PartialApply { .. } => ErrorSeverity::Warning,
            Self::CreationFailed { .. } => ErrorSeverity::Warning,
            Self::InvalidStateTransition { .. } | Self::DuplicateItem { .. } => {
                ErrorSeverity::Error
            }
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::PartialApply { .. } => ErrorCode::new(3, 1),
            Self::InvalidStateTransition { .. } => ErrorCode::new(3, 2),
            Self::DuplicateItem { .. } => ErrorCode::new(3, 3),
            Self::CreationFailed { .. } => ErrorCode::new(3, 4),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::PartialApply { .. } => vec![
                "Failed items are retried on the next apply or reconnect",
                "Verify the node ids exist on the server",
            ],
            Self::InvalidStateTransition { .. } => {
                vec!["Enable the subscription before activating it"]
            }
            Self::DuplicateItem { .. } => vec!["Remove duplicate node/attribute pairs"],
            Self::CreationFailed { .. } => vec!["Check server subscription limits"],
        }
    }
}

// =============================================================================
// ServiceError
// =============================================================================

/// Structured failure of a protocol stack service call.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service returned a bad status code.
    #[error("{service} failed: {status}")]
    BadStatus {
        /// Service name.
        service: &'static str,
        /// Returned status.
        status: StatusCode,
    },

    /// The service did not answer in time.
    #[error("{service} timed out after {duration:?}")]
    Timeout {
        /// Service name.
        service: &'static str,
        /// Elapsed time.
        duration: Duration,
    },
}

impl ServiceError {
    /// Creates a bad-status error.
    pub fn bad_status(service: &'static str, status: StatusCode) -> Self {
        Self::BadStatus { service, status }
    }

    /// Creates a timeout error.
    pub fn timeout(service: &'static str, duration: Duration) -> Self {
        Self::Timeout { service, duration }
    }

    /// Status code carried by the error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadStatus { status, .. } => *status,
            Self::Timeout { .. } => StatusCode::BAD_TIMEOUT,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::BadStatus { status, .. } => {
                !status.is_access_denied()
                    && *status != StatusCode::BAD_NODE_ID_UNKNOWN
                    && *status != StatusCode::BAD_ATTRIBUTE_ID_INVALID
            }
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        if self.status().is_access_denied() {
            ErrorSeverity::Error
        } else {
            ErrorSeverity::Warning
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BadStatus { .. } => ErrorCode::new(4, 1),
            Self::Timeout { .. } => ErrorCode::new(4, 2),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Timeout { .. } => vec!["Check network latency to the server"],
            Self::BadStatus { status, .. } if status.is_connection_loss() => {
                vec!["The session will be re-created"]
            }
            Self::BadStatus { .. } => vec!["Inspect the status code for the failing service"],
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Invalid configuration. Never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A field has an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Reason.
        reason: String,
    },

    /// A node id could not be parsed or is not monitorable.
    #[error("Invalid node id '{node_id}': {reason}")]
    InvalidNodeId {
        /// The node id text.
        node_id: String,
        /// Reason.
        reason: String,
    },

    /// Unknown security mode or policy.
    #[error("Invalid security setting: '{value}'")]
    InvalidSecurity {
        /// The rejected value.
        value: String,
    },

    /// The configuration file extension is not supported.
    #[error("Unsupported configuration format: {}", path.display())]
    UnsupportedFormat {
        /// File path.
        path: PathBuf,
    },

    /// The configuration text could not be parsed.
    #[error("Failed to parse {format} configuration: {message}")]
    Parse {
        /// Format name.
        format: &'static str,
        /// Parser message.
        message: String,
    },

    /// The configuration file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ConfigurationError {
    /// Creates an invalid-value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-node-id error.
    pub fn invalid_node_id(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-security error.
    pub fn invalid_security(value: impl Into<String>) -> Self {
        Self::InvalidSecurity {
            value: value.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(format: &'static str, message: impl fmt::Display) -> Self {
        Self::Parse {
            format,
            message: message.to_string(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidValue { .. } => ErrorCode::new(5, 1),
            Self::InvalidNodeId { .. } => ErrorCode::new(5, 2),
            Self::InvalidSecurity { .. } => ErrorCode::new(5, 3),
            Self::UnsupportedFormat { .. } => ErrorCode::new(5, 4),
            Self::Parse { .. } => ErrorCode::new(5, 5),
            Self::Io { .. } => ErrorCode::new(5, 6),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Expected during shutdown; no action required.
    Info,
    /// Recovered automatically.
    Warning,
    /// Needs attention.
    Error,
    /// Needs immediate attention.
    Critical,
}

impl ErrorSeverity {
    /// Converts to a tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code rendered as `UA-XXYY`.
///
/// Categories: 1 connection, 2 session, 3 subscription, 4 service,
/// 5 configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category.
    pub category: u8,
    /// Code within the category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

/// A Result type with [`OpcUaError`].
pub type OpcUaResult<T> = Result<T, OpcUaError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_classification() {
        let canceled = OpcUaError::canceled("acquire_session");
        assert!(canceled.is_canceled());
        assert!(!canceled.is_retryable());

        let closed = OpcUaError::session_closed("opc.tcp://host:4840");
        assert!(closed.is_canceled());

        let partial = OpcUaError::from(SubscriptionError::partial_apply("twin-1", 2, 5));
        assert!(partial.is_retryable());
        assert!(partial.to_string().contains("2 of 5"));

        let invalid = OpcUaError::from(SubscriptionError::invalid_transition(
            "twin-1", "created", "activate",
        ));
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_transport_loss_detection() {
        assert!(OpcUaError::connection_lost("opc.tcp://h", "reset").is_transport_loss());
        assert!(OpcUaError::bad_status("keep_alive", StatusCode::BAD_CONNECTION_CLOSED)
            .is_transport_loss());
        assert!(!OpcUaError::bad_status("keep_alive", StatusCode::BAD_TIMEOUT).is_transport_loss());
    }

    #[test]
    fn test_access_denied() {
        let err = OpcUaError::bad_status("open_session", StatusCode::BAD_USER_ACCESS_DENIED);
        assert!(err.is_access_denied());
        assert!(!err.is_retryable());
        assert!(OpcUaError::from(SessionError::unauthorized("h", "no")).is_access_denied());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::new(3, 1).to_string(), "UA-0301");
        let err = OpcUaError::from(ConnectionError::NotConnected);
        assert_eq!(err.error_code(), ErrorCode::new(1, 4));
        assert_eq!(err.category(), "connection");
    }

    #[test]
    fn test_recovery_hints_present() {
        let err = OpcUaError::from(ConnectionError::failed("opc.tcp://h", 3, "refused"));
        assert!(!err.recovery_hints().is_empty());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_configuration_errors_are_critical() {
        let err = OpcUaError::from(ConfigurationError::invalid_value("x", "bad"));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_retryable());
    }
}
