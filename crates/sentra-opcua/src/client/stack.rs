// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Outbound interfaces: the protocol stack and the credential provider.
//!
//! The engine never encodes OPC UA messages itself. Everything it needs from
//! the wire is expressed by [`ProtocolStack`] (open a session) and
//! [`StackSession`] (services on an open session). Every call returns a
//! structured [`OpcUaError`](crate::error::OpcUaError); per-item results carry
//! a [`StatusCode`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::notification::NotificationSink;
use crate::error::{OpcUaResult, SessionError};
use crate::types::{
    ConnectionIdentity, CredentialKind, MonitoredItemModel, StatusCode, SubscriptionConfiguration,
};

// =============================================================================
// Request / Result types
// =============================================================================

/// Result of creating a server-side subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSubscription {
    /// Server-assigned subscription id.
    pub subscription_id: u32,
    /// Publishing interval granted by the server.
    pub revised_publishing_interval: Duration,
    /// Lifetime count granted by the server.
    pub revised_lifetime_count: u32,
    /// Keep-alive count granted by the server.
    pub revised_keep_alive_count: u32,
}

impl CreatedSubscription {
    /// A result that grants exactly what was requested.
    pub fn granted(subscription_id: u32, config: &SubscriptionConfiguration) -> Self {
        Self {
            subscription_id,
            revised_publishing_interval: config.publishing_interval,
            revised_lifetime_count: config.lifetime_count,
            revised_keep_alive_count: config.keep_alive_count,
        }
    }
}

/// One item of a create-monitored-items request.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    /// Handle the stack echoes back in [`MonitoredValue`](super::MonitoredValue)s.
    pub client_handle: u32,
    /// Desired item settings.
    pub model: MonitoredItemModel,
}

/// One item of a modify-monitored-items request.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModify {
    /// Server-assigned item id.
    pub server_handle: u32,
    /// Client handle of the item.
    pub client_handle: u32,
    /// New item settings.
    pub model: MonitoredItemModel,
}

/// Per-item result of a create or modify request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitoredItemResult {
    /// Item status. Anything but good means the item was not applied.
    pub status: StatusCode,
    /// Server-assigned item id.
    pub server_handle: u32,
    /// Sampling interval granted by the server, in milliseconds.
    pub revised_sampling_interval: f64,
    /// Queue size granted by the server.
    pub revised_queue_size: u32,
}

impl MonitoredItemResult {
    /// A good result granting the requested settings.
    pub fn good(server_handle: u32, model: &MonitoredItemModel) -> Self {
        Self {
            status: StatusCode::GOOD,
            server_handle,
            revised_sampling_interval: model.sampling_interval,
            revised_queue_size: model.queue_size,
        }
    }

    /// A failed result.
    pub fn bad(status: StatusCode) -> Self {
        Self {
            status,
            server_handle: 0,
            revised_sampling_interval: 0.0,
            revised_queue_size: 0,
        }
    }
}

// =============================================================================
// ProtocolStack / StackSession
// =============================================================================

/// Factory for sessions against remote endpoints.
#[async_trait]
pub trait ProtocolStack: Send + Sync {
    /// Opens and activates a session for the identity.
    ///
    /// Returns once the session can serve requests.
    async fn open_session(
        &self,
        identity: &ConnectionIdentity,
        token: IdentityToken,
    ) -> OpcUaResult<Arc<dyn StackSession>>;
}

/// Services available on an open session.
///
/// Instances are owned by a [`SessionHandle`](super::SessionHandle); other
/// components reach them only through
/// [`acquire_session`](super::SessionHandle::acquire_session).
#[async_trait]
pub trait StackSession: Send + Sync {
    /// Stack-assigned session id, for logging.
    fn session_id(&self) -> String;

    /// Closes the session and its channel.
    async fn close(&self) -> OpcUaResult<()>;

    /// Low-cost health probe (e.g. a read of the server state).
    async fn keep_alive(&self) -> OpcUaResult<()>;

    /// Creates a subscription. Publish results for it go to `sink`.
    async fn create_subscription(
        &self,
        config: &SubscriptionConfiguration,
        publishing_enabled: bool,
        sink: Arc<dyn NotificationSink>,
    ) -> OpcUaResult<CreatedSubscription>;

    /// Changes the parameters of an existing subscription.
    async fn modify_subscription(
        &self,
        subscription_id: u32,
        config: &SubscriptionConfiguration,
    ) -> OpcUaResult<CreatedSubscription>;

    /// Deletes a subscription and all of its items.
    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()>;

    /// Turns publishing on or off.
    async fn set_publishing_mode(&self, subscription_id: u32, enabled: bool) -> OpcUaResult<()>;

    /// Creates monitored items. Results are positional.
    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> OpcUaResult<Vec<MonitoredItemResult>>;

    /// Modifies monitored items. Results are positional.
    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemModify],
    ) -> OpcUaResult<Vec<MonitoredItemResult>>;

    /// Deletes monitored items by server handle. Results are positional.
    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        server_handles: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>>;
}

// =============================================================================
// IdentityToken
// =============================================================================

/// Identity material presented when a session is activated.
///
/// Opaque to the engine: it is resolved by a [`CredentialProvider`] and handed
/// to the stack unchanged. `Display` never prints secrets.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum IdentityToken {
    /// Anonymous.
    #[default]
    Anonymous,
    /// User name and password.
    UserName {
        /// User name.
        user: String,
        /// Password.
        password: String,
    },
    /// DER certificate and private key.
    Certificate {
        /// Certificate bytes.
        certificate: Vec<u8>,
        /// Private key bytes.
        private_key: Vec<u8>,
    },
    /// Externally issued token.
    IssuedToken {
        /// Token bytes.
        token: Vec<u8>,
    },
}

impl IdentityToken {
    /// Creates a user-name token.
    pub fn user_name(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UserName {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Kind of this token.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Anonymous => CredentialKind::Anonymous,
            Self::UserName { .. } => CredentialKind::UserName,
            Self::Certificate { .. } => CredentialKind::Certificate,
            Self::IssuedToken { .. } => CredentialKind::IssuedToken,
        }
    }

    /// Returns `true` for [`IdentityToken::Anonymous`].
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::UserName { user, .. } => write!(f, "UserName({})", user),
            Self::Certificate { certificate, .. } => {
                write!(f, "Certificate({} bytes)", certificate.len())
            }
            Self::IssuedToken { token } => write!(f, "IssuedToken({} bytes)", token.len()),
        }
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// =============================================================================
// CredentialProvider
// =============================================================================

/// Resolves the credential reference of an identity into token material.
///
/// Called on every connect attempt so rotated secrets are picked up on
/// reconnect.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolves the token for `identity`.
    async fn resolve(&self, identity: &ConnectionIdentity) -> OpcUaResult<IdentityToken>;
}

/// Provider for deployments that only use anonymous endpoints.
///
/// Identities that reference a credential are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredentials;

#[async_trait]
impl CredentialProvider for AnonymousCredentials {
    async fn resolve(&self, identity: &ConnectionIdentity) -> OpcUaResult<IdentityToken> {
        match identity.credential() {
            None => Ok(IdentityToken::Anonymous),
            Some(c) if c.kind == CredentialKind::Anonymous => Ok(IdentityToken::Anonymous),
            Some(c) => Err(SessionError::unauthorized(
                identity.endpoint_url(),
                format!("no credential material for '{}'", c),
            )
            .into()),
        }
    }
}

/// In-memory provider keyed by credential id.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: DashMap<String, IdentityToken>,
}

impl StaticCredentials {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the token for a credential id.
    pub fn insert(&self, id: impl Into<String>, token: IdentityToken) {
        self.tokens.insert(id.into(), token);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(self, id: impl Into<String>, token: IdentityToken) -> Self {
        self.insert(id, token);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, identity: &ConnectionIdentity) -> OpcUaResult<IdentityToken> {
        let Some(credential) = identity.credential() else {
            return Ok(IdentityToken::Anonymous);
        };
        let token = self
            .tokens
            .get(&credential.id)
            .map(|t| t.clone())
            .ok_or_else(|| {
                SessionError::unauthorized(
                    identity.endpoint_url(),
                    format!("unknown credential '{}'", credential),
                )
            })?;
        if token.kind() != credential.kind {
            return Err(SessionError::unauthorized(
                identity.endpoint_url(),
                format!(
                    "credential '{}' resolved to a {:?} token",
                    credential,
                    token.kind()
                ),
            )
            .into());
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialRef;

    #[test]
    fn test_identity_token_redacts_secrets() {
        let token = IdentityToken::user_name("operator", "hunter2");
        let shown = format!("{} {:?}", token, token);
        assert!(shown.contains("operator"));
        assert!(!shown.contains("hunter2"));
        assert_eq!(token.kind(), CredentialKind::UserName);
    }

    #[tokio::test]
    async fn test_anonymous_credentials() {
        let anonymous = ConnectionIdentity::new("opc.tcp://plc:4840");
        assert!(AnonymousCredentials
            .resolve(&anonymous)
            .await
            .unwrap()
            .is_anonymous());

        let named = anonymous.with_credential(CredentialRef::user_name("vault/plc"));
        let err = AnonymousCredentials.resolve(&named).await.unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let provider =
            StaticCredentials::new().with("vault/plc", IdentityToken::user_name("op", "pw"));
        let identity = ConnectionIdentity::new("opc.tcp://plc:4840")
            .with_credential(CredentialRef::user_name("vault/plc"));
        let token = provider.resolve(&identity).await.unwrap();
        assert_eq!(token, IdentityToken::user_name("op", "pw"));

        let mismatched = ConnectionIdentity::new("opc.tcp://plc:4840").with_credential(
            CredentialRef::new(CredentialKind::Certificate, "vault/plc"),
        );
        assert!(provider.resolve(&mismatched).await.is_err());

        let unknown = ConnectionIdentity::new("opc.tcp://plc:4840")
            .with_credential(CredentialRef::user_name("vault/other"));
        assert!(provider.resolve(&unknown).await.unwrap_err().is_access_denied());
    }
}
