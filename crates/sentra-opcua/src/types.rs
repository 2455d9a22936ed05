// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Data model shared by the session pool and subscription handles.
//!
//! - **NodeId / AttributeId / ItemKey**: addressing of monitored data points
//! - **SecurityMode / SecurityPolicy / CredentialRef**: endpoint security
//! - **ConnectionIdentity**: the pool key
//! - **MonitoredItemModel / SubscriptionConfiguration**: desired state
//! - **ConnectivityState / StatusCode / OperationContext**: runtime status
//!
//! # Examples
//!
//! ```
//! use sentra_opcua::types::{ConnectionIdentity, MonitoredItemModel, NodeId, SecurityMode};
//!
//! let identity = ConnectionIdentity::new("opc.tcp://PLC-01:4840/")
//!     .with_security_mode(SecurityMode::Sign);
//! assert_eq!(identity.endpoint_url(), "opc.tcp://plc-01:4840");
//!
//! let item = MonitoredItemModel::new(NodeId::string(2, "Line1.Speed"))
//!     .with_sampling_interval(100.0);
//! assert_eq!(item.key().node_id.to_string(), "ns=2;s=Line1.Speed");
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, OpcUaError, OpcUaResult};

// =============================================================================
// NodeId
// =============================================================================

/// OPC UA node identifier: a namespace index plus an identifier.
///
/// ```
/// use sentra_opcua::types::NodeId;
///
/// let parsed: NodeId = "ns=3;i=1001".parse().unwrap();
/// assert_eq!(parsed, NodeId::numeric(3, 1001));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 = OPC UA standard namespace).
    pub namespace_index: u16,

    /// The identifier within the namespace.
    pub identifier: NodeIdentifier,
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// Creates an opaque (byte string) node ID.
    #[inline]
    pub fn opaque(namespace_index: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Opaque(value.into()),
        }
    }

    /// Returns `true` for the null node (`ns=0;i=0`).
    pub fn is_null(&self) -> bool {
        self.namespace_index == 0 && self.identifier == NodeIdentifier::Numeric(0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_index == 0 {
            write!(f, "{}", self.identifier)
        } else {
            write!(f, "ns={};{}", self.namespace_index, self.identifier)
        }
    }
}

impl FromStr for NodeId {
    type Err = OpcUaError;

    /// Parses `ns=<n>;<t>=<value>` or `<t>=<value>` where `t` is one of
    /// `i`, `s`, `g`, `b`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid =
            |reason: &str| -> OpcUaError { ConfigurationError::invalid_node_id(s, reason).into() };

        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("missing identifier after namespace"))?;
                let ns: u16 = ns.parse().map_err(|_| invalid("invalid namespace index"))?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier_part.strip_prefix("i=") {
            NodeIdentifier::Numeric(id.parse().map_err(|_| invalid("invalid numeric identifier"))?)
        } else if let Some(id) = identifier_part.strip_prefix("s=") {
            if id.is_empty() {
                return Err(invalid("empty string identifier"));
            }
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier_part.strip_prefix("g=") {
            NodeIdentifier::Guid(Uuid::parse_str(id).map_err(|_| invalid("invalid GUID"))?)
        } else if let Some(id) = identifier_part.strip_prefix("b=") {
            NodeIdentifier::Opaque(BASE64.decode(id).map_err(|_| invalid("invalid base64"))?)
        } else {
            return Err(invalid("expected one of i=, s=, g=, b="));
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

/// The four identifier kinds of an OPC UA node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
    /// Opaque byte string identifier.
    Opaque(Vec<u8>),
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={}", v),
            Self::String(v) => write!(f, "s={}", v),
            Self::Guid(v) => write!(f, "g={}", v),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// AttributeId
// =============================================================================

/// Numeric OPC UA attribute id. Monitored items almost always use [`AttributeId::VALUE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeId(pub u32);

impl AttributeId {
    /// The `NodeId` attribute.
    pub const NODE_ID: Self = Self(1);
    /// The `DisplayName` attribute.
    pub const DISPLAY_NAME: Self = Self(4);
    /// The `EventNotifier` attribute, used by event monitored items.
    pub const EVENT_NOTIFIER: Self = Self(12);
    /// The `Value` attribute.
    pub const VALUE: Self = Self(13);

    /// Returns `true` if the id is within the range defined by OPC UA Part 6.
    pub const fn is_valid(&self) -> bool {
        self.0 >= 1 && self.0 <= 27
    }
}

impl Default for AttributeId {
    fn default() -> Self {
        Self::VALUE
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::VALUE => write!(f, "Value"),
            Self::EVENT_NOTIFIER => write!(f, "EventNotifier"),
            Self::DISPLAY_NAME => write!(f, "DisplayName"),
            Self::NODE_ID => write!(f, "NodeId"),
            Self(other) => write!(f, "Attribute({})", other),
        }
    }
}

// =============================================================================
// ItemKey
// =============================================================================

/// Identity of a monitored item within one subscription: node id + attribute id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    /// Monitored node.
    pub node_id: NodeId,
    /// Monitored attribute.
    pub attribute_id: AttributeId,
}

impl ItemKey {
    /// Creates a key for the given node and attribute.
    pub fn new(node_id: NodeId, attribute_id: AttributeId) -> Self {
        Self {
            node_id,
            attribute_id,
        }
    }

    /// Creates a key for the `Value` attribute of a node.
    pub fn value(node_id: NodeId) -> Self {
        Self::new(node_id, AttributeId::VALUE)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_id, self.attribute_id)
    }
}

// =============================================================================
// SecurityMode
// =============================================================================

/// OPC UA message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Messages are neither signed nor encrypted.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = OpcUaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" | "signencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(ConfigurationError::invalid_security(s).into()),
        }
    }
}

// =============================================================================
// SecurityPolicy
// =============================================================================

/// OPC UA security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security.
    #[default]
    None,
    /// Basic128Rsa15 (deprecated).
    Basic128Rsa15,
    /// Basic256 (deprecated).
    Basic256,
    /// Basic256Sha256.
    Basic256Sha256,
    /// Aes128_Sha256_RsaOaep.
    Aes128Sha256RsaOaep,
    /// Aes256_Sha256_RsaPss.
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    /// Returns the policy URI sent to the server.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic128Rsa15 => "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
            Self::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
            Self::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            Self::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
        }
    }

    /// Returns the short name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Basic128Rsa15 => "Basic128Rsa15",
            Self::Basic256 => "Basic256",
            Self::Basic256Sha256 => "Basic256Sha256",
            Self::Aes128Sha256RsaOaep => "Aes128Sha256RsaOaep",
            Self::Aes256Sha256RsaPss => "Aes256Sha256RsaPss",
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityPolicy {
    type Err = OpcUaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('#').next().unwrap_or(s);
        match name.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "basic128rsa15" => Ok(Self::Basic128Rsa15),
            "basic256" => Ok(Self::Basic256),
            "basic256sha256" => Ok(Self::Basic256Sha256),
            "aes128sha256rsaoaep" => Ok(Self::Aes128Sha256RsaOaep),
            "aes256sha256rsapss" => Ok(Self::Aes256Sha256RsaPss),
            _ => Err(ConfigurationError::invalid_security(s).into()),
        }
    }
}

// =============================================================================
// CredentialRef
// =============================================================================

/// Kind of user identity presented when a session is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Anonymous identity.
    #[default]
    Anonymous,
    /// User name and password.
    UserName,
    /// X.509 user certificate.
    Certificate,
    /// Externally issued token.
    IssuedToken,
}

/// Reference to credential material held by a
/// [`CredentialProvider`](crate::client::CredentialProvider).
///
/// Only the reference takes part in identity equality; secrets never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Kind of credential.
    pub kind: CredentialKind,
    /// Provider-specific lookup key (e.g. a vault entry name).
    pub id: String,
}

impl CredentialRef {
    /// Creates a credential reference.
    pub fn new(kind: CredentialKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Creates a user-name credential reference.
    pub fn user_name(id: impl Into<String>) -> Self {
        Self::new(CredentialKind::UserName, id)
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

// =============================================================================
// ConnectionIdentity
// =============================================================================

/// Key of the session pool: endpoint, security and credential.
///
/// The endpoint URL is normalised on construction (scheme and authority
/// lower-cased, trailing `/` removed) so that trivially different spellings
/// of one endpoint share a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionIdentity {
    endpoint_url: String,
    security_policy: SecurityPolicy,
    security_mode: SecurityMode,
    credential: Option<CredentialRef>,
}

impl ConnectionIdentity {
    /// Creates an anonymous, unsecured identity for the endpoint.
    pub fn new(endpoint_url: impl AsRef<str>) -> Self {
        Self {
            endpoint_url: normalize_endpoint(endpoint_url.as_ref()),
            security_policy: SecurityPolicy::None,
            security_mode: SecurityMode::None,
            credential: None,
        }
    }

    /// Sets the security policy.
    pub fn with_security_policy(mut self, policy: SecurityPolicy) -> Self {
        self.security_policy = policy;
        self
    }

    /// Sets the security mode.
    pub fn with_security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    /// Sets the credential reference.
    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Normalised endpoint URL.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Security policy.
    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    /// Security mode.
    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// Credential reference, if any.
    pub fn credential(&self) -> Option<&CredentialRef> {
        self.credential.as_ref()
    }

    /// Stable textual fingerprint, suitable for logs and external keys.
    pub fn fingerprint(&self) -> String {
        let credential = self
            .credential
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "anonymous".to_string());
        format!(
            "{}|{}|{}|{}",
            self.endpoint_url, self.security_policy, self.security_mode, credential
        )
    }

    /// Checks that the endpoint is usable and the security settings agree.
    pub fn validate(&self) -> OpcUaResult<()> {
        let Some((scheme, rest)) = self.endpoint_url.split_once("://") else {
            return Err(ConfigurationError::invalid_value(
                "endpoint_url",
                format!("'{}' has no scheme", self.endpoint_url),
            )
            .into());
        };
        if !matches!(scheme, "opc.tcp" | "opc.https" | "opc.wss" | "https") {
            return Err(ConfigurationError::invalid_value(
                "endpoint_url",
                format!("unsupported scheme '{}'", scheme),
            )
            .into());
        }
        if rest.is_empty() {
            return Err(
                ConfigurationError::invalid_value("endpoint_url", "missing host").into(),
            );
        }
        let secured_mode = self.security_mode != SecurityMode::None;
        let secured_policy = self.security_policy != SecurityPolicy::None;
        if secured_mode != secured_policy {
            return Err(ConfigurationError::invalid_value(
                "security",
                format!(
                    "policy {} is incompatible with mode {}",
                    self.security_policy, self.security_mode
                ),
            )
            .into());
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}]",
            self.endpoint_url, self.security_policy, self.security_mode
        )
    }
}

fn normalize_endpoint(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let (authority, path) = match rest.find('/') {
                Some(idx) => rest.split_at(idx),
                None => (rest, ""),
            };
            format!(
                "{}://{}{}",
                scheme.to_ascii_lowercase(),
                authority.to_ascii_lowercase(),
                path
            )
        }
        None => url.to_string(),
    }
}

// =============================================================================
// Deadband / Filter
// =============================================================================

/// Deadband applied by the server before reporting a data change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Deadband {
    /// Report when the change exceeds an absolute amount.
    Absolute {
        /// Absolute threshold.
        value: f64,
    },
    /// Report when the change exceeds a percentage of the EU range.
    Percent {
        /// Percentage (0-100).
        percent: f64,
    },
}

impl Deadband {
    /// Creates an absolute deadband.
    pub fn absolute(value: f64) -> Self {
        Self::Absolute { value }
    }

    /// Creates a percent deadband.
    pub fn percent(percent: f64) -> Self {
        Self::Percent { percent }
    }
}

/// What constitutes a reportable change for a data-change item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataChangeTrigger {
    /// Status changes only.
    Status,
    /// Status or value changes.
    #[default]
    StatusValue,
    /// Status, value or source timestamp changes.
    StatusValueTimestamp,
}

/// Monitoring filter attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemFilter {
    /// Data-change filter with a trigger.
    DataChange {
        /// Reporting trigger.
        trigger: DataChangeTrigger,
    },
    /// Event filter selecting the given browse paths.
    Event {
        /// Selected event fields.
        select_clauses: Vec<String>,
    },
}

// =============================================================================
// MonitoredItemModel
// =============================================================================

/// Desired configuration of one monitored item.
///
/// `sampling_interval` is in milliseconds as in OPC UA; zero or negative means
/// "as fast as the server allows".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModel {
    /// Monitored node.
    pub node_id: NodeId,

    /// Monitored attribute.
    #[serde(default)]
    pub attribute_id: AttributeId,

    /// Sampling interval in milliseconds.
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval: f64,

    /// Server-side queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,

    /// Discard the oldest value when the queue overflows.
    #[serde(default = "default_true")]
    pub discard_oldest: bool,

    /// Optional deadband.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadband: Option<Deadband>,

    /// Optional monitoring filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ItemFilter>,
}

fn default_sampling_interval() -> f64 {
    250.0
}

fn default_queue_size() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl MonitoredItemModel {
    /// Creates a value item with default sampling settings.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::VALUE,
            sampling_interval: default_sampling_interval(),
            queue_size: default_queue_size(),
            discard_oldest: true,
            deadband: None,
            filter: None,
        }
    }

    /// Sets the attribute.
    pub fn with_attribute(mut self, attribute_id: AttributeId) -> Self {
        self.attribute_id = attribute_id;
        self
    }

    /// Sets the sampling interval in milliseconds.
    pub fn with_sampling_interval(mut self, millis: f64) -> Self {
        self.sampling_interval = millis;
        self
    }

    /// Sets the queue size.
    pub fn with_queue_size(mut self, queue_size: u32) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the discard policy.
    pub fn with_discard_oldest(mut self, discard_oldest: bool) -> Self {
        self.discard_oldest = discard_oldest;
        self
    }

    /// Sets the deadband.
    pub fn with_deadband(mut self, deadband: Deadband) -> Self {
        self.deadband = Some(deadband);
        self
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: ItemFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Returns this item's key.
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.node_id.clone(), self.attribute_id)
    }

    /// Returns `true` when the server should sample as fast as it can.
    #[inline]
    pub fn is_fastest_sampling(&self) -> bool {
        self.sampling_interval <= 0.0 || self.sampling_interval.is_nan()
    }

    /// Validates the item in isolation.
    pub fn validate(&self) -> OpcUaResult<()> {
        if self.node_id.is_null() {
            return Err(ConfigurationError::invalid_node_id(
                self.node_id.to_string(),
                "null node cannot be monitored",
            )
            .into());
        }
        if !self.attribute_id.is_valid() {
            return Err(ConfigurationError::invalid_value(
                "attribute_id",
                format!("{} is outside 1..=27", self.attribute_id.0),
            )
            .into());
        }
        if let Some(Deadband::Percent { percent }) = self.deadband {
            if !(0.0..=100.0).contains(&percent) {
                return Err(ConfigurationError::invalid_value(
                    "deadband.percent",
                    format!("{} is outside 0..=100", percent),
                )
                .into());
            }
        }
        Ok(())
    }
}

// =============================================================================
// SubscriptionConfiguration
// =============================================================================

/// Server-side parameters of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfiguration {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Publishing intervals without data before a keep-alive is sent.
    #[serde(default = "default_keep_alive_count")]
    pub keep_alive_count: u32,

    /// Publishing intervals without a publish request before the server
    /// deletes the subscription.
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Maximum notifications per publish response (0 = unlimited).
    #[serde(default)]
    pub max_notifications_per_publish: u32,

    /// Relative priority among subscriptions of one session.
    #[serde(default)]
    pub priority: u8,
}

fn default_publishing_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_keep_alive_count() -> u32 {
    10
}

fn default_lifetime_count() -> u32 {
    60
}

impl Default for SubscriptionConfiguration {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            keep_alive_count: default_keep_alive_count(),
            lifetime_count: default_lifetime_count(),
            max_notifications_per_publish: 0,
            priority: 0,
        }
    }
}

impl SubscriptionConfiguration {
    /// Configuration with a custom publishing interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            publishing_interval: interval,
            ..Default::default()
        }
    }

    /// Validates the OPC UA relationships between the counters.
    pub fn validate(&self) -> OpcUaResult<()> {
        if self.publishing_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "publishing_interval",
                "must be greater than zero",
            )
            .into());
        }
        if self.keep_alive_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "keep_alive_count",
                "must be greater than zero",
            )
            .into());
        }
        if self.lifetime_count < self.keep_alive_count.saturating_mul(3) {
            return Err(ConfigurationError::invalid_value(
                "lifetime_count",
                format!(
                    "{} must be at least three times keep_alive_count ({})",
                    self.lifetime_count, self.keep_alive_count
                ),
            )
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// ConnectivityState
// =============================================================================

/// Connectivity of a session as seen by its subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// A connect attempt is in progress.
    #[default]
    Connecting,
    /// The session is open and healthy.
    Connected,
    /// The session was lost or closed.
    Disconnected,
    /// The server rejected the identity.
    Unauthorized,
    /// The last connect attempt failed.
    Error,
}

impl ConnectivityState {
    /// Returns `true` only for [`ConnectivityState::Connected`].
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns the state name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Unauthorized => "unauthorized",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code as returned by the protocol stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: Self = Self(0);
    /// BadCommunicationError.
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    /// BadTimeout.
    pub const BAD_TIMEOUT: Self = Self(0x800A_0000);
    /// BadShutdown.
    pub const BAD_SHUTDOWN: Self = Self(0x800C_0000);
    /// BadServerNotConnected.
    pub const BAD_SERVER_NOT_CONNECTED: Self = Self(0x800D_0000);
    /// BadTooManyMonitoredItems.
    pub const BAD_TOO_MANY_MONITORED_ITEMS: Self = Self(0x80DB_0000);
    /// BadUserAccessDenied.
    pub const BAD_USER_ACCESS_DENIED: Self = Self(0x801F_0000);
    /// BadIdentityTokenRejected.
    pub const BAD_IDENTITY_TOKEN_REJECTED: Self = Self(0x8021_0000);
    /// BadSessionIdInvalid.
    pub const BAD_SESSION_ID_INVALID: Self = Self(0x8025_0000);
    /// BadSessionClosed.
    pub const BAD_SESSION_CLOSED: Self = Self(0x8026_0000);
    /// BadSubscriptionIdInvalid.
    pub const BAD_SUBSCRIPTION_ID_INVALID: Self = Self(0x8028_0000);
    /// BadNodeIdUnknown.
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// BadAttributeIdInvalid.
    pub const BAD_ATTRIBUTE_ID_INVALID: Self = Self(0x8035_0000);
    /// BadMonitoredItemIdInvalid.
    pub const BAD_MONITORED_ITEM_ID_INVALID: Self = Self(0x8042_0000);
    /// BadMonitoredItemFilterUnsupported.
    pub const BAD_FILTER_UNSUPPORTED: Self = Self(0x8044_0000);
    /// BadConnectionClosed.
    pub const BAD_CONNECTION_CLOSED: Self = Self(0x80AE_0000);

    /// Returns `true` when the severity bits are Good.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` when the severity bits are Bad.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Returns `true` for codes that mean the channel or session is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            *self,
            Self::BAD_CONNECTION_CLOSED
                | Self::BAD_SERVER_NOT_CONNECTED
                | Self::BAD_SESSION_CLOSED
                | Self::BAD_SESSION_ID_INVALID
                | Self::BAD_SHUTDOWN
        )
    }

    /// Returns `true` for codes that mean the identity was refused.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            *self,
            Self::BAD_USER_ACCESS_DENIED | Self::BAD_IDENTITY_TOKEN_REJECTED
        )
    }

    /// Symbolic name for the well-known codes.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::GOOD => "Good",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_SHUTDOWN => "BadShutdown",
            Self::BAD_SERVER_NOT_CONNECTED => "BadServerNotConnected",
            Self::BAD_TOO_MANY_MONITORED_ITEMS => "BadTooManyMonitoredItems",
            Self::BAD_USER_ACCESS_DENIED => "BadUserAccessDenied",
            Self::BAD_IDENTITY_TOKEN_REJECTED => "BadIdentityTokenRejected",
            Self::BAD_SESSION_ID_INVALID => "BadSessionIdInvalid",
            Self::BAD_SESSION_CLOSED => "BadSessionClosed",
            Self::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_ATTRIBUTE_ID_INVALID => "BadAttributeIdInvalid",
            Self::BAD_MONITORED_ITEM_ID_INVALID => "BadMonitoredItemIdInvalid",
            Self::BAD_FILTER_UNSUPPORTED => "BadMonitoredItemFilterUnsupported",
            Self::BAD_CONNECTION_CLOSED => "BadConnectionClosed",
            _ if self.is_good() => "Good",
            _ if self.is_bad() => "Bad",
            _ => "Uncertain",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

// =============================================================================
// OperationContext
// =============================================================================

/// Audit metadata attached to state-changing calls.
///
/// The engine only records it in log fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Who requested the change.
    pub author: Option<String>,
    /// When the change was requested.
    pub timestamp: DateTime<Utc>,
    /// Correlation id for tracing the change across services.
    pub correlation_id: Uuid,
}

impl OperationContext {
    /// Context for a change requested by `author` now.
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: Some(author.into()),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Context for engine-internal operations such as reconnect replay.
    pub fn system() -> Self {
        Self {
            author: None,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Author name for log fields.
    pub fn author_or_system(&self) -> &str {
        self.author.as_deref().unwrap_or("system")
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::system()
    }
}

// =============================================================================
// Tests
// =============================================================================
