// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Engine configuration.
//!
//! [`EngineConfig`] is passed explicitly into the pool; nothing is read from
//! global state. It can be built in code or loaded from YAML/TOML.
//!
//! ```yaml
//! keep_alive:
//!   interval: 5s
//!   timeout: 2s
//!   max_failures: 3
//! reconnect:
//!   initial_delay: 500ms
//!   max_delay: 30s
//!   multiplier: 2.0
//!   jitter: 0.2
//! acquire:
//!   max_wait: 1m        # omit for unbounded
//! subscription:
//!   notification_capacity: 1024
//! logging:
//!   level: info
//!   format: json
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ExponentialBackoff;
use crate::error::{ConfigurationError, OpcUaResult};
use crate::logging::LoggingConfig;
use crate::types::SubscriptionConfiguration;

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration of the session and subscription engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Keep-alive probing of connected sessions.
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Waiting for a connected session.
    #[serde(default)]
    pub acquire: AcquireConfig,

    /// Subscription handle defaults.
    #[serde(default)]
    pub subscription: SubscriptionDefaults,

    /// Logging setup for embedding processes.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Creates a builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates every section.
    pub fn validate(&self) -> OpcUaResult<()> {
        self.keep_alive.validate()?;
        self.reconnect.validate()?;
        if let Some(max_wait) = self.acquire.max_wait {
            if max_wait.is_zero() {
                return Err(ConfigurationError::invalid_value(
                    "acquire.max_wait",
                    "must be greater than zero; omit for unbounded",
                )
                .into());
            }
        }
        if self.subscription.notification_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "subscription.notification_capacity",
                "must be greater than zero",
            )
            .into());
        }
        self.subscription.defaults.validate()?;
        self.logging.validate()
    }

    /// Loads and validates a YAML, TOML or JSON file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> OpcUaResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            _ => {
                return Err(ConfigurationError::UnsupportedFormat {
                    path: path.to_path_buf(),
                }
                .into())
            }
        };
        tracing::debug!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Parses and validates YAML.
    pub fn from_yaml_str(content: &str) -> OpcUaResult<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigurationError::parse("YAML", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates TOML.
    pub fn from_toml_str(content: &str) -> OpcUaResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigurationError::parse("TOML", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates JSON.
    pub fn from_json_str(content: &str) -> OpcUaResult<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigurationError::parse("JSON", e))?;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// KeepAliveConfig
// =============================================================================

/// Keep-alive probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Delay between probes.
    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout of a single probe. A timed-out probe counts as a failure.
    #[serde(default = "default_keep_alive_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before the session is declared lost.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_keep_alive_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_failures() -> u32 {
    3
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: default_keep_alive_interval(),
            timeout: default_keep_alive_timeout(),
            max_failures: default_max_failures(),
        }
    }
}

impl KeepAliveConfig {
    fn validate(&self) -> OpcUaResult<()> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "keep_alive",
                "interval and timeout must be greater than zero",
            )
            .into());
        }
        if self.max_failures == 0 {
            return Err(ConfigurationError::invalid_value(
                "keep_alive.max_failures",
                "must be at least 1",
            )
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// ReconnectConfig
// =============================================================================

/// Reconnect backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Backoff cap.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Attempts before the handle gives up. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Backoff calculator for this policy.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay)
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter)
    }

    fn validate(&self) -> OpcUaResult<()> {
        if self.initial_delay.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "reconnect.initial_delay",
                "must be greater than zero",
            )
            .into());
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigurationError::invalid_value(
                "reconnect.max_delay",
                format!(
                    "{:?} is below initial_delay {:?}",
                    self.max_delay, self.initial_delay
                ),
            )
            .into());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "reconnect.multiplier",
                "must be a finite value >= 1.0",
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigurationError::invalid_value(
                "reconnect.jitter",
                "must be within 0.0..=1.0",
            )
            .into());
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "reconnect.max_attempts",
                "must be at least 1; omit for unbounded",
            )
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// AcquireConfig
// =============================================================================

/// Waiting for a connected session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Maximum time `acquire_session` waits. `None` waits until canceled.
    #[serde(default, with = "humantime_serde::option")]
    pub max_wait: Option<Duration>,
}

// =============================================================================
// SubscriptionDefaults
// =============================================================================

/// Defaults for subscription handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDefaults {
    /// Capacity of each handle's notification broadcast channel.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Configuration used until the first `apply` supplies one.
    #[serde(default)]
    pub defaults: SubscriptionConfiguration,
}

fn default_notification_capacity() -> usize {
    1024
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            notification_capacity: default_notification_capacity(),
            defaults: SubscriptionConfiguration::default(),
        }
    }
}

// =============================================================================
// EngineConfigBuilder
// =============================================================================

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the keep-alive probe interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive.interval = interval;
        self
    }

    /// Sets the keep-alive probe timeout.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive.timeout = timeout;
        self
    }

    /// Sets the failures tolerated before a session is declared lost.
    pub fn max_keep_alive_failures(mut self, failures: u32) -> Self {
        self.config.keep_alive.max_failures = failures;
        self
    }

    /// Sets the reconnect backoff bounds.
    pub fn reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect.initial_delay = initial;
        self.config.reconnect.max_delay = max;
        self
    }

    /// Sets the reconnect multiplier.
    pub fn reconnect_multiplier(mut self, multiplier: f64) -> Self {
        self.config.reconnect.multiplier = multiplier;
        self
    }

    /// Sets the reconnect jitter fraction.
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.config.reconnect.jitter = jitter;
        self
    }

    /// Limits reconnect attempts.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = Some(attempts);
        self
    }

    /// Bounds `acquire_session` waits.
    pub fn acquire_max_wait(mut self, max_wait: Duration) -> Self {
        self.config.acquire.max_wait = Some(max_wait);
        self
    }

    /// Sets the notification channel capacity.
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.config.subscription.notification_capacity = capacity;
        self
    }

    /// Sets the default subscription configuration.
    pub fn default_subscription(mut self, defaults: SubscriptionConfiguration) -> Self {
        self.config.subscription.defaults = defaults;
        self
    }

    /// Sets the logging section.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> OpcUaResult<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// =============================================================================
// Tests
// =============================================================================
