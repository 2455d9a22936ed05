// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Fixtures
//!
//! Pre-built identities, items and configurations shared by the suites.

use std::time::Duration;

use sentra_opcua::{
    ConnectionIdentity, CredentialRef, EngineConfig, MonitoredItemModel, NodeId, SecurityMode,
    SecurityPolicy, SubscriptionConfiguration,
};

// =============================================================================
// Identity Fixtures
// =============================================================================

/// Connection identities.
pub struct IdentityFixtures;

impl IdentityFixtures {
    /// An anonymous, unsecured plant server.
    pub fn plant_server() -> ConnectionIdentity {
        ConnectionIdentity::new("opc.tcp://plant-server:4840")
    }

    /// A second, unrelated server.
    pub fn line_server() -> ConnectionIdentity {
        ConnectionIdentity::new("opc.tcp://line-server:4840")
    }

    /// The plant server behind a signed and encrypted channel with a named
    /// user credential.
    pub fn secured_plant_server(credential: &str) -> ConnectionIdentity {
        Self::plant_server()
            .with_security_policy(SecurityPolicy::Basic256Sha256)
            .with_security_mode(SecurityMode::SignAndEncrypt)
            .with_credential(CredentialRef::user_name(credential))
    }

    /// `count` distinct servers.
    pub fn server_batch(count: usize) -> Vec<ConnectionIdentity> {
        (0..count)
            .map(|i| ConnectionIdentity::new(format!("opc.tcp://server-{:03}:4840", i)))
            .collect()
    }
}

// =============================================================================
// Item Fixtures
// =============================================================================

/// Monitored item definitions.
pub struct ItemFixtures;

impl ItemFixtures {
    /// `ns=2;s=A` sampled every 100 ms.
    pub fn item_a() -> MonitoredItemModel {
        Self::named("A", 100.0)
    }

    /// `ns=2;s=B` sampled every 500 ms.
    pub fn item_b() -> MonitoredItemModel {
        Self::named("B", 500.0)
    }

    /// `ns=2;s=C` sampled every 500 ms.
    pub fn item_c() -> MonitoredItemModel {
        Self::named("C", 500.0)
    }

    /// A string node in namespace 2.
    pub fn named(name: &str, sampling_ms: f64) -> MonitoredItemModel {
        MonitoredItemModel::new(NodeId::string(2, name)).with_sampling_interval(sampling_ms)
    }

    /// `count` numeric items `ns=3;i=1..=count`.
    pub fn batch(count: u32) -> Vec<MonitoredItemModel> {
        (1..=count)
            .map(|i| MonitoredItemModel::new(NodeId::numeric(3, i)).with_sampling_interval(250.0))
            .collect()
    }
}

// =============================================================================
// Config Fixtures
// =============================================================================

/// Engine and subscription configurations.
pub struct ConfigFixtures;

impl ConfigFixtures {
    /// Timings short enough that keep-alive loss and reconnect happen well
    /// within a test.
    pub fn fast_engine() -> EngineConfig {
        Self::fast_builder()
            .build()
            .expect("fast engine config must be valid")
    }

    /// Builder preloaded with [`fast_engine`](Self::fast_engine) timings.
    pub fn fast_builder() -> sentra_opcua::config::EngineConfigBuilder {
        EngineConfig::builder()
            .keep_alive_interval(Duration::from_millis(40))
            .keep_alive_timeout(Duration::from_millis(20))
            .max_keep_alive_failures(3)
            .reconnect_delays(Duration::from_millis(10), Duration::from_millis(50))
            .reconnect_jitter(0.0)
            .acquire_max_wait(Duration::from_secs(5))
    }

    /// One-second publishing.
    pub fn default_subscription() -> SubscriptionConfiguration {
        SubscriptionConfiguration::default()
    }

    /// Fast publishing for notification tests.
    pub fn fast_subscription() -> SubscriptionConfiguration {
        SubscriptionConfiguration::with_interval(Duration::from_millis(100))
    }
}
