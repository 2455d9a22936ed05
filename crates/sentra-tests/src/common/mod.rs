// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Common Test Utilities
//!
//! Shared fixtures, mocks and helpers for the integration suites.
//!
//! - `fixtures`: Pre-built identities, items and configurations
//! - `builders`: Builders for desired item sets
//! - `assertions`: Polling helpers and engine-specific assertions
//! - `mocks`: Mock protocol stack with fault injection and call recording
//! - `harness`: A pool wired to the mock stack

pub mod assertions;
pub mod builders;
pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use assertions::*;
pub use builders::*;
pub use fixtures::*;
pub use harness::*;
pub use mocks::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Initialize test logging. Safe to call from every test.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,sentra_opcua=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Generate a unique test ID for resource isolation.
pub fn unique_test_id() -> String {
    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("test_{}_{}", timestamp, sequence)
}

/// Create a temporary directory for test data.
pub fn temp_test_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("Failed to create temp directory")
}
