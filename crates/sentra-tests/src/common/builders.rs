// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Builders
//!
//! Fluent construction of desired item sets.

use sentra_opcua::{Deadband, MonitoredItemModel, NodeId};

// =============================================================================
// ItemSetBuilder
// =============================================================================

/// Builder for a desired monitored item set.
///
/// ```rust,ignore
/// let items = ItemSetBuilder::new()
///     .string("A", 100.0)
///     .string("B", 500.0)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ItemSetBuilder {
    items: Vec<MonitoredItemModel>,
}

impl ItemSetBuilder {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `ns=2;s=<name>` with the given sampling interval.
    pub fn string(mut self, name: &str, sampling_ms: f64) -> Self {
        self.items.push(
            MonitoredItemModel::new(NodeId::string(2, name)).with_sampling_interval(sampling_ms),
        );
        self
    }

    /// Add `ns=<ns>;i=<id>` with default sampling.
    pub fn numeric(mut self, namespace_index: u16, id: u32) -> Self {
        self.items.push(MonitoredItemModel::new(NodeId::numeric(namespace_index, id)));
        self
    }

    /// Add `count` numeric items in namespace 3, starting at `first`.
    pub fn numeric_range(mut self, first: u32, count: u32) -> Self {
        self.items.extend(
            (first..first + count).map(|i| MonitoredItemModel::new(NodeId::numeric(3, i))),
        );
        self
    }

    /// Add an absolute deadband to the last item.
    pub fn deadband(mut self, value: f64) -> Self {
        if let Some(last) = self.items.pop() {
            self.items.push(last.with_deadband(Deadband::absolute(value)));
        }
        self
    }

    /// Add a prepared item.
    pub fn item(mut self, item: MonitoredItemModel) -> Self {
        self.items.push(item);
        self
    }

    /// Number of items so far.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if no item was added.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Finish the set.
    pub fn build(self) -> Vec<MonitoredItemModel> {
        self.items
    }
}
