// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Reconciliation of desired monitored items against applied ones.
//!
//! [`diff`] is pure: it reads both sides and returns the keys to add, modify
//! and remove. Subscription handles apply the result in the order
//! remove, modify, add so that the server-side item count never spikes
//! during large reconfigurations.

use std::collections::BTreeMap;

use crate::types::{ItemKey, MonitoredItemModel};

// =============================================================================
// AppliedItem
// =============================================================================

/// A monitored item that exists on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedItem {
    /// Settings the item was created or last modified with.
    pub model: MonitoredItemModel,
    /// Server-assigned item id.
    pub server_handle: u32,
    /// Client handle used for notification routing.
    pub client_handle: u32,
    /// Sampling interval granted by the server, in milliseconds.
    pub revised_sampling_interval: f64,
}

// =============================================================================
// ItemDiff
// =============================================================================

/// Keys to reconcile, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDiff {
    /// Desired but not applied.
    pub to_add: Vec<ItemKey>,
    /// Applied with different settings, or sampling as fast as possible.
    pub to_modify: Vec<ItemKey>,
    /// Applied but no longer desired.
    pub to_remove: Vec<ItemKey>,
}

impl ItemDiff {
    /// Returns `true` when nothing needs to change.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_modify.is_empty() && self.to_remove.is_empty()
    }

    /// Total number of item operations.
    #[inline]
    pub fn total(&self) -> usize {
        self.to_add.len() + self.to_modify.len() + self.to_remove.len()
    }
}

// =============================================================================
// diff
// =============================================================================

/// Computes the operations that turn `applied` into `desired`.
pub fn diff(
    desired: &BTreeMap<ItemKey, MonitoredItemModel>,
    applied: &BTreeMap<ItemKey, AppliedItem>,
) -> ItemDiff {
    let mut result = ItemDiff::default();

    for (key, model) in desired {
        match applied.get(key) {
            None => result.to_add.push(key.clone()),
            Some(current) if needs_modify(model, &current.model) => {
                result.to_modify.push(key.clone())
            }
            Some(_) => {}
        }
    }

    result.to_remove = applied
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .cloned()
        .collect();

    result
}

/// Structural comparison of the server-visible settings.
///
/// `discard_oldest` is not compared.
fn needs_modify(desired: &MonitoredItemModel, applied: &MonitoredItemModel) -> bool {
    desired.is_fastest_sampling()
        || desired.sampling_interval != applied.sampling_interval
        || desired.queue_size != applied.queue_size
        || desired.deadband != applied.deadband
        || desired.filter != applied.filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataChangeTrigger, Deadband, ItemFilter, NodeId};

    fn model(name: &str, sampling: f64) -> MonitoredItemModel {
        MonitoredItemModel::new(NodeId::string(2, name)).with_sampling_interval(sampling)
    }

    fn desired(models: &[MonitoredItemModel]) -> BTreeMap<ItemKey, MonitoredItemModel> {
        models.iter().map(|m| (m.key(), m.clone())).collect()
    }

    fn applied(models: &[MonitoredItemModel]) -> BTreeMap<ItemKey, AppliedItem> {
        models
            .iter()
            .enumerate()
            .map(|(i, m)| {
                (
                    m.key(),
                    AppliedItem {
                        model: m.clone(),
                        server_handle: i as u32 + 100,
                        client_handle: i as u32 + 1,
                        revised_sampling_interval: m.sampling_interval,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_add_and_remove() {
        let a = model("A", 100.0);
        let b = model("B", 500.0);
        let c = model("C", 500.0);

        let result = diff(&desired(&[a.clone(), b.clone()]), &applied(&[b, c.clone()]));
        assert_eq!(result.to_add, vec![a.key()]);
        assert_eq!(result.to_remove, vec![c.key()]);
        assert!(result.to_modify.is_empty());
        assert_eq!(result.total(), 2);
    }

    #[test]
    fn test_changed_sampling_is_modify() {
        let b = model("B", 500.0);
        let result = diff(
            &desired(&[b.clone().with_sampling_interval(250.0)]),
            &applied(&[b.clone()]),
        );
        assert_eq!(result.to_modify, vec![b.key()]);
        assert!(result.to_add.is_empty() && result.to_remove.is_empty());
    }

    #[test]
    fn test_identical_sets_are_empty() {
        let items = [model("A", 100.0), model("B", 500.0)];
        assert!(diff(&desired(&items), &applied(&items)).is_empty());
    }

    #[test]
    fn test_fastest_sampling_always_modifies() {
        for sampling in [0.0, -1.0] {
            let a = model("A", sampling);
            let result = diff(&desired(&[a.clone()]), &applied(&[a.clone()]));
            assert_eq!(result.to_modify, vec![a.key()]);
        }
        let result = diff(&desired(&[model("A", 0.0)]), &BTreeMap::new());
        assert_eq!(result.to_add.len(), 1);
    }

    #[test]
    fn test_structural_filter_and_deadband() {
        let base = model("A", 100.0).with_filter(ItemFilter::DataChange {
            trigger: DataChangeTrigger::StatusValue,
        });
        let same = base.clone();
        assert!(diff(&desired(&[same]), &applied(&[base.clone()])).is_empty());

        let retriggered = base.clone().with_filter(ItemFilter::DataChange {
            trigger: DataChangeTrigger::StatusValueTimestamp,
        });
        assert_eq!(
            diff(&desired(&[retriggered]), &applied(&[base.clone()])).to_modify.len(),
            1
        );

        let deadbanded = base.clone().with_deadband(Deadband::absolute(0.5));
        assert_eq!(
            diff(&desired(&[deadbanded]), &applied(&[base.clone()])).to_modify.len(),
            1
        );

        let queue = base.clone().with_queue_size(50);
        assert_eq!(diff(&desired(&[queue]), &applied(&[base])).to_modify.len(), 1);
    }

    #[test]
    fn test_discard_policy_is_not_compared() {
        let a = model("A", 100.0);
        let flipped = a.clone().with_discard_oldest(false);
        assert!(diff(&desired(&[flipped]), &applied(&[a])).is_empty());
    }
}
