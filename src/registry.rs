// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Frozen view of the validated target list.
//!
//! Built once at boot and shared read-only by every worker. Slot indices match
//! the order of the validated configuration, which is also the column order
//! of the counter table.

use crate::config::{validate_targets, ReplicationTarget};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable, cheaply clonable target list.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Arc<[ReplicationTarget]>,
    by_name: Arc<HashMap<String, usize>>,
}

impl TargetRegistry {
    /// Freeze a target list, validating it first.
    ///
    /// Validation is idempotent, so an already validated list passes through
    /// unchanged. On duplicate names the first slot wins for name lookups.
    pub fn new(mut targets: Vec<ReplicationTarget>) -> Self {
        validate_targets(&mut targets);
        let mut by_name = HashMap::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            by_name.entry(target.name.clone()).or_insert(index);
        }
        Self {
            targets: targets.into(),
            by_name: Arc::new(by_name),
        }
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no target survived validation.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Target at a slot index.
    pub fn get(&self, index: usize) -> Option<&ReplicationTarget> {
        self.targets.get(index)
    }

    /// Slot index of a named target.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Target by name.
    pub fn by_name(&self, name: &str) -> Option<&ReplicationTarget> {
        self.index_of(name).and_then(|i| self.targets.get(i))
    }

    /// All targets in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicationTarget> {
        self.targets.iter()
    }

    /// Target names in slot order.
    pub fn names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }
}
