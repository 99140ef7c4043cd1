//! Symlink reconciliation between a source and a target tree.
//!
//! The device's `symlink` command does not overwrite, so every link that
//! changes is deleted first and recreated.

use std::collections::HashMap;

use serde::Serialize;

use crate::common::SymlinkRecord;

/// What the update has to do with symlinks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SymlinkPlan {
    /// Link paths to remove: source links absent from the target, then target
    /// links whose destination changed.
    pub to_delete: Vec<String>,
    /// Links to create, new or changed, in target order.
    pub to_create: Vec<SymlinkRecord>,
}

impl SymlinkPlan {
    /// Applies the plan to a `link -> target` map, as the device would.
    pub fn apply_to(&self, links: &mut HashMap<String, String>) {
        for link in &self.to_delete {
            links.remove(link);
        }
        for s in &self.to_create {
            links.insert(s.link.clone(), s.target.clone());
        }
    }
}

/// Computes the deletions and creations that turn `source` links into `target` links.
pub fn reconcile(source: &[SymlinkRecord], target: &[SymlinkRecord]) -> SymlinkPlan {
    let source_map: HashMap<&str, &str> = source.iter().map(|s| (s.link.as_str(), s.target.as_str())).collect();
    let target_map: HashMap<&str, &str> = target.iter().map(|s| (s.link.as_str(), s.target.as_str())).collect();

    let mut to_delete: Vec<String> = source
        .iter()
        .filter(|s| !target_map.contains_key(s.link.as_str()))
        .map(|s| s.link.clone())
        .collect();

    let to_create: Vec<SymlinkRecord> = target
        .iter()
        .filter(|t| source_map.get(t.link.as_str()).map_or(true, |dest| *dest != t.target))
        .cloned()
        .collect();

    to_delete.extend(
        to_create
            .iter()
            .filter(|t| source_map.contains_key(t.link.as_str()))
            .map(|t| t.link.clone()),
    );

    SymlinkPlan { to_delete, to_create }
}
