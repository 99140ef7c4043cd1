//! Majority-subtree compression of ownership facts.
//!
//! For each directory we pick the one `(uid, gid, dmode, fmode)` assignment
//! that covers the most of its descendants. A `set_perm_recursive` is emitted
//! only where that assignment changes, and a `set_perm` only for nodes that
//! deviate from what is already in force. The command count therefore tracks
//! the number of deviating nodes, not the size of the tree.

use std::collections::{BTreeMap, HashMap};

use super::{NodeId, Ownership, PathRegistry};
use crate::error::{OtaError, Result};
use crate::script::Script;

/// What a single node needs: directories carry `dmode`, files carry `fmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TallyKey {
    pub uid: u32,
    pub gid: u32,
    pub dmode: Option<u32>,
    pub fmode: Option<u32>,
}

/// The assignment a single `set_perm_recursive` would apply to a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubtreeAssignment {
    pub uid: u32,
    pub gid: u32,
    pub dmode: u32,
    pub fmode: u32,
}

/// Best-subtree assignment for every directory under a root, computed once
/// per build. The tree itself is not modified.
#[derive(Debug, Clone, Default)]
pub struct PermissionPlan {
    best: HashMap<NodeId, SubtreeAssignment>,
}

fn ownership_of(registry: &PathRegistry, id: NodeId) -> Result<Ownership> {
    let node = registry.node(id);
    node.ownership
        .ok_or_else(|| OtaError::tooling("ownership oracle", format!("no metadata for '{}'", node.path)))
}

/// Tallies, for every node in the subtree rooted at `id`, the key needed to
/// cover that node alone.
pub fn count_descendants(registry: &PathRegistry, id: NodeId) -> Result<BTreeMap<TallyKey, u64>> {
    let mut scratch = HashMap::new();
    fold(registry, id, &mut scratch)
}

fn fold(
    registry: &PathRegistry,
    id: NodeId,
    best: &mut HashMap<NodeId, SubtreeAssignment>,
) -> Result<BTreeMap<TallyKey, u64>> {
    let own = ownership_of(registry, id)?;
    let mut tally = BTreeMap::new();
    tally.insert(TallyKey { uid: own.uid, gid: own.gid, dmode: Some(own.mode), fmode: None }, 1);

    for &child in &registry.node(id).children {
        if registry.node(child).is_dir {
            for (key, count) in fold(registry, child, best)? {
                *tally.entry(key).or_insert(0) += count;
            }
        } else {
            let c = ownership_of(registry, child)?;
            *tally.entry(TallyKey { uid: c.uid, gid: c.gid, dmode: None, fmode: Some(c.mode) }).or_insert(0) += 1;
        }
    }

    best.insert(id, choose_assignment(&tally));
    Ok(tally)
}

/// Picks the most common `(uid, gid)` pair (ties go to the pair that sorts
/// last), then the most common directory and file modes within that pair
/// (ties go to the mode whose key sorts last).
fn choose_assignment(tally: &BTreeMap<TallyKey, u64>) -> SubtreeAssignment {
    let mut by_owner: BTreeMap<(u32, u32), u64> = BTreeMap::new();
    for (key, count) in tally {
        *by_owner.entry((key.uid, key.gid)).or_insert(0) += count;
    }
    let (uid, gid) = by_owner
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
        .map(|(pair, _)| *pair)
        .unwrap_or((0, 0));

    let mut best_dmode = (0, 0o755);
    let mut best_fmode = (0, 0o644);
    for (key, &count) in tally {
        if (key.uid, key.gid) != (uid, gid) {
            continue;
        }
        if let Some(dmode) = key.dmode {
            if count >= best_dmode.0 {
                best_dmode = (count, dmode);
            }
        }
        if let Some(fmode) = key.fmode {
            if count >= best_fmode.0 {
                best_fmode = (count, fmode);
            }
        }
    }

    SubtreeAssignment { uid, gid, dmode: best_dmode.1, fmode: best_fmode.1 }
}

impl PermissionPlan {
    /// Computes the best-subtree assignment of every directory under `root`.
    pub fn compute(registry: &PathRegistry, root: NodeId) -> Result<Self> {
        let mut best = HashMap::new();
        fold(registry, root, &mut best)?;
        Ok(Self { best })
    }

    pub fn best_subtree(&self, id: NodeId) -> Option<SubtreeAssignment> {
        self.best.get(&id).copied()
    }

    /// Appends the commands that bring every node under `root` to its
    /// ownership. `rename` maps tree paths to script paths.
    pub fn emit<F>(&self, registry: &PathRegistry, root: NodeId, script: &mut Script, rename: F) -> Result<()>
    where
        F: Fn(&str) -> String,
    {
        self.emit_node(registry, root, None, script, &rename)
    }

    fn emit_node(
        &self,
        registry: &PathRegistry,
        id: NodeId,
        current: Option<SubtreeAssignment>,
        script: &mut Script,
        rename: &dyn Fn(&str) -> String,
    ) -> Result<()> {
        let node = registry.node(id);
        let own = ownership_of(registry, id)?;

        if node.is_dir {
            let best = self.best_subtree(id).ok_or_else(|| {
                OtaError::Configuration(format!("no permission plan for '{}'", node.path))
            })?;
            if current != Some(best) {
                script.set_perm_recursive(best.uid, best.gid, best.dmode, best.fmode, &rename(&node.path));
            }
            if (own.uid, own.gid, own.mode) != (best.uid, best.gid, best.dmode) {
                script.set_perm(own.uid, own.gid, own.mode, &rename(&node.path));
            }
            for &child in &node.children {
                self.emit_node(registry, child, Some(best), script, rename)?;
            }
        } else {
            let covered = current.map_or(false, |c| (own.uid, own.gid, own.mode) == (c.uid, c.gid, c.fmode));
            if !covered {
                script.set_perm(own.uid, own.gid, own.mode, &rename(&node.path));
            }
        }
        Ok(())
    }
}
