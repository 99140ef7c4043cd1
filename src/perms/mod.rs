//! # Permission Tree
//!
//! A [`PathRegistry`] holds the directory/file hierarchy of one system tree.
//! It is populated while the tree is walked (see
//! [`crate::archive::TargetFiles::copy_system_files`]), filled with ownership
//! facts by a single batch query to an [`OwnershipOracle`], and then handed to
//! [`PermissionPlan`] which turns it into `set_perm_recursive`/`set_perm`
//! commands.
//!
//! The registry is an explicit value owned by the caller. Each tree (target,
//! source) gets its own, so walking one tree never disturbs another.

mod subtree;

pub use subtree::{count_descendants, PermissionPlan, SubtreeAssignment, TallyKey};

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::common::parent_path;
use crate::error::{OtaError, Result};
use crate::tools::OwnershipOracle;

/// Index of a node inside its [`PathRegistry`].
pub type NodeId = usize;

/// Owner, group and permission bits of a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self { uid, gid, mode }
    }
}

/// A directory or file in the tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub path: String,
    pub is_dir: bool,
    /// Unset until [`PathRegistry::resolve_metadata`] runs.
    pub ownership: Option<Ownership>,
    pub parent: Option<NodeId>,
    /// Owned children; always empty for files.
    pub children: Vec<NodeId>,
}

/// Arena of tree nodes keyed by root-relative path.
///
/// The root is the empty path. Registering a path implicitly registers its
/// parent directories, and registering a path twice returns the same node.
#[derive(Debug, Default)]
pub struct PathRegistry {
    nodes: Vec<TreeNode>,
    index: HashMap<String, NodeId>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for `path`, creating it (and any missing ancestors) on first use.
    pub fn register(&mut self, path: &str, is_dir: bool) -> NodeId {
        if let Some(&id) = self.index.get(path) {
            // A path first seen as a leaf can later turn out to have children.
            if is_dir {
                self.nodes[id].is_dir = true;
            }
            return id;
        }

        let parent = parent_path(path).map(|p| self.register(p, true));
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            path: path.to_string(),
            is_dir: is_dir || path.is_empty(),
            ownership: None,
            parent,
            children: Vec::new(),
        });
        self.index.insert(path.to_string(), id);
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    pub fn get(&self, path: &str) -> Option<NodeId> {
        self.index.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over every registered node, root included.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes.iter().enumerate()
    }

    /// Newline-separated list of every non-root path, directories suffixed with `/`.
    pub fn oracle_request(&self) -> String {
        let mut named: Vec<&TreeNode> = self.nodes.iter().filter(|n| !n.path.is_empty()).collect();
        named.sort_by(|a, b| a.path.cmp(&b.path));

        let mut request = String::new();
        for node in named {
            let suffix = if node.is_dir { "/" } else { "" };
            let _ = writeln!(request, "{}{}", node.path, suffix);
        }
        request
    }

    /// Fills in ownership for every node with one batch query to `oracle`.
    ///
    /// Each response line must read `path uid gid mode-octal`. Unknown paths,
    /// malformed lines, and nodes the oracle leaves unanswered are all errors.
    pub fn resolve_metadata(&mut self, oracle: &dyn OwnershipOracle) -> Result<()> {
        let request = self.oracle_request();
        let response = oracle.query(&request)?;
        let malformed = |line: &str| {
            OtaError::tooling(oracle.name(), format!("malformed output line: {:?}", line))
        };

        for line in response.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, uid, gid, mode] = fields[..] else {
                return Err(malformed(line));
            };
            let name = name.trim_end_matches('/');
            let ownership = Ownership {
                uid: uid.parse().map_err(|_| malformed(line))?,
                gid: gid.parse().map_err(|_| malformed(line))?,
                mode: u32::from_str_radix(mode, 8).map_err(|_| malformed(line))?,
            };
            let id = self.get(name).ok_or_else(|| {
                OtaError::tooling(oracle.name(), format!("metadata for unregistered path '{}'", name))
            })?;
            self.nodes[id].ownership = Some(ownership);
        }

        if let Some(node) = self.nodes.iter().find(|n| !n.path.is_empty() && n.ownership.is_none()) {
            return Err(OtaError::tooling(oracle.name(), format!("no metadata returned for '{}'", node.path)));
        }

        // Children are visited in path order when commands are emitted.
        let paths: Vec<String> = self.nodes.iter().map(|n| n.path.clone()).collect();
        for node in &mut self.nodes {
            node.children.sort_by(|&a, &b| paths[a].cmp(&paths[b]));
        }
        debug!(nodes = self.nodes.len(), "resolved ownership metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::memory::TableOracle;

    #[test]
    fn register_is_idempotent_and_links_parents() {
        let mut reg = PathRegistry::new();
        let a = reg.register("system/bin/sh", false);
        let b = reg.register("system/bin/sh", false);
        assert_eq!(a, b);

        let bin = reg.get("system/bin").unwrap();
        let system = reg.get("system").unwrap();
        let root = reg.get("").unwrap();
        assert!(reg.node(bin).is_dir);
        assert_eq!(reg.node(a).parent, Some(bin));
        assert_eq!(reg.node(bin).parent, Some(system));
        assert_eq!(reg.node(system).parent, Some(root));
        assert_eq!(reg.node(root).parent, None);
        assert_eq!(reg.node(bin).children, vec![a]);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn oracle_request_suffixes_directories() {
        let mut reg = PathRegistry::new();
        reg.register("system/lib/libc.so", false);
        reg.register("system/app", true);
        assert_eq!(
            reg.oracle_request(),
            "system/\nsystem/app/\nsystem/lib/\nsystem/lib/libc.so\n"
        );
    }

    #[test]
    fn resolve_populates_every_node() {
        let mut reg = PathRegistry::new();
        reg.register("system/bin/sh", false);
        let oracle = TableOracle::new(Ownership::new(0, 2000, 0o755), Ownership::new(0, 0, 0o644))
            .with("system/bin/sh", Ownership::new(0, 2000, 0o755));
        reg.resolve_metadata(&oracle).unwrap();

        let sh = reg.get("system/bin/sh").unwrap();
        assert_eq!(reg.node(sh).ownership, Some(Ownership::new(0, 2000, 0o755)));
        let bin = reg.get("system/bin").unwrap();
        assert_eq!(reg.node(bin).ownership, Some(Ownership::new(0, 2000, 0o755)));
    }

    struct CannedOracle(&'static str);

    impl OwnershipOracle for CannedOracle {
        fn query(&self, _request: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn malformed_oracle_output_is_a_tooling_error() {
        let mut reg = PathRegistry::new();
        reg.register("system/a", false);
        let err = reg.resolve_metadata(&CannedOracle("system/ 0 0\n")).unwrap_err();
        assert!(matches!(err, OtaError::Tooling { .. }));

        let err = reg.resolve_metadata(&CannedOracle("system/ 0 0 0999\n")).unwrap_err();
        assert!(matches!(err, OtaError::Tooling { .. }));
    }

    #[test]
    fn missing_or_unknown_paths_are_tooling_errors() {
        let mut reg = PathRegistry::new();
        reg.register("system/a", false);
        let err = reg.resolve_metadata(&CannedOracle("system 0 0 755\n")).unwrap_err();
        assert!(matches!(err, OtaError::Tooling { message, .. } if message.contains("system/a")));

        let err = reg
            .resolve_metadata(&CannedOracle("system 0 0 755\nsystem/a 0 0 644\nsystem/zzz 0 0 644\n"))
            .unwrap_err();
        assert!(matches!(err, OtaError::Tooling { message, .. } if message.contains("system/zzz")));
    }
}
