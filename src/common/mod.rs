//! Common utilities and types module.
// Shared structs, path conventions and constants used across the build.

use serde::Serialize;
use sha1::{Digest, Sha1};

/// Prefix of system-partition entries inside a target-files archive.
pub const SYSTEM_PREFIX: &str = "SYSTEM/";
/// Root-relative name of the system partition as seen by the device.
pub const SYSTEM_ROOT: &str = "system";
/// Partition name the update script uses for the system partition.
pub const SYSTEM_PARTITION: &str = "SYSTEM:";

/// Unix file-type mask and symlink marker as stored in zip external attributes.
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// A single regular file read from the system partition of a target-files archive.
///
/// Immutable once read; the digest is computed up front so the diff planner can
/// compare trees without touching the content again.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Root-relative path, e.g. `system/bin/sh`.
    pub path: String,
    pub data: Vec<u8>,
    pub size: u64,
    /// Hex-encoded SHA-1 of `data`. The device-side patcher verifies SHA-1.
    pub sha1: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        let sha1 = sha1_hex(&data);
        Self { path: path.into(), size: data.len() as u64, data, sha1 }
    }
}

/// A symbolic link found in a system tree: where it points and where it lives.
///
/// Ordered by `(target, link)` so symlink lists sort the same way every build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SymlinkRecord {
    /// The link's content (what it points to).
    pub target: String,
    /// Script-facing location of the link, e.g. `SYSTEM:bin/ls`.
    pub link: String,
}

impl SymlinkRecord {
    pub fn new(target: impl Into<String>, link: impl Into<String>) -> Self {
        Self { target: target.into(), link: link.into() }
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// True if a Unix mode read from an archive entry marks a symbolic link.
pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Maps a root-relative path under `system` to the partition syntax used by
/// the update script: `system` becomes `SYSTEM:` and `system/x` becomes `SYSTEM:x`.
pub fn substitute_root(path: &str) -> String {
    if path == SYSTEM_ROOT {
        return SYSTEM_PARTITION.to_string();
    }
    match path.strip_prefix("system/") {
        Some(rest) => format!("{}{}", SYSTEM_PARTITION, rest),
        // Paths outside the system tree are passed through untouched.
        None => path.to_string(),
    }
}

/// Parent directory of a `/`-separated path; the root (empty path) has none.
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    })
}
