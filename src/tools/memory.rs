//! In-process stand-ins for the host tools.
//!
//! These let a whole build run without spawning anything: the pipeline tests
//! use them, and `plan --in-process` uses [`SpliceDelta`] to size deltas on
//! machines without `bsdiff`. [`SpliceDelta`] patches are not understood by
//! the device-side patcher, so packages meant for devices must use the host
//! tools.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use super::{DeltaCodec, ImageAssembler, OwnershipOracle, PackageSigner};
use crate::error::{OtaError, Result};
use crate::perms::Ownership;

/// Answers ownership queries from a table: exact paths first, then prefix
/// rules in insertion order, then a per-kind default.
#[derive(Debug, Clone)]
pub struct TableOracle {
    default_dir: Ownership,
    default_file: Ownership,
    exact: BTreeMap<String, Ownership>,
    prefixes: Vec<(String, bool, Ownership)>,
}

impl TableOracle {
    pub fn new(default_dir: Ownership, default_file: Ownership) -> Self {
        Self { default_dir, default_file, exact: BTreeMap::new(), prefixes: Vec::new() }
    }

    /// Roughly what a stock device expects: root-owned everything, with
    /// executables in `bin`/`xbin` owned by the shell group.
    pub fn android_defaults() -> Self {
        let shell = Ownership::new(0, 2000, 0o755);
        Self::new(Ownership::new(0, 0, 0o755), Ownership::new(0, 0, 0o644))
            .with("system/bin", shell)
            .with("system/xbin", shell)
            .with_prefix("system/bin/", false, shell)
            .with_prefix("system/xbin/", false, shell)
    }

    pub fn with(mut self, path: &str, ownership: Ownership) -> Self {
        self.exact.insert(path.to_string(), ownership);
        self
    }

    /// Applies `ownership` to every directory (`is_dir`) or file under `prefix`.
    pub fn with_prefix(mut self, prefix: &str, is_dir: bool, ownership: Ownership) -> Self {
        self.prefixes.push((prefix.to_string(), is_dir, ownership));
        self
    }

    pub fn lookup(&self, path: &str, is_dir: bool) -> Ownership {
        if let Some(own) = self.exact.get(path) {
            return *own;
        }
        for (prefix, dir_rule, own) in &self.prefixes {
            if *dir_rule == is_dir && path.starts_with(prefix.as_str()) {
                return *own;
            }
        }
        if is_dir {
            self.default_dir
        } else {
            self.default_file
        }
    }
}

impl OwnershipOracle for TableOracle {
    fn query(&self, request: &str) -> Result<String> {
        let mut out = String::new();
        for line in request.lines().filter(|l| !l.is_empty()) {
            let is_dir = line.ends_with('/');
            let path = line.trim_end_matches('/');
            let own = self.lookup(path, is_dir);
            let _ = writeln!(out, "{} {} {} {:o}", path, own.uid, own.gid, own.mode);
        }
        Ok(out)
    }
}

const SPLICE_MAGIC: &[u8; 4] = b"SPLC";
const SPLICE_HEADER: usize = 4 + 3 * 8;

/// Delta made of the common prefix and suffix lengths plus the differing
/// middle of the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceDelta;

impl SpliceDelta {
    pub fn apply(source: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        let bad = || OtaError::tooling("splice delta", "malformed patch");
        if patch.len() < SPLICE_HEADER || &patch[..4] != SPLICE_MAGIC {
            return Err(bad());
        }
        let field = |i: usize| -> usize {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&patch[4 + i * 8..12 + i * 8]);
            u64::from_le_bytes(raw) as usize
        };
        let (prefix, suffix, middle) = (field(0), field(1), field(2));
        if prefix + suffix > source.len() || patch.len() != SPLICE_HEADER + middle {
            return Err(bad());
        }

        let mut out = Vec::with_capacity(prefix + middle + suffix);
        out.extend_from_slice(&source[..prefix]);
        out.extend_from_slice(&patch[SPLICE_HEADER..]);
        out.extend_from_slice(&source[source.len() - suffix..]);
        Ok(out)
    }
}

impl DeltaCodec for SpliceDelta {
    fn diff(&self, source: &[u8], target: &[u8]) -> Result<Vec<u8>> {
        let limit = source.len().min(target.len());
        let prefix = source.iter().zip(target).take_while(|(a, b)| a == b).count();
        let suffix = source
            .iter()
            .rev()
            .zip(target.iter().rev())
            .take(limit - prefix)
            .take_while(|(a, b)| a == b)
            .count();
        let middle = &target[prefix..target.len() - suffix];

        let mut patch = Vec::with_capacity(SPLICE_HEADER + middle.len());
        patch.extend_from_slice(SPLICE_MAGIC);
        for n in [prefix, suffix, middle.len()] {
            patch.extend_from_slice(&(n as u64).to_le_bytes());
        }
        patch.extend_from_slice(middle);
        Ok(patch)
    }

    fn name(&self) -> &str {
        "splice delta"
    }
}

/// Concatenates every part (relative path, NUL, content) in path order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatAssembler;

impl ImageAssembler for ConcatAssembler {
    fn assemble(&self, parts_dir: &Path) -> Result<Option<Vec<u8>>> {
        if !parts_dir.join("kernel").exists() {
            return Ok(None);
        }
        let mut image = Vec::new();
        for entry in WalkDir::new(parts_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| OtaError::tooling(self.name(), e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(parts_dir).unwrap_or(entry.path());
            image.extend_from_slice(rel.to_string_lossy().as_bytes());
            image.push(0);
            image.extend(fs::read(entry.path()).map_err(|e| OtaError::io_at(e, entry.path()))?);
        }
        Ok(Some(image))
    }

    fn name(&self) -> &str {
        "concat assembler"
    }
}

/// Copies the package unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopySigner;

impl PackageSigner for CopySigner {
    fn sign(&self, unsigned: &Path, signed: &Path, _key: &str, _passphrase: Option<&str>) -> Result<()> {
        fs::copy(unsigned, signed).map_err(|e| OtaError::io_at(e, signed))?;
        Ok(())
    }
}
