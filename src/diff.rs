//! # Diff Planner
//!
//! Decides, for every file of the target tree, whether the update ships
//! nothing (identical to the source), a binary delta, or the whole file.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::common::FileEntry;
use crate::config::VerbatimPolicy;
use crate::error::{OtaError, Result};
use crate::tools::DeltaCodec;

/// Per-file outcome of planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum DiffDecision {
    /// Same content on both sides; nothing ships.
    Identical,
    /// The full target file ships.
    Verbatim,
    /// A delta against the source file ships.
    Delta { delta_size: u64 },
}

/// A target file that ships in full.
#[derive(Debug, Clone, Serialize)]
pub struct VerbatimFile {
    pub path: String,
    pub size: u64,
}

/// A target file that ships as a delta against its source counterpart.
#[derive(Debug, Clone, Serialize)]
pub struct PatchFile {
    pub path: String,
    pub target_sha1: String,
    pub target_size: u64,
    pub source_sha1: String,
    pub source_size: u64,
    #[serde(skip)]
    pub patch: Vec<u8>,
}

/// The complete outcome of comparing two trees, in target path order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffPlan {
    pub decisions: BTreeMap<String, DiffDecision>,
    pub verbatim: Vec<VerbatimFile>,
    pub patches: Vec<PatchFile>,
    /// Largest source file that will be patched; sizes the device's scratch space.
    pub largest_source_size: u64,
    pub total_verbatim_size: u64,
    /// Sum of the target sizes of every patched file.
    pub total_patched_size: u64,
}

impl DiffPlan {
    fn push_verbatim(&mut self, entry: &FileEntry, policy: &VerbatimPolicy) -> Result<()> {
        if policy.prohibits(&entry.path) {
            return Err(OtaError::Configuration(format!("\"{}\" must not be sent verbatim", entry.path)));
        }
        debug!("send {} verbatim", entry.path);
        self.verbatim.push(VerbatimFile { path: entry.path.clone(), size: entry.size });
        self.total_verbatim_size += entry.size;
        self.decisions.insert(entry.path.clone(), DiffDecision::Verbatim);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.verbatim.is_empty() && self.patches.is_empty()
    }
}

/// Relative slack on `threshold * size`, so a delta exactly at the bound is
/// kept even when the product rounds down.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// True when a delta of `delta_len` bytes is too big to be worth shipping
/// for a file of `size` bytes.
fn exceeds_threshold(delta_len: u64, size: u64, threshold: f64) -> bool {
    let bound = size as f64 * threshold;
    delta_len as f64 > bound + bound.abs() * THRESHOLD_EPSILON
}

/// Plans the update from `source` to `target`.
///
/// A file ships verbatim when it has no source counterpart, is required
/// verbatim, or its delta is larger than `threshold` times its size. Shipping
/// a prohibited path verbatim is a configuration error.
pub fn plan(
    target: &BTreeMap<String, FileEntry>,
    source: &BTreeMap<String, FileEntry>,
    policy: &VerbatimPolicy,
    threshold: f64,
    codec: &dyn DeltaCodec,
) -> Result<DiffPlan> {
    policy.validate()?;
    let mut out = DiffPlan::default();

    for (path, tf) in target {
        let sf = match source.get(path) {
            Some(sf) if !policy.requires(path) => sf,
            _ => {
                out.push_verbatim(tf, policy)?;
                continue;
            }
        };

        if tf.sha1 == sf.sha1 {
            out.decisions.insert(path.clone(), DiffDecision::Identical);
            continue;
        }

        let patch = codec.diff(&sf.data, &tf.data)?;
        debug!(
            "{} {} {} {:.4}",
            path,
            tf.size,
            patch.len(),
            patch.len() as f64 / tf.size.max(1) as f64
        );
        if exceeds_threshold(patch.len() as u64, tf.size, threshold) {
            // The patch is almost as big as the file; don't bother patching.
            out.push_verbatim(tf, policy)?;
            continue;
        }

        out.largest_source_size = out.largest_source_size.max(sf.size);
        out.total_patched_size += tf.size;
        out.decisions.insert(path.clone(), DiffDecision::Delta { delta_size: patch.len() as u64 });
        out.patches.push(PatchFile {
            path: path.clone(),
            target_sha1: tf.sha1.clone(),
            target_size: tf.size,
            source_sha1: sf.sha1.clone(),
            source_size: sf.size,
            patch,
        });
    }

    info!(
        verbatim = out.verbatim.len(),
        patched = out.patches.len(),
        verbatim_bytes = out.total_verbatim_size,
        patched_bytes = out.total_patched_size,
        "diff plan ready"
    );
    Ok(out)
}
