//! Progress bar budgeting for generated scripts.
//!
//! The device shows a single bar that the script advances with
//! `show_progress <fraction> <seconds>`. Image writes get fixed reserved
//! slices; the rest is shared between patch verification, patch application
//! and the verbatim copy in proportion to the bytes each step touches.

use crate::diff::PatchFile;
use crate::script::Script;

/// Reserved share for rewriting the boot partition.
pub const BOOT_RESERVE: f64 = 0.1;
/// Reserved share for staging a new recovery image.
pub const RECOVERY_RESERVE: f64 = 0.05;
/// Reserved share for flashing the radio.
pub const RADIO_RESERVE: f64 = 0.3;

/// Share of the patched bytes spent verifying patches (the rest applies them).
const VERIFY_SHARE: f64 = 0.3;
const APPLY_SHARE: f64 = 0.7;

/// Patches are grouped this many to a `show_progress` command.
pub const PATCH_BATCH: usize = 5;

/// How much of the bar each part of an incremental update gets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressBudget {
    pub boot: f64,
    pub recovery: f64,
    pub radio: f64,
    /// What is left for verification, patching and the verbatim copy.
    pub available: f64,
    total_patched: u64,
    total_verbatim: u64,
}

impl ProgressBudget {
    pub fn new(
        updating_boot: bool,
        updating_recovery: bool,
        updating_radio: bool,
        total_patched: u64,
        total_verbatim: u64,
    ) -> Self {
        let boot = if updating_boot { BOOT_RESERVE } else { 0.0 };
        let recovery = if updating_recovery { RECOVERY_RESERVE } else { 0.0 };
        let radio = if updating_radio { RADIO_RESERVE } else { 0.0 };
        Self {
            boot,
            recovery,
            radio,
            available: 1.0 - boot - recovery - radio,
            total_patched,
            total_verbatim,
        }
    }

    // The +1 keeps the ratios finite for empty updates.
    fn denominator(&self) -> f64 {
        (self.total_patched + self.total_verbatim + 1) as f64
    }

    /// Bar share of the whole verification pass.
    pub fn verify_share(&self) -> f64 {
        self.available * VERIFY_SHARE * self.total_patched as f64 / self.denominator()
    }

    /// Bar share of the whole apply pass.
    pub fn apply_share(&self) -> f64 {
        self.available * APPLY_SHARE * self.total_patched as f64 / self.denominator()
    }

    /// Bar share of the verbatim copy, including the recovery image it carries.
    pub fn verbatim_share(&self) -> f64 {
        self.available * self.total_verbatim as f64 / self.denominator() + self.recovery
    }

    /// Fraction for a batch of patches covering `batch_bytes` of target data
    /// within a pass worth `share` of the bar.
    pub fn batch_fraction(&self, share: f64, batch_bytes: u64) -> f64 {
        batch_bytes as f64 * share / (self.total_patched + 1) as f64
    }

    /// Emits `command` for every patch, preceded by one `show_progress` per
    /// batch of [`PATCH_BATCH`] patches weighted by the batch's target bytes.
    pub fn emit_patch_pass<F>(&self, script: &mut Script, patches: &[PatchFile], share: f64, mut command: F)
    where
        F: FnMut(&mut Script, &PatchFile),
    {
        for batch in patches.chunks(PATCH_BATCH) {
            let bytes: u64 = batch.iter().map(|p| p.target_size).sum();
            script.show_progress(self.batch_fraction(share, bytes), 1);
            for patch in batch {
                command(script, patch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(size: u64) -> PatchFile {
        PatchFile {
            path: format!("system/p{}", size),
            target_sha1: String::new(),
            target_size: size,
            source_sha1: String::new(),
            source_size: size,
            patch: Vec::new(),
        }
    }

    #[test]
    fn every_share_fits_in_the_bar() {
        for (boot, recovery, radio) in [(false, false, false), (true, true, true), (true, false, true)] {
            for (patched, verbatim) in [(0, 0), (1000, 0), (0, 1000), (12345, 678)] {
                let b = ProgressBudget::new(boot, recovery, radio, patched, verbatim);
                let total = b.verify_share() + b.apply_share() + b.verbatim_share() + b.boot + b.radio;
                assert!(total <= 1.0 + 1e-6, "{:?} -> {}", b, total);
            }
        }
    }

    #[test]
    fn patch_pass_batches_progress() {
        let patches: Vec<PatchFile> = (1..=12).map(patch).collect();
        let total: u64 = patches.iter().map(|p| p.target_size).sum();
        let budget = ProgressBudget::new(false, false, false, total, 0);
        let mut script = Script::new();
        budget.emit_patch_pass(&mut script, &patches, budget.apply_share(), |s, p| s.run_program(&[&p.path]));

        let progress = script.lines().iter().filter(|l| l.starts_with("show_progress")).count();
        assert_eq!(progress, 3);
        assert_eq!(script.len(), 15);
        assert!(script.total_progress() <= budget.apply_share() + 1e-6);
    }
}
