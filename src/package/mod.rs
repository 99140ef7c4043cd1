//! # Package Assembler
//!
//! Turns one target-files archive (full mode) or a target/source pair
//! (incremental mode) into an update package: the generated script plus
//! every payload entry it references.
//!
//! [`build_full`] and [`build_incremental`] write into any `Write + Seek`
//! sink and hand it back on success. [`build_to_path`] wraps them for the
//! CLI: the package is built in a temporary file next to the output and only
//! persisted or signed once the build has succeeded, so a failed build
//! leaves nothing behind.

pub mod assertions;
mod full;
mod incremental;

pub use full::build_full;
pub use incremental::build_incremental;

use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::archive::{EntrySink, Substitutions, TargetFiles};
use crate::config::BuildOptions;
use crate::diff::{self, DiffPlan};
use crate::error::{OtaError, Result};
use crate::perms::PathRegistry;
use crate::script::Script;
use crate::symlinks::{self, SymlinkPlan};
use crate::tools::{DeltaCodec, ImageAssembler, Toolbox};

/// Radio image inside a target-files archive.
pub const RADIO_IMAGE: &str = "RADIO/image";
/// Where the recovery image is staged inside the system partition.
pub const RECOVERY_PATH: &str = "system/recovery.img";

/// Which kind of package a build produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Full,
    Incremental,
}

/// Summary of a finished build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub mode: BuildMode,
    pub script_commands: usize,
    /// Sum of every `show_progress` fraction in the script.
    pub progress_total: f64,
    pub verbatim_files: usize,
    pub patched_files: usize,
    pub boot_updated: bool,
    pub recovery_updated: bool,
    pub radio_updated: bool,
}

/// Key material handed to the package signer.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub key: String,
    pub passphrase: Option<String>,
}

/// What an incremental update would do with files and symlinks, without
/// building any images or writing a package.
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePlan {
    pub files: DiffPlan,
    pub symlinks: SymlinkPlan,
}

/// Builds an image from the parts under `prefix` (`BOOT/` or `RECOVERY/`).
/// Returns `None` when the archive carries no parts for it.
pub(crate) fn build_image<R: Read + Seek>(
    archive: &mut TargetFiles<R>,
    prefix: &str,
    image_name: &str,
    assembler: &dyn ImageAssembler,
) -> Result<Option<Vec<u8>>> {
    let dir = tempfile::tempdir()?;
    if archive.unpack_dir(prefix, dir.path())? == 0 {
        debug!(prefix, "no image parts");
        return Ok(None);
    }
    let Some(image) = assembler.assemble(dir.path())? else {
        return Ok(None);
    };
    debug!(image = image_name, size = image.len(), "built image");
    Ok(Some(image))
}

/// [`build_image`] for an image the package will install, checked against
/// the board limits. Source images are only compared and never checked.
pub(crate) fn build_target_image<R: Read + Seek>(
    archive: &mut TargetFiles<R>,
    prefix: &str,
    image_name: &str,
    assembler: &dyn ImageAssembler,
    options: &BuildOptions,
) -> Result<Option<Vec<u8>>> {
    let image = build_image(archive, prefix, image_name, assembler)?;
    if let Some(image) = &image {
        options.check_image_size(image_name, image.len())?;
    }
    Ok(image)
}

/// Copies a device-side helper from `OTA/bin/` into the package root.
pub(crate) fn include_helper<R: Read + Seek>(
    archive: &mut TargetFiles<R>,
    output: &mut dyn EntrySink,
    name: &str,
) -> Result<()> {
    let data = archive.read(&format!("OTA/bin/{}", name))?;
    output.add_file(name, &data, Some(0o755))
}

pub(crate) fn append_extra_script(script: &mut Script, options: &BuildOptions) {
    if let Some(extra) = &options.extra_script {
        for line in extra.lines() {
            script.push_raw(line);
        }
    }
}

/// Compares the system trees of two archives.
pub fn plan_update<R1, R2>(
    target: &mut TargetFiles<R1>,
    source: &mut TargetFiles<R2>,
    options: &BuildOptions,
    codec: &dyn DeltaCodec,
) -> Result<UpdatePlan>
where
    R1: Read + Seek,
    R2: Read + Seek,
{
    options.validate()?;
    let target_files = target.load_system_files()?;
    let source_files = source.load_system_files()?;
    let files = diff::plan(&target_files, &source_files, &options.verbatim, options.patch_threshold, codec)?;

    let no_subs = Substitutions::new();
    let target_links = target.copy_system_files(None, &no_subs, &mut PathRegistry::new())?;
    let source_links = source.copy_system_files(None, &no_subs, &mut PathRegistry::new())?;
    let symlinks = symlinks::reconcile(&source_links, &target_links);
    Ok(UpdatePlan { files, symlinks })
}

/// Builds a package from archives on disk and writes it to `output`.
///
/// With `signing`, the finished package is passed through the toolbox's
/// signer into a second temporary file; otherwise it is moved into place as
/// is. `output` is only ever created by a rename.
pub fn build_to_path(
    target_path: &Path,
    source_path: Option<&Path>,
    output: &Path,
    options: &BuildOptions,
    tools: &Toolbox,
    signing: Option<&SigningKey>,
) -> Result<BuildReport> {
    options.validate()?;
    let mut target = TargetFiles::open(target_path)?;
    let mut source = source_path.map(TargetFiles::open).transpose()?;

    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir).map_err(|e| OtaError::io_at(e, dir))?;

    let report = {
        let sink = staged.as_file_mut();
        let (sink, report) = match source.as_mut() {
            Some(source) => build_incremental(&mut target, source, sink, options, tools)?,
            None => build_full(&mut target, sink, options, tools)?,
        };
        sink.flush()?;
        report
    };

    match signing {
        Some(key) => {
            info!(signer = tools.signer.name(), key = %key.key, "signing package");
            let signed = NamedTempFile::new_in(dir).map_err(|e| OtaError::io_at(e, dir))?;
            tools
                .signer
                .sign(staged.path(), signed.path(), &key.key, key.passphrase.as_deref())?;
            signed.persist(output).map_err(|e| OtaError::io_at(e.error, output))?;
        }
        None => {
            staged.persist(output).map_err(|e| OtaError::io_at(e.error, output))?;
        }
    }

    let size = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
    info!(path = %output.display(), size, mode = ?report.mode, "package written");
    Ok(report)
}
