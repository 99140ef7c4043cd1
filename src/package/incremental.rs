use std::collections::HashSet;
use std::io::{Read, Seek, Write};

use tracing::info;

use super::assertions::{append_device_assertions, append_fingerprint_assertion, BuildProps, ANDROID_INFO, BUILD_PROP};
use super::{append_extra_script, build_image, build_target_image, include_helper, BuildMode, BuildReport, RADIO_IMAGE, RECOVERY_PATH};
use crate::archive::{EntrySink, PackageWriter, Substitutions, TargetFiles};
use crate::common::{substitute_root, SymlinkRecord, SYSTEM_PREFIX, SYSTEM_ROOT};
use crate::config::BuildOptions;
use crate::diff;
use crate::error::{OtaError, Result};
use crate::perms::{PathRegistry, PermissionPlan};
use crate::progress::ProgressBudget;
use crate::script::Script;
use crate::symlinks;
use crate::tools::Toolbox;

/// Scratch directory on the device that staged patches are copied to.
const PATCH_STAGING: &str = "/tmp/patchtmp";

/// Permission commands for the target tree, plus its symlinks.
///
/// Computed on a registry of its own, before the source tree is walked.
fn target_permissions<R: Read + Seek>(
    target: &mut TargetFiles<R>,
    tools: &Toolbox,
) -> Result<(Script, Vec<SymlinkRecord>)> {
    let mut registry = PathRegistry::new();
    let links = target.copy_system_files(None, &Substitutions::new(), &mut registry)?;
    registry.resolve_metadata(tools.oracle.as_ref())?;
    let root = registry
        .get(SYSTEM_ROOT)
        .ok_or_else(|| OtaError::MissingEntry(SYSTEM_PREFIX.to_string()))?;

    let mut script = Script::new();
    PermissionPlan::compute(&registry, root)?.emit(&registry, root, &mut script, substitute_root)?;
    Ok((script, links))
}

fn differs(target: &Option<Vec<u8>>, source: &Option<Vec<u8>>) -> bool {
    target.is_some() && target != source
}

/// Writes a package that moves a device from `source` to `target`.
pub fn build_incremental<R1, R2, W>(
    target: &mut TargetFiles<R1>,
    source: &mut TargetFiles<R2>,
    out: W,
    options: &BuildOptions,
    tools: &Toolbox,
) -> Result<(W, BuildReport)>
where
    R1: Read + Seek,
    R2: Read + Seek,
    W: Write + Seek,
{
    options.validate()?;
    let mut output = PackageWriter::new(out)?;
    let mut script = Script::new();

    let target_props = BuildProps::parse(&target.read(BUILD_PROP)?);
    let source_props = BuildProps::parse(&source.read(BUILD_PROP)?);
    let manifest = String::from_utf8_lossy(&target.read(ANDROID_INFO)?).into_owned();

    let mut target_files = target.load_system_files()?;
    let mut source_files = source.load_system_files()?;

    let (permissions, target_links) = target_permissions(target, tools)?;
    let source_links = source.copy_system_files(None, &Substitutions::new(), &mut PathRegistry::new())?;

    let assembler = tools.assembler.as_ref();
    let target_boot = build_target_image(target, "BOOT/", "boot.img", assembler, options)?;
    let source_boot = build_image(source, "BOOT/", "boot.img", assembler)?;
    let updating_boot = differs(&target_boot, &source_boot);

    let target_recovery = build_target_image(target, "RECOVERY/", "recovery.img", assembler, options)?;
    let source_recovery = build_image(source, "RECOVERY/", "recovery.img", assembler)?;
    let updating_recovery = differs(&target_recovery, &source_recovery);
    if updating_recovery {
        // The staged image replaces whatever the trees carry at that path.
        target_files.remove(RECOVERY_PATH);
        source_files.remove(RECOVERY_PATH);
    }

    let target_radio = target.read(RADIO_IMAGE)?;
    let updating_radio = target_radio != source.read(RADIO_IMAGE)?;
    info!(boot = updating_boot, recovery = updating_recovery, radio = updating_radio, "image updates");

    let plan = diff::plan(&target_files, &source_files, &options.verbatim, options.patch_threshold, tools.codec.as_ref())?;
    let links = symlinks::reconcile(&source_links, &target_links);
    let budget = ProgressBudget::new(
        updating_boot,
        updating_recovery,
        updating_radio,
        plan.total_patched_size,
        plan.total_verbatim_size,
    );

    append_fingerprint_assertion(&mut script, source_props.fingerprint()?, target_props.fingerprint()?);
    append_device_assertions(&mut script, &target_props, &manifest)?;

    budget.emit_patch_pass(&mut script, &plan.patches, budget.verify_share(), |s, p| {
        s.run_program(&["PACKAGE:applypatch", "-c", &format!("/{}", p.path), &p.target_sha1, &p.source_sha1]);
    });
    if !plan.patches.is_empty() {
        script.run_program(&["PACKAGE:applypatch", "-s", &plan.largest_source_size.to_string()]);
        script.copy_dir("PACKAGE:patch", &format!("CACHE:..{}", PATCH_STAGING));
        include_helper(target, &mut output, "applypatch")?;
        for patch in &plan.patches {
            output.add_file(&format!("patch/{}.p", patch.path), &patch.patch, None)?;
        }
    }

    script.comment("start making changes here");
    if options.wipe_user_data {
        script.format("DATA:");
    }

    let mut verbatim_paths: Vec<String> = plan.verbatim.iter().map(|v| substitute_root(&v.path)).collect();
    if updating_recovery {
        verbatim_paths.push(substitute_root(RECOVERY_PATH));
    }
    script.delete(verbatim_paths.as_slice());

    if let Some(boot) = target_boot.as_ref().filter(|_| updating_boot) {
        script.show_progress(budget.boot, 5);
        script.format("BOOT:");
        script.write_raw_image("PACKAGE:boot.img", "BOOT:");
        output.add_file("boot.img", boot, None)?;
    }
    if let Some(recovery) = target_recovery.as_ref().filter(|_| updating_recovery) {
        output.add_file(RECOVERY_PATH, recovery, None)?;
    }
    if updating_radio {
        script.show_progress(budget.radio, 10);
        script.write_radio_image("PACKAGE:radio.img");
        output.add_file("radio.img", &target_radio, None)?;
    }

    budget.emit_patch_pass(&mut script, &plan.patches, budget.apply_share(), |s, p| {
        s.run_program(&[
            "PACKAGE:applypatch",
            &format!("/{}", p.path),
            "-",
            &p.target_sha1,
            &p.target_size.to_string(),
            &format!("{}:{}/{}.p", p.source_sha1, PATCH_STAGING, p.path),
        ]);
    });

    script.delete(links.to_delete.as_slice());

    if !plan.verbatim.is_empty() || updating_recovery {
        script.show_progress(budget.verbatim_share(), 5);
        script.copy_dir("PACKAGE:system", "SYSTEM:");
        for file in &plan.verbatim {
            output.add_file(&file.path, &target_files[&file.path].data, None)?;
        }
    }

    let existing: HashSet<&str> = source_links.iter().map(|s| s.link.as_str()).collect();
    let fresh: Vec<&str> = links
        .to_create
        .iter()
        .map(|s| s.link.as_str())
        .filter(|l| !existing.contains(l))
        .collect();
    script.delete(fresh.as_slice());
    for link in &links.to_create {
        script.symlink(&link.target, &link.link);
    }

    script.extend(permissions);
    append_extra_script(&mut script, options);
    output.write_script(&script)?;

    let report = BuildReport {
        mode: BuildMode::Incremental,
        script_commands: script.len(),
        progress_total: script.total_progress(),
        verbatim_files: plan.verbatim.len() + usize::from(updating_recovery),
        patched_files: plan.patches.len(),
        boot_updated: updating_boot,
        recovery_updated: updating_recovery,
        radio_updated: updating_radio,
    };
    info!(
        commands = report.script_commands,
        verbatim = report.verbatim_files,
        patched = report.patched_files,
        "incremental package assembled"
    );
    Ok((output.finish()?, report))
}
