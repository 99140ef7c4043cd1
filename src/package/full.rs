use std::io::{Read, Seek, Write};

use tracing::info;

use super::assertions::{append_device_assertions, BuildProps, ANDROID_INFO, BUILD_PROP};
use super::{append_extra_script, build_target_image, include_helper, BuildMode, BuildReport, RADIO_IMAGE, RECOVERY_PATH};
use crate::archive::{EntrySink, PackageWriter, Substitutions, TargetFiles};
use crate::common::{substitute_root, SYSTEM_PREFIX, SYSTEM_ROOT};
use crate::config::BuildOptions;
use crate::error::{OtaError, Result};
use crate::perms::{PathRegistry, PermissionPlan};
use crate::script::Script;
use crate::tools::Toolbox;

/// Writes a package that reformats and reinstalls every partition from `target`.
pub fn build_full<R, W>(target: &mut TargetFiles<R>, out: W, options: &BuildOptions, tools: &Toolbox) -> Result<(W, BuildReport)>
where
    R: Read + Seek,
    W: Write + Seek,
{
    options.validate()?;
    let mut output = PackageWriter::new(out)?;
    let mut script = Script::new();

    let props = BuildProps::parse(&target.read(BUILD_PROP)?);
    let manifest = String::from_utf8_lossy(&target.read(ANDROID_INFO)?).into_owned();

    if !options.omit_prereq {
        include_helper(target, &mut output, "check_prereq")?;
        script.run_program(&["PACKAGE:check_prereq", props.build_date_utc()?]);
    }
    append_device_assertions(&mut script, &props, &manifest)?;

    script.format("BOOT:");
    script.show_progress(0.1, 0);

    let radio = target.read(RADIO_IMAGE)?;
    output.add_file("radio.img", &radio, None)?;
    script.write_radio_image("PACKAGE:radio.img");
    script.show_progress(0.5, 0);

    if options.wipe_user_data {
        script.format("DATA:");
    }

    script.format("SYSTEM:");
    script.copy_dir("PACKAGE:system", "SYSTEM:");

    let recovery = build_target_image(target, "RECOVERY/", "recovery.img", tools.assembler.as_ref(), options)?;
    let mut substitutions = Substitutions::new();
    if let Some(image) = &recovery {
        substitutions.insert(RECOVERY_PATH.to_string(), Some(image.clone()));
    }
    let mut registry = PathRegistry::new();
    let symlinks = target.copy_system_files(Some(&mut output), &substitutions, &mut registry)?;
    if let Some(image) = &recovery {
        if !output.contains(RECOVERY_PATH) {
            output.add_file(RECOVERY_PATH, image, None)?;
            registry.register(RECOVERY_PATH, false);
        }
    }

    for link in &symlinks {
        script.symlink(&link.target, &link.link);
    }

    registry.resolve_metadata(tools.oracle.as_ref())?;
    let root = registry
        .get(SYSTEM_ROOT)
        .ok_or_else(|| OtaError::MissingEntry(SYSTEM_PREFIX.to_string()))?;
    PermissionPlan::compute(&registry, root)?.emit(&registry, root, &mut script, substitute_root)?;

    let boot = build_target_image(target, "BOOT/", "boot.img", tools.assembler.as_ref(), options)?
        .ok_or_else(|| OtaError::MissingEntry("BOOT/kernel".to_string()))?;
    output.add_file("boot.img", &boot, None)?;
    script.show_progress(0.2, 0);
    script.write_raw_image("PACKAGE:boot.img", "BOOT:");
    script.show_progress(0.2, 10);

    append_extra_script(&mut script, options);
    output.write_script(&script)?;

    let report = BuildReport {
        mode: BuildMode::Full,
        script_commands: script.len(),
        progress_total: script.total_progress(),
        verbatim_files: registry.nodes().filter(|(_, n)| !n.is_dir).count(),
        patched_files: 0,
        boot_updated: true,
        recovery_updated: recovery.is_some(),
        radio_updated: true,
    };
    info!(commands = report.script_commands, files = report.verbatim_files, "full package assembled");
    Ok((output.finish()?, report))
}
