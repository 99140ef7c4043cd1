mod common;

use std::io::Cursor;
use std::path::Path;

use common::{blob, package_entry, package_script, system_tree, Fixture};
use otaforge::common::sha1_hex;
use otaforge::config::{BoardConfig, BuildOptions, VerbatimPolicy};
use otaforge::package::{build_full, build_incremental, build_to_path, SigningKey};
use otaforge::tools::{PackageSigner, Toolbox};
use otaforge::OtaError;

fn full(target: Fixture, options: &BuildOptions) -> Result<Vec<u8>, OtaError> {
    let (out, _) = build_full(&mut target.open(), Cursor::new(Vec::new()), options, &Toolbox::in_memory())?;
    Ok(out.into_inner())
}

fn incremental(target: Fixture, source: Fixture, options: &BuildOptions) -> Result<Vec<u8>, OtaError> {
    let (out, _) = build_incremental(
        &mut target.open(),
        &mut source.open(),
        Cursor::new(Vec::new()),
        options,
        &Toolbox::in_memory(),
    )?;
    Ok(out.into_inner())
}

fn position(script: &[String], needle: &str) -> usize {
    script
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no line containing {:?} in\n{}", needle, script.join("\n")))
}

#[test]
fn full_package_script_in_order() {
    let package = full(system_tree("fp/new"), &BuildOptions::default()).unwrap();
    let script = package_script(&package);
    assert_eq!(
        script,
        [
            "run_program PACKAGE:check_prereq 1234567890",
            r#"assert compatible_with("0.2") == "true""#,
            r#"assert getprop("ro.product.device") == "dream" || getprop("ro.build.product") == "dream""#,
            r#"assert getprop("ro.bootloader") == "1.0" || getprop("ro.bootloader") == "2.0""#,
            "format BOOT:",
            "show_progress 0.1 0",
            "write_radio_image PACKAGE:radio.img",
            "show_progress 0.5 0",
            "format SYSTEM:",
            "copy_dir PACKAGE:system SYSTEM:",
            "symlink toolbox SYSTEM:bin/ls",
            "set_perm_recursive 0 0 0755 0644 SYSTEM:",
            "set_perm_recursive 0 2000 0755 0755 SYSTEM:bin",
            "show_progress 0.2 0",
            "write_raw_image PACKAGE:boot.img BOOT:",
            "show_progress 0.2 10",
        ]
    );

    assert_eq!(package_entry(&package, "radio.img").unwrap(), b"radio v1");
    assert_eq!(package_entry(&package, "system/app/A.apk").unwrap(), b"apk a");
    assert!(package_entry(&package, "check_prereq").is_some());
    assert!(package_entry(&package, "boot.img").is_some());
    assert!(package_entry(&package, "system/recovery.img").is_some());
    assert!(package_entry(&package, "system/bin/ls").is_none());
}

#[test]
fn full_package_options() {
    let options = BuildOptions {
        wipe_user_data: true,
        omit_prereq: true,
        extra_script: Some("run_program PACKAGE:post_install\n".into()),
        ..BuildOptions::default()
    };
    let package = full(system_tree("fp/new"), &options).unwrap();
    let script = package_script(&package);

    assert!(script[0].starts_with("assert compatible_with"));
    assert!(package_entry(&package, "check_prereq").is_none());
    assert_eq!(position(&script, "format DATA:"), position(&script, "show_progress 0.5 0") + 1);
    assert_eq!(script.last().unwrap(), "run_program PACKAGE:post_install");
}

#[test]
fn full_package_progress_fills_the_bar() {
    let package = full(system_tree("fp/new"), &BuildOptions::default()).unwrap();
    let mut script = otaforge::script::Script::new();
    for line in package_script(&package) {
        script.push_raw(line);
    }
    assert!((script.total_progress() - 1.0).abs() < 1e-9);
}

#[test]
fn missing_bootloader_requirement_is_a_manifest_error() {
    let target = Fixture::new()
        .file("SYSTEM/build.prop", b"ro.product.device=dream\nro.build.date.utc=1\n")
        .file("OTA/android-info.txt", b"board=trout\n")
        .file("OTA/bin/check_prereq", b"bin")
        .file("RADIO/image", b"radio");
    let err = full(target, &BuildOptions::default()).unwrap_err();
    assert!(matches!(err, OtaError::Manifest(_)), "{}", err);
}

#[test]
fn missing_radio_image_is_reported() {
    let target = Fixture::new()
        .file("SYSTEM/build.prop", b"ro.product.device=dream\nro.build.date.utc=1\n")
        .file("OTA/android-info.txt", b"require version-bootloader=1.0\n")
        .file("OTA/bin/check_prereq", b"bin");
    let err = full(target, &BuildOptions::default()).unwrap_err();
    assert!(matches!(err, OtaError::MissingEntry(ref name) if name == "RADIO/image"), "{}", err);
}

#[test]
fn identical_builds_produce_no_payload() {
    let package = incremental(system_tree("fp/same"), system_tree("fp/same"), &BuildOptions::default()).unwrap();
    let script = package_script(&package);

    assert!(script[0].starts_with("assert file_contains(\"SYSTEM:build.prop\", \"ro.build.fingerprint=fp/same\")"));
    assert!(script.iter().all(|l| !l.contains("applypatch")));
    assert!(script.iter().all(|l| !l.starts_with("copy_dir") && !l.starts_with("show_progress")));
    assert!(script.iter().all(|l| !l.starts_with("delete")));
    position(&script, "# ---- start making changes here");
    assert!(package_entry(&package, "boot.img").is_none());
    assert!(package_entry(&package, "radio.img").is_none());
}

#[test]
fn small_tree_scenario() {
    let source = system_tree("fp/old").file("SYSTEM/a", b"X").file("SYSTEM/b", b"Y");
    let target = system_tree("fp/new").file("SYSTEM/a", b"X").file("SYSTEM/b", b"Z").file("SYSTEM/c", b"W");
    let package = incremental(target, source, &BuildOptions::default()).unwrap();
    let script = package_script(&package);

    let deletes: Vec<&String> = script.iter().filter(|l| l.starts_with("delete ")).collect();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].contains("SYSTEM:b") && deletes[0].contains("SYSTEM:c"));
    assert!(!deletes[0].contains("SYSTEM:a"));

    assert_eq!(package_entry(&package, "system/b").unwrap(), b"Z");
    assert_eq!(package_entry(&package, "system/c").unwrap(), b"W");
    assert!(package_entry(&package, "system/a").is_none());
    assert!(position(&script, "copy_dir PACKAGE:system SYSTEM:") > position(&script, "# ---- start making changes here"));
}

#[test]
fn incremental_patches_and_reconciles_symlinks() {
    let old_apk = blob(4096, 7);
    let mut new_apk = old_apk.clone();
    new_apk[2000..2010].copy_from_slice(b"0123456789");

    let source = system_tree("fp/old")
        .file("SYSTEM/app/Big.apk", &old_apk)
        .symlink("SYSTEM/bin/ps", "toolbox")
        .symlink("SYSTEM/bin/old", "toolbox");
    let target = system_tree("fp/new")
        .file("SYSTEM/app/Big.apk", &new_apk)
        .file("SYSTEM/c", b"W")
        .symlink("SYSTEM/bin/ps", "busybox")
        .symlink("SYSTEM/bin/new", "toolbox");
    let package = incremental(target, source, &BuildOptions::default()).unwrap();
    let script = package_script(&package);

    let (tgt, src) = (sha1_hex(&new_apk), sha1_hex(&old_apk));
    let verify = position(&script, &format!("run_program PACKAGE:applypatch -c /system/app/Big.apk {} {}", tgt, src));
    let space = position(&script, "run_program PACKAGE:applypatch -s 4096");
    let stage = position(&script, "copy_dir PACKAGE:patch CACHE:../tmp/patchtmp");
    let marker = position(&script, "# ---- start making changes here");
    let apply = position(
        &script,
        &format!("run_program PACKAGE:applypatch /system/app/Big.apk - {} 4096 {}:/tmp/patchtmp/system/app/Big.apk.p", tgt, src),
    );
    let stale = position(&script, "delete SYSTEM:bin/old SYSTEM:bin/ps");
    let copy = position(&script, "copy_dir PACKAGE:system SYSTEM:");
    let fresh = position(&script, "delete SYSTEM:bin/new");
    let relink = position(&script, "symlink busybox SYSTEM:bin/ps");
    let perms = position(&script, "set_perm_recursive 0 0 0755 0644 SYSTEM:");
    let order = [verify, space, stage, marker, apply, stale, copy, fresh, relink, perms];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}\n{}", order, script.join("\n"));

    assert!(script.iter().any(|l| l == "symlink toolbox SYSTEM:bin/new"));
    assert!(script[0].contains("fp/old") && script[0].contains("fp/new"));

    let patch = package_entry(&package, "patch/system/app/Big.apk.p").unwrap();
    assert!(patch.len() < new_apk.len());
    assert!(package_entry(&package, "applypatch").is_some());
    assert!(package_entry(&package, "system/app/Big.apk").is_none());
    assert_eq!(package_entry(&package, "system/c").unwrap(), b"W");
}

#[test]
fn changed_images_get_their_reserved_progress() {
    let source = Fixture::new()
        .with_board("fp/old", b"boot v1", b"on recovery v1", b"radio v1")
        .file("SYSTEM/app/A.apk", b"apk a");
    let target = Fixture::new()
        .with_board("fp/new", b"boot v2", b"on recovery v2", b"radio v2")
        .file("SYSTEM/app/A.apk", b"apk a");
    let package = incremental(target, source, &BuildOptions::default()).unwrap();
    let script = package_script(&package);

    let boot = position(&script, "show_progress 0.1 5");
    assert_eq!(script[boot + 1], "format BOOT:");
    assert_eq!(script[boot + 2], "write_raw_image PACKAGE:boot.img BOOT:");
    let radio = position(&script, "show_progress 0.3 10");
    assert_eq!(script[radio + 1], "write_radio_image PACKAGE:radio.img");
    assert!(radio > boot);
    assert!(position(&script, "delete ") < boot);
    assert!(script[position(&script, "delete ")].contains("SYSTEM:recovery.img"));
    assert!(position(&script, "copy_dir PACKAGE:system SYSTEM:") > radio);

    assert_eq!(package_entry(&package, "radio.img").unwrap(), b"radio v2");
    assert!(package_entry(&package, "boot.img").is_some());
    assert!(package_entry(&package, "system/recovery.img").is_some());

    let total: f64 = script
        .iter()
        .filter_map(|l| l.strip_prefix("show_progress "))
        .map(|rest| rest.split(' ').next().unwrap().parse::<f64>().unwrap())
        .sum();
    assert!(total <= 1.0 + 1e-6, "{}", total);
}

#[test]
fn progress_never_overflows_with_many_patches() {
    let mut source = system_tree("fp/old");
    let mut target = system_tree("fp/new");
    for i in 0..23u8 {
        let old = blob(512 + i as usize * 97, i);
        let mut new = old.clone();
        new[100] ^= 0xff;
        source = source.file(&format!("SYSTEM/lib/lib{}.so", i), &old);
        target = target.file(&format!("SYSTEM/lib/lib{}.so", i), &new);
    }
    target = target.file("SYSTEM/fresh.txt", &blob(3000, 99));
    let package = incremental(target, source, &BuildOptions::default()).unwrap();
    let script = package_script(&package);

    let total: f64 = script
        .iter()
        .filter_map(|l| l.strip_prefix("show_progress "))
        .map(|rest| rest.split(' ').next().unwrap().parse::<f64>().unwrap())
        .sum();
    assert!(total > 0.5 && total <= 1.0 + 1e-6, "{}", total);
}

#[test]
fn prohibited_verbatim_file_aborts_the_build() {
    let source = system_tree("fp/old");
    let target = system_tree("fp/new").file("SYSTEM/c", b"W");
    let options = BuildOptions {
        verbatim: VerbatimPolicy::new(Vec::<String>::new(), ["system/c"]),
        ..BuildOptions::default()
    };
    let err = incremental(target, source, &options).unwrap_err();
    assert!(matches!(err, OtaError::Configuration(ref msg) if msg.contains("system/c")), "{}", err);
}

#[test]
fn failed_build_leaves_no_package() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.zip");
    let no_radio = Fixture::new()
        .file("SYSTEM/build.prop", b"ro.product.device=dream\nro.build.date.utc=1\n")
        .file("OTA/android-info.txt", b"require version-bootloader=1.0\n")
        .file("OTA/bin/check_prereq", b"bin");
    std::fs::write(&target_path, no_radio.bytes()).unwrap();

    let output = dir.path().join("ota.zip");
    let result = build_to_path(&target_path, None, &output, &BuildOptions::default(), &Toolbox::in_memory(), None);
    assert!(result.is_err());
    assert!(!output.exists());
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[test]
fn signed_build_writes_the_package() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.zip");
    std::fs::write(&target_path, system_tree("fp/new").bytes()).unwrap();

    let output = dir.path().join("ota.zip");
    let key = SigningKey { key: "testkey".into(), passphrase: None };
    let report = build_to_path(&target_path, None, &output, &BuildOptions::default(), &Toolbox::in_memory(), Some(&key))
        .unwrap();
    assert!(report.recovery_updated);
    assert!((report.progress_total - 1.0).abs() < 1e-9);

    let package = std::fs::read(&output).unwrap();
    assert_eq!(package_script(&package).len(), report.script_commands);
}

fn boot_limit(limit: u64) -> BuildOptions {
    BuildOptions {
        board_config: Some(BoardConfig::parse(&format!("BOARD_BOOTIMAGE_MAX_SIZE := {}\n", limit))),
        check_sizes: true,
        ..BuildOptions::default()
    }
}

#[test]
fn oversized_source_image_does_not_block_the_update() {
    let source = Fixture::new()
        .with_board("fp/old", &blob(1100, 3), b"on recovery", b"radio v1")
        .file("SYSTEM/app/A.apk", b"apk a");
    let target = Fixture::new()
        .with_board("fp/new", b"boot v2", b"on recovery", b"radio v1")
        .file("SYSTEM/app/A.apk", b"apk a");
    let package = incremental(target, source, &boot_limit(1000)).unwrap();
    assert!(package_entry(&package, "boot.img").is_some());
}

#[test]
fn oversized_target_image_is_rejected() {
    let source = Fixture::new()
        .with_board("fp/old", b"boot v1", b"on recovery", b"radio v1")
        .file("SYSTEM/app/A.apk", b"apk a");
    let target = Fixture::new()
        .with_board("fp/new", &blob(1100, 3), b"on recovery", b"radio v1")
        .file("SYSTEM/app/A.apk", b"apk a");
    let err = incremental(target, source, &boot_limit(1000)).unwrap_err();
    assert!(matches!(err, OtaError::Configuration(ref msg) if msg.contains("boot")), "{}", err);
}

/// Writes part of a package and then fails, like a signer that gets killed.
struct PartialSigner;

impl PackageSigner for PartialSigner {
    fn sign(&self, _unsigned: &Path, signed: &Path, _key: &str, _passphrase: Option<&str>) -> Result<(), OtaError> {
        std::fs::write(signed, b"PK partial").unwrap();
        Err(OtaError::tooling("signapk", "killed"))
    }
}

#[test]
fn failed_signing_leaves_no_package() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.zip");
    std::fs::write(&target_path, system_tree("fp/new").bytes()).unwrap();

    let output = dir.path().join("ota.zip");
    let tools = Toolbox { signer: Box::new(PartialSigner), ..Toolbox::in_memory() };
    let key = SigningKey { key: "testkey".into(), passphrase: None };
    let err = build_to_path(&target_path, None, &output, &BuildOptions::default(), &tools, Some(&key)).unwrap_err();
    assert!(matches!(err, OtaError::Tooling { .. }), "{}", err);
    assert!(!output.exists());
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, ["target.zip"]);
}

#[test]
fn unchanged_recovery_leaves_its_system_copy_to_diffing() {
    let old = blob(4096, 11);
    let mut new = old.clone();
    new[100..104].copy_from_slice(b"v2v2");
    let source = system_tree("fp/old").file("SYSTEM/recovery.img", &old);
    let target = system_tree("fp/new").file("SYSTEM/recovery.img", &new);
    let package = incremental(target, source, &BuildOptions::default()).unwrap();
    let script = package_script(&package);

    position(&script, "run_program PACKAGE:applypatch /system/recovery.img -");
    assert!(package_entry(&package, "patch/system/recovery.img.p").is_some());
    assert!(package_entry(&package, "system/recovery.img").is_none());
}
