//! Shared fixtures: target-files archives built in memory.
#![allow(dead_code)]

use std::io::{Cursor, Write};

use otaforge::archive::TargetFiles;
use zip::write::FileOptions;
use zip::ZipWriter;

/// Builder for a target-files archive.
pub struct Fixture {
    zip: ZipWriter<Cursor<Vec<u8>>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self { zip: ZipWriter::new(Cursor::new(Vec::new())) }
    }

    pub fn file(self, name: &str, data: &[u8]) -> Self {
        self.file_mode(name, data, 0o644)
    }

    pub fn file_mode(mut self, name: &str, data: &[u8], mode: u32) -> Self {
        self.zip.start_file(name, FileOptions::default().unix_permissions(mode)).unwrap();
        self.zip.write_all(data).unwrap();
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.zip.add_symlink(name, target, FileOptions::default()).unwrap();
        self
    }

    /// Everything a build needs besides the system files: properties,
    /// manifest, helpers, and radio, boot and recovery image parts.
    pub fn with_board(self, fingerprint: &str, boot: &[u8], recovery: &[u8], radio: &[u8]) -> Self {
        let props = format!(
            "ro.build.fingerprint={}\nro.product.device=dream\nro.build.date.utc=1234567890\n",
            fingerprint
        );
        self.file("SYSTEM/build.prop", props.as_bytes())
            .file("OTA/android-info.txt", b"board=trout\nrequire version-bootloader=1.0|2.0\n")
            .file_mode("OTA/bin/check_prereq", b"\x7fELF prereq", 0o755)
            .file_mode("OTA/bin/applypatch", b"\x7fELF applypatch", 0o755)
            .file("RADIO/image", radio)
            .file("BOOT/kernel", boot)
            .file("BOOT/RAMDISK/init.rc", b"on boot")
            .file("RECOVERY/kernel", b"recovery kernel")
            .file("RECOVERY/RAMDISK/init.rc", recovery)
    }

    pub fn bytes(mut self) -> Vec<u8> {
        self.zip.finish().unwrap().into_inner()
    }

    pub fn open(self) -> TargetFiles<Cursor<Vec<u8>>> {
        TargetFiles::new(Cursor::new(self.bytes())).unwrap()
    }
}

/// A small but complete system tree.
pub fn system_tree(fingerprint: &str) -> Fixture {
    Fixture::new()
        .with_board(fingerprint, b"boot kernel", b"on recovery", b"radio v1")
        .file("SYSTEM/app/A.apk", b"apk a")
        .file("SYSTEM/app/B.apk", b"apk b")
        .file_mode("SYSTEM/bin/sh", b"#!shell", 0o755)
        .symlink("SYSTEM/bin/ls", "toolbox")
}

/// Deterministic pseudo-random bytes, so small edits leave most of a file intact.
pub fn blob(len: usize, seed: u8) -> Vec<u8> {
    let mut state = seed as u32 | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

/// Reads one entry of a finished package.
pub fn package_entry(package: &[u8], name: &str) -> Option<Vec<u8>> {
    let mut archive = TargetFiles::new(Cursor::new(package.to_vec())).unwrap();
    archive.read_optional(name).unwrap()
}

/// The script stored in a finished package, one command per element.
pub fn package_script(package: &[u8]) -> Vec<String> {
    let text = package_entry(package, otaforge::script::SCRIPT_PATH).expect("package has a script");
    String::from_utf8(text).unwrap().lines().map(str::to_string).collect()
}
