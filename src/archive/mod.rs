//! # Target-Files Archives
//!
//! Reading side of the build. A target-files archive is a zip holding the
//! system partition under `SYSTEM/`, boot and recovery image parts under
//! `BOOT/` and `RECOVERY/`, the radio image at `RADIO/image`, and helper
//! binaries and metadata under `OTA/`.
//!
//! The writing side, [`PackageWriter`], lives in [`writer`].

mod writer;

pub use writer::{EntrySink, PackageWriter};

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Component, Path};

use serde::Serialize;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::common::{is_symlink_mode, FileEntry, SymlinkRecord, SYSTEM_PARTITION, SYSTEM_PREFIX};
use crate::error::{OtaError, Result};
use crate::perms::PathRegistry;

/// Output paths to replace while copying: `Some(bytes)` substitutes the
/// content, `None` drops the entry entirely.
pub type Substitutions = HashMap<String, Option<Vec<u8>>>;

/// Kind of an entry under `SYSTEM/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One entry of the system partition as listed by [`TargetFiles::list_system_entries`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: Option<u32>,
}

/// A readable target-files archive.
pub struct TargetFiles<R> {
    zip: ZipArchive<R>,
}

impl TargetFiles<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| OtaError::io_at(e, path))?;
        Self::new(file)
    }
}

impl<R: Read + Seek> TargetFiles<R> {
    pub fn new(reader: R) -> Result<Self> {
        Ok(Self { zip: ZipArchive::new(reader)? })
    }

    /// Reads a whole entry; a missing entry is [`OtaError::MissingEntry`].
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        self.read_optional(name)?.ok_or_else(|| OtaError::MissingEntry(name.to_string()))
    }

    pub fn read_optional(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut entry = match self.zip.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Loads every regular file under `SYSTEM/`, keyed by `system/<rest>`.
    /// Symlinks and directory entries are skipped.
    pub fn load_system_files(&mut self) -> Result<BTreeMap<String, FileEntry>> {
        let mut out = BTreeMap::new();
        for i in 0..self.zip.len() {
            let mut entry = self.zip.by_index(i)?;
            let Some(base) = entry.name().strip_prefix(SYSTEM_PREFIX).map(str::to_string) else {
                continue;
            };
            if entry.is_dir() || entry.unix_mode().map_or(false, is_symlink_mode) {
                continue;
            }
            let path = format!("system/{}", base);
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            out.insert(path.clone(), FileEntry::new(path, data));
        }
        debug!(files = out.len(), "loaded system files");
        Ok(out)
    }

    /// Walks `SYSTEM/`, registering every file and directory in `registry`
    /// and, when `output` is given, copying it to `system/<rest>`.
    ///
    /// Paths in `substitutions` are replaced or dropped; dropped paths are not
    /// registered either. Returns the symlinks found, sorted.
    pub fn copy_system_files(
        &mut self,
        mut output: Option<&mut dyn EntrySink>,
        substitutions: &Substitutions,
        registry: &mut PathRegistry,
    ) -> Result<Vec<SymlinkRecord>> {
        let mut symlinks = Vec::new();

        for i in 0..self.zip.len() {
            let mut entry = self.zip.by_index(i)?;
            let Some(base) = entry.name().strip_prefix(SYSTEM_PREFIX).map(str::to_string) else {
                continue;
            };
            let mode = entry.unix_mode();

            if mode.map_or(false, is_symlink_mode) {
                let mut target = String::new();
                entry.read_to_string(&mut target)?;
                symlinks.push(SymlinkRecord::new(target, format!("{}{}", SYSTEM_PARTITION, base)));
                continue;
            }

            let path = format!("system/{}", base);
            let substitute = substitutions.get(&path);
            if let Some(None) = substitute {
                continue;
            }

            if let Some(dir) = path.strip_suffix('/') {
                if let Some(out) = output.as_deref_mut() {
                    out.add_directory(&path)?;
                }
                registry.register(dir, true);
                continue;
            }

            if let Some(out) = output.as_deref_mut() {
                match substitute {
                    Some(Some(data)) => out.add_file(&path, data, mode)?,
                    _ => {
                        let mut data = Vec::with_capacity(entry.size() as usize);
                        entry.read_to_end(&mut data)?;
                        out.add_file(&path, &data, mode)?;
                    }
                }
            }
            registry.register(&path, false);
        }

        symlinks.sort();
        Ok(symlinks)
    }

    /// Extracts every entry under `prefix` (e.g. `BOOT/`) into `dest`.
    /// Returns the number of entries written.
    pub fn unpack_dir(&mut self, prefix: &str, dest: &Path) -> Result<usize> {
        let mut written = 0;
        for i in 0..self.zip.len() {
            let mut entry = self.zip.by_index(i)?;
            let Some(rel) = entry.name().strip_prefix(prefix).map(str::to_string) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            let rel_path = Path::new(&rel);
            if !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
                return Err(OtaError::Archive(format!("unsafe entry name '{}'", entry.name())));
            }
            let out_path = dest.join(rel_path);

            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(|e| OtaError::io_at(e, &out_path))?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| OtaError::io_at(e, parent))?;
            }

            let mode = entry.unix_mode();
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;

            #[cfg(unix)]
            if mode.map_or(false, is_symlink_mode) {
                let target = String::from_utf8_lossy(&data).into_owned();
                std::os::unix::fs::symlink(&target, &out_path).map_err(|e| OtaError::io_at(e, &out_path))?;
                written += 1;
                continue;
            }

            fs::write(&out_path, &data).map_err(|e| OtaError::io_at(e, &out_path))?;
            #[cfg(unix)]
            if let Some(mode) = mode {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| OtaError::io_at(e, &out_path))?;
            }
            written += 1;
        }
        debug!(prefix, written, "unpacked image parts");
        Ok(written)
    }

    /// Lists the system partition in archive order.
    pub fn list_system_entries(&mut self) -> Result<Vec<SystemEntry>> {
        let mut out = Vec::new();
        for i in 0..self.zip.len() {
            let entry = self.zip.by_index(i)?;
            let Some(base) = entry.name().strip_prefix(SYSTEM_PREFIX) else {
                continue;
            };
            let mode = entry.unix_mode();
            let kind = if mode.map_or(false, is_symlink_mode) {
                EntryKind::Symlink
            } else if entry.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            out.push(SystemEntry { path: format!("system/{}", base), kind, size: entry.size(), mode });
        }
        Ok(out)
    }
}
