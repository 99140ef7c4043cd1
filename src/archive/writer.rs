use std::collections::BTreeSet;
use std::io::{Seek, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{OtaError, Result};
use crate::script::{Script, SCRIPT_PATH};

/// Mode given to package entries that carry none of their own.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Destination for package entries.
pub trait EntrySink {
    fn add_file(&mut self, name: &str, data: &[u8], mode: Option<u32>) -> Result<()>;
    fn add_directory(&mut self, name: &str) -> Result<()>;
}

/// Writes an update package. Every entry name may be written once.
pub struct PackageWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    entries: BTreeSet<String>,
}

impl<W: Write + Seek> PackageWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self { zip: ZipWriter::new(inner), entries: BTreeSet::new() })
    }

    fn claim(&mut self, name: &str) -> Result<()> {
        if !self.entries.insert(name.to_string()) {
            return Err(OtaError::Archive(format!("duplicate package entry '{}'", name)));
        }
        Ok(())
    }

    fn options(mode: u32) -> FileOptions {
        FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    /// Stores the rendered script at its fixed location.
    pub fn write_script(&mut self, script: &Script) -> Result<()> {
        self.add_file(SCRIPT_PATH, script.render().as_bytes(), None)
    }

    pub fn finish(mut self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

impl<W: Write + Seek> EntrySink for PackageWriter<W> {
    fn add_file(&mut self, name: &str, data: &[u8], mode: Option<u32>) -> Result<()> {
        self.claim(name)?;
        let mode = mode.map_or(DEFAULT_FILE_MODE, |m| m & 0o777);
        self.zip.start_file(name, Self::options(mode))?;
        self.zip.write_all(data)?;
        Ok(())
    }

    fn add_directory(&mut self, name: &str) -> Result<()> {
        self.claim(name)?;
        self.zip.add_directory(name, Self::options(0o755))?;
        Ok(())
    }
}
