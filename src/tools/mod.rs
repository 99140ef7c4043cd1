//! # External Tools
//!
//! Narrow capability traits for everything the build delegates to another
//! program: ownership lookup, binary diffing, boot image assembly, and package
//! signing. [`process`] runs the real host tools; [`memory`] provides
//! in-process implementations used by tests and dry runs.

pub mod memory;
pub mod process;

use std::path::Path;

use crate::error::Result;

/// Maps paths to `(uid, gid, mode)` facts.
///
/// `request` holds one path per line, directories suffixed with `/`. The
/// response holds one `path uid gid mode-octal` line per requested path.
pub trait OwnershipOracle {
    fn query(&self, request: &str) -> Result<String>;

    fn name(&self) -> &str {
        "ownership oracle"
    }
}

/// Produces a binary patch that turns `source` into `target`.
pub trait DeltaCodec {
    fn diff(&self, source: &[u8], target: &[u8]) -> Result<Vec<u8>>;

    fn name(&self) -> &str {
        "delta generator"
    }
}

/// Builds a bootable image from a directory of image parts (`kernel`,
/// `RAMDISK/`, optional `cmdline` and `base`).
///
/// Returns `None` when the directory holds no kernel, i.e. there is no image
/// to build.
pub trait ImageAssembler {
    fn assemble(&self, parts_dir: &Path) -> Result<Option<Vec<u8>>>;

    fn name(&self) -> &str {
        "image assembler"
    }
}

/// Signs a finished package.
pub trait PackageSigner {
    fn sign(&self, unsigned: &Path, signed: &Path, key: &str, passphrase: Option<&str>) -> Result<()>;

    fn name(&self) -> &str {
        "package signer"
    }
}

/// The set of collaborators a single build talks to.
pub struct Toolbox {
    pub oracle: Box<dyn OwnershipOracle>,
    pub codec: Box<dyn DeltaCodec>,
    pub assembler: Box<dyn ImageAssembler>,
    pub signer: Box<dyn PackageSigner>,
}

impl Toolbox {
    /// Host tools resolved through `config`.
    pub fn host(config: &crate::config::ToolConfig) -> Self {
        Self {
            oracle: Box::new(process::FsConfig::new(config)),
            codec: Box::new(process::Bsdiff::new(config)),
            assembler: Box::new(process::MkBootImg::new(config)),
            signer: Box::new(process::SignApk::new(config)),
        }
    }

    /// Fully in-process tools; see [`memory`].
    pub fn in_memory() -> Self {
        Self {
            oracle: Box::new(memory::TableOracle::android_defaults()),
            codec: Box::new(memory::SpliceDelta),
            assembler: Box::new(memory::ConcatAssembler),
            signer: Box::new(memory::CopySigner),
        }
    }
}
