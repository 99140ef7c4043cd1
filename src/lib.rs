//! # otaforge Core Library
//!
//! This crate builds over-the-air update packages from target-files archives.
//!
//! It is designed to be used by the `otaforge` command-line application, but its public API
//! can also be used to build full and incremental packages programmatically.
//!
//! ## Key Modules
//!
//! - [`archive`]: Reads target-files archives and writes update packages.
//! - [`perms`]: Resolves ownership for a system tree and compresses it into permission commands.
//! - [`diff`]: Decides per file between no change, a binary delta, or a whole copy.
//! - [`symlinks`]: Reconciles the symlinks of two system trees.
//! - [`package`]: Assembles full and incremental packages.
//! - [`tools`]: Capability traits for external host tools and their in-process doubles.
//!
//! ## Examples
//!
//! ```no_run
//! use otaforge::archive::TargetFiles;
//! use otaforge::config::BuildOptions;
//! use otaforge::tools::Toolbox;
//!
//! let mut target = TargetFiles::open("target-files.zip".as_ref())?;
//! let out = std::fs::File::create("ota.zip")?;
//! let (_, report) = otaforge::package::build_full(&mut target, out, &BuildOptions::default(), &Toolbox::in_memory())?;
//! println!("{} commands", report.script_commands);
//! # Ok::<(), otaforge::OtaError>(())
//! ```

pub mod archive;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod config;
pub mod diff;
pub mod error;
pub use error::OtaError;

pub mod package;
pub mod perms;
pub mod progress;
pub mod script;
pub mod symlinks;
pub mod tools;
