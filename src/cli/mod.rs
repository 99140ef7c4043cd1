use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{BoardConfig, BuildOptions, ToolConfig, VerbatimPolicy, DEFAULT_PACKAGE_KEY, DEFAULT_PATCH_THRESHOLD};
use crate::error::{OtaError, Result};

/// Environment variable consulted for the signing key passphrase.
pub const PASSPHRASE_ENV: &str = "OTAFORGE_KEY_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(author, version, about = "Build over-the-air update packages from target-files archives", long_about = None)]
pub struct Args {
    /// Log at debug level. `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that diffs or builds.
#[derive(clap::Args, Clone, Debug)]
pub struct PlanArgs {
    /// Paths that must always be sent whole, e.g. `system/build.prop`. Repeatable.
    #[arg(long = "require-verbatim", value_name = "PATH")]
    pub require_verbatim: Vec<String>,

    /// Paths that must never be sent whole. Repeatable.
    #[arg(long = "prohibit-verbatim", value_name = "PATH")]
    pub prohibit_verbatim: Vec<String>,

    /// Send a file whole when its delta exceeds this fraction of its size.
    #[arg(long, default_value_t = DEFAULT_PATCH_THRESHOLD)]
    pub patch_threshold: f64,

    /// Host tool directory; tools are looked up in its `bin/`.
    #[arg(short = 'p', long = "path", value_name = "DIR")]
    pub search_path: Option<PathBuf>,

    /// Seconds an external tool may run before it is killed. [0 = no limit]
    #[arg(long, default_value_t = 600)]
    pub tool_timeout: u64,
}

impl PlanArgs {
    pub fn tool_config(&self, signapk: Option<PathBuf>) -> ToolConfig {
        ToolConfig {
            search_path: self.search_path.clone(),
            signapk_jar: signapk,
            timeout: (self.tool_timeout > 0).then(|| Duration::from_secs(self.tool_timeout)),
        }
    }

    pub fn verbatim_policy(&self) -> VerbatimPolicy {
        VerbatimPolicy::new(self.require_verbatim.iter().cloned(), self.prohibit_verbatim.iter().cloned())
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build a full or incremental update package.
    #[command(alias = "b")]
    Build {
        /// The target-files archive describing the new build.
        #[arg(required = true)]
        target: PathBuf,

        /// The path for the output package.
        #[arg(short, long)]
        output: PathBuf,

        /// Build an incremental package from this source target-files archive.
        #[arg(short = 'i', long = "incremental-from", value_name = "SOURCE")]
        incremental_from: Option<PathBuf>,

        #[command(flatten)]
        plan: PlanArgs,

        /// Board config makefile with `BOARD_*IMAGE_MAX_SIZE` limits.
        #[arg(short = 's', long, value_name = "FILE")]
        board_config: Option<PathBuf>,

        /// Fail when boot or recovery images come near the board limits.
        #[arg(long)]
        check_sizes: bool,

        /// Erase the user data partition as part of the update.
        #[arg(short, long)]
        wipe_user_data: bool,

        /// Skip the build timestamp check in full packages.
        #[arg(short = 'n', long = "no-prereq")]
        no_prereq: bool,

        /// File of script commands to append to the generated script.
        #[arg(short = 'e', long, value_name = "FILE")]
        extra_script: Option<PathBuf>,

        /// Key used to sign the package, without the `.x509.pem`/`.pk8` extension.
        #[arg(short = 'k', long, default_value = DEFAULT_PACKAGE_KEY)]
        package_key: String,

        /// Passphrase for the signing key. If not provided, will try to read from OTAFORGE_KEY_PASSPHRASE.
        #[arg(long)]
        key_passphrase: Option<String>,

        /// Prompt for the signing key passphrase when none is given.
        #[arg(long)]
        ask_passphrase: bool,

        /// Write the package unsigned.
        #[arg(long)]
        no_sign: bool,

        /// Explicit path to signapk.jar.
        #[arg(long, value_name = "JAR")]
        signapk: Option<PathBuf>,
    },

    /// Print, as JSON, what an incremental package would contain.
    #[command(alias = "p")]
    Plan {
        /// The target-files archive describing the new build.
        #[arg(required = true)]
        target: PathBuf,

        /// The source target-files archive.
        #[arg(required = true)]
        source: PathBuf,

        #[command(flatten)]
        plan: PlanArgs,

        /// Diff in-process instead of invoking the host delta tool.
        #[arg(long)]
        in_process: bool,
    },

    /// List the system partition of a target-files archive.
    #[command(alias = "l")]
    List {
        /// The target-files archive to list.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

/// Gets the passphrase from the command-line option or the `OTAFORGE_KEY_PASSPHRASE` environment variable.
///
/// Priority:
/// 1. `--key-passphrase` command-line argument.
/// 2. `OTAFORGE_KEY_PASSPHRASE` environment variable.
/// 3. Returns `Ok(None)` if neither is present, allowing the caller to prompt interactively.
pub fn get_passphrase_from_opt_or_env(passphrase_opt: Option<String>) -> Result<Option<String>> {
    if let Some(pass) = passphrase_opt {
        return Ok(Some(pass));
    }
    if let Ok(pass) = std::env::var(PASSPHRASE_ENV) {
        return Ok(Some(pass));
    }
    Ok(None)
}

/// Asks for the passphrase of `key` on the terminal.
pub fn prompt_passphrase(key: &str) -> Result<String> {
    rpassword::prompt_password(format!("Enter password for {}: ", key))
        .map_err(|e| OtaError::Configuration(format!("could not read passphrase: {}", e)))
}

/// Assembles the build options a `build` invocation asks for.
pub fn build_options(
    plan: &PlanArgs,
    board_config: Option<&PathBuf>,
    check_sizes: bool,
    wipe_user_data: bool,
    no_prereq: bool,
    extra_script: Option<&PathBuf>,
) -> Result<BuildOptions> {
    let board_config = board_config.map(|p| BoardConfig::load(p)).transpose()?;
    let extra_script = extra_script
        .map(|p| std::fs::read_to_string(p).map_err(|e| OtaError::io_at(e, p)))
        .transpose()?;
    Ok(BuildOptions {
        patch_threshold: plan.patch_threshold,
        verbatim: plan.verbatim_policy(),
        wipe_user_data,
        omit_prereq: no_prereq,
        extra_script,
        board_config,
        check_sizes,
    })
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Args {
    Args::parse()
}
