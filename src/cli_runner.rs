//! Command dispatch for the `otaforge` binary, kept in the library so the
//! integration tests and the binary share one implementation.

use std::io::{self, Write};

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::archive::TargetFiles;
use crate::cli::{self, Args, Commands};
use crate::config::BuildOptions;
use crate::error::Result;
use crate::package::{self, SigningKey};
use crate::tools::{memory::SpliceDelta, process::Bsdiff, DeltaCodec, Toolbox};

/// Installs the stderr log subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "otaforge=debug" } else { "otaforge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Parses the command line and runs the requested command.
pub fn run_cli_app() -> Result<()> {
    let args = cli::run();
    init_logging(args.verbose);
    execute(args)
}

pub fn execute(args: Args) -> Result<()> {
    match args.command {
        Commands::Build {
            target,
            output,
            incremental_from,
            plan,
            board_config,
            check_sizes,
            wipe_user_data,
            no_prereq,
            extra_script,
            package_key,
            key_passphrase,
            ask_passphrase,
            no_sign,
            signapk,
        } => {
            let options = cli::build_options(
                &plan,
                board_config.as_ref(),
                check_sizes,
                wipe_user_data,
                no_prereq,
                extra_script.as_ref(),
            )?;
            options.validate()?;
            let tools = Toolbox::host(&plan.tool_config(signapk));

            let signing = if no_sign {
                None
            } else {
                let mut passphrase = cli::get_passphrase_from_opt_or_env(key_passphrase)?;
                if passphrase.is_none() && ask_passphrase {
                    passphrase = Some(cli::prompt_passphrase(&package_key)?);
                }
                Some(SigningKey { key: package_key, passphrase })
            };

            info!(archive = %target.display(), incremental = incremental_from.is_some(), "building package");
            let report = package::build_to_path(
                &target,
                incremental_from.as_deref(),
                &output,
                &options,
                &tools,
                signing.as_ref(),
            )?;
            debug!(?report, "build finished");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Plan { target, source, plan, in_process } => {
            let options = BuildOptions {
                patch_threshold: plan.patch_threshold,
                verbatim: plan.verbatim_policy(),
                ..BuildOptions::default()
            };
            let codec: Box<dyn DeltaCodec> = if in_process {
                Box::new(SpliceDelta)
            } else {
                Box::new(Bsdiff::new(&plan.tool_config(None)))
            };
            let mut target = TargetFiles::open(&target)?;
            let mut source = TargetFiles::open(&source)?;
            let update = package::plan_update(&mut target, &mut source, &options, codec.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&update)?);
        }
        Commands::List { archive } => {
            let mut archive = TargetFiles::open(&archive)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for entry in archive.list_system_entries()? {
                let mode = entry.mode.map(|m| format!("{:06o}", m)).unwrap_or_else(|| "------".into());
                writeln!(out, "{} {:>10} {:?} {}", mode, entry.size, entry.kind, entry.path)?;
            }
        }
    }
    Ok(())
}
