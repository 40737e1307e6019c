use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

mod cli;
mod error_fmt;
mod fit;
mod logging;
mod session;

use cli::{Cli, Commands, JSON_MODE};
use error_fmt::{exit_code_for_error, format_error_json, humanize};

impl Commands {
    fn needs_config(&self) -> bool {
        !matches!(self, Self::Fit { .. } | Self::Tempfit { .. })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    let _ = color_eyre::install();

    let cfg = cli
        .cmd
        .needs_config()
        .then(|| session::load_config(&cli.config));
    let logging = cfg.as_ref().and_then(|c| c.as_ref().ok()).map(|c| &c.logging);
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.and_then(|l| l.level.clone()))
        .unwrap_or_else(|| "warn".to_string());
    logging::init_tracing(cli.json, &level, logging);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)) {
            tracing::warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    let result = cfg.transpose().and_then(|cfg| dispatch(cli.cmd, cfg.as_ref(), &stop));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            if cli.json {
                eprintln!("{}", format_error_json(&e));
            } else {
                eprintln!("{}", humanize(&e));
            }
            ExitCode::from(u8::try_from(exit_code_for_error(&e)).unwrap_or(1))
        }
    }
}

fn dispatch(cmd: Commands, cfg: Option<&scanner_config::Config>, stop: &AtomicBool) -> eyre::Result<()> {
    let require = || cfg.ok_or_else(|| eyre::eyre!("this command needs a config file"));
    match cmd {
        Commands::Check => {
            session::check(require()?);
            Ok(())
        }
        Commands::Run {
            script,
            commands,
            seed,
            no_home,
            stream_dir,
            keep_going,
        } => {
            let opts = session::RunOpts {
                script,
                commands,
                seed,
                no_home,
                stream_dir,
                keep_going,
            };
            session::run(require()?, &opts, stop)
        }
        Commands::Fit {
            dump,
            name,
            mode,
            fw_version,
        } => fit::fit(&dump, &name, mode, &fw_version),
        Commands::Tempfit { logs } => fit::tempfit(&logs),
        Commands::SelfCheck => session::self_check(require()?),
    }
}
