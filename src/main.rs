use std::process::ExitCode;

use clap::Parser;
use regstash::Storage;
use tracing::error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::commands::{handle_list, handle_pull, handle_pull_dir, handle_push, handle_push_dir, handle_tags};

mod cli;
mod commands;

fn main() -> ExitCode {
    // The catalog request goes through ureq, which needs a process wide rustls
    // provider.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");
    let cli = cli::Cli::parse();
    let common = cli.common();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if common.debug { "debug" } else { "info" }));
    let custom_format = fmt::format()
        .with_target(false)
        .with_file(true)
        .with_level(true)
        .with_line_number(true)
        .compact();
    let fmt_layer = fmt::layer().with_writer(std::io::stderr).event_format(custom_format);

    // With the quiet flag only results are printed, errors go to stderr as is.
    let quiet = common.quiet;
    if !quiet {
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
    }

    let storage = Storage::new();
    let result = match &cli.mode {
        cli::Mode::Push(args) => handle_push(&storage, args),
        cli::Mode::Pull(args) => handle_pull(&storage, args),
        cli::Mode::PushDir(args) => handle_push_dir(&storage, args),
        cli::Mode::PullDir(args) => handle_pull_dir(&storage, args),
        cli::Mode::List(args) => handle_list(&storage, args),
        cli::Mode::Tags(args) => handle_tags(&storage, args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if quiet {
                eprintln!("{e}");
            } else {
                error!("{e}");
            }
            ExitCode::FAILURE
        }
    }
}
