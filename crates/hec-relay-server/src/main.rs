// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{error::ErrorKind, ArgAction, Parser, Subcommand};
use tracing::{error, info};

use hec_relay::{
    config::{template::TEMPLATE, Config},
    logger,
    relay::{wait_for_termination, Relay},
    smoke, BuildInfo, VERSION_STRING,
};

const EXIT_OK: u8 = 0;
const EXIT_STARTUP: u8 = 1;

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    about = "Relays NDJSON log streams to day files and an HTTP event collector",
    disable_version_flag = true,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print version and build, then exit.
    #[arg(short = 'V', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an annotated configuration template.
    Template,
    /// Probe the collector of every configured listener.
    SmokeTest {
        #[arg(short = 'f', long = "config", value_name = "PATH")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => return ExitCode::from(usage_exit(&e)),
    };

    if cli.version {
        println!("{VERSION_STRING}");
        return ExitCode::from(EXIT_OK);
    }

    match cli.command {
        Some(Command::Template) => {
            print!("{TEMPLATE}");
            ExitCode::from(EXIT_OK)
        }
        Some(Command::SmokeTest { config }) => smoke_test(&config).await,
        None => match cli.config {
            Some(path) => serve(&path).await,
            None => {
                eprintln!("relay: --config <PATH> is required (see `relay --help`)");
                ExitCode::from(EXIT_STARTUP)
            }
        },
    }
}

fn load(path: &Path) -> Result<Config, ExitCode> {
    let config = Config::load(path).map_err(|e| {
        eprintln!("relay: {e}");
        ExitCode::from(EXIT_STARTUP)
    })?;
    logger::init(&config.log_level).map_err(|e| {
        eprintln!("relay: failed to initialize logging: {e}");
        ExitCode::from(EXIT_STARTUP)
    })?;
    Ok(config)
}

async fn serve(path: &Path) -> ExitCode {
    let config = match load(path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    info!(
        "Starting relay {} with configuration {}",
        BuildInfo::current(),
        path.display()
    );

    let handle = match Relay::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Startup failed: {}", e);
            return exit_code(e.exit_code());
        }
    };

    match handle.run_until(wait_for_termination()).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("Relay stopped: {}", e);
            exit_code(e.exit_code())
        }
    }
}

async fn smoke_test(path: &Path) -> ExitCode {
    let config = match load(path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let report = smoke::run(&config).await;
    print!("{report}");
    if report.passed() {
        ExitCode::from(EXIT_OK)
    } else {
        ExitCode::from(EXIT_STARTUP)
    }
}

/// Prints a clap outcome (help or a usage error) and picks the exit byte for it.
fn usage_exit(e: &clap::Error) -> u8 {
    if let Err(io) = e.print() {
        eprintln!("relay: failed to print usage: {io}");
        return EXIT_STARTUP;
    }
    if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
        EXIT_OK
    } else {
        EXIT_STARTUP
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(exit_byte(code))
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_STARTUP)
}
